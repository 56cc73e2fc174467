//! API v1 routes.

mod nodes;
mod placements;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(placements::routes())
        .merge(nodes::routes())
}

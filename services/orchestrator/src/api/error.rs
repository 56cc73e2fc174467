//! RFC 7807 problem responses.

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hoster_id::RequestId;
use serde::Serialize;
use tracing::error;

use crate::orchestrator::{OrphanResource, PlacementError, Stage};

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
    pub retry_after_seconds: u32,
    /// Workflow stage the failure is attributed to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Resources left live by a failed rollback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orphans: Option<Vec<serde_json::Value>>,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://github.com/jack5341/giggle-hoster/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: RequestId::new().to_string(),
            retryable: false,
            retry_after_seconds: 0,
            stage: None,
            orphans: None,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }

    fn set_retry_after_seconds(&mut self, seconds: u32) {
        self.retry_after_seconds = seconds;
        if seconds > 0 {
            self.retryable = true;
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn unprocessable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::UNPROCESSABLE_ENTITY, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, message)
    }

    pub fn gateway_timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::GATEWAY_TIMEOUT, code, message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    pub fn with_retry_after_seconds(mut self, seconds: u32) -> Self {
        self.problem.set_retry_after_seconds(seconds);
        self
    }

    fn with_stage(mut self, stage: Option<Stage>) -> Self {
        self.problem.stage = stage.map(|s| s.as_str().to_string());
        self
    }

    fn with_orphans(mut self, orphans: &[OrphanResource]) -> Self {
        self.problem.orphans = Some(
            orphans
                .iter()
                .filter_map(|o| serde_json::to_value(o).ok())
                .collect(),
        );
        self
    }
}

impl From<PlacementError> for ApiError {
    fn from(err: PlacementError) -> Self {
        let stage = err.stage();
        let detail = err.to_string();

        let api = match &err {
            PlacementError::InvalidRequest(_) => ApiError::bad_request("invalid_request", detail),
            PlacementError::CapacityContention { .. } => {
                ApiError::service_unavailable("capacity_contention", detail)
                    .with_retry_after_seconds(1)
            }
            PlacementError::ProviderTransient { .. } => {
                ApiError::service_unavailable("provider_unavailable", detail)
                    .with_retry_after_seconds(5)
            }
            PlacementError::ProviderRejected { .. } => {
                ApiError::unprocessable("provider_rejected", detail)
            }
            PlacementError::ProviderAmbiguous { .. } => {
                ApiError::gateway_timeout("provider_ambiguous", detail)
            }
            PlacementError::RollbackFailed { orphans, .. } => {
                error!(error = %err, "Placement left orphaned resources");
                ApiError::internal("rollback_failed", detail).with_orphans(orphans)
            }
            PlacementError::Persistence { source, .. } if source.is_conflict() => {
                ApiError::conflict("conflict", detail)
            }
            PlacementError::Persistence { source, .. } if source.is_transient() => {
                ApiError::service_unavailable("store_unavailable", detail)
                    .with_retry_after_seconds(1)
            }
            PlacementError::Persistence { .. } => {
                error!(error = %err, "Persistence failure");
                ApiError::internal("persistence_error", "The capacity store failed")
            }
            PlacementError::NodeNotFound(_) => ApiError::not_found("node_not_found", detail),
            PlacementError::NodeUnavailable { .. } => ApiError::conflict("node_unavailable", detail),
        };

        api.with_stage(stage)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

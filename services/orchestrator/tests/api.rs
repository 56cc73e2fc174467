//! HTTP API integration tests.
//!
//! Serves the real router over a loopback listener, backed by the memory
//! store and scripted providers.

mod common;

use std::sync::atomic::Ordering;

use common::{CreateScript, Harness};
use hoster_orchestrator::{api, providers::ProviderError, state::AppState};
use serde_json::{json, Value};
use tokio::net::TcpListener;

struct ApiTestHarness {
    base_url: String,
    client: reqwest::Client,
    h: Harness,
}

impl ApiTestHarness {
    async fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,hoster_orchestrator=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let h = Harness::new();
        let app = api::create_router(AppState::new(h.orchestrator.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            h,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn place(&self, mem: i64, cpu: i32) -> reqwest::Response {
        self.client
            .post(self.url("/v1/placements"))
            .json(&json!({
                "requested_mem": mem,
                "requested_cpu": cpu,
                "workload_class": "game",
                "size_class": "small",
            }))
            .send()
            .await
            .unwrap()
    }
}

fn problem_content_type(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "application/problem+json")
}

#[tokio::test]
async fn test_health_endpoints() {
    let harness = ApiTestHarness::new().await;

    for path in ["/healthz", "/readyz", "/livez"] {
        let response = harness.client.get(harness.url(path)).send().await.unwrap();
        assert_eq!(response.status(), 200, "{path}");
    }
}

#[tokio::test]
async fn test_placement_on_existing_node_returns_ok() {
    let harness = ApiTestHarness::new().await;
    let id = harness.h.seed_well_node((4, 2), (4, 2)).await;

    let response = harness.place(2, 1).await;

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["origin"], "existing");
    assert_eq!(body["node"]["id"], id.to_string());
    assert_eq!(body["node"]["capacity"]["free_mem"], 2);
    assert_eq!(body["node"]["capacity"]["free_cpu"], 1);
}

#[tokio::test]
async fn test_placement_that_provisions_returns_created() {
    let harness = ApiTestHarness::new().await;

    let response = harness.place(8, 4).await;

    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["origin"], "provisioned");
    assert_eq!(body["node"]["status"], "well");
    assert!(body["node"]["dns_name"]
        .as_str()
        .unwrap()
        .ends_with(".game.example.net"));
}

#[tokio::test]
async fn test_invalid_placement_is_bad_request() {
    let harness = ApiTestHarness::new().await;

    let response = harness.place(-1, 1).await;

    assert_eq!(response.status(), 400);
    assert!(problem_content_type(&response));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "invalid_request");
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn test_transient_provider_failure_is_retryable() {
    let harness = ApiTestHarness::new().await;
    harness
        .h
        .dns
        .fail_creates(ProviderError::Transient("503".to_string()), 3);

    let response = harness.place(1, 1).await;

    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "provider_unavailable");
    assert_eq!(body["stage"], "dns");
    assert_eq!(body["retryable"], true);
    assert_eq!(body["retry_after_seconds"], 5);
}

#[tokio::test]
async fn test_ambiguous_provider_outcome_is_gateway_timeout() {
    let harness = ApiTestHarness::new().await;
    harness
        .h
        .compute
        .script_create(CreateScript::CreateThenFail(ProviderError::Ambiguous(
            "reset".to_string(),
        )));

    let response = harness.place(1, 1).await;

    assert_eq!(response.status(), 504);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "provider_ambiguous");
    assert_eq!(body["stage"], "compute");
}

#[tokio::test]
async fn test_rollback_failure_lists_orphans() {
    let harness = ApiTestHarness::new().await;
    harness.h.store.fail_activate.store(true, Ordering::SeqCst);
    harness
        .h
        .compute
        .fail_deletes(ProviderError::Transient("503".to_string()), 3);

    let response = harness.place(1, 1).await;

    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "rollback_failed");
    assert_eq!(body["stage"], "persist");
    let orphans = body["orphans"].as_array().unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0]["kind"], "instance");
}

#[tokio::test]
async fn test_list_and_get_nodes() {
    let harness = ApiTestHarness::new().await;
    let id = harness.h.seed_well_node((4, 2), (4, 2)).await;

    let response = harness
        .client
        .get(harness.url("/v1/nodes?status=well"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["items"].as_array().unwrap().len(), 1);

    let response = harness
        .client
        .get(harness.url("/v1/nodes?status=stopped"))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert!(body["items"].as_array().unwrap().is_empty());

    let response = harness
        .client
        .get(harness.url(&format!("/v1/nodes/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["id"], id.to_string());
}

#[tokio::test]
async fn test_bad_status_filter_and_node_id() {
    let harness = ApiTestHarness::new().await;

    let response = harness
        .client
        .get(harness.url("/v1/nodes?status=sleeping"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "invalid_status");

    let response = harness
        .client
        .get(harness.url("/v1/nodes/not-a-node"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "invalid_node_id");
}

#[tokio::test]
async fn test_unknown_node_is_not_found() {
    let harness = ApiTestHarness::new().await;

    let response = harness
        .client
        .get(harness.url(&format!("/v1/nodes/{}", hoster_id::NodeId::new())))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    assert!(problem_content_type(&response));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "node_not_found");
}

#[tokio::test]
async fn test_release_and_stop() {
    let harness = ApiTestHarness::new().await;
    let response = harness.place(1, 1).await;
    let body: Value = response.json().await.unwrap();
    let id = body["node"]["id"].as_str().unwrap().to_string();

    let response = harness
        .client
        .post(harness.url(&format!("/v1/nodes/{id}/release")))
        .json(&json!({ "mem": 1, "cpu": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["capacity"]["free_mem"], body["capacity"]["total_mem"]);

    let response = harness
        .client
        .post(harness.url(&format!("/v1/nodes/{id}/stop")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "stopped");
    assert!(harness.h.compute.live_instances().is_empty());

    // Releasing onto a stopped node conflicts.
    let response = harness
        .client
        .post(harness.url(&format!("/v1/nodes/{id}/release")))
        .json(&json!({ "mem": 1, "cpu": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "node_unavailable");
}

//! Fleet API: health probes, fleet view, provisioning and lifecycle actions


use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use fleet_control::{BotInstance, CreateSpec, Endpoint, MonitorState};
use mock_runtime::{TestApp, BACKEND};

async fn get(router: Router, uri: &str) -> (StatusCode, Value) {
    let resp = router
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn post_json(router: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let resp = router
        .oneshot(
            Request::post(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_readiness_follows_monitor_lifecycle() {
    let app = TestApp::new();

    let (status, _) = get(app.router(), "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = get(app.router(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    assert_eq!(app.state.monitor.start().await, MonitorState::SingleInstance);
    let (status, body) = get(app.router(), "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");

    app.state.monitor.stop(Duration::from_secs(1)).await;
    let (status, _) = get(app.router(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_fleet_view_of_single_instance() {
    let app = TestApp::new();
    app.state.monitor.start().await;

    let (status, body) = get(app.router(), "/v1/fleet").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instance_id"], "replica-test");
    assert_eq!(body["distributed"], false);
    assert_eq!(body["instance_count"], 1);
    assert_eq!(body["members"], json!(["replica-test"]));
    assert_eq!(body["state"], "single_instance");
    assert_eq!(body["backends"], json!([BACKEND]));

    let (status, detail) = get(app.router(), "/health/detail").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["status"], "healthy");
    assert_eq!(detail["fleet"]["instance_count"], 1);

    app.state.monitor.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_status_reflects_latest_check() {
    let app = TestApp::new();

    let (status, _) = get(app.router(), "/v1/bots/9a7f3f4e-1f0e-4d59-9d59-0b7a6f4f5c10/status").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get(app.router(), "/v1/bots/nope/status").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    app.runtime
        .set_endpoint("mock-live", Some(Endpoint::http("10.0.0.5", 8080)));
    let bot = app.add_bot(Some("mock-live")).await;

    let uri = format!("/v1/bots/{}/status", bot.id);
    let (status, body) = get(app.router(), &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], false);
    assert!(body["last_seen_at"].is_null());

    let report = app.state.monitor.run_tick().await;
    assert_eq!(report.checked, 1);
    assert_eq!(report.healthy, 1);

    let (status, body) = get(app.router(), &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);
    assert_eq!(body["backend"], BACKEND);
    assert_eq!(body["backend_handle"], "mock-live");
    assert_eq!(body["ip_address"], "10.0.0.5");
    assert_eq!(body["host_port"], 8080);
    assert!(body["last_seen_at"].is_string());
}

#[tokio::test]
async fn test_provision_once_then_conflict() {
    let app = TestApp::new();
    let bot = app.add_bot(None).await;
    let uri = format!("/v1/bots/{}/provision", bot.id);

    let (status, body) = post_json(app.router(), &uri, json!({})).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["backend"], BACKEND);
    let handle = body["runtime_handle"].as_str().unwrap().to_string();
    assert!(handle.starts_with("mock-"));
    // desired state defaults to running
    assert_eq!(app.runtime.actions(), vec![format!("start:{}", handle)]);

    let (status, _) = post_json(app.router(), &uri, json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_provision_rejected_by_backend() {
    let app = TestApp::new();
    let spec = CreateSpec {
        image: Some("missing:latest".to_string()),
        ..CreateSpec::default()
    };
    let bot = BotInstance::new("beta", BACKEND, spec);
    app.store.insert_bot(bot.clone()).await;

    let (status, _) = post_json(app.router(), &format!("/v1/bots/{}/provision", bot.id), json!({})).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = get(app.router(), &format!("/v1/bots/{}/status", bot.id)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["backend_handle"].is_null());
}

#[tokio::test]
async fn test_actions_require_provisioned_bot() {
    let app = TestApp::new();
    let bot = app.add_bot(None).await;
    let uri = format!("/v1/bots/{}/actions", bot.id);

    let (status, _) = post_json(app.router(), &uri, json!({"action": "stop"})).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = post_json(app.router(), &format!("/v1/bots/{}/provision", bot.id), json!({})).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = post_json(app.router(), &uri, json!({"action": "stop"})).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = get(app.router(), &format!("/v1/bots/{}/status", bot.id)).await;
    assert_eq!(body["desired_state"], "stopped");

    let (status, _) = post_json(app.router(), &uri, json!({"action": "restart"})).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = get(app.router(), &format!("/v1/bots/{}/status", bot.id)).await;
    assert_eq!(body["desired_state"], "running");

    let actions = app.runtime.actions();
    assert_eq!(actions.len(), 3);
    assert!(actions[1].starts_with("stop:"));
    assert!(actions[2].starts_with("restart:"));
}

#[tokio::test]
async fn test_data_prep_accepted_only_when_reachable() {
    let app = TestApp::new();
    app.runtime.set_endpoint("mock-cold", None);
    let cold = app.add_bot(Some("mock-cold")).await;

    let body = json!({"path": "/api/v1/download-data", "payload": {"pairs": ["BTC/USDT"]}});
    let (status, _) = post_json(app.router(), &format!("/v1/bots/{}/data-prep", cold.id), body.clone()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let server = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("POST"))
        .and(wiremock::matchers::path("/api/v1/download-data"))
        .respond_with(wiremock::ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let port = server.address().port();
    app.runtime
        .set_endpoint("mock-warm", Some(Endpoint::http("127.0.0.1", port)));
    let warm = app.add_bot(Some("mock-warm")).await;

    let (status, resp) = post_json(app.router(), &format!("/v1/bots/{}/data-prep", warm.id), body).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(resp["bot_id"], warm.id.to_string());
    assert!(resp["job_id"].is_string());

    // the job runs detached; give it a moment to land
    for _ in 0..50 {
        if !server.received_requests().await.unwrap_or_default().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    server.verify().await;
}

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::{json, Value};
use tether_core::{OverwritePolicy, SessionRegistry, StoreConfig};
use tether_relay::{router, AppState};
use tower::util::ServiceExt;

fn app() -> Router {
    router(AppState::detached(StoreConfig::default()))
}

/// Router whose counters land in the process-wide Prometheus recorder.
fn recorded_app() -> Router {
    static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
    let handle = HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install prometheus recorder")
    });
    router(AppState::new(
        SessionRegistry::new(StoreConfig::default()),
        handle.clone(),
        None,
    ))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if body.is_some() {
        request = request.header("content-type", "application/json");
    }
    let request = request
        .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

const OFFER: &str = r#"{"type":"offer","sdp":"v=0 OFFER_A"}"#;

#[test_timeout::tokio_timeout_test]
async fn post_then_poll_delivers_once() {
    let app = app();

    let (status, body) = send(&app, "POST", "/api/signal?id=sess1", Some(OFFER)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true }));

    let (status, body) = send(&app, "GET", "/api/signal?id=sess1&version=0", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);
    assert_eq!(body["signal"]["sdp"], "v=0 OFFER_A");

    let (status, body) = send(&app, "GET", "/api/signal?id=sess1&version=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "noUpdate": true }));
}

#[test_timeout::tokio_timeout_test]
async fn missing_version_means_zero() {
    let app = app();
    send(&app, "POST", "/api/answer?id=s", Some(r#"{"type":"answer"}"#)).await;

    let (status, body) = send(&app, "GET", "/api/answer?id=s", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);
}

#[test_timeout::tokio_timeout_test]
async fn unknown_session_is_404() {
    let app = app();
    let (status, body) = send(&app, "GET", "/api/signal?id=zzz&version=0", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[test_timeout::tokio_timeout_test]
async fn missing_or_empty_id_is_400() {
    let app = app();
    for uri in ["/api/signal", "/api/signal?id=", "/api/answer?version=1"] {
        let (status, body) = send(&app, "GET", uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "GET {uri}");
        assert!(body["error"].is_string());
    }
    let (status, _) = send(&app, "POST", "/api/answer", Some(OFFER)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[test_timeout::tokio_timeout_test]
async fn non_integer_version_is_400() {
    let app = app();
    send(&app, "POST", "/api/signal?id=s", Some(OFFER)).await;
    let (status, body) = send(&app, "GET", "/api/signal?id=s&version=abc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("abc"));
}

#[test_timeout::tokio_timeout_test]
async fn unreadable_body_is_500_and_stores_nothing() {
    let app = app();
    let (status, body) = send(&app, "POST", "/api/signal?id=s", Some("{not json")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].is_string());

    let (status, _) = send(&app, "GET", "/api/signal?id=s", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[test_timeout::tokio_timeout_test]
async fn null_signal_is_400_and_stores_nothing() {
    let app = app();
    let (status, body) = send(&app, "POST", "/api/answer?id=s", Some("null")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("null"));

    let (status, _) = send(&app, "GET", "/api/answer?id=s", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[test_timeout::tokio_timeout_test]
async fn offer_and_answer_stores_are_separate() {
    let app = app();
    send(&app, "POST", "/api/signal?id=sess1", Some(OFFER)).await;

    let (status, _) = send(&app, "GET", "/api/answer?id=sess1&version=0", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[test_timeout::tokio_timeout_test]
async fn hundred_polls_at_current_version_stay_quiet() {
    let app = app();
    send(&app, "POST", "/api/signal?id=s", Some(OFFER)).await;
    send(&app, "GET", "/api/signal?id=s&version=0", None).await;

    for _ in 0..100 {
        let (status, body) = send(&app, "GET", "/api/signal?id=s&version=1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "noUpdate": true }));
    }
}

#[test_timeout::tokio_timeout_test]
async fn overwrite_reaches_new_clients_only_under_default_policy() {
    let app = app();
    send(&app, "POST", "/api/signal?id=s", Some(OFFER)).await;
    send(&app, "GET", "/api/signal?id=s&version=0", None).await;
    send(&app, "POST", "/api/signal?id=s", Some(r#"{"type":"offer","sdp":"B"}"#)).await;

    let (_, body) = send(&app, "GET", "/api/signal?id=s&version=1", None).await;
    assert_eq!(body, json!({ "noUpdate": true }));

    let (_, body) = send(&app, "GET", "/api/signal?id=s&version=0", None).await;
    assert_eq!(body["signal"]["sdp"], "B");
    assert_eq!(body["version"], 1);
}

#[test_timeout::tokio_timeout_test]
async fn redeliver_policy_bumps_the_version() {
    let app = router(AppState::detached(StoreConfig {
        overwrite_policy: OverwritePolicy::Redeliver,
        ..StoreConfig::default()
    }));
    send(&app, "POST", "/api/answer?id=s", Some(OFFER)).await;
    send(&app, "GET", "/api/answer?id=s&version=0", None).await;
    send(&app, "POST", "/api/answer?id=s", Some(r#"{"type":"answer","sdp":"B"}"#)).await;

    let (_, body) = send(&app, "GET", "/api/answer?id=s&version=1", None).await;
    assert_eq!(body["version"], 2);
    assert_eq!(body["signal"]["sdp"], "B");
}

#[test_timeout::tokio_timeout_test]
async fn ambient_endpoints_respond() {
    let app = recorded_app();
    send(&app, "POST", "/api/signal?id=s", Some(OFFER)).await;
    send(&app, "GET", "/api/signal?id=s&version=0", None).await;
    send(&app, "GET", "/api/signal?id=s&version=1", None).await;
    send(&app, "GET", "/api/answer?id=nobody", None).await;

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));

    let (status, body) = send(&app, "GET", "/debug/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["offers"], 1);
    assert_eq!(body["answers"], 0);

    let (status, body) = send(&app, "GET", "/api/local-ip", None).await;
    assert!(status == StatusCode::OK || status == StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["ip"].as_str().unwrap().parse::<std::net::Ipv4Addr>().is_ok());

    let response = app
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&text);
    for line in [
        "tether_relay_puts_total{direction=\"offer\"}",
        "tether_relay_deliveries_total{direction=\"offer\"}",
        "tether_relay_no_update_total{direction=\"offer\"}",
        "tether_relay_not_found_total{direction=\"answer\"}",
    ] {
        assert!(text.contains(line), "missing {line} in:\n{text}");
    }
}

//! Shared helpers for integration tests

use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcp_negotiator::config::Config;

/// A complete `initialize` answer.
pub const INIT_RESULT: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-03-26","capabilities":{},"serverInfo":{"name":"mock-server","version":"1.0"}}}"#;

/// Defaults with short timings so failing races settle quickly.
#[allow(dead_code)]
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.negotiation.timeout_seconds = 10;
    config.negotiation.grace_period_ms = 500;
    config.negotiation.settle_delay_ms = 10;
    config.negotiation.close_timeout_ms = 500;
    config
}

/// Mounts a streaming endpoint at `p` answering `initialize` and accepting
/// the initialized notification.
#[allow(dead_code)]
pub async fn mount_streaming(server: &MockServer, p: &str) {
    Mock::given(method("POST"))
        .and(path(p))
        .and(body_partial_json(serde_json::json!({"method": "initialize"})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(INIT_RESULT, "application/json"))
        .mount(server)
        .await;
    mount_notification_sink(server, p).await;
}

/// Accepts `notifications/initialized` posted to `p`.
#[allow(dead_code)]
pub async fn mount_notification_sink(server: &MockServer, p: &str) {
    Mock::given(method("POST"))
        .and(path(p))
        .and(body_partial_json(
            serde_json::json!({"method": "notifications/initialized"}),
        ))
        .respond_with(ResponseTemplate::new(202))
        .mount(server)
        .await;
}

/// Mounts a legacy event stream at `p` announcing `/messages` and
/// delivering the `initialize` answer on the stream.
#[allow(dead_code)]
pub async fn mount_legacy(server: &MockServer, p: &str) {
    let body = format!(
        "event: endpoint\ndata: /messages?sessionId=s1\n\nevent: message\ndata: {}\n\n",
        INIT_RESULT
    );
    Mock::given(method("GET"))
        .and(path(p))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(202))
        .mount(server)
        .await;
}

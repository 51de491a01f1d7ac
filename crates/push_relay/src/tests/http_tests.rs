use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::Mutex};

use super::*;

#[derive(Clone)]
struct Canned {
    status: StatusCode,
    body: String,
    seen: Arc<Mutex<Vec<(HeaderMap, Value)>>>,
}

async fn record(
    State(canned): State<Canned>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> (StatusCode, String) {
    canned.seen.lock().await.push((headers, payload));
    (canned.status, canned.body.clone())
}

async fn spawn_relay(status: StatusCode, body: &str) -> (HttpPushRelay, Arc<Mutex<Vec<(HeaderMap, Value)>>>) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let canned = Canned {
        status,
        body: body.to_string(),
        seen: seen.clone(),
    };
    let app = Router::new()
        .route("/notification", post(record))
        .route("/send", post(record))
        .with_state(canned);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let relay = HttpPushRelay::new(HttpRelayConfig {
        group_url: Url::parse(&format!("http://{addr}/notification")).expect("url"),
        send_url: Url::parse(&format!("http://{addr}/send")).expect("url"),
        api_key: "secret".to_string(),
        sender_id: "1234".to_string(),
        timeout: Duration::from_secs(5),
    })
    .expect("relay");
    (relay, seen)
}

#[tokio::test]
async fn create_group_posts_operation_and_returns_key() {
    let (relay, seen) = spawn_relay(StatusCode::OK, r#"{"notification_key":"nk-1"}"#).await;

    let key = relay.create_group("group-a", "handle-1").await.expect("create");
    assert_eq!(key, "nk-1");

    let seen = seen.lock().await;
    let (headers, payload) = &seen[0];
    assert_eq!(headers["authorization"], "key=secret");
    assert_eq!(headers["project_id"], "1234");
    assert_eq!(
        payload,
        &json!({
            "operation": "create",
            "notification_key_name": "group-a",
            "registration_ids": ["handle-1"],
        })
    );
}

#[tokio::test]
async fn add_device_sends_existing_key() {
    let (relay, seen) = spawn_relay(StatusCode::OK, r#"{"notification_key":"nk-1"}"#).await;

    relay.add_device("group-a", "nk-1", "handle-2").await.expect("add");

    let seen = seen.lock().await;
    assert_eq!(seen[0].1["operation"], "add");
    assert_eq!(seen[0].1["notification_key"], "nk-1");
    assert_eq!(seen[0].1["registration_ids"], json!(["handle-2"]));
}

#[tokio::test]
async fn in_band_error_is_a_rejection() {
    let (relay, _) = spawn_relay(StatusCode::OK, r#"{"error":"InvalidRegistration"}"#).await;

    let err = relay.create_group("group-a", "bad").await.expect_err("rejected");
    assert_eq!(err, RelayError::Rejected("InvalidRegistration".to_string()));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn client_error_without_body_is_a_rejection() {
    let (relay, _) = spawn_relay(StatusCode::BAD_REQUEST, "").await;

    let err = relay.remove_device("group-a", "nk-1", "h").await.expect_err("rejected");
    assert!(matches!(err, RelayError::Rejected(_)), "{err:?}");
}

#[tokio::test]
async fn server_error_is_unavailable() {
    let (relay, _) = spawn_relay(
        StatusCode::SERVICE_UNAVAILABLE,
        r#"{"error":"ignored for 5xx"}"#,
    )
    .await;

    let err = relay.create_group("group-a", "handle-1").await.expect_err("unavailable");
    assert!(matches!(err, RelayError::Unavailable(_)), "{err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn garbage_success_body_is_invalid_response() {
    let (relay, _) = spawn_relay(StatusCode::OK, "not json").await;

    let err = relay.create_group("group-a", "handle-1").await.expect_err("invalid");
    assert!(matches!(err, RelayError::InvalidResponse(_)), "{err:?}");
}

#[tokio::test]
async fn create_without_key_is_invalid_response() {
    let (relay, _) = spawn_relay(StatusCode::OK, "{}").await;

    let err = relay.create_group("group-a", "handle-1").await.expect_err("invalid");
    assert!(matches!(err, RelayError::InvalidResponse(_)), "{err:?}");
}

#[tokio::test]
async fn unreachable_relay_is_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let relay = HttpPushRelay::new(HttpRelayConfig {
        group_url: Url::parse(&format!("http://{addr}/notification")).expect("url"),
        send_url: Url::parse(&format!("http://{addr}/send")).expect("url"),
        api_key: "secret".to_string(),
        sender_id: "1234".to_string(),
        timeout: Duration::from_secs(2),
    })
    .expect("relay");

    let err = relay.add_device("g", "k", "h").await.expect_err("down");
    assert!(matches!(err, RelayError::Unavailable(_)), "{err:?}");
}

#[tokio::test]
async fn send_posts_downstream_message() {
    let (relay, seen) = spawn_relay(StatusCode::OK, "{}").await;
    let message = DownstreamMessage {
        to: "handle-1".to_string(),
        message_id: "m-1".to_string(),
        data: json!({ "error": "unregistered_device", "reason": "device not found" }),
    };

    relay.send(&message).await.expect("send");

    let seen = seen.lock().await;
    assert_eq!(seen[0].1["to"], "handle-1");
    assert_eq!(seen[0].1["data"]["reason"], "device not found");
}

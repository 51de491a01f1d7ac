use axum::{
    body::{self, Body},
    http::Request,
    response::Response,
};
use push_relay::MemoryRelay;
use relay_api::ApiContext;
use serde_json::{json, Value};
use storage::{NewMessage, Storage, StoredUser};
use tokio::sync::mpsc;
use tower::ServiceExt;

use super::*;

const RELAY_KEY: &str = "relay-secret";

struct TestApp {
    router: Router,
    api: ApiContext,
    ingress_rx: mpsc::Receiver<InboundEvent>,
}

async fn test_app(queue: usize, history_limit: u32) -> TestApp {
    let storage = Storage::in_memory().await.expect("db");
    let api = ApiContext::new(storage, Arc::new(MemoryRelay::new()));
    let (ingress, ingress_rx) = mpsc::channel(queue);
    let router = build_router(Arc::new(AppState {
        api: api.clone(),
        ingress,
        history_limit,
        upstream_key: Some(RELAY_KEY.to_string()),
    }));
    TestApp {
        router,
        api,
        ingress_rx,
    }
}

async fn signed_in(api: &ApiContext, email: &str) -> (StoredUser, String) {
    let user = api
        .storage
        .create_user(email, None, true)
        .await
        .expect("user");
    let token = auth::issue_token(api, user.id, None).await.expect("token");
    (user, token.token)
}

fn request(method: &str, uri: &str, user: &StoredUser, token: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(USER_TOKEN_HEADER, token)
        .header(USER_ID_HEADER, user.uuid.to_string())
        .header("content-type", "application/json");
    let body = body.map(|v| Body::from(v.to_string())).unwrap_or_else(Body::empty);
    builder.body(body).expect("request")
}

async fn json_of(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

async fn seed_message(api: &ApiContext, user: &StoredUser, mid: &str) {
    api.storage
        .insert_message(
            user.id,
            &NewMessage {
                client_message_id: mid,
                destination: "+15550100",
                body: "ciphertext",
                status: shared::domain::MessageStatus::Sent,
            },
        )
        .await
        .expect("message");
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let app = test_app(4, 1000).await;
    let request = Request::get("/healthz").body(Body::empty()).expect("request");
    let response = app.router.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn missing_or_wrong_credentials_are_unauthorized() {
    let app = test_app(4, 1000).await;
    let (user, _) = signed_in(&app.api, "alice@example.com").await;

    let bare = Request::get("/user/devices").body(Body::empty()).expect("request");
    let response = app.router.clone().oneshot(bare).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_of(response).await, json!({ "error": "missing_credentials" }));

    let wrong = request("GET", "/user/devices", &user, "not-a-token", None);
    let response = app.router.oneshot(wrong).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_of(response).await["error"], "invalid_user_token");
}

#[tokio::test]
async fn unverified_account_is_refused() {
    let app = test_app(4, 1000).await;
    let (user, token) = signed_in(&app.api, "alice@example.com").await;
    app.api
        .storage
        .set_user_verified(user.id, false)
        .await
        .expect("unverify");

    let response = app
        .router
        .oneshot(request("GET", "/user/devices", &user, &token, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_of(response).await["error"], "account_not_verified");
}

#[tokio::test]
async fn device_registration_and_listing() {
    let app = test_app(4, 1000).await;
    let (user, token) = signed_in(&app.api, "alice@example.com").await;
    let body = json!({ "registration_id": "handle-1", "name": "pixel", "type": "phone" });

    let response = app
        .router
        .clone()
        .oneshot(request("POST", "/user/devices", &user, &token, Some(body.clone())))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let added: AddDeviceResponse = serde_json::from_value(json_of(response).await).expect("dto");
    assert_eq!(added.encryption_key.len(), 64);

    let response = app
        .router
        .clone()
        .oneshot(request("POST", "/user/devices", &user, &token, Some(body)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_of(response).await["error"], "duplicate_device_token");

    let response = app
        .router
        .oneshot(request("GET", "/user/devices", &user, &token, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let listed: DeviceListResponse = serde_json::from_value(json_of(response).await).expect("dto");
    assert_eq!(listed.devices.len(), 1);
    assert_eq!(listed.devices[0].device_id, added.device_id);
}

#[tokio::test]
async fn malformed_or_incomplete_device_body_is_invalid_json() {
    let app = test_app(4, 1000).await;
    let (user, token) = signed_in(&app.api, "alice@example.com").await;

    let garbage = Request::post("/user/devices")
        .header(USER_TOKEN_HEADER, token.as_str())
        .header(USER_ID_HEADER, user.uuid.to_string())
        .body(Body::from("{not json"))
        .expect("request");
    let response = app.router.clone().oneshot(garbage).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_of(response).await["error"], "invalid_json");

    let incomplete = json!({ "registration_id": "handle-1", "type": "tablet" });
    let response = app
        .router
        .oneshot(request("POST", "/user/devices", &user, &token, Some(incomplete)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_of(response).await;
    assert_eq!(body["error"], "invalid_json");
    assert!(body["reason"].as_str().expect("reason").contains("name: is required"));
}

#[tokio::test]
async fn history_is_capped_by_configured_limit() {
    let app = test_app(4, 2).await;
    let (user, token) = signed_in(&app.api, "alice@example.com").await;
    for mid in ["m1", "m2", "m3"] {
        seed_message(&app.api, &user, mid).await;
    }

    for uri in ["/user/messages/history", "/user/messages/history?limit=50"] {
        let response = app
            .router
            .clone()
            .oneshot(request("GET", uri, &user, &token, None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let history: MessageHistoryResponse =
            serde_json::from_value(json_of(response).await).expect("dto");
        let mids: Vec<_> = history.messages.iter().map(|m| m.mid.as_str()).collect();
        assert_eq!(mids, ["m3", "m2"]);
    }

    let response = app
        .router
        .oneshot(request("GET", "/user/messages/history?limit=1", &user, &token, None))
        .await
        .expect("response");
    let history: MessageHistoryResponse =
        serde_json::from_value(json_of(response).await).expect("dto");
    assert_eq!(history.messages.len(), 1);
    assert_eq!(history.messages[0].status, "sent");
}

#[tokio::test]
async fn sync_returns_messages_after_cursor() {
    let app = test_app(4, 1000).await;
    let (user, token) = signed_in(&app.api, "alice@example.com").await;
    for mid in ["m1", "m2", "m3"] {
        seed_message(&app.api, &user, mid).await;
    }

    let response = app
        .router
        .clone()
        .oneshot(request("GET", "/user/messages/sync/m1", &user, &token, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let synced: MessageHistoryResponse =
        serde_json::from_value(json_of(response).await).expect("dto");
    let mids: Vec<_> = synced.messages.iter().map(|m| m.mid.as_str()).collect();
    assert_eq!(mids, ["m3", "m2"]);

    let response = app
        .router
        .oneshot(request("GET", "/user/messages/sync/unknown", &user, &token, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_of(response).await["error"], "message_not_found");
}

#[tokio::test]
async fn delete_removes_only_own_message() {
    let app = test_app(4, 1000).await;
    let (alice, alice_token) = signed_in(&app.api, "alice@example.com").await;
    let (bob, bob_token) = signed_in(&app.api, "bob@example.com").await;
    seed_message(&app.api, &alice, "m1").await;

    let response = app
        .router
        .clone()
        .oneshot(request("DELETE", "/user/messages/m1", &bob, &bob_token, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .router
        .clone()
        .oneshot(request("DELETE", "/user/messages/m1", &alice, &alice_token, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_of(response).await, json!({ "success": true }));

    let response = app
        .router
        .oneshot(request("DELETE", "/user/messages/m1", &alice, &alice_token, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn signout_revokes_presented_token() {
    let app = test_app(4, 1000).await;
    let (user, token) = signed_in(&app.api, "alice@example.com").await;

    let response = app
        .router
        .clone()
        .oneshot(request("POST", "/user/signout", &user, &token, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router
        .oneshot(request("GET", "/user/devices", &user, &token, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn upstream_events_are_queued_for_ingress() {
    let mut app = test_app(1, 1000).await;
    let event = json!({
        "from": "handle-1",
        "data": { "type": "message", "payload": { "mid": "m1" } }
    });
    let upstream = |event: &Value| {
        Request::post("/relay/upstream")
            .header("content-type", "application/json")
            .header("authorization", format!("key={RELAY_KEY}"))
            .body(Body::from(event.to_string()))
            .expect("request")
    };

    let response = app
        .router
        .clone()
        .oneshot(upstream(&event))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .router
        .clone()
        .oneshot(upstream(&event))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_of(response).await["error"], "relay_unavailable");

    let queued = app.ingress_rx.recv().await.expect("queued event");
    assert_eq!(queued.from, "handle-1");
    assert_eq!(queued.data["type"], "message");

    let response = app
        .router
        .oneshot(upstream(&json!({ "data": {} })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_of(response).await["error"], "invalid_json");
}

#[tokio::test]
async fn upstream_requires_relay_key() {
    let mut app = test_app(4, 1000).await;
    let event = json!({
        "from": "victim-handle",
        "data": { "type": "message", "payload": { "mid": "m1" } }
    });

    for (authorization, code) in [
        (None, "missing_credentials"),
        (Some("key="), "missing_credentials"),
        (Some("Bearer relay-secret"), "missing_credentials"),
        (Some("key=relay-secre"), "invalid_user_token"),
        (Some("key=not-the-key"), "invalid_user_token"),
    ] {
        let mut builder = Request::post("/relay/upstream").header("content-type", "application/json");
        if let Some(value) = authorization {
            builder = builder.header("authorization", value);
        }
        let request = builder.body(Body::from(event.to_string())).expect("request");
        let response = app.router.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{authorization:?}");
        assert_eq!(json_of(response).await["error"], code);
    }
    assert!(app.ingress_rx.try_recv().is_err());
}

#[tokio::test]
async fn upstream_is_closed_without_configured_key() {
    let (ingress, mut ingress_rx) = mpsc::channel(4);
    let api = ApiContext::new(
        Storage::in_memory().await.expect("db"),
        Arc::new(MemoryRelay::new()),
    );
    let router = build_router(Arc::new(AppState {
        api,
        ingress,
        history_limit: 1000,
        upstream_key: None,
    }));

    let request = Request::post("/relay/upstream")
        .header("authorization", "key=anything")
        .body(Body::from(json!({ "from": "h", "data": {} }).to_string()))
        .expect("request");
    let response = router.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(ingress_rx.try_recv().is_err());
}

#[test]
fn every_category_maps_to_a_status() {
    assert_eq!(status_for(ErrorCategory::Auth), StatusCode::UNAUTHORIZED);
    assert_eq!(status_for(ErrorCategory::Conflict), StatusCode::CONFLICT);
    assert_eq!(status_for(ErrorCategory::NotFound), StatusCode::NOT_FOUND);
    assert_eq!(status_for(ErrorCategory::RelayRejection), StatusCode::BAD_REQUEST);
    assert_eq!(
        status_for(ErrorCategory::RelayUnavailable),
        StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(status_for(ErrorCategory::Validation), StatusCode::BAD_REQUEST);
    assert_eq!(
        status_for(ErrorCategory::Internal),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

use std::sync::Arc;

use push_relay::MemoryRelay;
use relay_api::{
    auth, devices,
    ingress::{IngressOutcome, RelayIngress},
    ledger, ApiContext,
};
use serde_json::json;
use shared::{domain::DeviceType, protocol::InboundEvent};
use storage::Storage;

fn upstream(from: &str, mid: &str) -> InboundEvent {
    let data = json!({
        "type": "message",
        "payload": { "mid": mid, "to": "+15550100", "status": "sent", "body": "b", "at": "1" }
    });
    InboundEvent {
        from: from.to_string(),
        message_id: None,
        data: data.as_object().cloned().expect("object"),
    }
}

#[tokio::test]
async fn device_resyncs_messages_written_by_another_device() {
    let storage = Storage::in_memory().await.expect("db");
    let relay = Arc::new(MemoryRelay::new());
    let ctx = ApiContext::new(storage.clone(), relay.clone());

    let user = storage
        .create_user("alice@example.com", None, true)
        .await
        .expect("user");
    let token = auth::issue_token(&ctx, user.id, None).await.expect("token");
    let session = auth::authenticate(&ctx, &token.token, &user.uuid.to_string())
        .await
        .expect("session");

    let phone = devices::ensure_device(&ctx, session.user.id, "phone", "pixel", DeviceType::Phone)
        .await
        .expect("phone");
    let laptop = devices::ensure_device(&ctx, session.user.id, "laptop", "mbp", DeviceType::Desktop)
        .await
        .expect("laptop");
    assert_eq!(phone.notification_key, laptop.notification_key);

    let ingress = RelayIngress::new(ctx.clone());
    for mid in ["m1", "m2", "m3"] {
        let outcome = ingress.handle_event(upstream("phone", mid)).await;
        assert!(matches!(outcome, IngressOutcome::Recorded(_)), "{outcome:?}");
    }

    let missed = ledger::since(&ctx, session.user.id, "m1").await.expect("since");
    let wire: Vec<_> = missed.iter().map(ledger::to_wire).collect();
    assert_eq!(
        wire.iter().map(|m| m.mid.as_str()).collect::<Vec<_>>(),
        ["m3", "m2"]
    );
    assert!(relay.sent().await.is_empty());
}

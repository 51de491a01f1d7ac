use std::sync::Arc;

use push_relay::MemoryRelay;
use storage::{Storage, StoredUser};

use crate::ApiContext;

pub(crate) struct Fixture {
    pub ctx: ApiContext,
    pub relay: Arc<MemoryRelay>,
}

impl Fixture {
    pub async fn new() -> Self {
        let storage = Storage::in_memory().await.expect("db");
        let relay = Arc::new(MemoryRelay::new());
        Self {
            ctx: ApiContext::new(storage, relay.clone()),
            relay,
        }
    }

    pub async fn user(&self, email: &str) -> StoredUser {
        self.ctx
            .storage
            .create_user(email, None, true)
            .await
            .expect("user")
    }
}

//! Core of the push relay backend: token authentication, the per-user
//! device group, the message ledger and the upstream event handler.
//!
//! Every operation takes an explicit [`ApiContext`] and returns
//! [`ApiError`] as its only caller-visible failure.

use std::sync::Arc;

use push_relay::PushRelay;
use rand::{rngs::OsRng, RngCore};
use shared::error::ApiError;
use storage::{StorageError, Storage};
use tracing::error;

pub mod auth;
pub mod devices;
pub mod ingress;
pub mod ledger;
pub mod validation;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub relay: Arc<dyn PushRelay>,
}

impl ApiContext {
    pub fn new(storage: Storage, relay: Arc<dyn PushRelay>) -> Self {
        Self { storage, relay }
    }
}

/// Storage failures that are not a known conflict end the request with an
/// opaque internal error. The cause is logged here, not returned.
pub(crate) fn internal(err: StorageError) -> ApiError {
    error!(error = %err, "storage failure");
    ApiError::internal()
}

pub(crate) fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

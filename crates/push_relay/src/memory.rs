use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use shared::protocol::DownstreamMessage;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{PushRelay, RelayError, RelayResult};

/// A group operation as observed by [`MemoryRelay`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayCall {
    CreateGroup {
        group_name: String,
        handle: String,
    },
    AddDevice {
        group_name: String,
        group_key: String,
        handle: String,
    },
    RemoveDevice {
        group_name: String,
        group_key: String,
        handle: String,
    },
}

#[derive(Default)]
struct MemoryState {
    groups: HashMap<String, (String, Vec<String>)>,
    calls: Vec<RelayCall>,
    sent: Vec<DownstreamMessage>,
    group_failures: VecDeque<RelayError>,
    send_failures: VecDeque<RelayError>,
}

/// In-process relay that keeps groups in memory. Built with [`new`] it also
/// records every call for tests to inspect; [`unrecorded`] keeps only group
/// state and is what the server runs on without an upstream relay.
///
/// [`new`]: MemoryRelay::new
/// [`unrecorded`]: MemoryRelay::unrecorded
pub struct MemoryRelay {
    state: Mutex<MemoryState>,
    record: bool,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            state: Mutex::default(),
            record: true,
        }
    }

    /// Memory stays bounded by the number of groups; `calls` and `sent`
    /// are always empty.
    pub fn unrecorded() -> Self {
        Self {
            state: Mutex::default(),
            record: false,
        }
    }

    /// The next group operation fails with `err` instead of running.
    pub async fn fail_next_group_call(&self, err: RelayError) {
        self.state.lock().await.group_failures.push_back(err);
    }

    pub async fn fail_next_send(&self, err: RelayError) {
        self.state.lock().await.send_failures.push_back(err);
    }

    pub async fn calls(&self) -> Vec<RelayCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn sent(&self) -> Vec<DownstreamMessage> {
        self.state.lock().await.sent.clone()
    }

    /// Handles currently registered under `group_name`.
    pub async fn members(&self, group_name: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .groups
            .get(group_name)
            .map(|(_, members)| members.clone())
            .unwrap_or_default()
    }

    pub async fn group_count(&self) -> usize {
        self.state.lock().await.groups.len()
    }
}

fn check_key(state: &MemoryState, group_name: &str, group_key: &str) -> RelayResult<()> {
    match state.groups.get(group_name) {
        Some((key, _)) if key == group_key => Ok(()),
        Some(_) => Err(RelayError::Rejected("InvalidNotificationKey".to_string())),
        None => Err(RelayError::Rejected("NotificationKeyNotFound".to_string())),
    }
}

#[async_trait]
impl PushRelay for MemoryRelay {
    async fn create_group(&self, group_name: &str, registration_handle: &str) -> RelayResult<String> {
        let mut state = self.state.lock().await;
        if self.record {
            state.calls.push(RelayCall::CreateGroup {
                group_name: group_name.to_string(),
                handle: registration_handle.to_string(),
            });
        }
        if let Some(err) = state.group_failures.pop_front() {
            return Err(err);
        }
        if state.groups.contains_key(group_name) {
            return Err(RelayError::Rejected("NotificationKeyAlreadyExists".to_string()));
        }
        let key = format!("nk-{}", Uuid::new_v4().simple());
        state.groups.insert(
            group_name.to_string(),
            (key.clone(), vec![registration_handle.to_string()]),
        );
        Ok(key)
    }

    async fn add_device(
        &self,
        group_name: &str,
        group_key: &str,
        registration_handle: &str,
    ) -> RelayResult<()> {
        let mut state = self.state.lock().await;
        if self.record {
            state.calls.push(RelayCall::AddDevice {
                group_name: group_name.to_string(),
                group_key: group_key.to_string(),
                handle: registration_handle.to_string(),
            });
        }
        if let Some(err) = state.group_failures.pop_front() {
            return Err(err);
        }
        check_key(&state, group_name, group_key)?;
        if let Some((_, members)) = state.groups.get_mut(group_name) {
            if !members.iter().any(|m| m == registration_handle) {
                members.push(registration_handle.to_string());
            }
        }
        Ok(())
    }

    async fn remove_device(
        &self,
        group_name: &str,
        group_key: &str,
        registration_handle: &str,
    ) -> RelayResult<()> {
        let mut state = self.state.lock().await;
        if self.record {
            state.calls.push(RelayCall::RemoveDevice {
                group_name: group_name.to_string(),
                group_key: group_key.to_string(),
                handle: registration_handle.to_string(),
            });
        }
        if let Some(err) = state.group_failures.pop_front() {
            return Err(err);
        }
        check_key(&state, group_name, group_key)?;
        if let Some((_, members)) = state.groups.get_mut(group_name) {
            members.retain(|m| m != registration_handle);
        }
        Ok(())
    }

    async fn send(&self, message: &DownstreamMessage) -> RelayResult<()> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.send_failures.pop_front() {
            return Err(err);
        }
        if self.record {
            state.sent.push(message.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;

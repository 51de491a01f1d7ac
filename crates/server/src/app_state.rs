use relay_api::ApiContext;
use shared::protocol::InboundEvent;
use tokio::sync::mpsc;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    /// Feeds the relay ingress listener spawned at startup.
    pub(crate) ingress: mpsc::Sender<InboundEvent>,
    pub(crate) history_limit: u32,
    /// Shared key a relay connector must present on the upstream bridge.
    /// `None` keeps the bridge closed.
    pub(crate) upstream_key: Option<String>,
}

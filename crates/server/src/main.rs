use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use push_relay::{HttpPushRelay, MemoryRelay, PushRelay};
use relay_api::{ingress::RelayIngress, ApiContext};
use storage::Storage;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod routes;

use app_state::AppState;
use config::{load_settings, normalize_database_url};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings()?;
    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.with_context(|| {
        format!("failed to open database at {database_url}; check the parent directory and permissions")
    })?;

    let relay: Arc<dyn PushRelay> = match settings.relay_config()? {
        Some(relay_config) => {
            info!(group_url = %relay_config.group_url, "using http push relay");
            Arc::new(HttpPushRelay::new(relay_config).context("failed to build relay client")?)
        }
        None => {
            warn!("no relay endpoints configured, using in-process relay without delivery");
            Arc::new(MemoryRelay::unrecorded())
        }
    };

    let api = ApiContext::new(storage, relay);
    let (ingress_tx, ingress_rx) = mpsc::channel(settings.ingress_queue_capacity);
    let ingress = Arc::new(RelayIngress::new(api.clone()));
    tokio::spawn(ingress.run(ReceiverStream::new(ingress_rx)));

    let upstream_key = Some(settings.relay_api_key.clone()).filter(|key| !key.is_empty());
    if upstream_key.is_none() {
        warn!("relay_api_key is empty, upstream bridge refuses all events");
    }
    let state = AppState {
        api,
        ingress: ingress_tx,
        history_limit: settings.history_limit,
        upstream_key,
    };
    let app = routes::build_router(Arc::new(state));

    let addr: SocketAddr = settings
        .server_bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", settings.server_bind))?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

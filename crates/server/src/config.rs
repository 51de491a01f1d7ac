use std::{fs, io, time::Duration};

use anyhow::{bail, Context};
use push_relay::HttpRelayConfig;
use serde::Deserialize;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    /// Group management endpoint of the push relay. When unset together with
    /// `relay_send_url` the server runs against an in-process relay.
    pub relay_group_url: Option<String>,
    pub relay_send_url: Option<String>,
    pub relay_api_key: String,
    pub relay_sender_id: String,
    pub relay_timeout_secs: u64,
    pub history_limit: u32,
    pub ingress_queue_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/relay.db".into(),
            relay_group_url: None,
            relay_send_url: None,
            relay_api_key: String::new(),
            relay_sender_id: String::new(),
            relay_timeout_secs: 10,
            history_limit: 1000,
            ingress_queue_capacity: 256,
        }
    }
}

/// Keys accepted in `server.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    relay_group_url: Option<String>,
    relay_send_url: Option<String>,
    relay_api_key: Option<String>,
    relay_sender_id: Option<String>,
    relay_timeout_secs: Option<u64>,
    history_limit: Option<u32>,
    ingress_queue_capacity: Option<usize>,
}

pub fn load_settings() -> anyhow::Result<Settings> {
    let file = match fs::read_to_string("server.toml") {
        Ok(raw) => Some(raw),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => return Err(err).context("failed to read server.toml"),
    };
    settings_from(file.as_deref(), |key| std::env::var(key).ok())
}

/// Layers defaults, then the optional file contents, then environment
/// values. Later `APP__*` variables win over the short names.
pub fn settings_from(
    file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        let file_cfg: FileSettings = toml::from_str(raw).context("invalid server.toml")?;
        if let Some(v) = file_cfg.bind_addr {
            settings.server_bind = v;
        }
        if let Some(v) = file_cfg.database_url {
            settings.database_url = v;
        }
        settings.relay_group_url = file_cfg.relay_group_url.or(settings.relay_group_url);
        settings.relay_send_url = file_cfg.relay_send_url.or(settings.relay_send_url);
        if let Some(v) = file_cfg.relay_api_key {
            settings.relay_api_key = v;
        }
        if let Some(v) = file_cfg.relay_sender_id {
            settings.relay_sender_id = v;
        }
        if let Some(v) = file_cfg.relay_timeout_secs {
            settings.relay_timeout_secs = v;
        }
        if let Some(v) = file_cfg.history_limit {
            settings.history_limit = v;
        }
        if let Some(v) = file_cfg.ingress_queue_capacity {
            settings.ingress_queue_capacity = v;
        }
    }

    for key in ["SERVER_BIND", "APP__BIND_ADDR"] {
        if let Some(v) = env(key) {
            settings.server_bind = v;
        }
    }
    for key in ["DATABASE_URL", "APP__DATABASE_URL"] {
        if let Some(v) = env(key) {
            settings.database_url = v;
        }
    }
    if let Some(v) = env("RELAY_GROUP_URL") {
        settings.relay_group_url = Some(v);
    }
    if let Some(v) = env("RELAY_SEND_URL") {
        settings.relay_send_url = Some(v);
    }
    if let Some(v) = env("RELAY_API_KEY") {
        settings.relay_api_key = v;
    }
    if let Some(v) = env("RELAY_SENDER_ID") {
        settings.relay_sender_id = v;
    }
    if let Some(v) = env("RELAY_TIMEOUT_SECS") {
        settings.relay_timeout_secs = v
            .parse()
            .with_context(|| format!("RELAY_TIMEOUT_SECS must be an integer, got '{v}'"))?;
    }
    if let Some(v) = env("HISTORY_LIMIT") {
        settings.history_limit = v
            .parse()
            .with_context(|| format!("HISTORY_LIMIT must be an integer, got '{v}'"))?;
    }

    if settings.ingress_queue_capacity == 0 {
        bail!("ingress_queue_capacity must be greater than zero");
    }
    Ok(settings)
}

impl Settings {
    /// HTTP relay settings, or `None` when no relay endpoint is configured.
    /// Configuring only one of the two URLs is an error.
    pub fn relay_config(&self) -> anyhow::Result<Option<HttpRelayConfig>> {
        let (group_url, send_url) = match (&self.relay_group_url, &self.relay_send_url) {
            (None, None) => return Ok(None),
            (Some(group), Some(send)) => (group, send),
            _ => bail!("relay_group_url and relay_send_url must be configured together"),
        };
        Ok(Some(HttpRelayConfig {
            group_url: parse_relay_url("relay_group_url", group_url)?,
            send_url: parse_relay_url("relay_send_url", send_url)?,
            api_key: self.relay_api_key.clone(),
            sender_id: self.relay_sender_id.clone(),
            timeout: Duration::from_secs(self.relay_timeout_secs),
        }))
    }
}

fn parse_relay_url(name: &str, raw: &str) -> anyhow::Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("{name} is not a valid url: '{raw}'"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("{name} must use http or https, got '{}'", url.scheme());
    }
    Ok(url)
}

/// Brings plain paths and loose `sqlite:` forms into the `sqlite://` shape
/// the storage layer expects.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        if is_windows_drive_path(path) {
            return format!("sqlite:{}", path.replace('\\', "/"));
        }
        return raw_database_url.to_string();
    }

    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url
        .strip_prefix("sqlite:")
        .unwrap_or(raw_database_url)
        .replace('\\', "/");
    if is_windows_drive_path(&path) {
        return format!("sqlite:{path}");
    }
    format!("sqlite://{path}")
}

fn is_windows_drive_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;

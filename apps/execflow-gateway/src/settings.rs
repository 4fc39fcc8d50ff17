//! Layered settings: built-in defaults, an optional TOML file, then
//! `EXECFLOW__`-prefixed environment overrides — the same three-tier
//! shape the reference service loads its own configuration through,
//! adapted here from a bespoke TOML loader to the `config` crate.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

fn default_port() -> u16 {
    8088
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_broker_uri() -> String {
    "mem://local".to_string()
}

fn default_requests_queue() -> String {
    "feature.requests".to_string()
}

fn default_main_queue() -> String {
    "feature.events".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Deployment settings for the gateway binary.
#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    /// HTTP port to bind.
    #[serde(default = "default_port")]
    pub port: u16,
    /// `REDIS_URL`; required when any `*_backend` setting is `"redis"`.
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Repository hosts accepted on `repository_url`; empty means unrestricted.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// Broker URI the gateway publishes and the DLQ store requeues through.
    #[serde(default = "default_broker_uri")]
    pub broker_uri: String,
    /// Queue the gateway publishes accepted requests' first event to.
    #[serde(default = "default_requests_queue")]
    pub requests_queue: String,
    /// Main event stream queue, used as the DLQ store's default requeue target.
    #[serde(default = "default_main_queue")]
    pub main_queue: String,
    /// `trace`/`debug`/`info`/`warn`/`error`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `"memory"` or `"redis"`.
    #[serde(default = "default_backend")]
    pub sequence_backend: String,
    /// `"memory"` or `"redis"`.
    #[serde(default = "default_backend")]
    pub dedup_backend: String,
    /// `"memory"` or `"redis"`.
    #[serde(default = "default_backend")]
    pub lock_backend: String,
    /// `"memory"` or `"redis"`.
    #[serde(default = "default_backend")]
    pub dlq_backend: String,
}

impl Settings {
    /// Load settings: built-in defaults, overridden by `config_path` (if it
    /// exists), overridden by `EXECFLOW__*` environment variables.
    pub fn load(config_path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(config_path).required(false))
            .add_source(Environment::with_prefix("EXECFLOW").separator("__"))
            .build()
            .with_context(|| format!("failed to build configuration from {config_path}"))?;

        settings
            .try_deserialize()
            .context("failed to deserialize gateway settings")
    }

    fn parse_kind(raw: &str) -> execflow_backends::BackendKind {
        if raw.eq_ignore_ascii_case("redis") {
            execflow_backends::BackendKind::Redis
        } else {
            execflow_backends::BackendKind::Memory
        }
    }

    /// Project this settings object onto the backend factory's config type.
    pub fn backend_config(&self) -> execflow_backends::BackendConfig {
        execflow_backends::BackendConfig {
            redis_url: self.redis_url.clone(),
            sequence: Self::parse_kind(&self.sequence_backend),
            dedup: Self::parse_kind(&self.dedup_backend),
            lock: Self::parse_kind(&self.lock_backend),
            dlq: Self::parse_kind(&self.dlq_backend),
        }
    }
}

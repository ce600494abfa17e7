// ============================
// crates/backend-lib/src/config.rs
// ============================
//! Configuration management.
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Application settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Log level filter
    pub log_level: String,
    /// Heartbeat timeout in milliseconds; a session that has not
    /// answered a ping within this window is evicted
    pub heartbeat_timeout_ms: u64,
    /// Batch size for purging a member's location history on leave
    pub location_delete_batch: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 3000),
            log_level: "info".to_string(),
            heartbeat_timeout_ms: 30_000,
            location_delete_batch: 500,
        }
    }
}

impl Settings {
    /// Load settings from `rendezvous.toml` and `RENDEZVOUS_`-prefixed
    /// environment variables, the latter taking precedence.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("rendezvous.toml")
    }

    /// Load settings from an explicit config file path plus environment.
    pub fn load_from(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("RENDEZVOUS_"))
            .extract()
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Location purge batch size, clamped to a safe range.
    pub fn delete_batch(&self) -> usize {
        self.location_delete_batch.clamp(1, 500)
    }
}

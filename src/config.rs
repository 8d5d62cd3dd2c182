//! Engine configuration
//!
//! Connection identity and tuning knobs for a single engine instance.
//! Validation happens once at engine construction; every field after that is
//! read-only for the lifetime of the engine.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default initial reconnect backoff
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Default reconnect backoff cap
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Default heartbeat ping interval
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

/// Default silence interval after which the connection is considered lost
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(45);

/// Default soft cap on the event queue
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 16_384;

/// Default retention for acknowledged tombstones (at least one reconnect cycle)
pub const DEFAULT_TOMBSTONE_RETENTION: Duration = Duration::from_secs(60);

/// Configuration for an [`Engine`](crate::Engine) instance
#[derive(Clone)]
pub struct EngineConfig {
    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Sync server URL (`ws://` or `wss://`)
    pub server_url: String,

    /// User identifier sent during authentication
    pub email: String,

    /// API key (`rpa_` prefix)
    pub api_key: String,

    /// API secret (`rps_` prefix). Never leaves the process except as an HMAC.
    pub api_secret: String,

    /// Initial reconnect delay
    pub backoff_base: Duration,

    /// Maximum reconnect delay
    pub backoff_cap: Duration,

    /// Interval between heartbeat pings while connected
    pub ping_interval: Duration,

    /// Connection is considered lost after this much silence
    pub heartbeat_timeout: Duration,

    /// Soft cap on queued events before the oldest are discarded
    pub event_queue_capacity: usize,

    /// How long acknowledged tombstones are retained before physical removal
    pub tombstone_retention: Duration,
}

impl EngineConfig {
    /// Create a configuration with default tuning values
    pub fn new(
        database_path: impl Into<PathBuf>,
        server_url: impl Into<String>,
        email: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        Self {
            database_path: database_path.into(),
            server_url: server_url.into(),
            email: email.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            ping_interval: DEFAULT_PING_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            tombstone_retention: DEFAULT_TOMBSTONE_RETENTION,
        }
    }

    /// Validate identity fields
    ///
    /// Checks the URL scheme and the credential prefixes. Called by
    /// `Engine::new`; safe to call again at any time.
    pub fn validate(&self) -> Result<()> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(Error::InvalidInput(format!(
                "server_url must use ws:// or wss:// scheme: {}",
                self.server_url
            )));
        }

        if self.email.is_empty() {
            return Err(Error::InvalidInput("email must not be empty".to_string()));
        }

        if !self.api_key.starts_with("rpa_") {
            return Err(Error::InvalidInput(
                "api_key must start with rpa_".to_string(),
            ));
        }

        if !self.api_secret.starts_with("rps_") {
            return Err(Error::InvalidInput(
                "api_secret must start with rps_".to_string(),
            ));
        }

        Ok(())
    }
}

// Manual Debug so the secret can never end up in a log line.
impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("database_path", &self.database_path)
            .field("server_url", &self.server_url)
            .field("email", &self.email)
            .field("api_key", &self.api_key)
            .field("api_secret", &"rps_****")
            .field("backoff_base", &self.backoff_base)
            .field("backoff_cap", &self.backoff_cap)
            .field("ping_interval", &self.ping_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("event_queue_capacity", &self.event_queue_capacity)
            .field("tombstone_retention", &self.tombstone_retention)
            .finish()
    }
}

//! Relay server configuration, read from CLI flags and/or environment.

use std::collections::HashSet;

use clap::{Parser, ValueEnum};

#[derive(Parser, Debug, Clone)]
#[command(name = "relaymux-server")]
#[command(author, version, about = "Public relay for reverse HTTP tunnels", long_about = None)]
pub struct RelayConfig {
    /// Port the public HTTP/WebSocket listener binds to
    #[arg(long, env = "RELAY_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Base domain tunnels are published under, e.g. `tunnels.example.com`
    #[arg(long, env = "RELAY_DOMAIN", default_value = "relaymux.local")]
    pub domain: String,

    /// Shared secrets clients may present on the control channel handshake,
    /// comma-separated. When unset, the relay accepts any client
    /// (development mode). Keys are not unique per tunnel: any number of
    /// clients may present the same key and each still gets its own
    /// subdomain.
    #[arg(long = "secret-key", env = "RELAY_SECRET_KEY", value_delimiter = ',')]
    pub secret_keys: Vec<String>,

    /// Length, in characters, of a generated subdomain
    #[arg(long, env = "RELAY_SUBDOMAIN_LENGTH", default_value_t = 12)]
    pub subdomain_length: usize,

    /// Maximum number of attempts the allocator makes before giving up
    #[arg(long, env = "RELAY_ALLOCATOR_ATTEMPTS", default_value_t = 100)]
    pub allocator_attempts: u32,

    /// How long the router waits for a client's response before failing
    /// a forwarded request with a timeout.
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Interval between server-initiated PING control frames.
    #[arg(long, env = "RELAY_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Maximum request/response body size accepted from either side.
    #[arg(long, env = "RELAY_MAX_BODY_BYTES", default_value_t = relaymux_shared::protocol::MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// Whether shutdown waits for in-flight requests to drain or completes
    /// them with SERVER_ERROR immediately.
    #[arg(long, env = "RELAY_SHUTDOWN_MODE", value_enum, default_value_t = ShutdownMode::Graceful)]
    pub shutdown_mode: ShutdownMode,

    /// Upper bound on how long graceful shutdown waits for the pending
    /// table to drain before giving up and completing what's left anyway.
    #[arg(long, env = "RELAY_GRACEFUL_SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    pub graceful_shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ShutdownMode {
    Graceful,
    Immediate,
}

impl RelayConfig {
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn graceful_shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }

    /// `None` means "accept any client" (development mode, no keys configured).
    pub fn secret_key_set(&self) -> Option<HashSet<String>> {
        if self.secret_keys.is_empty() {
            None
        } else {
            Some(self.secret_keys.iter().cloned().collect())
        }
    }
}

//! Client configuration, read from CLI flags and/or environment.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "relaymux")]
#[command(author, version, about = "Expose a local service through a relaymux tunnel", long_about = None)]
pub struct ClientConfig {
    /// WebSocket URL of the relay server's tunnel endpoint
    #[arg(short = 's', long = "server-url", env = "RELAY_SERVER_URL")]
    pub server_url: String,

    /// Shared secret presented to the relay during the channel handshake
    #[arg(short = 'k', long = "secret-key", env = "RELAY_SECRET_KEY")]
    pub secret_key: Option<String>,

    /// Base URL of the local service to forward requests to
    #[arg(short = 'l', long = "local-url", env = "RELAY_LOCAL_URL")]
    pub local_url: String,

    /// Preferred subdomain to request from the relay
    #[arg(short = 'd', long = "subdomain", env = "RELAY_SUBDOMAIN")]
    pub subdomain: Option<String>,

    /// Disable automatic reconnection after the channel drops
    #[arg(long = "no-reconnect")]
    pub no_reconnect: bool,

    /// Initial reconnect delay, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub reconnect_initial_ms: u64,

    /// Maximum reconnect delay, in milliseconds
    #[arg(long, default_value_t = 60_000)]
    pub reconnect_max_ms: u64,

    /// Backoff multiplier applied after each failed attempt
    #[arg(long, default_value_t = 2.0)]
    pub reconnect_multiplier: f64,

    /// Symmetric jitter fraction applied to each computed delay
    #[arg(long, default_value_t = 0.1)]
    pub reconnect_jitter: f64,

    /// Timeout for a single request against the local service, in seconds
    #[arg(long, default_value_t = 30)]
    pub origin_timeout_secs: u64,

    /// Maximum number of requests forwarded to the local service at once
    #[arg(long, default_value_t = 64)]
    pub max_concurrent_requests: usize,
}

impl ClientConfig {
    pub fn origin_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.origin_timeout_secs)
    }
}

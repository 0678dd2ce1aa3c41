//! Error types shared by the relay and the client.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication failed")]
    AuthFailed,

    #[error("invalid envelope")]
    InvalidMessage,

    #[error("request timed out")]
    Timeout,

    #[error("subdomain allocation exhausted after {attempts} attempts")]
    AllocationExhausted { attempts: u32 },

    #[error("subdomain length must be positive, got {0}")]
    InvalidSubdomainLength(usize),

    #[error("shutdown requested")]
    ShutdownRequested,
}

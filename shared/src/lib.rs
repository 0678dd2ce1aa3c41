//! Relaymux Shared Library
//!
//! Envelope/payload wire types and the codec used by both the relay and
//! the client to exchange requests and responses over a tunnel channel.

pub mod error;
pub mod protocol;

pub use error::{Error, Result};

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by the resolution and forwarding pipeline.
///
/// Negative lookups (an undecodable name, no matching instance) are not
/// errors; they surface as `None` from the locator.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("dns transport error: {0}")]
    Transport(String),

    #[error("dns message error: {0}")]
    Dns(String),

    #[error("inventory error: {0}")]
    Inventory(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no free local port in {start}..{end}")]
    ResourceExhausted { start: u16, end: u16 },

    #[error("session on {addr} not ready after {attempts} attempts")]
    ReadinessTimeout { addr: SocketAddr, attempts: u32 },

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("invalid engine state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("{hook} hook failed: {message}")]
    Hook { hook: String, message: String },

    #[error("{0}")]
    Shared(Arc<LinkError>),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<hickory_proto::ProtoError> for LinkError {
    fn from(e: hickory_proto::ProtoError) -> Self {
        LinkError::Dns(e.to_string())
    }
}

pub type LinkResult<T> = Result<T, LinkError>;

use std::io;

use thiserror::Error;

use crate::infragate::{protocol::ProtocolError, proxy_protocol::ProxyProtocolError};

/// Failure taxonomy of the gateway core.
///
/// Connection-scoped errors stay inside the connection task; only `Bind`,
/// `InvalidBackend` and `Closed` reach the caller of a registration operation.
/// Routing key collisions are not errors: the newer backend wins and the
/// takeover is reported as an event.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("decode: {0}")]
    Decode(String),
    #[error("no backend for {0}")]
    RoutingMiss(String),
    #[error("transport: {0}")]
    Transport(#[from] io::Error),
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("gateway closed")]
    Closed,
    #[error("invalid backend: {0}")]
    InvalidBackend(String),
}

impl GatewayError {
    /// Stable label used in events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::RoutingMiss(_) => "routing_miss",
            Self::Transport(_) => "transport",
            Self::Bind { .. } => "bind",
            Self::Closed => "closed",
            Self::InvalidBackend(_) => "invalid_backend",
        }
    }
}

impl From<ProtocolError> for GatewayError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => Self::Transport(e),
            other => Self::Decode(other.to_string()),
        }
    }
}

impl From<ProxyProtocolError> for GatewayError {
    fn from(err: ProxyProtocolError) -> Self {
        match err {
            ProxyProtocolError::Io(e) => Self::Transport(e),
            other => Self::Decode(other.to_string()),
        }
    }
}

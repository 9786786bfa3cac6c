//! Bus-level error kinds.
//!
//! Every error that can surface in an error-reply body maps to a stable
//! textual name via [`BusError::name`]. The names are part of the wire
//! contract and must not change between releases; the enum variants and
//! their payloads are free to evolve.

use thiserror::Error;

/// Errors produced by the routing core and surfaced to peers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// A request carried arguments of the wrong count or type.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// A message body did not match its declared signature.
    #[error("bad signature: expected {expected}, got {got}")]
    BadSignature {
        /// Signature the operation required.
        expected: String,
        /// Signature actually present.
        got: String,
    },

    /// No local endpoint, alias owner, or virtual endpoint matched the
    /// destination of a routed message.
    #[error("no route to destination {0}")]
    NoDestination(String),

    /// A name lookup failed.
    #[error("name {0} is not known to this daemon")]
    NameUnknown(String),

    /// The caller does not own the name it tried to operate on.
    #[error("caller does not own {0}")]
    NotOwner(String),

    /// The name is already registered.
    #[error("{0} is already owned")]
    AlreadyOwned(String),

    /// An authentication mechanism name was not recognized.
    #[error("unknown authentication mechanism {0}")]
    InvalidAuthMechanism(String),

    /// The peer failed authentication.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The handshake did not complete within the configured deadline.
    #[error("authentication timed out")]
    AuthTimeout,

    /// The peer speaks an incompatible protocol version.
    #[error("protocol mismatch: local {local}, peer {peer}")]
    ProtocolMismatch {
        /// Version implemented by this daemon.
        local: u32,
        /// Version reported by the peer.
        peer: u32,
    },

    /// The underlying stream closed mid-operation.
    #[error("stream closed")]
    StreamClosed,

    /// A message outlived its time-to-live before delivery.
    #[error("message expired in transit")]
    TtlExpired,

    /// The message was refused by federation policy.
    #[error("message not allowed across bus boundary")]
    BusNotAllowed,

    /// No registered transport can satisfy the request.
    #[error("transport not available: {0}")]
    TransportNotAvailable(String),

    /// The daemon configuration is invalid.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The daemon is shutting down.
    #[error("daemon is shutting down")]
    Shutdown,
}

impl BusError {
    /// Stable textual name carried in error-reply bodies.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::InvalidArgs(_) => "INVALID_ARGS",
            Self::BadSignature { .. } => "BAD_SIGNATURE",
            Self::NoDestination(_) => "ROUTING_NO_DESTINATION",
            Self::NameUnknown(_) => "NAME_UNKNOWN",
            Self::NotOwner(_) => "NOT_OWNER",
            Self::AlreadyOwned(_) => "ALREADY_OWNED",
            Self::InvalidAuthMechanism(_) => "INVALID_AUTH_MECHANISM",
            Self::AuthFailed(_) => "AUTH_FAILED",
            Self::AuthTimeout => "AUTH_TIMEOUT",
            Self::ProtocolMismatch { .. } => "PROTOCOL_MISMATCH",
            Self::StreamClosed => "STREAM_CLOSED",
            Self::TtlExpired => "TTL_EXPIRED",
            Self::BusNotAllowed => "BUS_NOT_ALLOWED",
            Self::TransportNotAvailable(_) => "TRANSPORT_NOT_AVAILABLE",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::Shutdown => "SHUTDOWN",
        }
    }
}

//! Transport coordination.
//!
//! Transports are factories that yield byte streams. The daemon consumes
//! them through the [`Transport`] trait and hears back through
//! [`TransportEvent`]s: accepted streams, discovery results, and surprise
//! disconnects. A connect spec (`scheme:key=val,...`) has a one-to-one
//! relationship with a transport via its scheme, and a normalized spec is
//! the canonical key for the control object's connect map.

pub mod name_service;
pub mod tcp;
pub mod unix;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe byte stream.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// A connected, not yet authenticated, byte stream.
pub type BusStream = Box<dyn StreamIo>;

/// Transport-layer failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connect spec could not be parsed or lacks required keys.
    #[error("invalid connect spec: {0}")]
    InvalidSpec(String),

    /// No registered transport handles the scheme.
    #[error("no transport for scheme {0}")]
    NoTransport(String),

    /// The transport does not implement the requested capability.
    #[error("transport does not support {0}")]
    NotSupported(&'static str),

    /// The transport is already listening.
    #[error("already listening on {0}")]
    AlreadyListening(String),

    /// Underlying socket failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parsed, normalizable transport address: `scheme:key=val,key=val`.
///
/// Keys are sorted in the canonical form, so two spellings of the same
/// address normalize to the same string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectSpec {
    scheme: String,
    args: BTreeMap<String, String>,
}

impl ConnectSpec {
    /// Parses a spec string.
    pub fn parse(spec: &str) -> Result<Self, TransportError> {
        let (scheme, rest) = spec
            .split_once(':')
            .ok_or_else(|| TransportError::InvalidSpec(format!("missing scheme: {spec}")))?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(TransportError::InvalidSpec(format!("bad scheme: {spec}")));
        }
        let mut args = BTreeMap::new();
        for pair in rest.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| TransportError::InvalidSpec(format!("bad argument {pair:?}")))?;
            if key.is_empty() {
                return Err(TransportError::InvalidSpec(format!("empty key in {spec}")));
            }
            args.insert(key.to_string(), value.to_string());
        }
        Ok(Self {
            scheme: scheme.to_string(),
            args,
        })
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    /// Canonical string form: scheme, then arguments in sorted key order.
    #[must_use]
    pub fn canonical(&self) -> String {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!("{}:{}", self.scheme, args.join(","))
    }
}

impl fmt::Display for ConnectSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Events a transport surfaces to the daemon.
pub enum TransportEvent {
    /// A listener accepted a stream; the handshake has not run yet.
    IncomingStream {
        /// The raw stream.
        stream: BusStream,
        /// Peer address in spec form, for logging.
        remote_addr: String,
    },
    /// A remote daemon's advertisements were heard. A `ttl_secs` of zero
    /// announces explicit loss.
    FoundNames {
        /// Bus address the remote daemon is reachable at.
        bus_addr: String,
        /// Remote daemon GUID.
        guid: String,
        /// Advertised well-known names.
        names: Vec<String>,
        /// Advertisement lifetime in seconds.
        ttl_secs: u32,
    },
    /// A transport noticed an established bus link drop.
    ConnectionLost {
        /// Bus address of the lost link.
        bus_addr: String,
    },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncomingStream { remote_addr, .. } => f
                .debug_struct("IncomingStream")
                .field("remote_addr", remote_addr)
                .finish_non_exhaustive(),
            Self::FoundNames {
                bus_addr,
                guid,
                names,
                ttl_secs,
            } => f
                .debug_struct("FoundNames")
                .field("bus_addr", bus_addr)
                .field("guid", guid)
                .field("names", names)
                .field("ttl_secs", ttl_secs)
                .finish(),
            Self::ConnectionLost { bus_addr } => f
                .debug_struct("ConnectionLost")
                .field("bus_addr", bus_addr)
                .finish(),
        }
    }
}

/// One transport implementation (tcp, unix, ...).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Spec scheme this transport owns.
    fn scheme(&self) -> &'static str;

    /// Whether this transport can advertise and discover names.
    fn supports_advertisement(&self) -> bool {
        false
    }

    /// Opens an outbound stream to `spec`.
    async fn connect(&self, spec: &ConnectSpec) -> Result<BusStream, TransportError>;

    /// Starts listening per `spec`; accepted streams surface as
    /// [`TransportEvent::IncomingStream`]. Returns the bound address in
    /// spec form.
    async fn start_listen(&self, spec: &ConnectSpec) -> Result<String, TransportError>;

    /// Stops the listener.
    async fn stop_listen(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Begins advertising `name`.
    async fn enable_advertisement(&self, _name: &str) -> Result<(), TransportError> {
        Err(TransportError::NotSupported("advertisement"))
    }

    /// Stops advertising `name`, announcing the loss.
    async fn disable_advertisement(&self, _name: &str) -> Result<(), TransportError> {
        Err(TransportError::NotSupported("advertisement"))
    }

    /// Begins discovery for names under `prefix`.
    async fn enable_discovery(&self, _prefix: &str) -> Result<(), TransportError> {
        Err(TransportError::NotSupported("discovery"))
    }

    /// Stops discovery for `prefix`.
    async fn disable_discovery(&self, _prefix: &str) -> Result<(), TransportError> {
        Err(TransportError::NotSupported("discovery"))
    }
}

/// Registry of the daemon's transports, keyed by scheme.
#[derive(Default)]
pub struct TransportList {
    transports: Mutex<Vec<Arc<dyn Transport>>>,
}

impl TransportList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transport. Last registration of a scheme wins.
    pub fn register(&self, transport: Arc<dyn Transport>) {
        let mut transports = self.transports.lock().unwrap();
        transports.retain(|t| t.scheme() != transport.scheme());
        transports.push(transport);
    }

    /// Finds the transport owning `scheme`.
    #[must_use]
    pub fn by_scheme(&self, scheme: &str) -> Option<Arc<dyn Transport>> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.scheme() == scheme)
            .cloned()
    }

    /// Parses and validates a spec against the registered transports.
    pub fn normalize(&self, spec: &str) -> Result<ConnectSpec, TransportError> {
        let parsed = ConnectSpec::parse(spec)?;
        if self.by_scheme(parsed.scheme()).is_none() {
            return Err(TransportError::NoTransport(parsed.scheme().to_string()));
        }
        Ok(parsed)
    }

    /// Transports able to advertise and discover names.
    #[must_use]
    pub fn advertising(&self) -> Vec<Arc<dyn Transport>> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.supports_advertisement())
            .cloned()
            .collect()
    }

    /// Snapshot of every registered transport.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<dyn Transport>> {
        self.transports.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_normalization_sorts_arguments() {
        let a = ConnectSpec::parse("tcp:port=9955,addr=10.0.0.2").unwrap();
        let b = ConnectSpec::parse("tcp:addr=10.0.0.2,port=9955").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.canonical(), "tcp:addr=10.0.0.2,port=9955");
        assert_eq!(a.get("port"), Some("9955"));
        assert_eq!(a.scheme(), "tcp");
    }

    #[test]
    fn malformed_specs_are_rejected() {
        assert!(ConnectSpec::parse("no-scheme-here").is_err());
        assert!(ConnectSpec::parse(":addr=1").is_err());
        assert!(ConnectSpec::parse("tcp:addr").is_err());
        assert!(ConnectSpec::parse("tcp:=1").is_err());
    }

    #[test]
    fn empty_argument_list_is_valid() {
        let spec = ConnectSpec::parse("unix:").unwrap();
        assert_eq!(spec.canonical(), "unix:");
    }

    #[test]
    fn unknown_scheme_has_no_transport() {
        let list = TransportList::new();
        assert!(matches!(
            list.normalize("bluetooth:"),
            Err(TransportError::NoTransport(scheme)) if scheme == "bluetooth"
        ));
    }
}

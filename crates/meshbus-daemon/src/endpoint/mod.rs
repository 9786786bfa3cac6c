//! Endpoints and the endpoint registry.
//!
//! An [`EndpointHandle`] is the router-facing face of one attached peer: its
//! identity learned during the handshake, its lifecycle state, and a bounded
//! outbound queue feeding the write task that owns the stream's send half.
//!
//! The [`EndpointRegistry`] holds the only strong references. The name
//! table and the virtual-endpoint map store unique-name keys and resolve
//! through the registry, so endpoint teardown is: remove the key, then drop
//! the registry slot — no reference cycles to break.

pub mod virtual_endpoint;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use meshbus_core::{BusGuid, Message};

/// What kind of peer sits on the other side of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// A locally attached client.
    Local,
    /// A link to a peer daemon.
    BusToBus,
    /// The daemon's own bus-management endpoint.
    Control,
}

/// Endpoint lifecycle. Transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Stream accepted, handshake not begun.
    Starting,
    /// Handshake in progress.
    Authenticating,
    /// Registered and routing.
    Running,
    /// Teardown initiated; queues are draining.
    Stopping,
    /// Fully torn down.
    Stopped,
}

/// Failure to enqueue a message on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The bounded queue is full.
    Full,
    /// The endpoint's write task is gone.
    Closed,
}

/// Per-endpoint broadcast-signal filter. The default accepts everything;
/// a restricted filter accepts only the listed interface prefixes.
#[derive(Debug, Default)]
pub struct SignalFilter {
    interface_prefixes: Option<Vec<String>>,
}

impl SignalFilter {
    /// Whether this filter accepts a broadcast of `interface`.
    #[must_use]
    pub fn accepts(&self, interface: Option<&str>) -> bool {
        match (&self.interface_prefixes, interface) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(prefixes), Some(interface)) => {
                prefixes.iter().any(|p| interface.starts_with(p.as_str()))
            }
        }
    }

    /// Restricts the filter to the given interface prefixes.
    pub fn restrict_to(&mut self, prefixes: Vec<String>) {
        self.interface_prefixes = Some(prefixes);
    }
}

/// One registered endpoint.
pub struct EndpointHandle {
    unique_name: String,
    kind: EndpointKind,
    peer_name: String,
    peer_guid: Option<BusGuid>,
    peer_protocol_version: u32,
    allow_remote: bool,
    is_acceptor: bool,
    /// Normalized connect spec of the carrying transport link, bus-to-bus
    /// only.
    bus_addr: Option<String>,
    tx: mpsc::Sender<Message>,
    state: Mutex<EndpointState>,
    filter: Mutex<SignalFilter>,
    overflow: AtomicU32,
    stop: CancellationToken,
}

impl EndpointHandle {
    /// Creates a handle and the receiving half of its outbound queue.
    #[must_use]
    pub fn new(
        unique_name: String,
        kind: EndpointKind,
        peer_name: String,
        peer_guid: Option<BusGuid>,
        peer_protocol_version: u32,
        allow_remote: bool,
        is_acceptor: bool,
        bus_addr: Option<String>,
        queue_depth: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let handle = Arc::new(Self {
            unique_name,
            kind,
            peer_name,
            peer_guid,
            peer_protocol_version,
            allow_remote,
            is_acceptor,
            bus_addr,
            tx,
            state: Mutex::new(EndpointState::Starting),
            filter: Mutex::new(SignalFilter::default()),
            overflow: AtomicU32::new(0),
            stop: CancellationToken::new(),
        });
        (handle, rx)
    }

    /// Token cancelled when the endpoint must shut down. The endpoint's
    /// read and write tasks select on it.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Initiates teardown: marks the endpoint stopping and cancels its
    /// I/O tasks.
    pub fn request_stop(&self) {
        self.set_state(EndpointState::Stopping);
        self.stop.cancel();
    }

    #[must_use]
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    #[must_use]
    pub const fn kind(&self) -> EndpointKind {
        self.kind
    }

    #[must_use]
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    #[must_use]
    pub const fn peer_guid(&self) -> Option<BusGuid> {
        self.peer_guid
    }

    #[must_use]
    pub const fn peer_protocol_version(&self) -> u32 {
        self.peer_protocol_version
    }

    #[must_use]
    pub const fn allow_remote(&self) -> bool {
        self.allow_remote
    }

    #[must_use]
    pub const fn is_acceptor(&self) -> bool {
        self.is_acceptor
    }

    #[must_use]
    pub fn bus_addr(&self) -> Option<&str> {
        self.bus_addr.as_deref()
    }

    #[must_use]
    pub fn state(&self) -> EndpointState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: EndpointState) {
        *self.state.lock().unwrap() = state;
    }

    /// Whether a broadcast signal with the given interface passes this
    /// endpoint's filter.
    #[must_use]
    pub fn accepts_broadcast(&self, interface: Option<&str>) -> bool {
        self.filter.lock().unwrap().accepts(interface)
    }

    /// Restricts the endpoint's broadcast filter.
    pub fn restrict_signals(&self, interface_prefixes: Vec<String>) {
        self.filter.lock().unwrap().restrict_to(interface_prefixes);
    }

    /// Non-blocking enqueue onto the outbound queue. A success resets the
    /// overflow counter; a full queue increments it.
    pub fn enqueue(&self, msg: Message) -> Result<(), EnqueueError> {
        match self.tx.try_send(msg) {
            Ok(()) => {
                self.overflow.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                Err(EnqueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Consecutive overflows since the last successful enqueue.
    #[must_use]
    pub fn overflow_count(&self) -> u32 {
        self.overflow.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("unique_name", &self.unique_name)
            .field("kind", &self.kind)
            .field("peer_name", &self.peer_name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// The daemon-wide strong-reference endpoint store.
#[derive(Default)]
pub struct EndpointRegistry {
    inner: Mutex<HashMap<String, Arc<EndpointHandle>>>,
}

impl EndpointRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an endpoint under its unique name. Returns false if the
    /// name is already taken.
    pub fn add(&self, endpoint: Arc<EndpointHandle>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(endpoint.unique_name()) {
            return false;
        }
        inner.insert(endpoint.unique_name().to_string(), endpoint);
        true
    }

    /// Removes and returns the endpoint registered under `unique_name`.
    pub fn remove(&self, unique_name: &str) -> Option<Arc<EndpointHandle>> {
        self.inner.lock().unwrap().remove(unique_name)
    }

    #[must_use]
    pub fn get(&self, unique_name: &str) -> Option<Arc<EndpointHandle>> {
        self.inner.lock().unwrap().get(unique_name).cloned()
    }

    /// Snapshot of all local (client) endpoints.
    #[must_use]
    pub fn local_endpoints(&self) -> Vec<Arc<EndpointHandle>> {
        self.of_kind(EndpointKind::Local)
    }

    /// Snapshot of all bus-to-bus endpoints.
    #[must_use]
    pub fn b2b_endpoints(&self) -> Vec<Arc<EndpointHandle>> {
        self.of_kind(EndpointKind::BusToBus)
    }

    fn of_kind(&self, kind: EndpointKind) -> Vec<Arc<EndpointHandle>> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    /// Snapshot of every registered endpoint.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<EndpointHandle>> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbus_core::Message;

    fn handle(name: &str, kind: EndpointKind, depth: usize) -> (Arc<EndpointHandle>, mpsc::Receiver<Message>) {
        EndpointHandle::new(
            name.into(),
            kind,
            ":peer".into(),
            None,
            2,
            false,
            true,
            None,
            depth,
        )
    }

    #[test]
    fn bounded_queue_reports_overflow() {
        let (ep, mut rx) = handle(":1.0", EndpointKind::Local, 1);
        let msg = Message::signal(1, "/p", "i.f", "S", vec![]);

        assert!(ep.enqueue(msg.clone()).is_ok());
        assert_eq!(ep.enqueue(msg.clone()), Err(EnqueueError::Full));
        assert_eq!(ep.enqueue(msg.clone()), Err(EnqueueError::Full));
        assert_eq!(ep.overflow_count(), 2);

        rx.try_recv().unwrap();
        assert!(ep.enqueue(msg).is_ok());
        assert_eq!(ep.overflow_count(), 0);
    }

    #[test]
    fn closed_queue_reports_closed() {
        let (ep, rx) = handle(":1.0", EndpointKind::Local, 1);
        drop(rx);
        let msg = Message::signal(1, "/p", "i.f", "S", vec![]);
        assert_eq!(ep.enqueue(msg), Err(EnqueueError::Closed));
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let registry = EndpointRegistry::new();
        let (a, _rx_a) = handle(":1.0", EndpointKind::Local, 4);
        let (b, _rx_b) = handle(":1.0", EndpointKind::Local, 4);
        assert!(registry.add(a));
        assert!(!registry.add(b));
        assert!(registry.get(":1.0").is_some());
        assert!(registry.remove(":1.0").is_some());
        assert!(registry.get(":1.0").is_none());
    }

    #[test]
    fn kind_snapshots_are_disjoint() {
        let registry = EndpointRegistry::new();
        let (local, _r1) = handle(":1.0", EndpointKind::Local, 4);
        let (b2b, _r2) = handle(":1.1", EndpointKind::BusToBus, 4);
        registry.add(local);
        registry.add(b2b);
        assert_eq!(registry.local_endpoints().len(), 1);
        assert_eq!(registry.b2b_endpoints().len(), 1);
    }

    #[test]
    fn signal_filter_defaults_to_accept_all() {
        let (ep, _rx) = handle(":1.0", EndpointKind::Local, 4);
        assert!(ep.accepts_broadcast(Some("org.example.Anything")));
        assert!(ep.accepts_broadcast(None));

        ep.restrict_signals(vec!["org.alljoyn.".into()]);
        assert!(ep.accepts_broadcast(Some("org.alljoyn.Bus")));
        assert!(!ep.accepts_broadcast(Some("org.example.Other")));
        assert!(!ep.accepts_broadcast(None));
    }
}

//! The bus: wiring and lifecycle.
//!
//! A [`Bus`] owns every long-lived piece of the daemon — the name table,
//! endpoint registry, virtual-endpoint map, router, transports, auth
//! manager, and the control object — and runs the event loop that turns
//! transport events and router commands into state changes.
//!
//! Endpoint bring-up is: transport yields a stream, the handshake runs on
//! it, and only then is the endpoint registered and its read/write tasks
//! spawned. No routed message is accepted from a stream before the
//! handshake completes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use meshbus_core::{
    BusConfig, BusError, BusGuid, JsonCodec, MessageCodec, NameTable, SerialCounter,
};

use crate::auth::{AuthManager, EndpointAuth, KeyStore};
use crate::control::{reaper, ControlObject, BUS_NAME, CONTROL_ENDPOINT_NAME};
use crate::endpoint::virtual_endpoint::VirtualEndpointMap;
use crate::endpoint::{EndpointHandle, EndpointKind, EndpointRegistry, EndpointState};
use crate::protocol::{FrameCodec, MAX_HANDSHAKE_FRAME_SIZE};
use crate::router::{Router, RouterCommand};
use crate::transport::name_service::{self, NameService};
use crate::transport::tcp::TcpTransport;
use crate::transport::unix::UnixTransport;
use crate::transport::{BusStream, ConnectSpec, TransportEvent, TransportList};

/// The daemon core.
pub struct Bus {
    guid: BusGuid,
    node_id: u32,
    unique_counter: AtomicU32,
    config: BusConfig,

    names: Arc<NameTable>,
    registry: Arc<EndpointRegistry>,
    virtuals: Arc<VirtualEndpointMap>,
    router: Arc<Router>,
    transports: Arc<TransportList>,
    tcp: Arc<TcpTransport>,
    auth: Arc<AuthManager>,
    endpoint_auth: EndpointAuth,
    control: Arc<ControlObject>,
    codec: Arc<dyn MessageCodec>,

    cancel: CancellationToken,
    local_addrs: Mutex<Vec<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    commands_tx: mpsc::UnboundedSender<RouterCommand>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<RouterCommand>>>,
    control_rx: Mutex<Option<mpsc::Receiver<meshbus_core::Message>>>,
}

impl Bus {
    /// Builds a bus with a random GUID.
    pub fn new(config: BusConfig, key_store: Arc<dyn KeyStore>) -> Result<Arc<Self>, BusError> {
        let guid = BusGuid::generate();
        let node_id = guid.node_id();
        Self::with_identity(config, key_store, guid, node_id)
    }

    /// Builds a bus with a pinned identity, used by tests that need
    /// predictable unique names.
    pub fn with_identity(
        config: BusConfig,
        key_store: Arc<dyn KeyStore>,
        guid: BusGuid,
        node_id: u32,
    ) -> Result<Arc<Self>, BusError> {
        let names = Arc::new(NameTable::new());
        let registry = Arc::new(EndpointRegistry::new());
        let virtuals = Arc::new(VirtualEndpointMap::new());
        let serials = Arc::new(SerialCounter::new());
        let transports = Arc::new(TransportList::new());
        let cancel = CancellationToken::new();

        let (events_tx, events_rx) = mpsc::channel(64);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let auth = Arc::new(AuthManager::with_default_mechanisms(key_store));
        if !config.auth_mechanisms.trim().is_empty() {
            auth.check_names(&config.auth_mechanisms)?;
            if auth.filter_mechanisms(&config.auth_mechanisms) == 0 {
                return Err(BusError::ConfigError(
                    "no supported authentication mechanisms".into(),
                ));
            }
        }

        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            Arc::clone(&names),
            Arc::clone(&virtuals),
            Arc::clone(&serials),
            commands_tx.clone(),
            config.limits.b2b_overflow_limit,
        ));
        let control = ControlObject::new(
            guid,
            Arc::clone(&names),
            Arc::clone(&registry),
            Arc::clone(&virtuals),
            Arc::clone(&transports),
            Arc::clone(&serials),
        );
        control.set_router(Arc::clone(&router));
        names.add_listener(Arc::clone(&control) as Arc<dyn meshbus_core::NameListener>);

        let unix = Arc::new(UnixTransport::new(events_tx.clone(), cancel.child_token()));
        let tcp = Arc::new(TcpTransport::new(events_tx.clone(), cancel.child_token()));
        transports.register(Arc::clone(&unix) as Arc<dyn crate::transport::Transport>);
        transports.register(Arc::clone(&tcp) as Arc<dyn crate::transport::Transport>);

        // The control object's own endpoint: a queue consumed by the
        // method-dispatch task, registered like any other endpoint.
        let (control_ep, control_rx) = EndpointHandle::new(
            CONTROL_ENDPOINT_NAME.to_string(),
            EndpointKind::Control,
            CONTROL_ENDPOINT_NAME.to_string(),
            Some(guid),
            meshbus_core::PROTOCOL_VERSION,
            true,
            true,
            None,
            config.limits.queue_depth,
        );
        control_ep.set_state(EndpointState::Running);
        registry.add(Arc::clone(&control_ep));
        names.add_unique_name(CONTROL_ENDPOINT_NAME)?;
        names.request_name(BUS_NAME, CONTROL_ENDPOINT_NAME, 0)?;
        control.set_endpoint(Arc::clone(&control_ep));

        let endpoint_auth = EndpointAuth::new(Arc::clone(&auth), config.limits.auth_timeout);

        let bus = Arc::new(Self {
            guid,
            node_id,
            unique_counter: AtomicU32::new(0),
            config,
            names,
            registry,
            virtuals,
            router,
            transports,
            tcp,
            auth,
            endpoint_auth,
            control,
            codec: Arc::new(JsonCodec),
            cancel,
            local_addrs: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            commands_tx,
            commands_rx: Mutex::new(Some(commands_rx)),
            control_rx: Mutex::new(Some(control_rx)),
        });
        bus.control.set_bus(Arc::downgrade(&bus));
        Ok(bus)
    }

    /// Daemon GUID.
    #[must_use]
    pub const fn guid(&self) -> BusGuid {
        self.guid
    }

    /// The control object.
    #[must_use]
    pub fn control(&self) -> &Arc<ControlObject> {
        &self.control
    }

    /// The router.
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// The endpoint registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// The name table.
    #[must_use]
    pub fn names(&self) -> &Arc<NameTable> {
        &self.names
    }

    /// The virtual-endpoint map.
    #[must_use]
    pub fn virtuals(&self) -> &Arc<VirtualEndpointMap> {
        &self.virtuals
    }

    /// Addresses the bus is listening on, in spec form.
    #[must_use]
    pub fn local_addresses(&self) -> Vec<String> {
        self.local_addrs.lock().unwrap().clone()
    }

    /// Shutdown token; child tokens drive every task the bus spawns.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Generates the next unique name, `:<node>.<counter>`.
    #[must_use]
    pub fn next_unique_name(&self) -> String {
        let n = self.unique_counter.fetch_add(1, Ordering::Relaxed);
        format!(":{}.{}", self.node_id, n)
    }

    /// Re-applies the configured mechanism filter, e.g. after a config
    /// reload. Returns the number of active mechanisms.
    pub fn apply_auth_filter(&self, list: &str) -> usize {
        self.auth.filter_mechanisms(list)
    }

    /// Starts listeners, the discovery name service, the reaper, the
    /// control dispatcher, and the event loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), BusError> {
        for spec_str in self.config.listen.clone() {
            let spec = self
                .transports
                .normalize(&spec_str)
                .map_err(|e| BusError::TransportNotAvailable(e.to_string()))?;
            let transport = self
                .transports
                .by_scheme(spec.scheme())
                .ok_or_else(|| BusError::TransportNotAvailable(spec.scheme().to_string()))?;
            let bound = transport
                .start_listen(&spec)
                .await
                .map_err(|e| BusError::TransportNotAvailable(e.to_string()))?;
            self.local_addrs.lock().unwrap().push(bound);
        }

        // Discovery rides on the tcp transport: once it listens, attach the
        // multicast name service announcing its address.
        if let Some(tcp_addr) = self.tcp.local_addr() {
            let service = NameService::new(
                self.guid.to_string(),
                tcp_addr,
                name_service::DEFAULT_PORT,
                self.config.limits.advertise_ttl,
                self.events_tx.clone(),
                self.cancel.child_token(),
            );
            match service.start().await {
                Ok(()) => self.tcp.set_name_service(service),
                Err(error) => warn!(%error, "name service unavailable, advertising disabled"),
            }
        }

        // Control method dispatcher.
        let control = Arc::clone(&self.control);
        let mut control_rx = self
            .control_rx
            .lock()
            .unwrap()
            .take()
            .expect("bus started once");
        let dispatch_cancel = self.cancel.child_token();
        self.spawn(async move {
            loop {
                tokio::select! {
                    () = dispatch_cancel.cancelled() => break,
                    maybe = control_rx.recv() => match maybe {
                        Some(msg) if msg.msg_type == meshbus_core::MessageType::MethodCall => {
                            control.handle_method(msg).await;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });

        // Advertisement-cache reaper.
        let control = Arc::clone(&self.control);
        let notify = self.control.reaper_notify();
        let reaper_cancel = self.cancel.child_token();
        self.spawn(reaper::run(control, notify, reaper_cancel));

        // Main event loop.
        let bus = Arc::clone(self);
        self.spawn(async move { bus.run().await });

        info!(
            guid = %self.guid.short(),
            addrs = ?self.local_addresses(),
            "bus serving"
        );
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let mut events = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .expect("event loop runs once");
        let mut commands = self
            .commands_rx
            .lock()
            .unwrap()
            .take()
            .expect("event loop runs once");
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                maybe = events.recv() => match maybe {
                    None => break,
                    Some(TransportEvent::IncomingStream { stream, remote_addr }) => {
                        let bus = Arc::clone(&self);
                        tokio::spawn(async move {
                            bus.accept_stream(stream, remote_addr).await;
                        });
                    }
                    Some(TransportEvent::FoundNames { bus_addr, guid, names, ttl_secs }) => {
                        self.control.found_names(&bus_addr, &guid, &names, ttl_secs);
                    }
                    Some(TransportEvent::ConnectionLost { bus_addr }) => {
                        self.control.bus_connection_lost(&bus_addr);
                    }
                },
                maybe = commands.recv() => match maybe {
                    None => break,
                    Some(RouterCommand::FederationSignal { via, msg }) => {
                        self.control.handle_federation_signal(&via, &msg);
                    }
                    Some(RouterCommand::TearDownB2b { unique_name }) => {
                        if let Some(link) = self.registry.get(&unique_name) {
                            self.control.teardown_b2b(&link);
                        }
                    }
                    Some(RouterCommand::EndpointClosed { unique_name }) => {
                        self.control.endpoint_closed(&unique_name).await;
                    }
                },
            }
        }
        debug!("bus event loop stopped");
    }

    /// Runs the acceptor handshake on an incoming stream and registers the
    /// resulting endpoint. Used by transport accept loops and by tests
    /// injecting in-memory streams.
    pub async fn accept_stream(self: &Arc<Self>, stream: BusStream, remote_addr: String) {
        let mut framed = Framed::new(stream, FrameCodec::with_max_size(MAX_HANDSHAKE_FRAME_SIZE));
        let assigned = self.next_unique_name();
        let established = match self
            .endpoint_auth
            .accept(
                &mut framed,
                assigned,
                CONTROL_ENDPOINT_NAME.to_string(),
                &self.guid,
                true,
            )
            .await
        {
            Ok(established) => established,
            Err(error) => {
                warn!(%remote_addr, %error, "handshake failed");
                return;
            }
        };

        let kind = if established.bus_to_bus {
            EndpointKind::BusToBus
        } else {
            EndpointKind::Local
        };
        let bus_addr = established.bus_to_bus.then(|| remote_addr.clone());
        let (endpoint, rx) = EndpointHandle::new(
            established.unique_name.clone(),
            kind,
            established.peer_name.clone(),
            established.peer_guid,
            established.peer_protocol_version,
            established.allow_remote,
            true,
            bus_addr,
            self.config.limits.queue_depth,
        );
        if let Err(error) = self.register_endpoint(&endpoint, rx, framed) {
            warn!(%error, "could not register endpoint");
        }
    }

    /// Opens a bus-to-bus link over `spec` via its transport.
    pub async fn connect_b2b(
        self: &Arc<Self>,
        spec: &ConnectSpec,
    ) -> Result<Arc<EndpointHandle>, BusError> {
        let transport = self
            .transports
            .by_scheme(spec.scheme())
            .ok_or_else(|| BusError::TransportNotAvailable(spec.scheme().to_string()))?;
        let stream = transport
            .connect(spec)
            .await
            .map_err(|e| BusError::TransportNotAvailable(e.to_string()))?;
        self.connect_stream(stream, spec.canonical()).await
    }

    /// Runs the initiator handshake on an already connected stream and
    /// registers the bus-to-bus endpoint.
    pub async fn connect_stream(
        self: &Arc<Self>,
        stream: BusStream,
        bus_addr: String,
    ) -> Result<Arc<EndpointHandle>, BusError> {
        let mut framed = Framed::new(stream, FrameCodec::with_max_size(MAX_HANDSHAKE_FRAME_SIZE));
        let local_name = self.next_unique_name();
        let established = self
            .endpoint_auth
            .initiate(&mut framed, local_name, &self.guid, true, true)
            .await?;

        let (endpoint, rx) = EndpointHandle::new(
            established.unique_name.clone(),
            EndpointKind::BusToBus,
            established.peer_name.clone(),
            established.peer_guid,
            established.peer_protocol_version,
            established.allow_remote,
            false,
            Some(bus_addr),
            self.config.limits.queue_depth,
        );
        self.register_endpoint(&endpoint, rx, framed)?;
        Ok(endpoint)
    }

    fn register_endpoint(
        self: &Arc<Self>,
        endpoint: &Arc<EndpointHandle>,
        rx: mpsc::Receiver<meshbus_core::Message>,
        mut framed: Framed<BusStream, FrameCodec>,
    ) -> Result<(), BusError> {
        framed.codec_mut().promote_to_message_limit();
        if !self.registry.add(Arc::clone(endpoint)) {
            return Err(BusError::AlreadyOwned(endpoint.unique_name().to_string()));
        }
        if endpoint.kind() == EndpointKind::Local {
            if let Err(error) = self.names.add_unique_name(endpoint.unique_name()) {
                self.registry.remove(endpoint.unique_name());
                return Err(error);
            }
        }
        endpoint.set_state(EndpointState::Running);
        self.spawn_endpoint_io(endpoint, rx, framed);
        if endpoint.kind() == EndpointKind::BusToBus {
            self.control.add_b2b_endpoint(endpoint);
        }
        info!(
            endpoint = %endpoint.unique_name(),
            kind = ?endpoint.kind(),
            "endpoint running"
        );
        Ok(())
    }

    fn spawn_endpoint_io(
        self: &Arc<Self>,
        endpoint: &Arc<EndpointHandle>,
        mut rx: mpsc::Receiver<meshbus_core::Message>,
        framed: Framed<BusStream, FrameCodec>,
    ) {
        let (mut sink, mut stream) = framed.split();

        // Write task: drains the bounded queue onto the stream, re-checking
        // TTL at dequeue. A call that went stale while queued still gets
        // its TTL_EXPIRED error reply; only the delivery is dropped. On
        // shutdown the task drains what is already queued under the
        // configured deadline.
        let codec = Arc::clone(&self.codec);
        let router = Arc::clone(&self.router);
        let stop = endpoint.stop_token();
        let drain_deadline = self.config.limits.drain_timeout;
        let writer_name = endpoint.unique_name().to_string();
        self.spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    maybe = rx.recv() => match maybe {
                        None => break,
                        Some(msg) => {
                            if msg.is_expired() {
                                debug!(endpoint = %writer_name, "dropping expired queued message");
                                router.reply_expired(&msg);
                                continue;
                            }
                            match codec.encode(&msg) {
                                Ok(bytes) => {
                                    if sink.send(bytes).await.is_err() {
                                        break;
                                    }
                                }
                                Err(error) => {
                                    warn!(endpoint = %writer_name, %error, "encode failed");
                                }
                            }
                        }
                    },
                }
            }
            // Bounded drain of whatever is still queued.
            let drain = async {
                while let Ok(msg) = rx.try_recv() {
                    if msg.is_expired() {
                        router.reply_expired(&msg);
                        continue;
                    }
                    if let Ok(bytes) = codec.encode(&msg) {
                        if sink.send(bytes).await.is_err() {
                            break;
                        }
                    }
                }
                let _ = sink.close().await;
            };
            let _ = tokio::time::timeout(drain_deadline, drain).await;
        });

        // Read task: feeds the router until the stream ends or errors, then
        // reports the closure.
        let bus = Arc::clone(self);
        let reader_ep = Arc::clone(endpoint);
        let stop = endpoint.stop_token();
        let codec = Arc::clone(&self.codec);
        let commands = self.commands_tx.clone();
        self.spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    frame = stream.next() => match frame {
                        None => break,
                        Some(Err(error)) => {
                            warn!(endpoint = %reader_ep.unique_name(), %error, "read failed");
                            break;
                        }
                        Some(Ok(payload)) => match codec.decode(&payload) {
                            Ok(msg) => bus.router.route(&reader_ep, msg),
                            Err(error) => {
                                warn!(
                                    endpoint = %reader_ep.unique_name(),
                                    %error,
                                    "undecodable message, closing endpoint"
                                );
                                break;
                            }
                        },
                    },
                }
            }
            let _ = commands.send(RouterCommand::EndpointClosed {
                unique_name: reader_ep.unique_name().to_string(),
            });
        });
    }

    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.lock().unwrap().push(handle);
    }

    /// Graceful shutdown: stop accepting, stop transports, stop every
    /// endpoint (their write tasks drain under the configured deadline),
    /// then join every task.
    pub async fn shutdown(&self) {
        info!("bus shutting down");
        self.cancel.cancel();
        for transport in self.transports.all() {
            let _ = transport.stop_listen().await;
        }
        for endpoint in self.registry.all() {
            endpoint.request_stop();
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        let deadline = self.config.limits.drain_timeout;
        for task in tasks {
            if tokio::time::timeout(deadline, task).await.is_err() {
                debug!("task did not finish within the drain deadline");
            }
        }
        info!("bus stopped");
    }
}

//! The bus-management control object.
//!
//! Implements the methods and signals of the `org.alljoyn.Bus` interface at
//! `/org/alljoyn/Bus`: Connect/Disconnect for bus-to-bus links,
//! AdvertiseName/CancelAdvertiseName, FindName/CancelFindName,
//! ListAdvertisedNames, plus the federation signals ExchangeNames and
//! NameChanged, transport discovery results (FoundNames), and bus link loss
//! (BusConnectionLost).
//!
//! Every method handler resolves the caller from the message sender field
//! (which the router stamps, so it cannot be spoofed) and refuses
//! cross-endpoint cancellations. Handlers never raise: they always answer
//! with a method-scoped u32 result code.
//!
//! # Locking
//!
//! The control maps have dedicated mutexes acquired in a fixed order, after
//! the name table and the virtual-endpoint map:
//!
//! ```text
//! NameTable -> VirtualEndpointMap -> b2b -> discover/name-map -> advertise -> connect
//! ```
//!
//! No I/O happens under any of these locks; handlers snapshot what they
//! need, drop the lock, and then emit signals or drive transports.

pub mod reaper;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use meshbus_core::{
    is_well_known_name, BusError, BusGuid, Message, MsgArg, NameListener, NameTable, SerialCounter,
};

use crate::bus::Bus;
use crate::endpoint::virtual_endpoint::VirtualEndpointMap;
use crate::endpoint::{EndpointHandle, EndpointKind, EndpointRegistry};
use crate::router::Router;
use crate::transport::TransportList;

/// Object path of the bus-management object.
pub const BUS_OBJECT_PATH: &str = "/org/alljoyn/Bus";
/// Interface of the bus-management object.
pub const BUS_INTERFACE: &str = "org.alljoyn.Bus";
/// Well-known name owned by the control endpoint.
pub const BUS_NAME: &str = "org.alljoyn.Bus";
/// Unique name of the control endpoint.
pub const CONTROL_ENDPOINT_NAME: &str = ":0.1";

/// Signal member names.
pub const SIG_FOUND_ADVERTISED_NAME: &str = "FoundAdvertisedName";
pub const SIG_LOST_ADVERTISED_NAME: &str = "LostAdvertisedName";
pub const SIG_BUS_CONNECTION_LOST: &str = "BusConnectionLost";
pub const SIG_EXCHANGE_NAMES: &str = "ExchangeNames";
pub const SIG_NAME_CHANGED: &str = "NameChanged";

/// Reply codes for `Connect`. Values are wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConnectReply {
    Success = 1,
    AlreadyConnected = 2,
    InvalidSpec = 3,
    NoTransport = 4,
    Failed = 5,
}

/// Reply codes for `Disconnect`. Values are wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReply {
    Success = 1,
    NoConn = 2,
    NotAllowed = 3,
}

/// Reply codes for `AdvertiseName`. Values are wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AdvertiseReply {
    Success = 1,
    AlreadyAdvertising = 2,
    TransportNotAvailable = 3,
    Failed = 4,
}

/// Reply codes for `FindName`. Values are wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FindReply {
    Success = 1,
    AlreadyFinding = 2,
    Failed = 3,
}

/// Reply codes for the cancel methods. Values are wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CancelReply {
    Success = 1,
    NotFound = 2,
}

/// A parsed control-plane method call (typed, not index-poked).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Connect { spec: String },
    Disconnect { spec: String },
    AdvertiseName { name: String },
    CancelAdvertiseName { name: String },
    FindName { prefix: String },
    CancelFindName { prefix: String },
    ListAdvertisedNames,
}

impl ControlRequest {
    /// Parses a method call addressed to the bus-management object.
    pub fn parse(msg: &Message) -> Result<Self, BusError> {
        if msg.fields.interface.as_deref() != Some(BUS_INTERFACE) {
            return Err(BusError::InvalidArgs(format!(
                "unknown interface {:?}",
                msg.fields.interface
            )));
        }
        let member = msg.fields.member.as_deref().unwrap_or_default();
        let arg = |index: usize| -> Result<String, BusError> {
            msg.args
                .get(index)
                .and_then(MsgArg::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    BusError::BadSignature {
                        expected: "s".into(),
                        got: meshbus_core::signature_of(&msg.args),
                    }
                })
        };
        match member {
            "Connect" => Ok(Self::Connect { spec: arg(0)? }),
            "Disconnect" => Ok(Self::Disconnect { spec: arg(0)? }),
            "AdvertiseName" => Ok(Self::AdvertiseName { name: arg(0)? }),
            "CancelAdvertiseName" => Ok(Self::CancelAdvertiseName { name: arg(0)? }),
            "FindName" => Ok(Self::FindName { prefix: arg(0)? }),
            "CancelFindName" => Ok(Self::CancelFindName { prefix: arg(0)? }),
            "ListAdvertisedNames" => Ok(Self::ListAdvertisedNames),
            other => Err(BusError::InvalidArgs(format!("unknown method {other}"))),
        }
    }
}

/// One cached remote advertisement.
#[derive(Debug, Clone)]
struct NameMapEntry {
    guid: String,
    bus_addr: String,
    expires_at: Instant,
}

#[derive(Default)]
struct DiscoverState {
    /// prefix -> interested local unique names.
    discover_map: HashMap<String, Vec<String>>,
    /// well-known name -> advertisement cache entries.
    name_map: HashMap<String, Vec<NameMapEntry>>,
}

struct ConnectEntry {
    requestors: Vec<String>,
    b2b_name: String,
}

/// A pending LostAdvertisedName emission, snapshotted under the lock.
struct LostEvent {
    name: String,
    guid: String,
    bus_addr: String,
    subscribers: Vec<String>,
}

/// The control object.
pub struct ControlObject {
    guid: BusGuid,
    names: Arc<NameTable>,
    registry: Arc<EndpointRegistry>,
    virtuals: Arc<VirtualEndpointMap>,
    transports: Arc<TransportList>,
    serials: Arc<SerialCounter>,

    b2b: Mutex<HashMap<String, String>>,
    discover: Mutex<DiscoverState>,
    advertise: Mutex<HashMap<String, Vec<String>>>,
    connect: Mutex<HashMap<String, ConnectEntry>>,

    reaper_notify: Arc<Notify>,
    endpoint: OnceLock<Arc<EndpointHandle>>,
    router: OnceLock<Arc<Router>>,
    bus: OnceLock<Weak<Bus>>,
}

impl ControlObject {
    #[must_use]
    pub fn new(
        guid: BusGuid,
        names: Arc<NameTable>,
        registry: Arc<EndpointRegistry>,
        virtuals: Arc<VirtualEndpointMap>,
        transports: Arc<TransportList>,
        serials: Arc<SerialCounter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            guid,
            names,
            registry,
            virtuals,
            transports,
            serials,
            b2b: Mutex::new(HashMap::new()),
            discover: Mutex::new(DiscoverState::default()),
            advertise: Mutex::new(HashMap::new()),
            connect: Mutex::new(HashMap::new()),
            reaper_notify: Arc::new(Notify::new()),
            endpoint: OnceLock::new(),
            router: OnceLock::new(),
            bus: OnceLock::new(),
        })
    }

    /// Wires the control endpoint handle, set once at bus bring-up.
    pub fn set_endpoint(&self, endpoint: Arc<EndpointHandle>) {
        let _ = self.endpoint.set(endpoint);
    }

    /// Wires the router, set once at bus bring-up.
    pub fn set_router(&self, router: Arc<Router>) {
        let _ = self.router.set(router);
    }

    /// Wires the owning bus, set once at bus bring-up.
    pub fn set_bus(&self, bus: Weak<Bus>) {
        let _ = self.bus.set(bus);
    }

    /// Wake handle for the name-map reaper.
    #[must_use]
    pub fn reaper_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.reaper_notify)
    }

    fn router(&self) -> &Arc<Router> {
        self.router.get().expect("router wired at bring-up")
    }

    fn control_endpoint(&self) -> &Arc<EndpointHandle> {
        self.endpoint.get().expect("control endpoint wired at bring-up")
    }

    // =====================================================================
    // Method dispatch
    // =====================================================================

    /// Handles one method call routed to the bus-management object and
    /// sends the reply.
    pub async fn handle_method(&self, msg: Message) {
        let Some(caller) = msg.fields.sender.clone() else {
            warn!("control method without sender");
            return;
        };
        let request = match ControlRequest::parse(&msg) {
            Ok(request) => request,
            Err(error) => {
                debug!(%error, "rejecting control method");
                let reply = Message::error_reply(self.serials.next(), &msg, &error);
                self.router().route(self.control_endpoint(), reply);
                return;
            }
        };

        let reply_args = match request {
            ControlRequest::Connect { spec } => {
                vec![MsgArg::U32(self.connect(&caller, &spec).await as u32)]
            }
            ControlRequest::Disconnect { spec } => {
                vec![MsgArg::U32(self.disconnect(&caller, &spec).await as u32)]
            }
            ControlRequest::AdvertiseName { name } => {
                vec![MsgArg::U32(self.advertise_name(&caller, &name).await as u32)]
            }
            ControlRequest::CancelAdvertiseName { name } => {
                vec![MsgArg::U32(self.cancel_advertise_name(&caller, &name).await as u32)]
            }
            ControlRequest::FindName { prefix } => {
                vec![MsgArg::U32(self.find_name(&caller, &prefix).await as u32)]
            }
            ControlRequest::CancelFindName { prefix } => {
                vec![MsgArg::U32(self.cancel_find_name(&caller, &prefix).await as u32)]
            }
            ControlRequest::ListAdvertisedNames => {
                let names = self.list_advertised_names();
                vec![MsgArg::Array(names.into_iter().map(MsgArg::String).collect())]
            }
        };
        if msg.reply_expected() {
            let reply = Message::method_return(self.serials.next(), &msg, reply_args);
            self.router().route(self.control_endpoint(), reply);
        }
    }

    /// `Connect(connectSpec)`: open (or join) a bus-to-bus link.
    pub async fn connect(&self, caller: &str, spec: &str) -> ConnectReply {
        let spec = match self.transports.normalize(spec) {
            Ok(spec) => spec,
            Err(crate::transport::TransportError::NoTransport(scheme)) => {
                debug!(scheme, "connect: no transport");
                return ConnectReply::NoTransport;
            }
            Err(error) => {
                debug!(%error, "connect: bad spec");
                return ConnectReply::InvalidSpec;
            }
        };
        let key = spec.canonical();

        {
            let mut connect = self.connect.lock().unwrap();
            if let Some(entry) = connect.get_mut(&key) {
                entry.requestors.push(caller.to_string());
                return ConnectReply::AlreadyConnected;
            }
        }

        let Some(bus) = self.bus.get().and_then(Weak::upgrade) else {
            return ConnectReply::Failed;
        };
        match bus.connect_b2b(&spec).await {
            Ok(link) => {
                let mut connect = self.connect.lock().unwrap();
                let entry = connect.entry(key).or_insert_with(|| ConnectEntry {
                    requestors: Vec::new(),
                    b2b_name: link.unique_name().to_string(),
                });
                entry.requestors.push(caller.to_string());
                info!(spec = %spec, link = %link.unique_name(), "bus-to-bus connected");
                ConnectReply::Success
            }
            Err(error) => {
                warn!(spec = %spec, %error, "bus-to-bus connect failed");
                ConnectReply::Failed
            }
        }
    }

    /// `Disconnect(connectSpec)`: release the caller's claim on a link. A
    /// caller may only disconnect a spec it opened.
    pub async fn disconnect(&self, caller: &str, spec: &str) -> DisconnectReply {
        let Ok(spec) = self.transports.normalize(spec) else {
            return DisconnectReply::NoConn;
        };
        let key = spec.canonical();

        let to_close = {
            let mut connect = self.connect.lock().unwrap();
            let Some(entry) = connect.get_mut(&key) else {
                return DisconnectReply::NoConn;
            };
            let Some(pos) = entry.requestors.iter().position(|r| r == caller) else {
                return DisconnectReply::NotAllowed;
            };
            entry.requestors.remove(pos);
            if entry.requestors.is_empty() {
                connect.remove(&key).map(|e| e.b2b_name)
            } else {
                None
            }
        };
        if let Some(b2b_name) = to_close {
            if let Some(link) = self.registry.get(&b2b_name) {
                self.teardown_b2b(&link);
            }
        }
        DisconnectReply::Success
    }

    /// `AdvertiseName(name)`: start advertising a name the caller owns.
    pub async fn advertise_name(&self, caller: &str, name: &str) -> AdvertiseReply {
        if !is_well_known_name(name) {
            return AdvertiseReply::Failed;
        }
        if self.names.lookup(name).as_deref() != Some(caller) {
            debug!(name, caller, "advertise refused: caller is not the owner");
            return AdvertiseReply::Failed;
        }
        let transports = self.transports.advertising();
        if transports.is_empty() {
            return AdvertiseReply::TransportNotAvailable;
        }

        let first = {
            let mut advertise = self.advertise.lock().unwrap();
            let entry = advertise.entry(name.to_string()).or_default();
            if entry.iter().any(|r| r == caller) {
                return AdvertiseReply::AlreadyAdvertising;
            }
            entry.push(caller.to_string());
            entry.len() == 1
        };

        if first {
            for transport in transports {
                if let Err(error) = transport.enable_advertisement(name).await {
                    warn!(name, %error, "transport failed to advertise");
                    let mut advertise = self.advertise.lock().unwrap();
                    if let Some(entry) = advertise.get_mut(name) {
                        entry.retain(|r| r != caller);
                        if entry.is_empty() {
                            advertise.remove(name);
                        }
                    }
                    return AdvertiseReply::Failed;
                }
            }
            info!(name, "advertising");
        }
        AdvertiseReply::Success
    }

    /// `CancelAdvertiseName(name)`.
    pub async fn cancel_advertise_name(&self, caller: &str, name: &str) -> CancelReply {
        let last = {
            let mut advertise = self.advertise.lock().unwrap();
            let Some(entry) = advertise.get_mut(name) else {
                return CancelReply::NotFound;
            };
            let Some(pos) = entry.iter().position(|r| r == caller) else {
                return CancelReply::NotFound;
            };
            entry.remove(pos);
            if entry.is_empty() {
                advertise.remove(name);
                true
            } else {
                false
            }
        };
        if last {
            for transport in self.transports.advertising() {
                if let Err(error) = transport.disable_advertisement(name).await {
                    warn!(name, %error, "transport failed to stop advertising");
                }
            }
            info!(name, "advertisement withdrawn");
        }
        CancelReply::Success
    }

    /// `FindName(prefix)`: subscribe to advertisements under a prefix and
    /// replay the live cache.
    pub async fn find_name(&self, caller: &str, prefix: &str) -> FindReply {
        if prefix.is_empty() {
            return FindReply::Failed;
        }
        let (first, replay) = {
            let mut discover = self.discover.lock().unwrap();
            let entry = discover.discover_map.entry(prefix.to_string()).or_default();
            if entry.iter().any(|r| r == caller) {
                return FindReply::AlreadyFinding;
            }
            entry.push(caller.to_string());
            let first = entry.len() == 1;

            let now = Instant::now();
            let replay: Vec<(String, String, String)> = discover
                .name_map
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .flat_map(|(name, entries)| {
                    entries
                        .iter()
                        .filter(move |e| e.expires_at > now)
                        .map(move |e| (name.clone(), e.guid.clone(), e.bus_addr.clone()))
                })
                .collect();
            (first, replay)
        };

        if first {
            for transport in self.transports.advertising() {
                if let Err(error) = transport.enable_discovery(prefix).await {
                    warn!(prefix, %error, "transport failed to start discovery");
                }
            }
        }
        for (name, guid, bus_addr) in replay {
            self.send_found_advertised_name(caller, &name, &guid, prefix, &bus_addr);
        }
        FindReply::Success
    }

    /// `CancelFindName(prefix)`.
    pub async fn cancel_find_name(&self, caller: &str, prefix: &str) -> CancelReply {
        let last = {
            let mut discover = self.discover.lock().unwrap();
            let Some(entry) = discover.discover_map.get_mut(prefix) else {
                return CancelReply::NotFound;
            };
            let Some(pos) = entry.iter().position(|r| r == caller) else {
                return CancelReply::NotFound;
            };
            entry.remove(pos);
            if entry.is_empty() {
                discover.discover_map.remove(prefix);
                true
            } else {
                false
            }
        };
        if last {
            for transport in self.transports.advertising() {
                if let Err(error) = transport.disable_discovery(prefix).await {
                    warn!(prefix, %error, "transport failed to stop discovery");
                }
            }
        }
        CancelReply::Success
    }

    /// `ListAdvertisedNames()`: the domain of the advertise map, sorted.
    #[must_use]
    pub fn list_advertised_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.advertise.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    // =====================================================================
    // Bus-to-bus lifecycle
    // =====================================================================

    /// Registers a fresh bus-to-bus link and pushes our name snapshot to
    /// the peer.
    pub fn add_b2b_endpoint(&self, link: &Arc<EndpointHandle>) {
        // Snapshot local clients only: the control endpoint and virtual
        // names have no business in a name exchange.
        let registry = Arc::clone(&self.registry);
        let snapshot = self.names.unique_names_and_aliases(|unique| {
            registry
                .get(unique)
                .is_some_and(|ep| ep.kind() == EndpointKind::Local)
        });
        self.b2b.lock().unwrap().insert(
            link.unique_name().to_string(),
            link.bus_addr().unwrap_or_default().to_string(),
        );

        let entries: Vec<MsgArg> = snapshot
            .into_iter()
            .map(|(unique, aliases)| {
                MsgArg::Struct(vec![
                    MsgArg::String(unique),
                    MsgArg::Array(aliases.into_iter().map(MsgArg::String).collect()),
                ])
            })
            .collect();
        let mut signal = Message::signal(
            self.serials.next(),
            BUS_OBJECT_PATH,
            BUS_INTERFACE,
            SIG_EXCHANGE_NAMES,
            vec![MsgArg::Array(entries)],
        );
        signal.set_sender(CONTROL_ENDPOINT_NAME);
        if link.enqueue(signal).is_err() {
            warn!(link = %link.unique_name(), "could not send name exchange");
        }
    }

    /// Tears down one bus-to-bus link: detaches virtual endpoints, drops
    /// orphaned remote names, scrubs the connect map, and expires cache
    /// entries advertised solely by the lost peer.
    pub fn teardown_b2b(&self, link: &Arc<EndpointHandle>) {
        let link_name = link.unique_name().to_string();
        info!(link = %link_name, "tearing down bus-to-bus link");
        link.request_stop();
        self.registry.remove(&link_name);
        self.b2b.lock().unwrap().remove(&link_name);

        let destroyed = self.virtuals.detach_b2b(&link_name);
        for unique in &destroyed {
            // Emits NameOwnerChanged for the unique name and for every
            // alias it owned.
            self.names.remove_unique_name(unique);
        }

        self.connect
            .lock()
            .unwrap()
            .retain(|_, entry| entry.b2b_name != link_name);

        if let Some(guid) = link.peer_guid() {
            let lost = self.drop_name_map_entries_for_guid(&guid.to_string());
            self.emit_lost_events(lost);
        }
    }

    /// Processes a transport's `BusConnectionLost(busAddr)` notification.
    pub fn bus_connection_lost(&self, bus_addr: &str) {
        let affected: Vec<Arc<EndpointHandle>> = self
            .registry
            .b2b_endpoints()
            .into_iter()
            .filter(|ep| ep.bus_addr() == Some(bus_addr))
            .collect();
        if affected.is_empty() {
            return;
        }
        warn!(bus_addr, links = affected.len(), "bus connection lost");
        for link in &affected {
            self.teardown_b2b(link);
        }

        let signal = Message::signal(
            self.serials.next(),
            BUS_OBJECT_PATH,
            BUS_INTERFACE,
            SIG_BUS_CONNECTION_LOST,
            vec![MsgArg::String(bus_addr.to_string())],
        );
        self.router().route(self.control_endpoint(), signal);
    }

    /// Cleanup after an endpoint's read loop ended, local or bus-to-bus.
    pub async fn endpoint_closed(&self, unique_name: &str) {
        let Some(endpoint) = self.registry.get(unique_name) else {
            return;
        };
        match endpoint.kind() {
            EndpointKind::BusToBus => {
                let bus_addr = endpoint.bus_addr().map(str::to_string);
                self.teardown_b2b(&endpoint);
                if let Some(bus_addr) = bus_addr {
                    let signal = Message::signal(
                        self.serials.next(),
                        BUS_OBJECT_PATH,
                        BUS_INTERFACE,
                        SIG_BUS_CONNECTION_LOST,
                        vec![MsgArg::String(bus_addr)],
                    );
                    self.router().route(self.control_endpoint(), signal);
                }
            }
            EndpointKind::Local => {
                info!(endpoint = %unique_name, "endpoint detached");
                endpoint.request_stop();
                self.registry.remove(unique_name);
                self.names.remove_unique_name(unique_name);
                self.scrub_departed_caller(unique_name).await;
            }
            EndpointKind::Control => {}
        }
    }

    /// Residual map hygiene for a departed local endpoint: its finds,
    /// advertisements, and connections are cancelled as if it had asked.
    async fn scrub_departed_caller(&self, caller: &str) {
        let stopped_prefixes: Vec<String> = {
            let mut discover = self.discover.lock().unwrap();
            let mut stopped = Vec::new();
            discover.discover_map.retain(|prefix, requestors| {
                requestors.retain(|r| r != caller);
                if requestors.is_empty() {
                    stopped.push(prefix.clone());
                    false
                } else {
                    true
                }
            });
            stopped
        };
        let stopped_names: Vec<String> = {
            let mut advertise = self.advertise.lock().unwrap();
            let mut stopped = Vec::new();
            advertise.retain(|name, requestors| {
                requestors.retain(|r| r != caller);
                if requestors.is_empty() {
                    stopped.push(name.clone());
                    false
                } else {
                    true
                }
            });
            stopped
        };
        let closed_links: Vec<String> = {
            let mut connect = self.connect.lock().unwrap();
            let mut closed = Vec::new();
            connect.retain(|_, entry| {
                entry.requestors.retain(|r| r != caller);
                if entry.requestors.is_empty() {
                    closed.push(entry.b2b_name.clone());
                    false
                } else {
                    true
                }
            });
            closed
        };

        for transport in self.transports.advertising() {
            for prefix in &stopped_prefixes {
                let _ = transport.disable_discovery(prefix).await;
            }
            for name in &stopped_names {
                let _ = transport.disable_advertisement(name).await;
            }
        }
        for b2b_name in closed_links {
            if let Some(link) = self.registry.get(&b2b_name) {
                self.teardown_b2b(&link);
            }
        }
    }

    // =====================================================================
    // Federation signals
    // =====================================================================

    /// Dispatches a federation signal that arrived over `via`.
    pub fn handle_federation_signal(&self, via: &str, msg: &Message) {
        match msg.fields.member.as_deref() {
            Some(SIG_EXCHANGE_NAMES) => self.handle_exchange_names(via, msg),
            Some(SIG_NAME_CHANGED) => self.handle_name_changed(via, msg),
            other => debug!(?other, "ignoring unknown federation signal"),
        }
    }

    /// `ExchangeNames(a(sas))` from a peer daemon: create or refresh the
    /// virtual endpoints reachable through this link and apply their alias
    /// claims. A failed entry is logged and skipped; the link stays live.
    fn handle_exchange_names(&self, via: &str, msg: &Message) {
        let Some(link) = self.registry.get(via) else {
            return;
        };
        let Some(MsgArg::Array(entries)) = msg.args.first() else {
            warn!(via, "malformed name exchange");
            return;
        };

        for entry in entries {
            let Some((unique, aliases)) = parse_exchange_entry(entry) else {
                warn!(via, "skipping malformed name-exchange entry");
                continue;
            };
            // The link's own endpoint never becomes a virtual endpoint.
            if unique == link.peer_name() {
                continue;
            }
            if self.registry.get(&unique).is_some() {
                warn!(name = %unique, "remote unique name collides with a local endpoint");
                continue;
            }

            let (_, created) = self.virtuals.add(&unique, via);
            if created {
                if let Err(error) = self.names.add_unique_name(&unique) {
                    warn!(name = %unique, %error, "skipping remote endpoint");
                    self.virtuals.remove(&unique);
                    continue;
                }
                debug!(name = %unique, via, "virtual endpoint created");
            }

            for alias in aliases {
                match self.names.lookup(&alias) {
                    Some(owner) if owner == unique => {}
                    Some(owner) if self.registry.get(&owner).is_some() => {
                        // Local owner wins the tie; tell the peer who
                        // actually holds the alias.
                        self.send_name_changed_over(&link, &alias, &unique, &owner);
                    }
                    _ => {
                        self.names.apply_remote_claim(&alias, &unique);
                    }
                }
            }
        }
    }

    /// `NameChanged(alias, oldOwner, newOwner)` from a peer daemon.
    fn handle_name_changed(&self, via: &str, msg: &Message) {
        let Some(link) = self.registry.get(via) else {
            return;
        };
        let (Some(alias), Some(old_owner), Some(new_owner)) = (
            msg.args.first().and_then(MsgArg::as_str),
            msg.args.get(1).and_then(MsgArg::as_str),
            msg.args.get(2).and_then(MsgArg::as_str),
        ) else {
            warn!(via, "malformed name-changed signal");
            return;
        };

        if new_owner.is_empty() {
            // The alias lost its remote owner.
            if !old_owner.is_empty() && self.names.lookup(alias).as_deref() == Some(old_owner) {
                self.names.release_name(alias, old_owner);
            }
        } else {
            if self.registry.get(new_owner).is_some() {
                warn!(alias, new_owner, "peer claimed a local unique name");
                return;
            }
            let (_, created) = self.virtuals.add(new_owner, via);
            if created {
                if let Err(error) = self.names.add_unique_name(new_owner) {
                    warn!(name = %new_owner, %error, "cannot track remote owner");
                    self.virtuals.remove(new_owner);
                    return;
                }
            }
            match self.names.lookup(alias) {
                Some(current) if self.registry.get(&current).is_some() => {
                    // Local owner wins ties; answer with the truth.
                    self.send_name_changed_over(&link, alias, new_owner, &current);
                    return;
                }
                Some(current) if current == *old_owner => {
                    self.names.release_name(alias, old_owner);
                    self.names.apply_remote_claim(alias, new_owner);
                }
                _ => {
                    self.names.apply_remote_claim(alias, new_owner);
                }
            }
        }

        // Garbage-collect a remote endpoint that lost its last alias and is
        // reachable only through this link.
        if !old_owner.is_empty() {
            if let Some(virtual_ep) = self.virtuals.find(old_owner) {
                if self.names.aliases_of(old_owner).is_empty()
                    && virtual_ep.sole_route_is(via)
                {
                    self.virtuals.remove(old_owner);
                    self.names.remove_unique_name(old_owner);
                }
            }
        }
    }

    // =====================================================================
    // Discovery
    // =====================================================================

    /// A transport heard advertisements (or their loss, when `ttl_secs` is
    /// zero).
    pub fn found_names(&self, bus_addr: &str, guid: &str, names: &[String], ttl_secs: u32) {
        if ttl_secs == 0 {
            let lost = {
                let mut discover = self.discover.lock().unwrap();
                let mut lost = Vec::new();
                for name in names {
                    let Some(entries) = discover.name_map.get_mut(name) else {
                        continue;
                    };
                    entries.retain(|e| e.guid != guid);
                    if entries.is_empty() {
                        discover.name_map.remove(name);
                        lost.push(LostEvent {
                            name: name.clone(),
                            guid: guid.to_string(),
                            bus_addr: bus_addr.to_string(),
                            subscribers: subscribers_for(&discover.discover_map, name),
                        });
                    }
                }
                lost
            };
            self.emit_lost_events(lost);
            return;
        }

        let ttl = Duration::from_secs(u64::from(ttl_secs));
        let found = {
            let mut discover = self.discover.lock().unwrap();
            let expires_at = Instant::now() + ttl;
            let mut found = Vec::new();
            for name in names {
                let entries = discover.name_map.entry(name.clone()).or_default();
                if let Some(entry) = entries
                    .iter_mut()
                    .find(|e| e.guid == guid && e.bus_addr == bus_addr)
                {
                    entry.expires_at = expires_at;
                } else {
                    entries.push(NameMapEntry {
                        guid: guid.to_string(),
                        bus_addr: bus_addr.to_string(),
                        expires_at,
                    });
                }
                for (prefix, requestors) in &discover.discover_map {
                    if name.starts_with(prefix.as_str()) {
                        for requestor in requestors {
                            found.push((requestor.clone(), name.clone(), prefix.clone()));
                        }
                    }
                }
            }
            found
        };
        for (dest, name, prefix) in found {
            self.send_found_advertised_name(&dest, &name, guid, &prefix, bus_addr);
        }
        self.reaper_notify.notify_one();
    }

    /// Earliest advertisement-cache expiry, if any.
    #[must_use]
    pub fn next_name_map_expiry(&self) -> Option<Instant> {
        let discover = self.discover.lock().unwrap();
        discover
            .name_map
            .values()
            .flatten()
            .map(|e| e.expires_at)
            .min()
    }

    /// Drops expired advertisement-cache entries and notifies interested
    /// subscribers of names that are now entirely gone.
    pub fn reap_name_map(&self) {
        let lost = {
            let mut discover = self.discover.lock().unwrap();
            let now = Instant::now();
            let mut expired: Vec<(String, NameMapEntry)> = Vec::new();
            discover.name_map.retain(|name, entries| {
                entries.retain(|entry| {
                    if entry.expires_at <= now {
                        expired.push((name.clone(), entry.clone()));
                        false
                    } else {
                        true
                    }
                });
                !entries.is_empty()
            });
            expired
                .into_iter()
                .filter(|(name, _)| !discover.name_map.contains_key(name))
                .map(|(name, entry)| LostEvent {
                    subscribers: subscribers_for(&discover.discover_map, &name),
                    name,
                    guid: entry.guid,
                    bus_addr: entry.bus_addr,
                })
                .collect::<Vec<_>>()
        };
        self.emit_lost_events(lost);
    }

    fn drop_name_map_entries_for_guid(&self, guid: &str) -> Vec<LostEvent> {
        let mut discover = self.discover.lock().unwrap();
        let mut lost = Vec::new();
        discover.name_map.retain(|name, entries| {
            entries.retain(|e| e.guid != guid);
            if entries.is_empty() {
                lost.push((name.clone(), guid.to_string()));
                false
            } else {
                true
            }
        });
        lost.into_iter()
            .map(|(name, guid)| LostEvent {
                subscribers: subscribers_for(&discover.discover_map, &name),
                name,
                guid,
                bus_addr: String::new(),
            })
            .collect()
    }

    fn emit_lost_events(&self, events: Vec<LostEvent>) {
        for event in events {
            for subscriber in &event.subscribers {
                self.send_lost_advertised_name(
                    subscriber,
                    &event.name,
                    &event.guid,
                    &event.bus_addr,
                );
            }
        }
    }

    // =====================================================================
    // Signal emission
    // =====================================================================

    fn send_found_advertised_name(
        &self,
        dest: &str,
        name: &str,
        guid: &str,
        prefix: &str,
        bus_addr: &str,
    ) {
        let signal = Message::signal(
            self.serials.next(),
            BUS_OBJECT_PATH,
            BUS_INTERFACE,
            SIG_FOUND_ADVERTISED_NAME,
            vec![
                MsgArg::String(name.to_string()),
                MsgArg::String(guid.to_string()),
                MsgArg::String(prefix.to_string()),
                MsgArg::String(bus_addr.to_string()),
            ],
        )
        .with_destination(dest);
        self.router().route(self.control_endpoint(), signal);
    }

    fn send_lost_advertised_name(&self, dest: &str, name: &str, guid: &str, bus_addr: &str) {
        let signal = Message::signal(
            self.serials.next(),
            BUS_OBJECT_PATH,
            BUS_INTERFACE,
            SIG_LOST_ADVERTISED_NAME,
            vec![
                MsgArg::String(name.to_string()),
                MsgArg::String(guid.to_string()),
                MsgArg::String(bus_addr.to_string()),
            ],
        )
        .with_destination(dest);
        self.router().route(self.control_endpoint(), signal);
    }

    fn send_name_changed_over(
        &self,
        link: &Arc<EndpointHandle>,
        alias: &str,
        old_owner: &str,
        new_owner: &str,
    ) {
        let mut signal = Message::signal(
            self.serials.next(),
            BUS_OBJECT_PATH,
            BUS_INTERFACE,
            SIG_NAME_CHANGED,
            vec![
                MsgArg::String(alias.to_string()),
                MsgArg::String(old_owner.to_string()),
                MsgArg::String(new_owner.to_string()),
            ],
        );
        signal.set_sender(CONTROL_ENDPOINT_NAME);
        if link.enqueue(signal).is_err() {
            warn!(link = %link.unique_name(), alias, "could not forward name change");
        }
    }

    /// Daemon GUID, as advertised to peers.
    #[must_use]
    pub const fn guid(&self) -> BusGuid {
        self.guid
    }

    #[cfg(test)]
    fn inject_connect_entry(&self, key: &str, requestor: &str, b2b_name: &str) {
        self.connect.lock().unwrap().insert(
            key.to_string(),
            ConnectEntry {
                requestors: vec![requestor.to_string()],
                b2b_name: b2b_name.to_string(),
            },
        );
    }
}

impl NameListener for ControlObject {
    /// Forwards local alias transitions to every bus-to-bus link whose peer
    /// opted into remote traffic. Runs under the name-table lock: only
    /// non-blocking enqueues happen here.
    fn name_owner_changed(&self, name: &str, old_owner: Option<&str>, new_owner: Option<&str>) {
        if name.starts_with(':') {
            return;
        }
        let locally_involved = [old_owner, new_owner]
            .into_iter()
            .flatten()
            .any(|owner| {
                self.registry
                    .get(owner)
                    .is_some_and(|ep| ep.kind() == EndpointKind::Local)
            });
        if !locally_involved {
            return;
        }
        for link in self.registry.b2b_endpoints() {
            if !link.allow_remote() {
                continue;
            }
            self.send_name_changed_over(
                &link,
                name,
                old_owner.unwrap_or_default(),
                new_owner.unwrap_or_default(),
            );
        }
    }
}

fn parse_exchange_entry(entry: &MsgArg) -> Option<(String, Vec<String>)> {
    let MsgArg::Struct(fields) = entry else {
        return None;
    };
    let unique = fields.first()?.as_str()?.to_string();
    let MsgArg::Array(alias_args) = fields.get(1)? else {
        return None;
    };
    let aliases = alias_args
        .iter()
        .map(|a| a.as_str().map(str::to_string))
        .collect::<Option<Vec<String>>>()?;
    Some((unique, aliases))
}

fn subscribers_for(discover_map: &HashMap<String, Vec<String>>, name: &str) -> Vec<String> {
    let mut subscribers: Vec<String> = discover_map
        .iter()
        .filter(|(prefix, _)| name.starts_with(prefix.as_str()))
        .flat_map(|(_, requestors)| requestors.iter().cloned())
        .collect();
    subscribers.sort();
    subscribers.dedup();
    subscribers
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use meshbus_core::MessageType;

    use crate::endpoint::EndpointState;
    use crate::router::RouterCommand;
    use crate::transport::{BusStream, ConnectSpec, Transport, TransportError};

    #[derive(Default)]
    struct StubTransport {
        advertised: Mutex<Vec<String>>,
        discovering: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for StubTransport {
        fn scheme(&self) -> &'static str {
            "stub"
        }

        fn supports_advertisement(&self) -> bool {
            true
        }

        async fn connect(&self, _spec: &ConnectSpec) -> Result<BusStream, TransportError> {
            Err(TransportError::NotSupported("connect"))
        }

        async fn start_listen(&self, _spec: &ConnectSpec) -> Result<String, TransportError> {
            Err(TransportError::NotSupported("listen"))
        }

        async fn enable_advertisement(&self, name: &str) -> Result<(), TransportError> {
            self.advertised.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn disable_advertisement(&self, name: &str) -> Result<(), TransportError> {
            self.advertised.lock().unwrap().retain(|n| n != name);
            Ok(())
        }

        async fn enable_discovery(&self, prefix: &str) -> Result<(), TransportError> {
            self.discovering.lock().unwrap().push(prefix.to_string());
            Ok(())
        }

        async fn disable_discovery(&self, prefix: &str) -> Result<(), TransportError> {
            self.discovering.lock().unwrap().retain(|p| p != prefix);
            Ok(())
        }
    }

    struct Harness {
        control: Arc<ControlObject>,
        names: Arc<NameTable>,
        registry: Arc<EndpointRegistry>,
        virtuals: Arc<VirtualEndpointMap>,
        stub: Arc<StubTransport>,
        // Held so router commands never error out, unread in these tests.
        _commands: mpsc::UnboundedReceiver<RouterCommand>,
    }

    impl Harness {
        fn new() -> Self {
            let names = Arc::new(NameTable::new());
            let registry = Arc::new(EndpointRegistry::new());
            let virtuals = Arc::new(VirtualEndpointMap::new());
            let serials = Arc::new(SerialCounter::new());
            let transports = Arc::new(crate::transport::TransportList::new());
            let stub = Arc::new(StubTransport::default());
            transports.register(Arc::clone(&stub) as Arc<dyn Transport>);

            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            let router = Arc::new(Router::new(
                Arc::clone(&registry),
                Arc::clone(&names),
                Arc::clone(&virtuals),
                Arc::clone(&serials),
                commands_tx,
                8,
            ));
            let control = ControlObject::new(
                BusGuid::generate(),
                Arc::clone(&names),
                Arc::clone(&registry),
                Arc::clone(&virtuals),
                transports,
                serials,
            );
            control.set_router(router);
            names.add_listener(Arc::clone(&control) as Arc<dyn NameListener>);

            let (control_ep, _control_rx) = EndpointHandle::new(
                CONTROL_ENDPOINT_NAME.to_string(),
                EndpointKind::Control,
                CONTROL_ENDPOINT_NAME.to_string(),
                None,
                meshbus_core::PROTOCOL_VERSION,
                true,
                true,
                None,
                64,
            );
            control_ep.set_state(EndpointState::Running);
            registry.add(Arc::clone(&control_ep));
            names.add_unique_name(CONTROL_ENDPOINT_NAME).unwrap();
            names.request_name(BUS_NAME, CONTROL_ENDPOINT_NAME, 0).unwrap();
            control.set_endpoint(control_ep);

            Self {
                control,
                names,
                registry,
                virtuals,
                stub,
                _commands: commands_rx,
            }
        }

        fn local(&self, name: &str) -> (Arc<EndpointHandle>, mpsc::Receiver<Message>) {
            let (ep, rx) = EndpointHandle::new(
                name.to_string(),
                EndpointKind::Local,
                name.to_string(),
                None,
                meshbus_core::PROTOCOL_VERSION,
                true,
                true,
                None,
                64,
            );
            ep.set_state(EndpointState::Running);
            self.registry.add(Arc::clone(&ep));
            self.names.add_unique_name(name).unwrap();
            (ep, rx)
        }

        fn b2b(
            &self,
            name: &str,
            peer_name: &str,
            bus_addr: &str,
            guid: BusGuid,
        ) -> (Arc<EndpointHandle>, mpsc::Receiver<Message>) {
            let (ep, rx) = EndpointHandle::new(
                name.to_string(),
                EndpointKind::BusToBus,
                peer_name.to_string(),
                Some(guid),
                meshbus_core::PROTOCOL_VERSION,
                true,
                true,
                Some(bus_addr.to_string()),
                64,
            );
            ep.set_state(EndpointState::Running);
            self.registry.add(Arc::clone(&ep));
            self.control.add_b2b_endpoint(&ep);
            (ep, rx)
        }
    }

    fn exchange_names_msg(entries: &[(&str, &[&str])]) -> Message {
        let args = entries
            .iter()
            .map(|(unique, aliases)| {
                MsgArg::Struct(vec![
                    MsgArg::String((*unique).to_string()),
                    MsgArg::Array(
                        aliases
                            .iter()
                            .map(|a| MsgArg::String((*a).to_string()))
                            .collect(),
                    ),
                ])
            })
            .collect();
        let mut msg = Message::signal(
            1,
            BUS_OBJECT_PATH,
            BUS_INTERFACE,
            SIG_EXCHANGE_NAMES,
            vec![MsgArg::Array(args)],
        );
        msg.set_sender(":0.1");
        msg
    }

    fn name_changed_msg(alias: &str, old: &str, new: &str) -> Message {
        let mut msg = Message::signal(
            2,
            BUS_OBJECT_PATH,
            BUS_INTERFACE,
            SIG_NAME_CHANGED,
            vec![
                MsgArg::String(alias.to_string()),
                MsgArg::String(old.to_string()),
                MsgArg::String(new.to_string()),
            ],
        );
        msg.set_sender(":0.1");
        msg
    }

    #[tokio::test]
    async fn advertise_requires_ownership() {
        let h = Harness::new();
        let (_e1, _rx1) = h.local(":1.2");
        assert_eq!(
            h.control.advertise_name(":1.2", "org.example.X").await,
            AdvertiseReply::Failed
        );
    }

    #[tokio::test]
    async fn advertise_cancel_round_trip() {
        let h = Harness::new();
        let (_e1, _rx1) = h.local(":1.2");
        h.names.request_name("org.example.X", ":1.2", 0).unwrap();

        assert_eq!(
            h.control.advertise_name(":1.2", "org.example.X").await,
            AdvertiseReply::Success
        );
        assert_eq!(*h.stub.advertised.lock().unwrap(), vec!["org.example.X"]);
        assert_eq!(
            h.control.advertise_name(":1.2", "org.example.X").await,
            AdvertiseReply::AlreadyAdvertising
        );
        assert_eq!(h.control.list_advertised_names(), vec!["org.example.X"]);

        assert_eq!(
            h.control.cancel_advertise_name(":1.2", "org.example.X").await,
            CancelReply::Success
        );
        assert!(h.stub.advertised.lock().unwrap().is_empty());
        assert!(h.control.list_advertised_names().is_empty());
        assert_eq!(
            h.control.cancel_advertise_name(":1.2", "org.example.X").await,
            CancelReply::NotFound
        );
    }

    #[tokio::test]
    async fn cancellations_are_per_caller() {
        let h = Harness::new();
        let (_e1, _rx1) = h.local(":1.2");
        let (_e2, _rx2) = h.local(":1.3");
        h.names.request_name("org.example.X", ":1.2", 0).unwrap();

        h.control.advertise_name(":1.2", "org.example.X").await;
        assert_eq!(
            h.control.cancel_advertise_name(":1.3", "org.example.X").await,
            CancelReply::NotFound
        );

        h.control.find_name(":1.2", "org.example").await;
        assert_eq!(
            h.control.cancel_find_name(":1.3", "org.example").await,
            CancelReply::NotFound
        );
        assert_eq!(
            h.control.cancel_find_name(":1.2", "org.example").await,
            CancelReply::Success
        );
    }

    #[tokio::test]
    async fn find_replays_live_cache_entries() {
        let h = Harness::new();
        let (_e1, mut rx1) = h.local(":1.2");

        h.control
            .found_names("stub:host=a", "guid-a", &["org.example.X".to_string()], 30);

        assert_eq!(h.control.find_name(":1.2", "org.example").await, FindReply::Success);
        let signal = rx1.try_recv().unwrap();
        assert_eq!(signal.fields.member.as_deref(), Some(SIG_FOUND_ADVERTISED_NAME));
        assert_eq!(signal.args[0].as_str(), Some("org.example.X"));
        assert_eq!(signal.args[1].as_str(), Some("guid-a"));
        assert_eq!(signal.args[2].as_str(), Some("org.example"));
        assert_eq!(signal.args[3].as_str(), Some("stub:host=a"));
        assert_eq!(*h.stub.discovering.lock().unwrap(), vec!["org.example"]);

        assert_eq!(
            h.control.find_name(":1.2", "org.example").await,
            FindReply::AlreadyFinding
        );
    }

    #[tokio::test]
    async fn found_names_notifies_subscribers() {
        let h = Harness::new();
        let (_e1, mut rx1) = h.local(":1.2");
        h.control.find_name(":1.2", "org.example").await;

        h.control
            .found_names("stub:host=a", "guid-a", &["org.example.X".to_string()], 30);
        let signal = rx1.try_recv().unwrap();
        assert_eq!(signal.fields.member.as_deref(), Some(SIG_FOUND_ADVERTISED_NAME));

        // Explicit loss: ttl of zero removes the entry and notifies.
        h.control
            .found_names("stub:host=a", "guid-a", &["org.example.X".to_string()], 0);
        let signal = rx1.try_recv().unwrap();
        assert_eq!(signal.fields.member.as_deref(), Some(SIG_LOST_ADVERTISED_NAME));
        assert_eq!(signal.args[0].as_str(), Some("org.example.X"));
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_expires_stale_entries_exactly_once() {
        let h = Harness::new();
        let (_e1, mut rx1) = h.local(":1.2");
        h.control.find_name(":1.2", "org.example").await;

        h.control
            .found_names("stub:host=a", "guid-a", &["org.example.X".to_string()], 1);
        let _found = rx1.try_recv().unwrap();

        // Before expiry nothing is reaped.
        h.control.reap_name_map();
        assert!(rx1.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        h.control.reap_name_map();
        let signal = rx1.try_recv().unwrap();
        assert_eq!(signal.fields.member.as_deref(), Some(SIG_LOST_ADVERTISED_NAME));
        // Exactly once.
        h.control.reap_name_map();
        assert!(rx1.try_recv().is_err());
        assert!(h.control.next_name_map_expiry().is_none());
    }

    #[tokio::test]
    async fn exchange_names_builds_virtual_endpoints() {
        let h = Harness::new();
        let guid = BusGuid::generate();
        let (_link, mut link_rx) = h.b2b(":1.5", ":9.1", "stub:host=d1", guid);
        // The snapshot pushed at registration.
        let pushed = link_rx.try_recv().unwrap();
        assert_eq!(pushed.fields.member.as_deref(), Some(SIG_EXCHANGE_NAMES));

        let msg = exchange_names_msg(&[(":9.0", &["org.example.X"])]);
        h.control.handle_federation_signal(":1.5", &msg);

        let vep = h.virtuals.find(":9.0").expect("virtual endpoint exists");
        assert_eq!(vep.routes(), vec![":1.5"]);
        assert!(h.names.is_registered(":9.0"));
        assert_eq!(h.names.lookup("org.example.X").as_deref(), Some(":9.0"));

        // A method call addressed to the alias is forwarded over the link.
        let (src, _src_rx) = h.local(":1.2");
        let call = Message::method_call(9, "/obj", "org.x.I", "Ping", "org.example.X", vec![]);
        h.control.router().route(&src, call);
        let forwarded = link_rx.try_recv().unwrap();
        assert_eq!(forwarded.fields.destination.as_deref(), Some("org.example.X"));
    }

    #[tokio::test]
    async fn exchange_names_local_owner_wins_ties() {
        let h = Harness::new();
        let (_e1, _rx1) = h.local(":1.2");
        h.names.request_name("org.example.X", ":1.2", 0).unwrap();

        let guid = BusGuid::generate();
        let (_link, mut link_rx) = h.b2b(":1.5", ":9.1", "stub:host=d1", guid);
        let _pushed = link_rx.try_recv().unwrap();

        let msg = exchange_names_msg(&[(":9.0", &["org.example.X"])]);
        h.control.handle_federation_signal(":1.5", &msg);

        // Local ownership stands and the peer is corrected.
        assert_eq!(h.names.lookup("org.example.X").as_deref(), Some(":1.2"));
        let inverse = link_rx.try_recv().unwrap();
        assert_eq!(inverse.fields.member.as_deref(), Some(SIG_NAME_CHANGED));
        assert_eq!(inverse.args[0].as_str(), Some("org.example.X"));
        assert_eq!(inverse.args[1].as_str(), Some(":9.0"));
        assert_eq!(inverse.args[2].as_str(), Some(":1.2"));
    }

    #[tokio::test]
    async fn name_changed_release_collects_orphaned_virtuals() {
        let h = Harness::new();
        let guid = BusGuid::generate();
        let (_link, _link_rx) = h.b2b(":1.5", ":9.1", "stub:host=d1", guid);

        let msg = exchange_names_msg(&[(":9.0", &["org.example.X"])]);
        h.control.handle_federation_signal(":1.5", &msg);
        assert!(h.virtuals.find(":9.0").is_some());

        let msg = name_changed_msg("org.example.X", ":9.0", "");
        h.control.handle_federation_signal(":1.5", &msg);

        assert_eq!(h.names.lookup("org.example.X"), None);
        assert!(h.virtuals.find(":9.0").is_none());
        assert!(!h.names.is_registered(":9.0"));
    }

    #[tokio::test]
    async fn name_changed_transfers_remote_ownership() {
        let h = Harness::new();
        let guid = BusGuid::generate();
        let (_link, _link_rx) = h.b2b(":1.5", ":9.1", "stub:host=d1", guid);

        let msg = exchange_names_msg(&[(":9.0", &["org.example.X"])]);
        h.control.handle_federation_signal(":1.5", &msg);

        let msg = name_changed_msg("org.example.X", ":9.0", ":9.2");
        h.control.handle_federation_signal(":1.5", &msg);

        assert_eq!(h.names.lookup("org.example.X").as_deref(), Some(":9.2"));
        assert!(h.virtuals.find(":9.2").is_some());
        // The old owner lost its last alias and its only route was this
        // link, so it is gone.
        assert!(h.virtuals.find(":9.0").is_none());
    }

    #[tokio::test]
    async fn bus_connection_lost_tears_down_the_federation_state() {
        let h = Harness::new();
        let guid = BusGuid::generate();
        let (_link, _link_rx) = h.b2b(":1.5", ":9.1", "stub:host=d1", guid);

        let msg = exchange_names_msg(&[(":9.0", &["org.example.X"])]);
        h.control.handle_federation_signal(":1.5", &msg);

        // A local endpoint subscribed to the prefix and a cache entry from
        // the same daemon.
        let (_e1, mut rx1) = h.local(":1.2");
        h.control.find_name(":1.2", "org.example").await;
        h.control.found_names(
            "stub:host=d1",
            &guid.to_string(),
            &["org.example.X".to_string()],
            30,
        );
        let _found = rx1.try_recv().unwrap();

        h.control.bus_connection_lost("stub:host=d1");

        // Virtual endpoint destroyed, alias released, cache scrubbed.
        assert!(h.virtuals.find(":9.0").is_none());
        assert_eq!(h.names.lookup("org.example.X"), None);
        assert!(h.registry.get(":1.5").is_none());

        let mut members = Vec::new();
        while let Ok(signal) = rx1.try_recv() {
            members.push(signal.fields.member.unwrap_or_default());
        }
        assert!(members.iter().any(|m| m == SIG_LOST_ADVERTISED_NAME));
        assert!(members.iter().any(|m| m == SIG_BUS_CONNECTION_LOST));
    }

    #[tokio::test]
    async fn disconnect_rules() {
        let h = Harness::new();
        let (_e1, _rx1) = h.local(":1.2");
        let (_e2, _rx2) = h.local(":1.3");

        assert_eq!(
            h.control.disconnect(":1.2", "stub:host=nowhere").await,
            DisconnectReply::NoConn
        );

        let guid = BusGuid::generate();
        let (_link, _link_rx) = h.b2b(":1.5", ":9.1", "stub:host=d1", guid);
        h.control.inject_connect_entry("stub:host=d1", ":1.2", ":1.5");

        // Only the endpoint that opened the spec may close it.
        assert_eq!(
            h.control.disconnect(":1.3", "stub:host=d1").await,
            DisconnectReply::NotAllowed
        );
        assert_eq!(
            h.control.disconnect(":1.2", "stub:host=d1").await,
            DisconnectReply::Success
        );
        assert!(h.registry.get(":1.5").is_none());
    }

    #[tokio::test]
    async fn endpoint_closed_scrubs_residual_requests() {
        let h = Harness::new();
        let (_e1, _rx1) = h.local(":1.2");
        h.names.request_name("org.example.X", ":1.2", 0).unwrap();
        h.control.advertise_name(":1.2", "org.example.X").await;
        h.control.find_name(":1.2", "org.example").await;

        h.control.endpoint_closed(":1.2").await;

        assert!(h.registry.get(":1.2").is_none());
        assert!(!h.names.is_registered(":1.2"));
        assert!(h.control.list_advertised_names().is_empty());
        assert!(h.stub.advertised.lock().unwrap().is_empty());
        assert!(h.stub.discovering.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn method_dispatch_replies_with_codes() {
        let h = Harness::new();
        let (_e1, mut rx1) = h.local(":1.2");
        h.names.request_name("org.example.X", ":1.2", 0).unwrap();

        let mut call = Message::method_call(
            5,
            BUS_OBJECT_PATH,
            BUS_INTERFACE,
            "AdvertiseName",
            BUS_NAME,
            vec![MsgArg::String("org.example.X".into())],
        );
        call.set_sender(":1.2");
        h.control.handle_method(call).await;

        let reply = rx1.try_recv().unwrap();
        assert_eq!(reply.msg_type, MessageType::MethodReturn);
        assert_eq!(reply.fields.reply_serial, Some(5));
        assert_eq!(reply.args[0].as_u32(), Some(AdvertiseReply::Success as u32));

        // Unknown member draws an error reply, not silence.
        let mut call = Message::method_call(
            6,
            BUS_OBJECT_PATH,
            BUS_INTERFACE,
            "NoSuchMethod",
            BUS_NAME,
            vec![],
        );
        call.set_sender(":1.2");
        h.control.handle_method(call).await;
        let reply = rx1.try_recv().unwrap();
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.fields.error_name.as_deref(), Some("INVALID_ARGS"));
    }

    #[tokio::test]
    async fn cancelled_find_hears_nothing_more() {
        let h = Harness::new();
        let (_e1, mut rx1) = h.local(":1.2");

        h.control.find_name(":1.2", "org.example").await;
        assert_eq!(
            h.control.cancel_find_name(":1.2", "org.example").await,
            CancelReply::Success
        );

        h.control
            .found_names("stub:host=a", "guid-a", &["org.example.X".to_string()], 30);
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn list_advertised_names_is_sorted_domain() {
        let h = Harness::new();
        let (_e1, _rx1) = h.local(":1.2");
        h.names.request_name("org.example.B", ":1.2", 0).unwrap();
        h.names.request_name("org.example.A", ":1.2", 0).unwrap();
        h.control.advertise_name(":1.2", "org.example.B").await;
        h.control.advertise_name(":1.2", "org.example.A").await;
        assert_eq!(
            h.control.list_advertised_names(),
            vec!["org.example.A", "org.example.B"]
        );
    }
}

//! Message routing.
//!
//! The router accepts one inbound message at a time from an endpoint's read
//! task and places it on the correct outbound queue(s): a local endpoint, a
//! bus-to-bus link selected from a virtual endpoint's route set, or — for
//! broadcast signals — a fan-out across local endpoints and links.
//!
//! Routing never blocks and never performs I/O: every delivery is a
//! non-blocking enqueue, and failure policy is applied per message. Full
//! queues answer method calls with an error reply, drop signals with a
//! warning, and escalate to endpoint teardown when a bus-to-bus link stays
//! saturated.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use meshbus_core::message::flags;
use meshbus_core::{BusError, Message, MessageType, NameTable, SerialCounter};

use crate::control::{BUS_INTERFACE, CONTROL_ENDPOINT_NAME, SIG_EXCHANGE_NAMES, SIG_NAME_CHANGED};
use crate::endpoint::virtual_endpoint::VirtualEndpointMap;
use crate::endpoint::{EndpointHandle, EndpointKind, EndpointRegistry, EnqueueError};

/// Requests the router raises to the daemon's event loop.
#[derive(Debug)]
pub enum RouterCommand {
    /// A federation control signal arrived over the named bus-to-bus link.
    FederationSignal {
        /// Unique name of the receiving bus-to-bus endpoint.
        via: String,
        /// The signal itself.
        msg: Message,
    },
    /// A bus-to-bus link overflowed past its limit and must be torn down.
    TearDownB2b {
        /// Unique name of the saturated link.
        unique_name: String,
    },
    /// An endpoint's read loop ended; sent by the endpoint I/O tasks.
    EndpointClosed {
        /// Unique name of the departed endpoint.
        unique_name: String,
    },
}

/// The daemon router.
pub struct Router {
    registry: Arc<EndpointRegistry>,
    names: Arc<NameTable>,
    virtuals: Arc<VirtualEndpointMap>,
    serials: Arc<SerialCounter>,
    commands: mpsc::UnboundedSender<RouterCommand>,
    b2b_overflow_limit: u32,
}

impl Router {
    #[must_use]
    pub fn new(
        registry: Arc<EndpointRegistry>,
        names: Arc<NameTable>,
        virtuals: Arc<VirtualEndpointMap>,
        serials: Arc<SerialCounter>,
        commands: mpsc::UnboundedSender<RouterCommand>,
        b2b_overflow_limit: u32,
    ) -> Self {
        Self {
            registry,
            names,
            virtuals,
            serials,
            commands,
            b2b_overflow_limit,
        }
    }

    /// Routes one inbound message from `src`.
    pub fn route(&self, src: &Arc<EndpointHandle>, mut msg: Message) {
        // The sender field is daemon-assigned: local peers can never spoof
        // it. Messages forwarded over a link keep the remote unique name.
        match src.kind() {
            EndpointKind::Local | EndpointKind::Control => msg.set_sender(src.unique_name()),
            EndpointKind::BusToBus => {
                let Some(sender) = msg.fields.sender.clone() else {
                    warn!(via = %src.unique_name(), "dropping forwarded message without sender");
                    return;
                };
                // Replies must be able to find their way back: a remote
                // sender not yet announced via a name exchange becomes a
                // virtual endpoint routed through this link.
                self.learn_remote_sender(src, &sender);
            }
        }

        // Federation control signals terminate here; they are daemon-to-
        // daemon traffic and are never re-broadcast.
        if src.kind() == EndpointKind::BusToBus && is_federation_signal(&msg) {
            let _ = self.commands.send(RouterCommand::FederationSignal {
                via: src.unique_name().to_string(),
                msg,
            });
            return;
        }

        if msg.is_expired() {
            debug!(serial = msg.serial, "dropping expired message");
            if msg.reply_expected() {
                self.reply_error(src, &msg, &BusError::TtlExpired);
            }
            return;
        }

        if msg.is_broadcast_signal() {
            self.broadcast(src, &msg);
            return;
        }

        let Some(dest) = msg.fields.destination.clone() else {
            // Method calls and replies must be addressed.
            if msg.reply_expected() {
                self.reply_error(src, &msg, &BusError::InvalidArgs("missing destination".into()));
            }
            return;
        };
        self.unicast(src, &dest, msg);
    }

    /// Next daemon-originated serial.
    #[must_use]
    pub fn next_serial(&self) -> u32 {
        self.serials.next()
    }

    /// Synthesizes a TTL_EXPIRED error reply toward the sender of a call
    /// that expired after routing, e.g. while parked in a saturated
    /// outbound queue. Write tasks re-check TTL at every dequeue and call
    /// this instead of dropping the call silently.
    pub fn reply_expired(&self, call: &Message) {
        if !call.reply_expected() {
            return;
        }
        let Some(dest) = call.fields.sender.clone() else {
            return;
        };
        let mut reply = Message::error_reply(self.serials.next(), call, &BusError::TtlExpired);
        reply.set_sender(CONTROL_ENDPOINT_NAME);
        if !self.deliver_by_name(&dest, reply) {
            debug!(dest, serial = call.serial, "expired-call sender is gone");
        }
    }

    /// Best-effort unicast for daemon-originated messages addressed by
    /// name: a registered endpoint, the name-table owner, or a virtual
    /// endpoint's routes.
    fn deliver_by_name(&self, dest: &str, msg: Message) -> bool {
        if let Some(endpoint) = self.registry.get(dest) {
            return endpoint.enqueue(msg).is_ok();
        }
        if let Some(owner) = self.names.lookup(dest) {
            if let Some(endpoint) = self.registry.get(&owner) {
                return endpoint.enqueue(msg).is_ok();
            }
        }
        if let Some(virtual_ep) = self.virtuals.find(dest) {
            let attempts = virtual_ep.routes().len();
            for _ in 0..attempts {
                let Some(route) = virtual_ep.pick_route() else {
                    break;
                };
                if let Some(link) = self.registry.get(&route) {
                    if link.enqueue(msg.clone()).is_ok() {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn learn_remote_sender(&self, link: &Arc<EndpointHandle>, sender: &str) {
        if sender == link.peer_name()
            || self.registry.get(sender).is_some()
            || self.virtuals.find(sender).is_some()
        {
            return;
        }
        let (_, created) = self.virtuals.add(sender, link.unique_name());
        if created {
            if let Err(error) = self.names.add_unique_name(sender) {
                debug!(sender, %error, "could not track remote sender");
                self.virtuals.remove(sender);
            } else {
                debug!(sender, via = %link.unique_name(), "learned remote sender");
            }
        }
    }

    fn unicast(&self, src: &Arc<EndpointHandle>, dest: &str, msg: Message) {
        // Destination resolution: a registered endpoint by unique name, the
        // name table owner (which may itself be virtual), or a virtual
        // endpoint directly.
        if let Some(endpoint) = self.registry.get(dest) {
            self.deliver(src, &endpoint, msg);
            return;
        }
        if let Some(owner) = self.names.lookup(dest) {
            if let Some(endpoint) = self.registry.get(&owner) {
                self.deliver(src, &endpoint, msg);
                return;
            }
            if self.deliver_virtual(src, &owner, msg.clone()) {
                return;
            }
        } else if self.deliver_virtual(src, dest, msg.clone()) {
            return;
        }

        debug!(dest, serial = msg.serial, "no route to destination");
        if msg.reply_expected() {
            self.reply_error(src, &msg, &BusError::NoDestination(dest.to_string()));
        }
    }

    fn deliver_virtual(&self, src: &Arc<EndpointHandle>, name: &str, msg: Message) -> bool {
        let Some(virtual_ep) = self.virtuals.find(name) else {
            return false;
        };
        let attempts = virtual_ep.routes().len();
        for _ in 0..attempts {
            let Some(route) = virtual_ep.pick_route() else {
                break;
            };
            let Some(link) = self.registry.get(&route) else {
                continue;
            };
            match self.try_enqueue(&link, msg.clone()) {
                Ok(()) => return true,
                Err(_) => continue,
            }
        }
        warn!(name, "all routes to virtual endpoint failed");
        if msg.reply_expected() {
            self.reply_error(src, &msg, &BusError::TtlExpired);
        }
        true
    }

    fn deliver(&self, src: &Arc<EndpointHandle>, dest: &Arc<EndpointHandle>, msg: Message) {
        // Remote-originated traffic only reaches endpoints that opted in.
        if src.kind() == EndpointKind::BusToBus
            && dest.kind() == EndpointKind::Local
            && !dest.allow_remote()
        {
            debug!(dest = %dest.unique_name(), "endpoint does not accept remote messages");
            if msg.reply_expected() {
                self.reply_error(src, &msg, &BusError::BusNotAllowed);
            }
            return;
        }

        if let Err(error) = self.try_enqueue(dest, msg.clone()) {
            match error {
                EnqueueError::Full => {
                    warn!(dest = %dest.unique_name(), "outbound queue full");
                    if msg.reply_expected() {
                        self.reply_error(src, &msg, &BusError::TtlExpired);
                    }
                }
                EnqueueError::Closed => {
                    if msg.reply_expected() {
                        self.reply_error(
                            src,
                            &msg,
                            &BusError::NoDestination(dest.unique_name().to_string()),
                        );
                    }
                }
            }
        }
    }

    fn broadcast(&self, src: &Arc<EndpointHandle>, msg: &Message) {
        let interface = msg.fields.interface.as_deref();
        let from_remote = src.kind() == EndpointKind::BusToBus;

        for endpoint in self.registry.local_endpoints() {
            if endpoint.unique_name() == src.unique_name() {
                continue;
            }
            if from_remote && !endpoint.allow_remote() {
                continue;
            }
            if !endpoint.accepts_broadcast(interface) {
                continue;
            }
            if self.try_enqueue(&endpoint, msg.clone()).is_err() {
                warn!(dest = %endpoint.unique_name(), "dropping broadcast signal: queue full");
            }
        }

        // Forward once over each link, but never re-broadcast a signal that
        // itself arrived over a link.
        if !from_remote && msg.flags & flags::ALLOW_REMOTE != 0 {
            for link in self.registry.b2b_endpoints() {
                if self.try_enqueue(&link, msg.clone()).is_err() {
                    warn!(link = %link.unique_name(), "dropping broadcast signal toward link");
                }
            }
        }
    }

    fn try_enqueue(&self, dest: &Arc<EndpointHandle>, msg: Message) -> Result<(), EnqueueError> {
        let result = dest.enqueue(msg);
        if result == Err(EnqueueError::Full)
            && dest.kind() == EndpointKind::BusToBus
            && dest.overflow_count() >= self.b2b_overflow_limit
        {
            warn!(link = %dest.unique_name(), "bus-to-bus link saturated, requesting teardown");
            let _ = self.commands.send(RouterCommand::TearDownB2b {
                unique_name: dest.unique_name().to_string(),
            });
        }
        result
    }

    /// Best-effort error reply to the sender of `call`.
    fn reply_error(&self, src: &Arc<EndpointHandle>, call: &Message, error: &BusError) {
        let mut reply = Message::error_reply(self.serials.next(), call, error);
        reply.set_sender(CONTROL_ENDPOINT_NAME);
        if src.enqueue(reply).is_err() {
            debug!(dest = %src.unique_name(), "could not deliver error reply");
        }
    }
}

fn is_federation_signal(msg: &Message) -> bool {
    msg.msg_type == MessageType::Signal
        && msg.fields.interface.as_deref() == Some(BUS_INTERFACE)
        && matches!(
            msg.fields.member.as_deref(),
            Some(SIG_EXCHANGE_NAMES | SIG_NAME_CHANGED)
        )
}

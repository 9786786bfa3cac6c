//! Multicast name service.
//!
//! Advertises and discovers well-known names over UDP multicast on the
//! local network segment. Two datagram kinds exist: `WhoHas`, asking for
//! names under the given prefixes, and `IsAt`, announcing the names a
//! daemon advertises along with its GUID, bus address, and a TTL.
//!
//! Announcements are repeated every `ttl / 3` so listeners keep cached
//! entries fresh; a TTL of zero announces explicit loss. Heard `IsAt`
//! packets surface to the daemon as [`TransportEvent::FoundNames`].

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{TransportError, TransportEvent};

/// Multicast group the name service speaks on.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 70, 70);

/// Default name-service port.
pub const DEFAULT_PORT: u16 = 9956;

/// One name-service datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
enum NsPacket {
    /// Query for names under any of the given prefixes.
    WhoHas { prefixes: Vec<String> },
    /// Announcement of advertised names. `ttl_secs` of zero means the
    /// names are gone.
    IsAt {
        guid: String,
        bus_addr: String,
        names: Vec<String>,
        ttl_secs: u32,
    },
}

#[derive(Default)]
struct NsState {
    advertised: HashSet<String>,
    prefixes: HashSet<String>,
}

/// Multicast advertise/discover service backing the tcp transport.
pub struct NameService {
    guid: String,
    bus_addr: String,
    port: u16,
    ttl: Duration,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
    socket: OnceLock<Arc<UdpSocket>>,
    state: Mutex<NsState>,
}

impl NameService {
    /// Creates a service announcing `bus_addr` under `guid`.
    #[must_use]
    pub fn new(
        guid: String,
        bus_addr: String,
        port: u16,
        ttl: Duration,
        events: mpsc::Sender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            guid,
            bus_addr,
            port,
            ttl,
            events,
            cancel,
            socket: OnceLock::new(),
            state: Mutex::new(NsState::default()),
        })
    }

    /// Binds the multicast socket and spawns the receive/re-announce loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.port)).await?;
        socket.join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;
        let socket = Arc::new(socket);
        self.socket
            .set(Arc::clone(&socket))
            .map_err(|_| TransportError::AlreadyListening("name service".into()))?;

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.run(socket).await;
        });
        Ok(())
    }

    async fn run(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let reannounce = self.ttl / 3;
        let mut interval = tokio::time::interval(reannounce.max(Duration::from_secs(1)));
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let names = self.advertised_names();
                    if !names.is_empty() {
                        self.announce(names, self.ttl_secs()).await;
                    }
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, _peer)) => self.handle_packet(&buf[..len]).await,
                    Err(e) => {
                        warn!(error = %e, "name service receive failed");
                        break;
                    }
                },
            }
        }
    }

    async fn handle_packet(&self, payload: &[u8]) {
        let packet: NsPacket = match serde_json::from_slice(payload) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "ignoring malformed name-service packet");
                return;
            }
        };
        match packet {
            NsPacket::WhoHas { prefixes } => {
                let matching = {
                    let state = self.state.lock().unwrap();
                    matching_names(&state.advertised, &prefixes)
                };
                if !matching.is_empty() {
                    self.announce(matching, self.ttl_secs()).await;
                }
            }
            NsPacket::IsAt {
                guid,
                bus_addr,
                names,
                ttl_secs,
            } => {
                if guid == self.guid {
                    return;
                }
                let event = TransportEvent::FoundNames {
                    bus_addr,
                    guid,
                    names,
                    ttl_secs,
                };
                let _ = self.events.send(event).await;
            }
        }
    }

    /// Starts advertising `name` and announces it immediately.
    pub async fn enable_advertisement(&self, name: &str) -> Result<(), TransportError> {
        self.state.lock().unwrap().advertised.insert(name.to_string());
        self.announce(vec![name.to_string()], self.ttl_secs()).await;
        Ok(())
    }

    /// Stops advertising `name` and announces the loss.
    pub async fn disable_advertisement(&self, name: &str) -> Result<(), TransportError> {
        self.state.lock().unwrap().advertised.remove(name);
        self.announce(vec![name.to_string()], 0).await;
        Ok(())
    }

    /// Starts discovery for `prefix` and queries the segment.
    pub async fn enable_discovery(&self, prefix: &str) -> Result<(), TransportError> {
        self.state.lock().unwrap().prefixes.insert(prefix.to_string());
        self.send(&NsPacket::WhoHas {
            prefixes: vec![prefix.to_string()],
        })
        .await;
        Ok(())
    }

    /// Stops discovery for `prefix`.
    pub async fn disable_discovery(&self, prefix: &str) -> Result<(), TransportError> {
        self.state.lock().unwrap().prefixes.remove(prefix);
        Ok(())
    }

    async fn announce(&self, names: Vec<String>, ttl_secs: u32) {
        self.send(&NsPacket::IsAt {
            guid: self.guid.clone(),
            bus_addr: self.bus_addr.clone(),
            names,
            ttl_secs,
        })
        .await;
    }

    async fn send(&self, packet: &NsPacket) {
        let Some(socket) = self.socket.get() else {
            debug!("name service not started, dropping outbound packet");
            return;
        };
        let Ok(payload) = serde_json::to_vec(packet) else {
            return;
        };
        if let Err(e) = socket.send_to(&payload, (MULTICAST_GROUP, self.port)).await {
            warn!(error = %e, "name service send failed");
        }
    }

    fn advertised_names(&self) -> Vec<String> {
        self.state.lock().unwrap().advertised.iter().cloned().collect()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn ttl_secs(&self) -> u32 {
        self.ttl.as_secs().min(u64::from(u32::MAX)) as u32
    }
}

fn matching_names(advertised: &HashSet<String>, prefixes: &[String]) -> Vec<String> {
    advertised
        .iter()
        .filter(|name| prefixes.iter().any(|p| name.starts_with(p.as_str())))
        .cloned()
        .collect()
}

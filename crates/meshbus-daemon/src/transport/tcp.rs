//! TCP transport.
//!
//! Streams over TCP; advertisement and discovery are delegated to the
//! multicast [`NameService`](super::name_service::NameService) when one is
//! attached.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::name_service::NameService;
use super::{BusStream, ConnectSpec, Transport, TransportError, TransportEvent};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 9955;

/// TCP stream transport.
pub struct TcpTransport {
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
    name_service: Mutex<Option<Arc<NameService>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<String>>,
}

impl TcpTransport {
    #[must_use]
    pub fn new(events: mpsc::Sender<TransportEvent>, cancel: CancellationToken) -> Self {
        Self {
            events,
            cancel,
            name_service: Mutex::new(None),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Attaches the multicast name service that gives this transport its
    /// advertise/discover capability.
    pub fn set_name_service(&self, service: Arc<NameService>) {
        *self.name_service.lock().unwrap() = Some(service);
    }

    fn service(&self) -> Result<Arc<NameService>, TransportError> {
        self.name_service
            .lock()
            .unwrap()
            .clone()
            .ok_or(TransportError::NotSupported("advertisement"))
    }

    /// The bound listen address in spec form, once listening.
    #[must_use]
    pub fn local_addr(&self) -> Option<String> {
        self.local_addr.lock().unwrap().clone()
    }

    fn endpoint_of(spec: &ConnectSpec) -> Result<(String, u16), TransportError> {
        let addr = spec
            .get("addr")
            .ok_or_else(|| TransportError::InvalidSpec(format!("{spec}: missing addr")))?;
        let port = match spec.get("port") {
            Some(p) => p
                .parse()
                .map_err(|_| TransportError::InvalidSpec(format!("{spec}: bad port")))?,
            None => DEFAULT_PORT,
        };
        Ok((addr.to_string(), port))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    fn supports_advertisement(&self) -> bool {
        self.name_service.lock().unwrap().is_some()
    }

    async fn connect(&self, spec: &ConnectSpec) -> Result<BusStream, TransportError> {
        let (addr, port) = Self::endpoint_of(spec)?;
        let stream = TcpStream::connect((addr.as_str(), port)).await?;
        stream.set_nodelay(true)?;
        debug!(%spec, "tcp connected");
        Ok(Box::new(stream))
    }

    async fn start_listen(&self, spec: &ConnectSpec) -> Result<String, TransportError> {
        if self.listener.lock().unwrap().is_some() {
            let addr = self.local_addr().unwrap_or_default();
            return Err(TransportError::AlreadyListening(addr));
        }

        let (addr, port) = Self::endpoint_of(spec)?;
        let listener = TcpListener::bind((addr.as_str(), port)).await?;
        let bound = listener.local_addr()?;
        let bound_spec = format!("tcp:addr={},port={}", bound.ip(), bound.port());
        *self.local_addr.lock().unwrap() = Some(bound_spec.clone());
        info!(addr = %bound_spec, "tcp transport listening");

        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let remote_addr =
                                format!("tcp:addr={},port={}", peer.ip(), peer.port());
                            let event = TransportEvent::IncomingStream {
                                stream: Box::new(stream),
                                remote_addr,
                            };
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "tcp accept failed");
                        }
                    },
                }
            }
        });
        *self.listener.lock().unwrap() = Some(task);
        Ok(bound_spec)
    }

    async fn stop_listen(&self) -> Result<(), TransportError> {
        if let Some(task) = self.listener.lock().unwrap().take() {
            task.abort();
        }
        *self.local_addr.lock().unwrap() = None;
        Ok(())
    }

    async fn enable_advertisement(&self, name: &str) -> Result<(), TransportError> {
        self.service()?.enable_advertisement(name).await
    }

    async fn disable_advertisement(&self, name: &str) -> Result<(), TransportError> {
        self.service()?.disable_advertisement(name).await
    }

    async fn enable_discovery(&self, prefix: &str) -> Result<(), TransportError> {
        self.service()?.enable_discovery(prefix).await
    }

    async fn disable_discovery(&self, prefix: &str) -> Result<(), TransportError> {
        self.service()?.disable_discovery(prefix).await
    }
}

//! Unix-domain-socket transport.
//!
//! The standard transport for locally attached clients. No advertisement:
//! discovery makes no sense inside one host.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BusStream, ConnectSpec, Transport, TransportError, TransportEvent};

/// Socket file mode: owner and group only.
const SOCKET_MODE: u32 = 0o660;

/// Unix stream transport.
pub struct UnixTransport {
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
    socket_path: Mutex<Option<PathBuf>>,
}

impl UnixTransport {
    #[must_use]
    pub fn new(events: mpsc::Sender<TransportEvent>, cancel: CancellationToken) -> Self {
        Self {
            events,
            cancel,
            listener: Mutex::new(None),
            socket_path: Mutex::new(None),
        }
    }

    fn path_of(spec: &ConnectSpec) -> Result<PathBuf, TransportError> {
        spec.get("path")
            .map(PathBuf::from)
            .ok_or_else(|| TransportError::InvalidSpec(format!("{spec}: missing path")))
    }

    fn prepare_socket_path(path: &Path) -> Result<(), TransportError> {
        // Remove a stale socket left by a previous run.
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for UnixTransport {
    fn scheme(&self) -> &'static str {
        "unix"
    }

    async fn connect(&self, spec: &ConnectSpec) -> Result<BusStream, TransportError> {
        let path = Self::path_of(spec)?;
        let stream = UnixStream::connect(&path).await?;
        debug!(%spec, "unix connected");
        Ok(Box::new(stream))
    }

    async fn start_listen(&self, spec: &ConnectSpec) -> Result<String, TransportError> {
        if self.listener.lock().unwrap().is_some() {
            let path = self.socket_path.lock().unwrap().clone().unwrap_or_default();
            return Err(TransportError::AlreadyListening(path.display().to_string()));
        }

        let path = Self::path_of(spec)?;
        Self::prepare_socket_path(&path)?;
        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
        info!(path = %path.display(), "unix transport listening");
        *self.socket_path.lock().unwrap() = Some(path.clone());

        let bound_spec = format!("unix:path={}", path.display());
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _addr)) => {
                            let event = TransportEvent::IncomingStream {
                                stream: Box::new(stream),
                                remote_addr: format!("unix:path={}", path.display()),
                            };
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "unix accept failed");
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
        if let Some(path) = self.socket_path.lock().unwrap().take() {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}

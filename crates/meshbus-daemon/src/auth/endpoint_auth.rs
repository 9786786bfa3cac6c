//! Endpoint handshake.
//!
//! Drives the authenticated handshake over a freshly accepted or connected
//! stream, before the endpoint exists as far as the router is concerned.
//! The acceptor assigns the peer its unique name; on bus-to-bus links both
//! sides additionally learn each other's daemon GUID and protocol version.
//!
//! The whole exchange runs under one hard timeout. On expiry the stream is
//! dropped and the caller sees [`BusError::AuthTimeout`].

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::debug;

use meshbus_core::{BusError, BusGuid, PROTOCOL_VERSION};

use super::manager::AuthManager;
use super::mechanism::ServerVerdict;
use crate::protocol::{HandshakeFrame, ProtocolError};

/// Identity learned from a completed handshake.
#[derive(Debug, Clone)]
pub struct EstablishedPeer {
    /// Unique name of this endpoint on the local side of the link. On the
    /// acceptor this is the name it assigned; on a connecting client it is
    /// the name the server assigned; on a bus-to-bus initiator it is the
    /// locally generated link name.
    pub unique_name: String,
    /// The name the peer reported for its side of the link.
    pub peer_name: String,
    /// Peer daemon GUID, bus-to-bus only.
    pub peer_guid: Option<BusGuid>,
    /// Protocol version the peer reported.
    pub peer_protocol_version: u32,
    /// Mechanism that authenticated the link.
    pub mechanism: String,
    /// Whether the link is bus-to-bus.
    pub bus_to_bus: bool,
    /// Whether the peer is willing to receive messages that originated on
    /// a remote bus.
    pub allow_remote: bool,
}

/// Handshake driver bound to an [`AuthManager`].
pub struct EndpointAuth {
    manager: Arc<AuthManager>,
    timeout: Duration,
}

impl EndpointAuth {
    #[must_use]
    pub fn new(manager: Arc<AuthManager>, timeout: Duration) -> Self {
        Self { manager, timeout }
    }

    /// Runs the acceptor side. `assigned_name` becomes the peer's unique
    /// name on this bus; `server_name` is our own endpoint name reported to
    /// the peer.
    pub async fn accept<S>(
        &self,
        framed: &mut Framed<S, crate::protocol::FrameCodec>,
        assigned_name: String,
        server_name: String,
        local_guid: &BusGuid,
        local_allow_remote: bool,
    ) -> Result<EstablishedPeer, BusError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tokio::time::timeout(
            self.timeout,
            self.accept_inner(framed, assigned_name, server_name, local_guid, local_allow_remote),
        )
        .await
        .map_err(|_| BusError::AuthTimeout)?
    }

    /// Runs the initiator side. `local_name` is the unique name this side
    /// uses for the link endpoint on bus-to-bus connections; clients adopt
    /// the server-assigned name instead.
    pub async fn initiate<S>(
        &self,
        framed: &mut Framed<S, crate::protocol::FrameCodec>,
        local_name: String,
        local_guid: &BusGuid,
        bus_to_bus: bool,
        allow_remote: bool,
    ) -> Result<EstablishedPeer, BusError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tokio::time::timeout(
            self.timeout,
            self.initiate_inner(framed, local_name, local_guid, bus_to_bus, allow_remote),
        )
        .await
        .map_err(|_| BusError::AuthTimeout)?
    }

    async fn accept_inner<S>(
        &self,
        framed: &mut Framed<S, crate::protocol::FrameCodec>,
        assigned_name: String,
        server_name: String,
        local_guid: &BusGuid,
        local_allow_remote: bool,
    ) -> Result<EstablishedPeer, BusError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let HandshakeFrame::Hello {
            version,
            mechanisms,
            bus_to_bus,
            allow_remote: peer_allow_remote,
        } = recv_frame(framed).await?
        else {
            reject(framed, "expected hello").await;
            return Err(BusError::AuthFailed("peer did not open with hello".into()));
        };

        // A peer speaking an older (nonzero) protocol revision is
        // acceptable; zero and anything newer than ours are not.
        if version == 0 || version > PROTOCOL_VERSION {
            reject(framed, "protocol version mismatch").await;
            return Err(BusError::ProtocolMismatch {
                local: PROTOCOL_VERSION,
                peer: version,
            });
        }

        let Some(selected) = self.manager.pick_common(&mechanisms) else {
            reject(framed, "no common authentication mechanism").await;
            return Err(BusError::InvalidAuthMechanism(mechanisms.join(" ")));
        };
        send_frame(
            framed,
            &HandshakeFrame::Start {
                mechanism: selected.clone(),
            },
        )
        .await?;

        let mut mechanism = self
            .manager
            .get_mechanism(&selected, None)
            .ok_or_else(|| BusError::InvalidAuthMechanism(selected.clone()))?;

        let mut verdict = mechanism.first_challenge();
        loop {
            match verdict {
                ServerVerdict::Ok => break,
                ServerVerdict::Reject => {
                    reject(framed, "credentials rejected").await;
                    return Err(BusError::AuthFailed(format!(
                        "{selected} rejected the peer"
                    )));
                }
                ServerVerdict::Challenge(data) => {
                    send_frame(
                        framed,
                        &HandshakeFrame::Challenge {
                            data: hex::encode(data),
                        },
                    )
                    .await?;
                    let HandshakeFrame::Response { data } = recv_frame(framed).await? else {
                        reject(framed, "expected response").await;
                        return Err(BusError::AuthFailed("peer broke the auth exchange".into()));
                    };
                    let response = hex::decode(&data)
                        .map_err(|_| BusError::AuthFailed("response is not hex".into()))?;
                    verdict = mechanism.verify(&response);
                }
            }
        }

        send_frame(
            framed,
            &HandshakeFrame::ServerHello {
                assigned_name: assigned_name.clone(),
                server_name,
                guid: bus_to_bus.then(|| local_guid.to_string()),
                version: PROTOCOL_VERSION,
                allow_remote: local_allow_remote,
            },
        )
        .await?;

        let HandshakeFrame::HelloAck {
            unique_name,
            guid,
            version: peer_version,
        } = recv_frame(framed).await?
        else {
            return Err(BusError::AuthFailed("peer did not acknowledge hello".into()));
        };

        let peer_guid = parse_guid(guid)?;
        debug!(
            endpoint = %assigned_name,
            peer = %unique_name,
            mechanism = %selected,
            bus_to_bus,
            "handshake complete (acceptor)"
        );
        Ok(EstablishedPeer {
            unique_name: assigned_name,
            peer_name: unique_name,
            peer_guid,
            peer_protocol_version: peer_version,
            mechanism: selected,
            bus_to_bus,
            allow_remote: peer_allow_remote,
        })
    }

    async fn initiate_inner<S>(
        &self,
        framed: &mut Framed<S, crate::protocol::FrameCodec>,
        local_name: String,
        local_guid: &BusGuid,
        bus_to_bus: bool,
        allow_remote: bool,
    ) -> Result<EstablishedPeer, BusError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        send_frame(
            framed,
            &HandshakeFrame::Hello {
                version: PROTOCOL_VERSION,
                mechanisms: self.manager.mechanism_names(),
                bus_to_bus,
                allow_remote,
            },
        )
        .await?;

        let selected = match recv_frame(framed).await? {
            HandshakeFrame::Start { mechanism } => mechanism,
            HandshakeFrame::Reject { reason } => return Err(BusError::AuthFailed(reason)),
            other => {
                return Err(BusError::AuthFailed(format!(
                    "expected mechanism start, got {}",
                    other.kind()
                )))
            }
        };
        let mut mechanism = self
            .manager
            .get_mechanism(&selected, None)
            .ok_or_else(|| BusError::InvalidAuthMechanism(selected.clone()))?;

        let server_hello = loop {
            match recv_frame(framed).await? {
                HandshakeFrame::Challenge { data } => {
                    let challenge = hex::decode(&data)
                        .map_err(|_| BusError::AuthFailed("challenge is not hex".into()))?;
                    let Some(response) = mechanism.respond(&challenge) else {
                        return Err(BusError::AuthFailed(format!(
                            "no credentials for {selected}"
                        )));
                    };
                    send_frame(
                        framed,
                        &HandshakeFrame::Response {
                            data: hex::encode(response),
                        },
                    )
                    .await?;
                }
                frame @ HandshakeFrame::ServerHello { .. } => break frame,
                HandshakeFrame::Reject { reason } => return Err(BusError::AuthFailed(reason)),
                other => {
                    return Err(BusError::AuthFailed(format!(
                        "unexpected {} frame during auth",
                        other.kind()
                    )))
                }
            }
        };
        let HandshakeFrame::ServerHello {
            assigned_name,
            server_name,
            guid,
            version: peer_version,
            allow_remote: peer_allow_remote,
        } = server_hello
        else {
            unreachable!("loop only breaks on server hello");
        };

        // Same acceptance range as the acceptor applies to our hello.
        if peer_version == 0 || peer_version > PROTOCOL_VERSION {
            return Err(BusError::ProtocolMismatch {
                local: PROTOCOL_VERSION,
                peer: peer_version,
            });
        }

        let unique_name = if bus_to_bus {
            local_name
        } else {
            assigned_name
        };
        send_frame(
            framed,
            &HandshakeFrame::HelloAck {
                unique_name: unique_name.clone(),
                guid: bus_to_bus.then(|| local_guid.to_string()),
                version: PROTOCOL_VERSION,
            },
        )
        .await?;

        let peer_guid = parse_guid(guid)?;
        debug!(
            endpoint = %unique_name,
            peer = %server_name,
            mechanism = %selected,
            bus_to_bus,
            "handshake complete (initiator)"
        );
        Ok(EstablishedPeer {
            unique_name,
            peer_name: server_name,
            peer_guid,
            peer_protocol_version: peer_version,
            mechanism: selected,
            bus_to_bus,
            allow_remote: peer_allow_remote,
        })
    }
}

fn parse_guid(guid: Option<String>) -> Result<Option<BusGuid>, BusError> {
    guid.map(|g| {
        g.parse()
            .map_err(|_| BusError::AuthFailed(format!("peer sent a malformed guid: {g}")))
    })
    .transpose()
}

async fn send_frame<S>(
    framed: &mut Framed<S, crate::protocol::FrameCodec>,
    frame: &HandshakeFrame,
) -> Result<(), BusError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = frame
        .encode()
        .map_err(|e| BusError::AuthFailed(e.to_string()))?;
    framed.send(payload).await.map_err(map_stream_error)
}

async fn recv_frame<S>(
    framed: &mut Framed<S, crate::protocol::FrameCodec>,
) -> Result<HandshakeFrame, BusError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        None => Err(BusError::StreamClosed),
        Some(Err(e)) => Err(map_stream_error(e)),
        Some(Ok(payload)) => {
            HandshakeFrame::decode(&payload).map_err(|e| BusError::AuthFailed(e.to_string()))
        }
    }
}

/// Best-effort terminal reject; the stream is going away either way.
async fn reject<S>(framed: &mut Framed<S, crate::protocol::FrameCodec>, reason: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = HandshakeFrame::Reject {
        reason: reason.to_string(),
    };
    if let Ok(payload) = frame.encode() {
        let _ = framed.send(payload).await;
    }
}

fn map_stream_error(error: ProtocolError) -> BusError {
    match error {
        ProtocolError::Io(_) => BusError::StreamClosed,
        other => BusError::AuthFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::mechanism::InMemoryKeyStore;
    use crate::protocol::{FrameCodec, MAX_HANDSHAKE_FRAME_SIZE};

    fn framed_pair() -> (
        Framed<tokio::io::DuplexStream, FrameCodec>,
        Framed<tokio::io::DuplexStream, FrameCodec>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Framed::new(a, FrameCodec::with_max_size(MAX_HANDSHAKE_FRAME_SIZE)),
            Framed::new(b, FrameCodec::with_max_size(MAX_HANDSHAKE_FRAME_SIZE)),
        )
    }

    fn auth_with_secret(secret: &str) -> EndpointAuth {
        let store = Arc::new(InMemoryKeyStore::with_secret(secret));
        EndpointAuth::new(
            Arc::new(AuthManager::with_default_mechanisms(store)),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn client_handshake_assigns_name() {
        let (mut server_io, mut client_io) = framed_pair();
        let server_guid = BusGuid::generate();
        let client_guid = BusGuid::generate();

        let server = auth_with_secret("hunter2");
        let client = auth_with_secret("hunter2");

        let server_task = tokio::spawn(async move {
            server
                .accept(&mut server_io, ":1.3".into(), ":0.1".into(), &server_guid, false)
                .await
        });
        let established = client
            .initiate(&mut client_io, String::new(), &client_guid, false, false)
            .await
            .unwrap();

        assert_eq!(established.unique_name, ":1.3");
        assert_eq!(established.peer_name, ":0.1");
        assert_eq!(established.mechanism, "HMAC-SHA256");
        assert!(established.peer_guid.is_none());

        let accepted = server_task.await.unwrap().unwrap();
        assert_eq!(accepted.unique_name, ":1.3");
        assert_eq!(accepted.peer_name, ":1.3");
        assert!(!accepted.bus_to_bus);
    }

    #[tokio::test]
    async fn bus_to_bus_handshake_exchanges_guids() {
        let (mut server_io, mut client_io) = framed_pair();
        let server_guid = BusGuid::generate();
        let client_guid = BusGuid::generate();

        let server = auth_with_secret("fed");
        let client = auth_with_secret("fed");

        let sg = server_guid;
        let server_task = tokio::spawn(async move {
            server
                .accept(&mut server_io, ":1.7".into(), ":0.1".into(), &sg, true)
                .await
        });
        let established = client
            .initiate(&mut client_io, ":9.2".into(), &client_guid, true, true)
            .await
            .unwrap();

        assert!(established.bus_to_bus);
        assert_eq!(established.unique_name, ":9.2");
        assert_eq!(established.peer_guid, Some(server_guid));
        assert!(established.allow_remote);

        let accepted = server_task.await.unwrap().unwrap();
        assert_eq!(accepted.peer_name, ":9.2");
        assert_eq!(accepted.peer_guid, Some(client_guid));
        assert!(accepted.bus_to_bus);
    }

    #[tokio::test]
    async fn mismatched_secrets_fail_auth() {
        let (mut server_io, mut client_io) = framed_pair();
        let guid = BusGuid::generate();

        let server = auth_with_secret("alpha");
        let client = auth_with_secret("beta");

        let server_task = tokio::spawn(async move {
            server
                .accept(&mut server_io, ":1.1".into(), ":0.1".into(), &guid, false)
                .await
        });
        let client_guid = BusGuid::generate();
        let result = client
            .initiate(&mut client_io, String::new(), &client_guid, false, false)
            .await;
        assert!(matches!(result, Err(BusError::AuthFailed(_))));
        assert!(matches!(
            server_task.await.unwrap(),
            Err(BusError::AuthFailed(_))
        ));
    }

    #[tokio::test]
    async fn no_common_mechanism_is_rejected() {
        let (mut server_io, mut client_io) = framed_pair();
        let guid = BusGuid::generate();

        let server_store: Arc<dyn super::super::mechanism::KeyStore> =
            Arc::new(InMemoryKeyStore::with_secret("x"));
        let server_manager = AuthManager::with_default_mechanisms(server_store);
        server_manager.filter_mechanisms("ANONYMOUS");
        let server = EndpointAuth::new(Arc::new(server_manager), Duration::from_secs(5));

        let client_store: Arc<dyn super::super::mechanism::KeyStore> =
            Arc::new(InMemoryKeyStore::with_secret("x"));
        let client_manager = AuthManager::with_default_mechanisms(client_store);
        client_manager.filter_mechanisms("HMAC-SHA256");
        let client = EndpointAuth::new(Arc::new(client_manager), Duration::from_secs(5));

        let server_task = tokio::spawn(async move {
            server
                .accept(&mut server_io, ":1.1".into(), ":0.1".into(), &guid, false)
                .await
        });
        let client_guid = BusGuid::generate();
        let result = client
            .initiate(&mut client_io, String::new(), &client_guid, false, false)
            .await;
        assert!(matches!(result, Err(BusError::AuthFailed(_))));
        assert!(matches!(
            server_task.await.unwrap(),
            Err(BusError::InvalidAuthMechanism(_))
        ));
    }

    #[tokio::test]
    async fn protocol_mismatch_is_reported() {
        let (mut server_io, mut client_io) = framed_pair();
        let guid = BusGuid::generate();
        let server = auth_with_secret("x");

        let server_task = tokio::spawn(async move {
            server
                .accept(&mut server_io, ":1.1".into(), ":0.1".into(), &guid, false)
                .await
        });

        let hello = HandshakeFrame::Hello {
            version: 99,
            mechanisms: vec!["ANONYMOUS".into()],
            bus_to_bus: false,
            allow_remote: false,
        };
        client_io.send(hello.encode().unwrap()).await.unwrap();

        assert!(matches!(
            server_task.await.unwrap(),
            Err(BusError::ProtocolMismatch { local: PROTOCOL_VERSION, peer: 99 })
        ));
    }

    #[tokio::test]
    async fn initiator_rejects_bad_server_version() {
        let (mut server_io, mut client_io) = framed_pair();
        let client = auth_with_secret("x");
        let client_guid = BusGuid::generate();

        let client_task = tokio::spawn(async move {
            client
                .initiate(&mut client_io, String::new(), &client_guid, false, false)
                .await
        });

        // Hand-rolled acceptor: pick a mechanism, then report version 0.
        let hello = server_io.next().await.unwrap().unwrap();
        assert!(matches!(
            HandshakeFrame::decode(&hello).unwrap(),
            HandshakeFrame::Hello { .. }
        ));
        let start = HandshakeFrame::Start {
            mechanism: "ANONYMOUS".into(),
        };
        server_io.send(start.encode().unwrap()).await.unwrap();
        let server_hello = HandshakeFrame::ServerHello {
            assigned_name: ":1.9".into(),
            server_name: ":0.1".into(),
            guid: None,
            version: 0,
            allow_remote: false,
        };
        server_io.send(server_hello.encode().unwrap()).await.unwrap();

        assert!(matches!(
            client_task.await.unwrap(),
            Err(BusError::ProtocolMismatch { local: PROTOCOL_VERSION, peer: 0 })
        ));
    }

    #[tokio::test]
    async fn acceptor_accepts_older_peer_version() {
        let (mut server_io, mut client_io) = framed_pair();
        let guid = BusGuid::generate();
        let server = auth_with_secret("x");

        let server_task = tokio::spawn(async move {
            server
                .accept(&mut server_io, ":1.2".into(), ":0.1".into(), &guid, false)
                .await
        });

        // An older, nonzero client revision offering a mechanism we have.
        let hello = HandshakeFrame::Hello {
            version: 1,
            mechanisms: vec!["ANONYMOUS".into()],
            bus_to_bus: false,
            allow_remote: false,
        };
        client_io.send(hello.encode().unwrap()).await.unwrap();

        let start = HandshakeFrame::decode(&client_io.next().await.unwrap().unwrap()).unwrap();
        assert!(matches!(
            start,
            HandshakeFrame::Start { mechanism } if mechanism == "ANONYMOUS"
        ));
        let server_hello =
            HandshakeFrame::decode(&client_io.next().await.unwrap().unwrap()).unwrap();
        assert!(matches!(server_hello, HandshakeFrame::ServerHello { .. }));

        let ack = HandshakeFrame::HelloAck {
            unique_name: ":1.2".into(),
            guid: None,
            version: 1,
        };
        client_io.send(ack.encode().unwrap()).await.unwrap();

        let accepted = server_task.await.unwrap().unwrap();
        assert_eq!(accepted.peer_protocol_version, 1);
        assert_eq!(accepted.unique_name, ":1.2");
    }

    #[tokio::test]
    async fn closed_stream_reports_stream_closed() {
        let (mut server_io, client_io) = framed_pair();
        let guid = BusGuid::generate();
        let server = auth_with_secret("x");
        drop(client_io);
        let result = server
            .accept(&mut server_io, ":1.1".into(), ":0.1".into(), &guid, false)
            .await;
        assert!(matches!(result, Err(BusError::StreamClosed)));
    }
}

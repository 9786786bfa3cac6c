//! Shared helpers for integration tests: bus builders, in-memory
//! bus-to-bus links, and a minimal test client speaking the full wire
//! protocol (handshake + framed JSON messages).

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_util::codec::Framed;

use meshbus_core::{BusConfig, BusGuid, JsonCodec, Message, MessageCodec, MsgArg};
use meshbus_daemon::auth::{AuthManager, EndpointAuth, InMemoryKeyStore, KeyStore};
use meshbus_daemon::bus::Bus;
use meshbus_daemon::control::{BUS_INTERFACE, BUS_NAME, BUS_OBJECT_PATH};
use meshbus_daemon::endpoint::EndpointHandle;
use meshbus_daemon::protocol::{FrameCodec, MAX_HANDSHAKE_FRAME_SIZE};

/// Shared secret provisioned on every daemon and client in the tests.
pub const SECRET: &str = "fed-secret";

/// A config with no listeners: streams are injected directly.
pub fn test_config() -> BusConfig {
    BusConfig {
        listen: Vec::new(),
        ..BusConfig::default()
    }
}

/// Builds and starts a bus with a pinned node id.
pub async fn start_bus(node_id: u32) -> Arc<Bus> {
    let key_store = Arc::new(InMemoryKeyStore::with_secret(SECRET));
    let bus = Bus::with_identity(test_config(), key_store, BusGuid::generate(), node_id)
        .expect("bus builds");
    bus.start().await.expect("bus starts");
    bus
}

/// Links two buses bus-to-bus over an in-memory duplex stream. `acceptor`
/// runs the acceptor side of the handshake. Returns the connector's link
/// endpoint.
pub async fn link(
    acceptor: &Arc<Bus>,
    connector: &Arc<Bus>,
    bus_addr: &str,
) -> Arc<EndpointHandle> {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let accept_bus = Arc::clone(acceptor);
    let addr = bus_addr.to_string();
    tokio::spawn(async move {
        accept_bus.accept_stream(Box::new(a), addr).await;
    });
    connector
        .connect_stream(Box::new(b), bus_addr.to_string())
        .await
        .expect("bus-to-bus link established")
}

/// Polls `condition` until it holds, panicking after ~5 seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// A locally attached client endpoint driven from the test body.
pub struct TestClient<S> {
    /// Unique name the daemon assigned.
    pub name: String,
    framed: Framed<S, FrameCodec>,
    codec: JsonCodec,
    serial: u32,
    /// Messages received while waiting for something else.
    backlog: std::collections::VecDeque<Message>,
}

impl TestClient<DuplexStream> {
    /// Attaches over an in-memory stream to `bus`.
    pub async fn attach(bus: &Arc<Bus>) -> Self {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let accept_bus = Arc::clone(bus);
        tokio::spawn(async move {
            accept_bus
                .accept_stream(Box::new(a), "test:client=mem".into())
                .await;
        });
        Self::handshake(b).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> TestClient<S> {
    /// Runs the client handshake over an already connected stream.
    pub async fn handshake(stream: S) -> Self {
        let key_store: Arc<dyn KeyStore> = Arc::new(InMemoryKeyStore::with_secret(SECRET));
        let manager = Arc::new(AuthManager::with_default_mechanisms(key_store));
        let auth = EndpointAuth::new(manager, Duration::from_secs(5));
        let mut framed = Framed::new(stream, FrameCodec::with_max_size(MAX_HANDSHAKE_FRAME_SIZE));
        let guid = BusGuid::generate();
        let established = auth
            .initiate(&mut framed, String::new(), &guid, false, true)
            .await
            .expect("client handshake");
        framed.codec_mut().promote_to_message_limit();
        Self {
            name: established.unique_name,
            framed,
            codec: JsonCodec,
            serial: 0,
            backlog: std::collections::VecDeque::new(),
        }
    }

    pub fn next_serial(&mut self) -> u32 {
        self.serial += 1;
        self.serial
    }

    pub async fn send(&mut self, msg: &Message) {
        let bytes = self.codec.encode(msg).expect("encode");
        self.framed.send(bytes).await.expect("send");
    }

    /// Receives the next message, draining the backlog first.
    pub async fn recv(&mut self) -> Message {
        if let Some(msg) = self.backlog.pop_front() {
            return msg;
        }
        self.recv_from_stream().await
    }

    async fn recv_from_stream(&mut self) -> Message {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("receive timed out")
            .expect("stream open")
            .expect("frame decodes");
        self.codec.decode(&frame).expect("message decodes")
    }

    /// Calls a bus-management method and returns its reply. Interleaved
    /// signals are kept for later `recv`/`recv_signal` calls.
    pub async fn call_control(&mut self, member: &str, args: Vec<MsgArg>) -> Message {
        let serial = self.next_serial();
        let call = Message::method_call(
            serial,
            BUS_OBJECT_PATH,
            BUS_INTERFACE,
            member,
            BUS_NAME,
            args,
        );
        self.send(&call).await;
        loop {
            let msg = self.recv_from_stream().await;
            if msg.fields.reply_serial == Some(serial) {
                return msg;
            }
            self.backlog.push_back(msg);
        }
    }

    /// Receives messages until a signal with the given member arrives,
    /// keeping everything else in the backlog.
    pub async fn recv_signal(&mut self, member: &str) -> Message {
        if let Some(pos) = self
            .backlog
            .iter()
            .position(|m| m.fields.member.as_deref() == Some(member))
        {
            return self.backlog.remove(pos).expect("position valid");
        }
        loop {
            let msg = self.recv_from_stream().await;
            if msg.fields.member.as_deref() == Some(member) {
                return msg;
            }
            self.backlog.push_back(msg);
        }
    }
}

/// Extracts the u32 result code of a control reply.
pub fn reply_code(msg: &Message) -> u32 {
    msg.args
        .first()
        .and_then(MsgArg::as_u32)
        .expect("u32 reply code")
}

//! Handshake wire frames.
//!
//! The handshake runs before any routed message is accepted from a stream.
//! Frames are JSON documents inside the length-prefixed framing, tagged by
//! a `t` discriminant. Sequence, initiator first:
//!
//! ```text
//! Hello        -->                          mechanisms offered, b2b/allow-remote flags
//!              <-- Start                    mechanism selected by the acceptor
//!              <-- Challenge                zero or more rounds, hex payloads
//! Response     -->
//!              <-- ServerHello              assigned name, acceptor identity
//! HelloAck     -->                          initiator identity
//! ```
//!
//! Either side may answer with `Reject` instead and close the stream.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// One frame of the endpoint handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum HandshakeFrame {
    /// Initiator's opening: protocol version, offered mechanisms, whether
    /// this is a bus-to-bus link, and whether the initiator is willing to
    /// receive messages that originated on a remote bus.
    Hello {
        version: u32,
        mechanisms: Vec<String>,
        bus_to_bus: bool,
        allow_remote: bool,
    },

    /// Acceptor's mechanism selection.
    Start { mechanism: String },

    /// Server-to-client authentication data, hex encoded.
    Challenge { data: String },

    /// Client-to-server authentication data, hex encoded.
    Response { data: String },

    /// Terminal refusal. The sender closes the stream after this.
    Reject { reason: String },

    /// Acceptor's closing identity: the unique name it assigned to this
    /// endpoint, its own endpoint name, its daemon GUID (bus-to-bus only),
    /// protocol version, and its allow-remote flag.
    ServerHello {
        assigned_name: String,
        server_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        guid: Option<String>,
        version: u32,
        allow_remote: bool,
    },

    /// Initiator's closing identity: the name it will be known by on its
    /// own side of the link, plus GUID on bus-to-bus links.
    HelloAck {
        unique_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        guid: Option<String>,
        version: u32,
    },
}

impl HandshakeFrame {
    /// Frame discriminant used in sequence-error reporting.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Start { .. } => "start",
            Self::Challenge { .. } => "challenge",
            Self::Response { .. } => "response",
            Self::Reject { .. } => "reject",
            Self::ServerHello { .. } => "server_hello",
            Self::HelloAck { .. } => "hello_ack",
        }
    }

    /// Serializes the frame for the wire.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Parses a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

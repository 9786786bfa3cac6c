//! Message codec seam.
//!
//! Marshalling routed messages is the job of an external collaborator; the
//! daemon only depends on the [`MessageCodec`] trait. [`JsonCodec`] is the
//! default implementation, encoding the typed message as a JSON document
//! inside a length-prefixed frame.

use bytes::Bytes;
use thiserror::Error;

use crate::message::Message;

/// Codec failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The message could not be marshalled.
    #[error("encode failed: {0}")]
    Encode(String),
    /// The frame payload could not be unmarshalled.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Serializes and deserializes routed messages.
pub trait MessageCodec: Send + Sync {
    /// Marshals a message into a frame payload.
    fn encode(&self, msg: &Message) -> Result<Bytes, CodecError>;

    /// Unmarshals a frame payload. Implementations stamp the arrival
    /// instant so TTL expiry is measured against the local clock.
    fn decode(&self, frame: &[u8]) -> Result<Message, CodecError>;
}

/// JSON message codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(&self, msg: &Message) -> Result<Bytes, CodecError> {
        serde_json::to_vec(msg)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, frame: &[u8]) -> Result<Message, CodecError> {
        let mut msg: Message =
            serde_json::from_slice(frame).map_err(|e| CodecError::Decode(e.to_string()))?;
        msg.stamp_arrival();
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MsgArg, MessageType};

    #[test]
    fn decode_stamps_arrival_for_ttl() {
        let codec = JsonCodec;
        let msg = Message::signal(9, "/p", "i.f", "S", vec![MsgArg::U32(42)]).with_ttl_ms(500);
        let decoded = codec.decode(&codec.encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Signal);
        assert_eq!(decoded.args, msg.args);
        assert!(decoded.arrival.is_some());
        assert!(!decoded.is_expired());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(JsonCodec.decode(b"not a message").is_err());
    }
}

//! Wire protocol: framing and handshake messages.
//!
//! Everything an endpoint sends travels in length-prefixed frames:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! During the handshake the payload is a [`wire::HandshakeFrame`]; after
//! authentication it is a marshalled bus message (see
//! [`meshbus_core::codec`]). Frame size is validated before any allocation,
//! and the handshake runs under a tighter size cap than routed traffic.

pub mod framing;
pub mod wire;

use std::io;

use thiserror::Error;

/// Maximum size of a routed-message frame.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Maximum size of a handshake frame. Nothing in the handshake is large;
/// the tight cap bounds what an unauthenticated peer can make us buffer.
pub const MAX_HANDSHAKE_FRAME_SIZE: usize = 64 * 1024;

/// Protocol-layer failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame exceeded the negotiated size cap.
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Observed frame size.
        size: usize,
        /// Applicable limit.
        max: usize,
    },

    /// A frame payload could not be parsed.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The peer sent a frame out of sequence.
    #[error("unexpected {got} frame (expected {expected})")]
    UnexpectedFrame {
        /// What the state machine was waiting for.
        expected: &'static str,
        /// What arrived.
        got: &'static str,
    },

    /// Underlying stream failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub use framing::FrameCodec;
pub use wire::HandshakeFrame;

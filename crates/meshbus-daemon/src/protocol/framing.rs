//! Length-prefixed frame codec.
//!
//! [`tokio_util::codec`] compatible codec for 4-byte big-endian
//! length-prefixed binary framing. The length is validated before the
//! payload is buffered, so an oversized announcement can never make the
//! daemon allocate.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{ProtocolError, MAX_FRAME_SIZE};

/// Length of the frame header.
const HEADER_LEN: usize = 4;

/// Frame codec used with [`tokio_util::codec::Framed`] over every endpoint
/// stream. Empty frames are valid.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Codec with the routed-traffic size limit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Codec with a custom size limit, used during the handshake.
    ///
    /// # Panics
    ///
    /// Panics if `max_frame_size` exceeds [`MAX_FRAME_SIZE`].
    #[must_use]
    pub fn with_max_size(max_frame_size: usize) -> Self {
        assert!(
            max_frame_size <= MAX_FRAME_SIZE,
            "frame limit {max_frame_size} exceeds protocol maximum {MAX_FRAME_SIZE}"
        );
        Self { max_frame_size }
    }

    /// Raises the size limit in place once the handshake completes.
    pub fn promote_to_message_limit(&mut self) {
        self.max_frame_size = MAX_FRAME_SIZE;
    }

    /// Current frame size limit.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0u8; HEADER_LEN];
        length_bytes.copy_from_slice(&src[..HEADER_LEN]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if item.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // validated above
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

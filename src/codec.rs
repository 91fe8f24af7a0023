//! Tokio codec for owned [`Frame`] values.
//!
//! The dispatcher encodes its outbound replies and events with
//! [`FrameCodec`], and the host-side client uses it in both directions.
//! Unlike the pooled [`FrameDecoder`](crate::decoder::FrameDecoder), an
//! oversized declared length is a hard framing error here: the peer is
//! expected to be well behaved, so there is nothing to resynchronise to.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{DEFAULT_MTU, Frame, FrameHeader, HEADER_SIZE};

/// Framing-level errors raised by [`FrameCodec`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// Declared or supplied payload exceeds the configured maximum.
    #[error("payload exceeds max length: {size} > {max}")]
    OversizedPayload {
        /// Payload size.
        size: usize,
        /// Maximum allowed payload size.
        max: usize,
    },
    /// The stream ended part way through a frame.
    #[error("premature EOF: {bytes_received} bytes of an incomplete frame received")]
    Truncated {
        /// Bytes left in the buffer at EOF.
        bytes_received: usize,
    },
}

impl From<FramingError> for io::Error {
    fn from(error: FramingError) -> Self {
        let kind = match error {
            FramingError::OversizedPayload { .. } => io::ErrorKind::InvalidData,
            FramingError::Truncated { .. } => io::ErrorKind::UnexpectedEof,
        };
        io::Error::new(kind, error)
    }
}

/// Header-then-payload codec for owned frames.
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    /// Create a codec accepting payloads of up to `max_payload` bytes.
    ///
    /// The limit is clamped to what the 16-bit length field can express.
    #[must_use]
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(usize::from(u16::MAX)),
        }
    }

    /// Maximum payload this codec accepts.
    #[must_use]
    pub fn max_payload(&self) -> usize { self.max_payload }
}

impl Default for FrameCodec {
    fn default() -> Self { Self::new(DEFAULT_MTU - HEADER_SIZE) }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(head) = src.first_chunk::<HEADER_SIZE>().copied() else {
            src.reserve(HEADER_SIZE);
            return Ok(None);
        };
        let header = FrameHeader::parse(head);
        let len = header.payload_len();
        if len > self.max_payload {
            return Err(FramingError::OversizedPayload {
                size: len,
                max: self.max_payload,
            }
            .into());
        }
        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_SIZE);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame::new(
            header.service,
            header.opcode,
            header.index,
            payload,
        )))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FramingError::Truncated {
                bytes_received: src.len(),
            }
            .into()),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = item.payload.len();
        let header = item
            .header()
            .filter(|_| size <= self.max_payload)
            .ok_or(FramingError::OversizedPayload {
                size,
                max: self.max_payload,
            })?;
        dst.reserve(HEADER_SIZE + size);
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&item.payload);
        Ok(())
    }
}

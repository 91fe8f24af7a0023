//! Byte-stream reassembly into pooled command slots.
//!
//! [`FrameDecoder`] accepts bytes in arbitrarily sized chunks and yields a
//! [`CommandSlot`] holding each complete frame. Framing problems never
//! surface as errors:
//!
//! - a header declaring more than the maximum payload is discarded and
//!   accumulation restarts from the next byte;
//! - a frame arriving while every slot is in use is skipped up to its
//!   declared end ("receive overflow"), after which decoding resumes.
//!
//! The peer learns about neither; it simply never receives a reply.

use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{trace, warn};

use crate::{
    frame::{FrameHeader, HEADER_SIZE},
    metrics::{self, DropReason},
    pool::{BufferPool, CommandSlot},
};

#[derive(Default)]
enum DecodeState {
    /// Collecting header bytes.
    #[default]
    Header,
    /// Copying payload bytes into `slot`.
    Payload { slot: CommandSlot, remaining: usize },
    /// Skipping the payload of a frame that found no free slot.
    Discard { remaining: usize },
}

/// Pool-backed frame reassembler.
pub struct FrameDecoder {
    pool: BufferPool,
    state: DecodeState,
    header: [u8; HEADER_SIZE],
    header_len: usize,
}

impl FrameDecoder {
    /// Create a decoder borrowing slots from `pool`.
    ///
    /// The pool's slot size bounds the accepted payload length.
    #[must_use]
    pub fn new(pool: BufferPool) -> Self {
        Self {
            pool,
            state: DecodeState::Header,
            header: [0; HEADER_SIZE],
            header_len: 0,
        }
    }

    /// Pool this decoder draws slots from.
    #[must_use]
    pub fn pool(&self) -> &BufferPool { &self.pool }

    /// Feed one byte, returning a slot if it completed a frame.
    pub fn push(&mut self, byte: u8) -> Option<CommandSlot> { self.consume(&[byte]).1 }

    /// Feed `bytes`, passing every completed frame to `sink` in order.
    pub fn feed(&mut self, mut bytes: &[u8], mut sink: impl FnMut(CommandSlot)) {
        while !bytes.is_empty() {
            let (used, slot) = self.consume(bytes);
            bytes = &bytes[used..];
            if let Some(slot) = slot {
                sink(slot);
            }
        }
    }

    /// Consume bytes up to and including the end of the next complete
    /// frame. Returns the number of bytes used and the frame, if any.
    fn consume(&mut self, bytes: &[u8]) -> (usize, Option<CommandSlot>) {
        let mut used = 0;
        while used < bytes.len() {
            let rest = &bytes[used..];
            match std::mem::take(&mut self.state) {
                DecodeState::Header => {
                    let take = (HEADER_SIZE - self.header_len).min(rest.len());
                    self.header[self.header_len..self.header_len + take]
                        .copy_from_slice(&rest[..take]);
                    self.header_len += take;
                    used += take;
                    if self.header_len == HEADER_SIZE {
                        self.header_len = 0;
                        if let Some(slot) = self.start_frame() {
                            return (used, Some(slot));
                        }
                    }
                }
                DecodeState::Payload {
                    mut slot,
                    remaining,
                } => {
                    let take = remaining.min(rest.len());
                    slot.extend(&rest[..take]);
                    used += take;
                    if take == remaining {
                        return (used, Some(Self::complete(slot)));
                    }
                    self.state = DecodeState::Payload {
                        slot,
                        remaining: remaining - take,
                    };
                }
                DecodeState::Discard { remaining } => {
                    let take = remaining.min(rest.len());
                    used += take;
                    if take < remaining {
                        self.state = DecodeState::Discard {
                            remaining: remaining - take,
                        };
                    }
                }
            }
        }
        (used, None)
    }

    /// Act on a freshly completed header. Returns the slot directly for
    /// frames without payload.
    fn start_frame(&mut self) -> Option<CommandSlot> {
        let header = FrameHeader::parse(self.header);
        let len = header.payload_len();
        if len > self.pool.max_payload() {
            warn!(
                service = header.service,
                opcode = header.opcode,
                len,
                max = self.pool.max_payload(),
                "invalid packet length; resynchronising"
            );
            metrics::inc_dropped(DropReason::Oversized);
            return None;
        }

        let Some(mut slot) = self.pool.acquire() else {
            warn!(
                service = header.service,
                opcode = header.opcode,
                len,
                "receive overflow; dropping frame"
            );
            metrics::inc_dropped(DropReason::Overflow);
            if len > 0 {
                self.state = DecodeState::Discard { remaining: len };
            }
            return None;
        };

        slot.extend(&self.header);
        if len == 0 {
            return Some(Self::complete(slot));
        }
        self.state = DecodeState::Payload {
            slot,
            remaining: len,
        };
        None
    }

    fn complete(slot: CommandSlot) -> CommandSlot {
        trace!(slot = %slot.id(), header = ?slot.header(), "frame complete");
        metrics::inc_decoded();
        slot
    }
}

impl Decoder for FrameDecoder {
    type Item = CommandSlot;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (used, slot) = self.consume(src);
        src.advance(used);
        Ok(slot)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let slot = self.decode(src)?;
        if slot.is_none() && (self.header_len > 0 || !matches!(self.state, DecodeState::Header)) {
            warn!("transport closed mid-frame; discarding partial frame");
            self.header_len = 0;
            self.state = DecodeState::Header;
        }
        Ok(slot)
    }
}

//! Wire-level frame types for the tester protocol.
//!
//! Every frame starts with a fixed five-byte header (`service`, `opcode`,
//! `index`, little-endian `length`) followed by `length` payload bytes.

use bytes::Bytes;
use static_assertions::const_assert;

use crate::{
    byte_order::{read_wire_u16, write_wire_u16},
    status::Status,
};

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 5;

/// Default maximum transmission unit, header included.
pub const DEFAULT_MTU: usize = 1024;

/// Largest MTU whose payload still fits the 16-bit length field.
pub const MAX_MTU: usize = HEADER_SIZE + u16::MAX as usize;

const_assert!(HEADER_SIZE < DEFAULT_MTU);
const_assert!(DEFAULT_MTU <= MAX_MTU);

/// Opcode reserved for bare status replies.
pub const STATUS_OPCODE: u8 = 0x00;

/// First opcode of the unsolicited event range.
pub const EVENT_OPCODE_MIN: u8 = 0x80;

/// Index addressing the default controller.
pub const DEFAULT_INDEX: u8 = 0x00;

/// Index used by service-global commands and stamped on every event.
pub const INDEX_NONE: u8 = 0xff;

/// Classification of an opcode by its numeric range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpcodeKind {
    /// `0x00`: a bare status reply.
    Status,
    /// `0x01..=0x7f`: a command or its reply.
    Command,
    /// `0x80..=0xff`: an unsolicited event.
    Event,
}

impl OpcodeKind {
    /// Classify `opcode`.
    #[must_use]
    pub const fn of(opcode: u8) -> Self {
        match opcode {
            STATUS_OPCODE => Self::Status,
            EVENT_OPCODE_MIN..=u8::MAX => Self::Event,
            _ => Self::Command,
        }
    }
}

/// Decoded frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub service: u8,
    pub opcode: u8,
    pub index: u8,
    pub len: u16,
}

impl FrameHeader {
    /// Build a header from its fields.
    #[must_use]
    pub const fn new(service: u8, opcode: u8, index: u8, len: u16) -> Self {
        Self {
            service,
            opcode,
            index,
            len,
        }
    }

    /// Parse a header from its on-wire representation.
    #[must_use]
    pub fn parse(bytes: [u8; HEADER_SIZE]) -> Self {
        let [service, opcode, index, lo, hi] = bytes;
        Self::new(service, opcode, index, read_wire_u16([lo, hi]))
    }

    /// Serialise the header to its on-wire representation.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let [lo, hi] = write_wire_u16(self.len);
        [self.service, self.opcode, self.index, lo, hi]
    }

    /// Declared payload length.
    #[must_use]
    pub fn payload_len(&self) -> usize { usize::from(self.len) }
}

/// An owned frame, used for outbound traffic and by the host-side client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub service: u8,
    pub opcode: u8,
    pub index: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame from its fields.
    #[must_use]
    pub fn new(service: u8, opcode: u8, index: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            service,
            opcode,
            index,
            payload: payload.into(),
        }
    }

    /// Build a bare status reply addressed to `service`/`index`.
    #[must_use]
    pub fn status(service: u8, index: u8, status: Status) -> Self {
        Self::new(
            service,
            STATUS_OPCODE,
            index,
            Bytes::copy_from_slice(&[status.code()]),
        )
    }

    /// Build an event frame, stamped with [`INDEX_NONE`].
    #[must_use]
    pub fn event(service: u8, opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(service, opcode, INDEX_NONE, payload)
    }

    /// Range classification of this frame's opcode.
    #[must_use]
    pub fn kind(&self) -> OpcodeKind { OpcodeKind::of(self.opcode) }

    /// Header describing this frame, or `None` if the payload does not fit
    /// the 16-bit length field.
    #[must_use]
    pub fn header(&self) -> Option<FrameHeader> {
        let len = u16::try_from(self.payload.len()).ok()?;
        Some(FrameHeader::new(self.service, self.opcode, self.index, len))
    }
}

//! Reply encoding and unsolicited events.
//!
//! [`Responder`] turns command outcomes into frames and hands them, in
//! emission order, to the transport writer. [`EventEmitter`] sends
//! unsolicited events and owns the shared scratch buffer handlers use to
//! assemble variable-length event payloads.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::{
    frame::{EVENT_OPCODE_MIN, Frame, FrameHeader, INDEX_NONE},
    metrics,
    status::Status,
};

/// Receiving end of the outbound frame channel, drained by the transport
/// writer.
pub type OutboundReceiver = mpsc::UnboundedReceiver<Frame>;

/// Cloneable, thread-safe handle that sends replies and events.
#[derive(Clone, Debug)]
pub struct Responder {
    tx: mpsc::UnboundedSender<Frame>,
    max_payload: usize,
}

impl Responder {
    /// Create a responder and the receiver its frames arrive on.
    #[must_use]
    pub fn channel(max_payload: usize) -> (Self, OutboundReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, max_payload }, rx)
    }

    /// Largest payload a reply or event may carry.
    #[must_use]
    pub fn max_payload(&self) -> usize { self.max_payload }

    /// Send the reply to the command described by `request`.
    ///
    /// A successful reply echoes the request's service, opcode and index and
    /// carries `payload`. Any other status is sent as a bare status frame and
    /// `payload` is ignored. A successful reply too large for the transport is
    /// replaced by a [`Status::Failed`] status.
    pub fn reply(&self, request: &FrameHeader, status: Status, payload: &[u8]) {
        let status = if status.is_success() && payload.len() > self.max_payload {
            error!(
                service = request.service,
                opcode = request.opcode,
                len = payload.len(),
                max = self.max_payload,
                "reply too large; sending failure status"
            );
            Status::Failed
        } else {
            status
        };

        let frame = if status.is_success() {
            Frame::new(
                request.service,
                request.opcode,
                request.index,
                Bytes::copy_from_slice(payload),
            )
        } else {
            Frame::status(request.service, request.index, status)
        };
        debug!(
            service = request.service,
            opcode = request.opcode,
            index = request.index,
            %status,
            len = frame.payload.len(),
            "reply"
        );
        metrics::inc_replies(status);
        self.send(frame);
    }

    fn send(&self, frame: Frame) {
        if self.tx.send(frame).is_err() {
            debug!("transport writer gone; dropping outbound frame");
        }
    }
}

/// Sends unsolicited events.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    responder: Responder,
    scratch: Arc<Mutex<BytesMut>>,
}

impl EventEmitter {
    /// Create an emitter sending through `responder`.
    #[must_use]
    pub fn new(responder: Responder) -> Self {
        let scratch = BytesMut::with_capacity(responder.max_payload());
        Self {
            responder,
            scratch: Arc::new(Mutex::new(scratch)),
        }
    }

    /// Emit an event carrying `payload`.
    ///
    /// Events always carry [`INDEX_NONE`] and are not correlated with any
    /// request.
    ///
    /// # Panics
    ///
    /// Panics if `opcode` is outside the event range or the payload exceeds
    /// the maximum payload size.
    pub fn emit(&self, service: u8, opcode: u8, payload: &[u8]) {
        assert!(
            opcode >= EVENT_OPCODE_MIN,
            "opcode {opcode:#04x} is not an event opcode"
        );
        assert!(
            payload.len() <= self.responder.max_payload(),
            "event payload of {} bytes exceeds {}",
            payload.len(),
            self.responder.max_payload()
        );
        debug!(service, opcode, len = payload.len(), index = INDEX_NONE, "event");
        metrics::inc_events();
        self.responder
            .send(Frame::event(service, opcode, Bytes::copy_from_slice(payload)));
    }

    /// Lock the shared event scratch buffer.
    ///
    /// The buffer stays locked until the returned guard is dropped, at which
    /// point it is cleared. Do not call this again while holding a guard on
    /// the same thread.
    pub fn scratch(&self) -> EventScratch<'_> {
        let guard = self.scratch.lock().unwrap_or_else(PoisonError::into_inner);
        EventScratch {
            emitter: self,
            buf: guard,
        }
    }
}

/// Exclusive access to the event scratch buffer.
pub struct EventScratch<'a> {
    emitter: &'a EventEmitter,
    buf: MutexGuard<'a, BytesMut>,
}

impl EventScratch<'_> {
    /// Reset the buffer to `len` zeroed bytes and return them for filling.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the maximum payload size.
    pub fn allocate(&mut self, len: usize) -> &mut [u8] {
        let max = self.emitter.responder.max_payload();
        assert!(len <= max, "event payload of {len} bytes exceeds {max}");
        self.buf.clear();
        self.buf.resize(len, 0);
        &mut self.buf[..]
    }

    /// Current contents of the buffer.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] { &self.buf }

    /// Emit the buffer's contents as an event.
    ///
    /// # Panics
    ///
    /// Panics if `opcode` is outside the event range.
    pub fn emit(&self, service: u8, opcode: u8) { self.emitter.emit(service, opcode, &self.buf); }
}

impl Drop for EventScratch<'_> {
    fn drop(&mut self) { self.buf.clear(); }
}

//! Single-slot holder for a command whose reply has been postponed.

use std::{
    fmt,
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::{debug, warn};

use crate::{frame::FrameHeader, pool::CommandSlot, response::Responder, status::Status};

enum Slot {
    Empty,
    Parked(CommandSlot),
    /// Completed from another thread before the handler returned.
    Early { status: Status, reply: Vec<u8> },
}

struct State {
    /// A handler is running and may still defer its command.
    armed: bool,
    /// The dispatcher has stopped; late completions are ignored.
    closed: bool,
    slot: Slot,
}

/// Cloneable handle that finishes the currently deferred command.
///
/// The handle may be moved to any thread, such as the callback context of
/// the stack a handler drives. At most one command can be deferred at a
/// time; the command keeps its pool slot until it is completed.
#[derive(Clone)]
pub struct Completer {
    state: Arc<Mutex<State>>,
    responder: Responder,
}

impl Completer {
    pub(crate) fn new(responder: Responder) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                armed: false,
                closed: false,
                slot: Slot::Empty,
            })),
            responder,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a command is waiting for completion.
    #[must_use]
    pub fn is_pending(&self) -> bool { matches!(self.lock().slot, Slot::Parked(_)) }

    /// Header of the command waiting for completion.
    #[must_use]
    pub fn pending(&self) -> Option<FrameHeader> {
        match &self.lock().slot {
            Slot::Parked(slot) => Some(slot.header()),
            _ => None,
        }
    }

    /// Mark the start of a handler invocation.
    pub(crate) fn arm(&self) { self.lock().armed = true; }

    /// Mark the end of a handler invocation that did not defer.
    ///
    /// # Panics
    ///
    /// Panics if the command was completed although it never deferred.
    pub(crate) fn disarm(&self) {
        let mut state = self.lock();
        state.armed = false;
        if matches!(state.slot, Slot::Early { .. }) {
            state.slot = Slot::Empty;
            drop(state);
            panic!("completed a command that was never deferred");
        }
    }

    /// Park `slot` until [`complete`](Self::complete) is called. If the
    /// completion already arrived, the reply is sent at once.
    ///
    /// # Panics
    ///
    /// Panics if another command is already deferred.
    pub(crate) fn park(&self, slot: CommandSlot) {
        let mut state = self.lock();
        state.armed = false;
        match mem::replace(&mut state.slot, Slot::Empty) {
            Slot::Empty => {
                debug!(slot = %slot.id(), header = ?slot.header(), "command deferred");
                state.slot = Slot::Parked(slot);
            }
            Slot::Early { status, reply } => {
                drop(state);
                self.finish(slot, status, &reply);
            }
            Slot::Parked(pending) => {
                let held = pending.header();
                state.slot = Slot::Parked(pending);
                drop(state);
                panic!(
                    "cannot defer {:?}: {held:?} is already deferred",
                    slot.header()
                );
            }
        }
    }

    /// Send the final reply for the deferred command and release its slot.
    ///
    /// The reply is encoded exactly like an immediate one: `reply` is only
    /// sent with [`Status::Success`]. While a handler is running and no
    /// command is parked, the completion is held for the command that
    /// handler defers. After the dispatcher has stopped, a completion with
    /// nothing deferred is logged and ignored.
    ///
    /// # Panics
    ///
    /// Panics if no command is deferred while the dispatcher is running.
    pub fn complete(&self, status: Status, reply: &[u8]) {
        let mut state = self.lock();
        match mem::replace(&mut state.slot, Slot::Empty) {
            Slot::Parked(slot) => {
                drop(state);
                self.finish(slot, status, reply);
            }
            Slot::Empty if state.armed => {
                state.slot = Slot::Early {
                    status,
                    reply: reply.to_vec(),
                };
            }
            Slot::Empty if state.closed => {
                drop(state);
                warn!(%status, "dispatcher stopped; ignoring completion");
            }
            unmatched @ (Slot::Empty | Slot::Early { .. }) => {
                state.slot = unmatched;
                drop(state);
                panic!("no deferred command to complete");
            }
        }
    }

    /// Stop accepting deferred commands and drop the outstanding one, if
    /// any, without replying.
    pub(crate) fn abandon(&self) -> Option<FrameHeader> {
        let mut state = self.lock();
        state.closed = true;
        state.armed = false;
        match mem::replace(&mut state.slot, Slot::Empty) {
            Slot::Parked(slot) => {
                drop(state);
                Some(slot.header())
            }
            Slot::Empty | Slot::Early { .. } => None,
        }
    }

    fn finish(&self, slot: CommandSlot, status: Status, reply: &[u8]) {
        let header = slot.header();
        debug!(slot = %slot.id(), ?header, %status, "deferred command completed");
        self.responder.reply(&header, status, reply);
        drop(slot);
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

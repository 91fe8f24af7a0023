//! Handler contracts and the context passed to command handlers.

use std::{fmt, sync::Arc};

use crate::{
    dispatcher::Completer,
    frame::{DEFAULT_INDEX, FrameHeader},
    pool::ReplyBuf,
    response::EventEmitter,
    status::{Outcome, Status},
};

/// Signature shared by all command handlers.
///
/// Handlers run on the dispatcher task and must return promptly. A handler
/// must never wait for the external event that would complete a deferred
/// command: that completion can only be observed once the handler returns.
pub type HandlerFn = dyn Fn(&mut Command<'_>) -> Outcome + Send + Sync;

/// Index a command must carry to reach its handler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RequiredIndex {
    /// Only this exact index is accepted.
    Exact(u8),
    /// Only the default controller index is accepted.
    #[default]
    Default,
    /// Every index is accepted.
    Any,
}

impl RequiredIndex {
    #[must_use]
    pub fn accepts(self, index: u8) -> bool {
        match self {
            Self::Exact(required) => index == required,
            Self::Default => index == DEFAULT_INDEX,
            Self::Any => true,
        }
    }
}

/// Payload length a command must carry to reach its handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpectedLength {
    /// Exactly this many bytes.
    Fixed(u16),
    /// No payload at all.
    Empty,
    /// Anything the transport accepts.
    Variable,
}

impl ExpectedLength {
    #[must_use]
    pub fn accepts(self, len: u16) -> bool {
        match self {
            Self::Fixed(expected) => len == expected,
            Self::Empty => len == 0,
            Self::Variable => true,
        }
    }
}

/// Static validation contract of one opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Contract {
    pub opcode: u8,
    pub index: RequiredIndex,
    pub len: ExpectedLength,
}

impl Contract {
    /// Check `header` against this contract.
    ///
    /// # Errors
    ///
    /// Returns [`Status::Failed`] if the index or the payload length do not
    /// match.
    pub fn check(&self, header: &FrameHeader) -> Result<(), Status> {
        if !self.index.accepts(header.index) {
            return Err(Status::Failed);
        }
        if !self.len.accepts(header.len) {
            return Err(Status::Failed);
        }
        Ok(())
    }
}

/// A handler together with its validation contract.
#[derive(Clone)]
pub struct HandlerEntry {
    contract: Contract,
    handler: Arc<HandlerFn>,
}

impl HandlerEntry {
    /// Create an entry for `opcode` requiring the default index.
    pub fn new<F>(opcode: u8, len: ExpectedLength, handler: F) -> Self
    where
        F: Fn(&mut Command<'_>) -> Outcome + Send + Sync + 'static,
    {
        Self {
            contract: Contract {
                opcode,
                index: RequiredIndex::Default,
                len,
            },
            handler: Arc::new(handler),
        }
    }

    /// Replace the required index.
    #[must_use]
    pub fn with_index(mut self, index: RequiredIndex) -> Self {
        self.contract.index = index;
        self
    }

    #[must_use]
    pub fn opcode(&self) -> u8 { self.contract.opcode }

    #[must_use]
    pub fn contract(&self) -> &Contract { &self.contract }

    pub(crate) fn handler(&self) -> Arc<HandlerFn> { Arc::clone(&self.handler) }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("contract", &self.contract)
            .finish_non_exhaustive()
    }
}

/// Context handed to a command handler.
pub struct Command<'a> {
    header: FrameHeader,
    payload: &'a [u8],
    reply: ReplyBuf<'a>,
    events: &'a EventEmitter,
    completer: &'a Completer,
}

impl<'a> Command<'a> {
    pub(crate) fn new(
        header: FrameHeader,
        payload: &'a [u8],
        reply: ReplyBuf<'a>,
        events: &'a EventEmitter,
        completer: &'a Completer,
    ) -> Self {
        Self {
            header,
            payload,
            reply,
            events,
            completer,
        }
    }

    #[must_use]
    pub fn header(&self) -> &FrameHeader { &self.header }

    #[must_use]
    pub fn index(&self) -> u8 { self.header.index }

    /// Request payload.
    #[must_use]
    pub fn payload(&self) -> &'a [u8] { self.payload }

    /// Reply scratch area. Its contents are sent only with a
    /// [`Status::Success`] outcome.
    pub fn reply(&mut self) -> &mut ReplyBuf<'a> { &mut self.reply }

    /// Handle for emitting events.
    #[must_use]
    pub fn events(&self) -> &EventEmitter { self.events }

    /// Handle for completing this command later, after returning
    /// [`Outcome::Deferred`].
    #[must_use]
    pub fn completer(&self) -> Completer { self.completer.clone() }
}

//! Status codes and handler outcomes.

use std::fmt;

/// Status carried by a reply.
///
/// Only [`Status::Success`] replies carry an opcode-specific payload; every
/// other status is sent as a bare status frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    Failed,
    UnknownCommand,
    NotReady,
}

impl Status {
    /// On-wire status code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Success => 0x00,
            Self::Failed => 0x01,
            Self::UnknownCommand => 0x02,
            Self::NotReady => 0x03,
        }
    }

    /// Parse an on-wire status code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Success),
            0x01 => Some(Self::Failed),
            0x02 => Some(Self::UnknownCommand),
            0x03 => Some(Self::NotReady),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_success(self) -> bool { matches!(self, Self::Success) }

    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::UnknownCommand => "unknown_command",
            Self::NotReady => "not_ready",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Result of invoking a command handler.
///
/// A handler either finishes the command now, or defers it. A deferred
/// command is finished later through the dispatcher's
/// [`Completer`](crate::dispatcher::Completer); at most one command may be
/// deferred at a time.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The command finished with the given status. On success the reply
    /// payload is whatever the handler wrote to its reply buffer.
    Completed(Status),
    /// The reply will be supplied later by an external event.
    Deferred,
}

impl From<Status> for Outcome {
    fn from(status: Status) -> Self { Self::Completed(status) }
}

//! Top-level error type for assembling and serving a tester.

use std::io;

use thiserror::Error;

use crate::{config::ConfigError, registry::RegistryError};

/// Errors raised while building or serving a [`Tester`](crate::runtime::Tester).
///
/// Malformed input from the peer never surfaces here: framing errors are
/// resynchronised and dispatch errors become status replies.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum TesterError {
    /// The configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// A service could not be registered at start-up.
    #[error("service registration failed: {0}")]
    Registry(#[from] RegistryError),
    /// Reading from or writing to the transport failed.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    /// A serving task was cancelled before it finished.
    #[error("{0} task was cancelled")]
    Cancelled(&'static str),
}

//! Framed request/response/event dispatcher for tester protocols.
//!
//! A controller drives the implementation under test one command at a time
//! over a byte stream. Each frame carries a five byte header (service,
//! opcode, index and a little-endian payload length) followed by the
//! payload. This crate reassembles frames into a fixed pool of command
//! slots, validates them against per-opcode contracts, invokes the
//! registered handlers and encodes their replies, which may be immediate or
//! deferred until an external event completes them.

pub mod byte_order;
pub mod client;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod dispatcher;
pub mod echo;
pub mod error;
pub mod frame;
pub mod handler;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod response;
pub mod runtime;
pub mod status;

pub use client::{ClientError, Response, TesterClient};
pub use codec::{FrameCodec, FramingError};
pub use config::{ClientConfig, ConfigError, TesterConfig};
pub use decoder::FrameDecoder;
pub use dispatcher::{Completer, Dispatcher, Service};
pub use error::TesterError;
pub use frame::{Frame, FrameHeader, INDEX_NONE};
pub use handler::{Command, ExpectedLength, HandlerEntry, RequiredIndex};
pub use pool::{BufferPool, CommandSlot};
pub use registry::{HandlerRegistry, RegistryError};
pub use response::{EventEmitter, Responder};
pub use runtime::{Tester, TesterBuilder};
pub use status::{Outcome, Status};

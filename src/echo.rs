//! Echo service used by the `btpwire` binary and the tests.
//!
//! The service answers `ECHO` at once and `DEFERRED_ECHO` from a spawned
//! task, which first announces the payload with an `ECHOED` event and then
//! completes the deferred command with the same payload.

use bytes::Bytes;
use tokio::runtime::Handle;
use tracing::debug;

use crate::{
    dispatcher::Service,
    handler::{Command, ExpectedLength, HandlerEntry},
    registry::bitmap,
    status::{Outcome, Status},
};

/// Service id of the echo service.
pub const ECHO_SERVICE_ID: u8 = 0x01;
pub const OP_READ_SUPPORTED_COMMANDS: u8 = 0x01;
pub const OP_ECHO: u8 = 0x02;
pub const OP_DEFERRED_ECHO: u8 = 0x03;
/// Event carrying the payload of a deferred echo before its reply.
pub const EV_ECHOED: u8 = 0x80;

const OPCODES: [u8; 3] = [OP_READ_SUPPORTED_COMMANDS, OP_ECHO, OP_DEFERRED_ECHO];

/// The echo service. Deferred echoes complete on the runtime it was built
/// with.
#[derive(Clone, Debug)]
pub struct EchoService {
    runtime: Handle,
}

impl EchoService {
    #[must_use]
    pub fn new(runtime: Handle) -> Self { Self { runtime } }

    fn entries(&self) -> Vec<HandlerEntry> {
        let runtime = self.runtime.clone();
        vec![
            HandlerEntry::new(
                OP_READ_SUPPORTED_COMMANDS,
                ExpectedLength::Empty,
                read_supported_commands,
            ),
            HandlerEntry::new(OP_ECHO, ExpectedLength::Variable, echo),
            HandlerEntry::new(OP_DEFERRED_ECHO, ExpectedLength::Variable, move |cmd| {
                deferred_echo(&runtime, cmd)
            }),
        ]
    }
}

impl Service for EchoService {
    fn id(&self) -> u8 { ECHO_SERVICE_ID }

    fn handlers(&mut self) -> Vec<HandlerEntry> { self.entries() }
}

fn read_supported_commands(cmd: &mut Command<'_>) -> Outcome {
    match cmd.reply().put_slice(&bitmap(OPCODES)) {
        Ok(()) => Status::Success.into(),
        Err(_) => Status::Failed.into(),
    }
}

fn echo(cmd: &mut Command<'_>) -> Outcome {
    let payload = cmd.payload();
    match cmd.reply().put_slice(payload) {
        Ok(()) => Status::Success.into(),
        Err(_) => Status::Failed.into(),
    }
}

fn deferred_echo(runtime: &Handle, cmd: &mut Command<'_>) -> Outcome {
    let completer = cmd.completer();
    if completer.is_pending() {
        debug!("deferred echo already outstanding");
        return Status::NotReady.into();
    }

    let payload = Bytes::copy_from_slice(cmd.payload());
    let events = cmd.events().clone();
    runtime.spawn(async move {
        events.emit(ECHO_SERVICE_ID, EV_ECHOED, &payload);
        completer.complete(Status::Success, &payload);
    });
    Outcome::Deferred
}

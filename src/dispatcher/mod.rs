//! Command dispatch.
//!
//! The [`Dispatcher`] takes decoded frames off the dispatch queue one at a
//! time, validates them against the handler registry, invokes the handler
//! and sends the reply. A handler may postpone its reply by returning
//! [`Outcome::Deferred`]; the frame's slot is then parked in the
//! [`Completer`] until the reply is produced.

mod core_service;
mod deferred;

use tracing::{debug, warn};

pub use self::{
    core_service::{
        CORE_SERVICE_ID,
        EV_IUT_READY,
        OP_READ_SUPPORTED_COMMANDS,
        OP_READ_SUPPORTED_SERVICES,
        OP_REGISTER_SERVICE,
        OP_UNREGISTER_SERVICE,
        Service,
    },
    deferred::Completer,
};
use crate::{
    frame::{FrameHeader, OpcodeKind},
    handler::Command,
    pool::CommandSlot,
    queue::QueueReceiver,
    registry::{HandlerRegistry, Lookup},
    response::{EventEmitter, Responder},
    status::{Outcome, Status},
};

/// Keep `registry` from accepting handlers for the core service id.
pub(crate) fn reserve_core(registry: &mut HandlerRegistry) { registry.reserve(CORE_SERVICE_ID); }

/// Routes commands to their handlers and sends the replies.
pub struct Dispatcher {
    registry: HandlerRegistry,
    core: core_service::Core,
    responder: Responder,
    events: EventEmitter,
    completer: Completer,
}

impl Dispatcher {
    /// Create a dispatcher over `registry`, replying through `responder`.
    ///
    /// Service `0x00` is reserved for the core service.
    #[must_use]
    pub fn new(mut registry: HandlerRegistry, responder: Responder) -> Self {
        reserve_core(&mut registry);
        Self {
            registry,
            core: core_service::Core::default(),
            events: EventEmitter::new(responder.clone()),
            completer: Completer::new(responder.clone()),
            responder,
        }
    }

    /// Add `service` to the catalogue the peer may register through the
    /// core service. A service with the same id is replaced.
    #[must_use]
    pub fn with_service(mut self, service: Box<dyn Service>) -> Self {
        if let Some(previous) = self.core.add(service) {
            warn!(service = previous.id(), "replacing catalogue service");
        }
        self
    }

    /// Ids of the services available for registration.
    pub fn catalogue(&self) -> impl Iterator<Item = u8> + '_ { self.core.catalogue() }

    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry { &self.registry }

    /// Emitter sharing this dispatcher's outbound channel.
    #[must_use]
    pub fn events(&self) -> &EventEmitter { &self.events }

    /// Handle completing this dispatcher's deferred command.
    #[must_use]
    pub fn completer(&self) -> &Completer { &self.completer }

    /// Tell the peer the tester is ready.
    pub fn announce_ready(&self) { self.events.emit(CORE_SERVICE_ID, EV_IUT_READY, &[]); }

    /// Process one decoded frame and return what became of it.
    ///
    /// A completed command is answered before its slot is released. A
    /// deferred command keeps its slot until [`Completer::complete`] runs.
    ///
    /// # Panics
    ///
    /// Panics if the handler defers while another command is still deferred,
    /// or if its command is completed through the [`Completer`] although the
    /// handler did not defer.
    pub fn dispatch(&mut self, mut slot: CommandSlot) -> Outcome {
        let header = slot.header();
        debug!(slot = %slot.id(), ?header, "dispatching command");

        self.completer.arm();
        let outcome = match OpcodeKind::of(header.opcode) {
            OpcodeKind::Command if header.service == CORE_SERVICE_ID => {
                self.dispatch_core(&header, &mut slot)
            }
            OpcodeKind::Command => self.dispatch_registered(&header, &mut slot),
            OpcodeKind::Status | OpcodeKind::Event => {
                debug!(?header, "not a command opcode");
                Status::UnknownCommand.into()
            }
        };

        match outcome {
            Outcome::Completed(status) => {
                self.completer.disarm();
                self.responder.reply(&header, status, slot.reply());
                drop(slot);
            }
            Outcome::Deferred => self.completer.park(slot),
        }
        outcome
    }

    fn dispatch_core(&mut self, header: &FrameHeader, slot: &mut CommandSlot) -> Outcome {
        let Some(contract) = core_service::contract(header.opcode) else {
            debug!(?header, "unknown core command");
            return Status::UnknownCommand.into();
        };
        if let Err(status) = contract.check(header) {
            debug!(?header, ?contract, "core command rejected");
            return status.into();
        }
        let (payload, mut reply) = slot.split();
        self.core
            .handle(&mut self.registry, header.opcode, payload, &mut reply)
            .into()
    }

    fn dispatch_registered(&self, header: &FrameHeader, slot: &mut CommandSlot) -> Outcome {
        let handler = match self.registry.resolve(header) {
            Lookup::Unknown => {
                debug!(?header, "unknown command");
                return Status::UnknownCommand.into();
            }
            Lookup::Found(entry) => {
                if let Err(status) = entry.contract().check(header) {
                    debug!(?header, contract = ?entry.contract(), "command rejected");
                    return status.into();
                }
                entry.handler()
            }
        };
        let (payload, reply) = slot.split();
        let mut command = Command::new(*header, payload, reply, &self.events, &self.completer);
        handler(&mut command)
    }

    /// Dispatch frames from `queue` until every producer has gone away.
    ///
    /// A command still deferred at that point is released without a reply.
    pub async fn run(mut self, mut queue: QueueReceiver) {
        while let Some(slot) = queue.next().await {
            let _ = self.dispatch(slot);
        }
        self.finish();
    }

    /// Blocking variant of [`run`](Self::run) for a dedicated thread.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn run_blocking(mut self, mut queue: QueueReceiver) {
        while let Some(slot) = queue.blocking_next() {
            let _ = self.dispatch(slot);
        }
        self.finish();
    }

    fn finish(&self) {
        if let Some(header) = self.completer.abandon() {
            warn!(?header, "dispatcher stopped with a deferred command outstanding; releasing it");
        }
        debug!("dispatcher stopped");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("catalogue", &self.catalogue().collect::<Vec<_>>())
            .field("completer", &self.completer)
            .finish_non_exhaustive()
    }
}

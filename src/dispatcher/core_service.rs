//! The built-in core service (id `0x00`).
//!
//! The core service is always available. It reports which services and
//! commands exist and registers or unregisters the services of the
//! [`Service`] catalogue on the peer's request.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::{
    frame::INDEX_NONE,
    handler::{Contract, ExpectedLength, HandlerEntry, RequiredIndex},
    pool::ReplyBuf,
    registry::{HandlerRegistry, bitmap},
    status::Status,
};

/// Service id of the core service.
pub const CORE_SERVICE_ID: u8 = 0x00;

/// Core command: bitmap of the core opcodes.
pub const OP_READ_SUPPORTED_COMMANDS: u8 = 0x01;
/// Core command: bitmap of the registered services.
pub const OP_READ_SUPPORTED_SERVICES: u8 = 0x02;
/// Core command: register the catalogue service named by the payload byte.
pub const OP_REGISTER_SERVICE: u8 = 0x03;
/// Core command: unregister the service named by the payload byte.
pub const OP_UNREGISTER_SERVICE: u8 = 0x04;
/// Core event sent once the tester is ready to take commands.
pub const EV_IUT_READY: u8 = 0x80;

const fn core_contract(opcode: u8, len: ExpectedLength) -> Contract {
    Contract {
        opcode,
        index: RequiredIndex::Exact(INDEX_NONE),
        len,
    }
}

const CORE_CONTRACTS: [Contract; 4] = [
    core_contract(OP_READ_SUPPORTED_COMMANDS, ExpectedLength::Empty),
    core_contract(OP_READ_SUPPORTED_SERVICES, ExpectedLength::Empty),
    core_contract(OP_REGISTER_SERVICE, ExpectedLength::Fixed(1)),
    core_contract(OP_UNREGISTER_SERVICE, ExpectedLength::Fixed(1)),
];

/// A service the peer can register through the core service.
///
/// Implementations hand out their handler table on registration and get a
/// chance to tear down on unregistration.
pub trait Service: Send {
    /// Service id, in `0x01..=MAX_SERVICE_ID`.
    fn id(&self) -> u8;

    /// Handler table installed when the peer registers the service.
    fn handlers(&mut self) -> Vec<HandlerEntry>;

    /// Release the service's resources. Any status other than
    /// [`Status::Success`] keeps the service registered.
    fn unregister(&mut self) -> Status { Status::Success }
}

pub(super) fn contract(opcode: u8) -> Option<&'static Contract> {
    CORE_CONTRACTS.iter().find(|c| c.opcode == opcode)
}

/// State and handlers of the core service.
#[derive(Default)]
pub(super) struct Core {
    catalogue: BTreeMap<u8, Box<dyn Service>>,
}

impl Core {
    pub(super) fn add(&mut self, service: Box<dyn Service>) -> Option<Box<dyn Service>> {
        self.catalogue.insert(service.id(), service)
    }

    pub(super) fn catalogue(&self) -> impl Iterator<Item = u8> + '_ {
        self.catalogue.keys().copied()
    }

    /// Run the core command `opcode`, which already passed its contract.
    pub(super) fn handle(
        &mut self,
        registry: &mut HandlerRegistry,
        opcode: u8,
        payload: &[u8],
        reply: &mut ReplyBuf<'_>,
    ) -> Status {
        match (opcode, payload) {
            (OP_READ_SUPPORTED_COMMANDS, _) => {
                put(reply, &bitmap(CORE_CONTRACTS.iter().map(|c| c.opcode)))
            }
            (OP_READ_SUPPORTED_SERVICES, _) => put(
                reply,
                &bitmap(
                    std::iter::once(CORE_SERVICE_ID)
                        .chain(self.catalogue())
                        .chain(registry.registered()),
                ),
            ),
            (OP_REGISTER_SERVICE, &[id]) => self.register(registry, id),
            (OP_UNREGISTER_SERVICE, &[id]) => self.unregister(registry, id),
            _ => Status::Failed,
        }
    }

    fn register(&mut self, registry: &mut HandlerRegistry, id: u8) -> Status {
        let Some(service) = self.catalogue.get_mut(&id) else {
            warn!(service = id, "register request for unknown service");
            return Status::Failed;
        };
        if registry.is_registered(id) {
            warn!(service = id, "service already registered");
            return Status::Failed;
        }
        match registry.register(id, service.handlers()) {
            Ok(()) => {
                info!(service = id, "service registered");
                Status::Success
            }
            Err(err) => {
                warn!(service = id, error = %err, "service registration rejected");
                Status::Failed
            }
        }
    }

    fn unregister(&mut self, registry: &mut HandlerRegistry, id: u8) -> Status {
        if !registry.is_registered(id) {
            warn!(service = id, "unregister request for unregistered service");
            return Status::Failed;
        }
        if let Some(service) = self.catalogue.get_mut(&id) {
            let status = service.unregister();
            if !status.is_success() {
                warn!(service = id, %status, "service refused to unregister");
                return status;
            }
        }
        match registry.unregister(id) {
            Ok(()) => {
                info!(service = id, "service unregistered");
                Status::Success
            }
            Err(err) => {
                warn!(service = id, error = %err, "service unregistration rejected");
                Status::Failed
            }
        }
    }
}

fn put(reply: &mut ReplyBuf<'_>, bytes: &[u8]) -> Status {
    match reply.put_slice(bytes) {
        Ok(()) => Status::Success,
        Err(err) => {
            warn!(error = %err, "core reply does not fit");
            Status::Failed
        }
    }
}

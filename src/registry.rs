//! Mapping from service ids to handler tables.
//!
//! The registry is owned by the dispatcher, so it is never mutated while a
//! lookup is in progress. Each service may hold at most one table at a time;
//! registering a service twice is rejected.

use thiserror::Error;

use crate::{frame::FrameHeader, handler::HandlerEntry};

/// Highest service id the registry can hold.
pub const MAX_SERVICE_ID: u8 = 0x3f;

/// Errors returned when registering or unregistering services.
#[non_exhaustive]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// The service already has a handler table.
    #[error("service {0:#04x} is already registered")]
    AlreadyRegistered(u8),
    /// The service has no handler table.
    #[error("service {0:#04x} is not registered")]
    NotRegistered(u8),
    /// The id exceeds [`MAX_SERVICE_ID`] or is reserved.
    #[error("service id {0:#04x} is out of range")]
    OutOfRange(u8),
    /// Two handlers in one table share an opcode.
    #[error("service {service:#04x} lists opcode {opcode:#04x} twice")]
    DuplicateOpcode { service: u8, opcode: u8 },
}

/// Result of resolving a request header.
#[derive(Debug)]
pub enum Lookup<'a> {
    /// A handler exists for the service and opcode.
    Found(&'a HandlerEntry),
    /// The service is not registered or lacks the opcode.
    Unknown,
}

/// Per-service handler tables, indexed by service id.
pub struct HandlerRegistry {
    services: Vec<Option<Vec<HandlerEntry>>>,
    reserved: Option<u8>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: vec![None; usize::from(MAX_SERVICE_ID) + 1],
            reserved: None,
        }
    }

    /// Reserve `service` so it can never be registered, as done for the
    /// built-in core service.
    pub(crate) fn reserve(&mut self, service: u8) { self.reserved = Some(service); }

    /// Install the handler table of `service`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the id is out of range or reserved, the
    /// service is already registered, or two entries share an opcode.
    pub fn register(
        &mut self,
        service: u8,
        handlers: impl IntoIterator<Item = HandlerEntry>,
    ) -> Result<(), RegistryError> {
        if self.reserved == Some(service) {
            return Err(RegistryError::OutOfRange(service));
        }
        let slot = self
            .services
            .get_mut(usize::from(service))
            .ok_or(RegistryError::OutOfRange(service))?;
        if slot.is_some() {
            return Err(RegistryError::AlreadyRegistered(service));
        }

        let mut table: Vec<HandlerEntry> = Vec::new();
        for entry in handlers {
            let opcode = entry.opcode();
            if table.iter().any(|e| e.opcode() == opcode) {
                return Err(RegistryError::DuplicateOpcode { service, opcode });
            }
            table.push(entry);
        }
        *slot = Some(table);
        Ok(())
    }

    /// Remove the handler table of `service`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotRegistered`] if the service holds no table.
    pub fn unregister(&mut self, service: u8) -> Result<(), RegistryError> {
        self.services
            .get_mut(usize::from(service))
            .and_then(Option::take)
            .map(drop)
            .ok_or(RegistryError::NotRegistered(service))
    }

    #[must_use]
    pub fn is_registered(&self, service: u8) -> bool { self.table(service).is_some() }

    /// Resolve the handler for `service`/`opcode`.
    #[must_use]
    pub fn lookup(&self, service: u8, opcode: u8) -> Option<&HandlerEntry> {
        self.table(service)?.iter().find(|e| e.opcode() == opcode)
    }

    /// Resolve the handler addressed by `header`.
    #[must_use]
    pub fn resolve(&self, header: &FrameHeader) -> Lookup<'_> {
        match self.lookup(header.service, header.opcode) {
            Some(entry) => Lookup::Found(entry),
            None => Lookup::Unknown,
        }
    }

    /// Ids of all registered services, ascending.
    pub fn registered(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=MAX_SERVICE_ID).filter(|&id| self.is_registered(id))
    }

    /// Bitmap of the opcodes registered for `service`.
    #[must_use]
    pub fn supported_commands(&self, service: u8) -> Option<Vec<u8>> {
        let table = self.table(service)?;
        Some(bitmap(table.iter().map(HandlerEntry::opcode)))
    }

    fn table(&self, service: u8) -> Option<&Vec<HandlerEntry>> {
        self.services.get(usize::from(service))?.as_ref()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered", &self.registered().collect::<Vec<_>>())
            .finish()
    }
}

/// Build a bitmap with bit `id % 8` of byte `id / 8` set for every id.
///
/// The result is just long enough to cover the highest id.
///
/// ```
/// use btpwire::registry::bitmap;
///
/// assert_eq!(bitmap([1, 2, 9]), vec![0b0000_0110, 0b0000_0010]);
/// assert!(bitmap(Vec::<u8>::new()).is_empty());
/// ```
pub fn bitmap(ids: impl IntoIterator<Item = u8>) -> Vec<u8> {
    let mut map = Vec::new();
    for id in ids {
        let byte = usize::from(id / 8);
        if map.len() <= byte {
            map.resize(byte + 1, 0);
        }
        map[byte] |= 1 << (id % 8);
    }
    map
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::{handler::ExpectedLength, status::Status};

    fn entry(opcode: u8) -> HandlerEntry {
        HandlerEntry::new(opcode, ExpectedLength::Empty, |_| Status::Success.into())
    }

    #[fixture]
    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register(0x01, [entry(0x01), entry(0x03)])
            .expect("register service");
        registry
    }

    #[rstest]
    fn lookup_finds_registered_opcode(registry: HandlerRegistry) {
        assert_eq!(registry.lookup(0x01, 0x03).map(HandlerEntry::opcode), Some(0x03));
        assert!(registry.lookup(0x01, 0x02).is_none());
        assert!(registry.lookup(0x02, 0x01).is_none());
        assert!(matches!(
            registry.resolve(&FrameHeader::new(0x02, 0x01, 0, 0)),
            Lookup::Unknown
        ));
    }

    #[rstest]
    fn second_registration_is_rejected(mut registry: HandlerRegistry) {
        assert_eq!(
            registry.register(0x01, [entry(0x05)]),
            Err(RegistryError::AlreadyRegistered(0x01))
        );
        assert!(registry.lookup(0x01, 0x05).is_none());
    }

    #[rstest]
    fn out_of_range_service_is_rejected(mut registry: HandlerRegistry) {
        assert_eq!(
            registry.register(MAX_SERVICE_ID + 1, [entry(0x01)]),
            Err(RegistryError::OutOfRange(MAX_SERVICE_ID + 1))
        );
        registry.reserve(0x00);
        assert_eq!(
            registry.register(0x00, [entry(0x01)]),
            Err(RegistryError::OutOfRange(0x00))
        );
    }

    #[rstest]
    fn duplicate_opcode_is_rejected(mut registry: HandlerRegistry) {
        assert_eq!(
            registry.register(0x02, [entry(0x01), entry(0x01)]),
            Err(RegistryError::DuplicateOpcode {
                service: 0x02,
                opcode: 0x01
            })
        );
        assert!(!registry.is_registered(0x02));
    }

    #[rstest]
    fn unregister_allows_registering_again(mut registry: HandlerRegistry) {
        registry.unregister(0x01).expect("unregister");
        assert_eq!(
            registry.unregister(0x01),
            Err(RegistryError::NotRegistered(0x01))
        );
        registry.register(0x01, [entry(0x02)]).expect("register again");
        assert_eq!(registry.registered().collect::<Vec<_>>(), vec![0x01]);
    }

    #[rstest]
    fn supported_commands_bitmap(registry: HandlerRegistry) {
        assert_eq!(registry.supported_commands(0x01), Some(vec![0b0000_1010]));
        assert_eq!(registry.supported_commands(0x02), None);
    }
}

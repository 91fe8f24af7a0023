//! Runtime configuration for the tester and the host-side client.
//!
//! Both configurations are validated on construction so the rest of the
//! crate can rely on `pool_slots >= 1` and an MTU that leaves room for at
//! least one payload byte while still fitting the 16-bit length field.

use std::time::Duration;

use thiserror::Error;

use crate::frame::{DEFAULT_MTU, HEADER_SIZE, MAX_MTU};

/// Default number of command slots in the buffer pool.
pub const DEFAULT_POOL_SLOTS: usize = 2;

/// Default time the client waits for a reply.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default number of events the client buffers before dropping the oldest.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Errors returned when validating configuration values.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The pool must hold at least one slot.
    #[error("invalid pool size {0}; must be >= 1")]
    InvalidPoolSlots(usize),
    /// The MTU must exceed the header and fit the length field.
    #[error("invalid mtu {mtu}; must be in {min}..={max}", min = HEADER_SIZE + 1, max = MAX_MTU)]
    InvalidMtu { mtu: usize },
    /// The client event buffer must hold at least one event.
    #[error("invalid event capacity {0}; must be >= 1")]
    InvalidEventCapacity(usize),
}

fn check_mtu(mtu: usize) -> Result<usize, ConfigError> {
    if mtu <= HEADER_SIZE || mtu > MAX_MTU {
        return Err(ConfigError::InvalidMtu { mtu });
    }
    Ok(mtu)
}

/// Configuration of the dispatcher side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TesterConfig {
    pool_slots: usize,
    mtu: usize,
}

impl TesterConfig {
    /// Create a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `pool_slots` is zero or `mtu` is out of
    /// range.
    pub fn new(pool_slots: usize, mtu: usize) -> Result<Self, ConfigError> {
        if pool_slots == 0 {
            return Err(ConfigError::InvalidPoolSlots(pool_slots));
        }
        Ok(Self {
            pool_slots,
            mtu: check_mtu(mtu)?,
        })
    }

    /// Replace the pool size.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPoolSlots`] if `pool_slots` is zero.
    pub fn with_pool_slots(self, pool_slots: usize) -> Result<Self, ConfigError> {
        Self::new(pool_slots, self.mtu)
    }

    /// Replace the MTU.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidMtu`] if `mtu` is out of range.
    pub fn with_mtu(self, mtu: usize) -> Result<Self, ConfigError> {
        Self::new(self.pool_slots, mtu)
    }

    #[must_use]
    pub fn pool_slots(&self) -> usize { self.pool_slots }

    #[must_use]
    pub fn mtu(&self) -> usize { self.mtu }

    /// Largest payload a frame may declare.
    #[must_use]
    pub fn max_payload(&self) -> usize { self.mtu - HEADER_SIZE }
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            pool_slots: DEFAULT_POOL_SLOTS,
            mtu: DEFAULT_MTU,
        }
    }
}

/// Configuration of the host-side [`TesterClient`](crate::client::TesterClient).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    response_timeout: Duration,
    event_capacity: usize,
    mtu: usize,
}

impl ClientConfig {
    /// Create a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `event_capacity` is zero or `mtu` is out of
    /// range.
    pub fn new(
        response_timeout: Duration,
        event_capacity: usize,
        mtu: usize,
    ) -> Result<Self, ConfigError> {
        if event_capacity == 0 {
            return Err(ConfigError::InvalidEventCapacity(event_capacity));
        }
        Ok(Self {
            response_timeout,
            event_capacity,
            mtu: check_mtu(mtu)?,
        })
    }

    /// Replace the response timeout.
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    #[must_use]
    pub fn response_timeout(&self) -> Duration { self.response_timeout }

    #[must_use]
    pub fn event_capacity(&self) -> usize { self.event_capacity }

    #[must_use]
    pub fn mtu(&self) -> usize { self.mtu }

    /// Largest payload a frame may declare.
    #[must_use]
    pub fn max_payload(&self) -> usize { self.mtu - HEADER_SIZE }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            mtu: DEFAULT_MTU,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn tester_defaults() {
        let config = TesterConfig::default();
        assert_eq!(config.pool_slots(), 2);
        assert_eq!(config.mtu(), 1024);
        assert_eq!(config.max_payload(), 1019);
    }

    #[rstest]
    #[case(0, DEFAULT_MTU, ConfigError::InvalidPoolSlots(0))]
    #[case(2, HEADER_SIZE, ConfigError::InvalidMtu { mtu: HEADER_SIZE })]
    #[case(2, MAX_MTU + 1, ConfigError::InvalidMtu { mtu: MAX_MTU + 1 })]
    fn rejects_invalid_tester_values(
        #[case] pool_slots: usize,
        #[case] mtu: usize,
        #[case] expected: ConfigError,
    ) {
        assert_eq!(TesterConfig::new(pool_slots, mtu), Err(expected));
    }

    #[test]
    fn accepts_boundary_mtu() {
        let config = TesterConfig::default()
            .with_mtu(MAX_MTU)
            .expect("max mtu is valid");
        assert_eq!(config.max_payload(), usize::from(u16::MAX));
    }

    #[test]
    fn client_rejects_zero_event_capacity() {
        assert_eq!(
            ClientConfig::new(DEFAULT_RESPONSE_TIMEOUT, 0, DEFAULT_MTU),
            Err(ConfigError::InvalidEventCapacity(0))
        );
    }
}

//! Helpers for explicit little-endian conversions.
//!
//! The tester protocol carries its multi-byte fields in little-endian order.
//! These helpers keep Clippy expectations scoped to the conversion points so
//! protocol code can remain explicit about wire endianness without repeating
//! lint annotations.

/// Serialise a `u16` in wire byte order (little-endian).
///
/// # Examples
///
/// ```
/// use btpwire::byte_order::write_wire_u16;
///
/// assert_eq!(write_wire_u16(0x1234), [0x34, 0x12]);
/// ```
#[must_use]
pub fn write_wire_u16(value: u16) -> [u8; 2] {
    #[expect(
        clippy::little_endian_bytes,
        reason = "The tester protocol encodes lengths as little-endian."
    )]
    value.to_le_bytes()
}

/// Parse a wire-order `u16` from its on-wire representation.
///
/// # Examples
///
/// ```
/// use btpwire::byte_order::read_wire_u16;
///
/// assert_eq!(read_wire_u16([0x34, 0x12]), 0x1234);
/// ```
#[must_use]
pub fn read_wire_u16(bytes: [u8; 2]) -> u16 {
    #[expect(
        clippy::little_endian_bytes,
        reason = "The tester protocol encodes lengths as little-endian."
    )]
    u16::from_le_bytes(bytes)
}

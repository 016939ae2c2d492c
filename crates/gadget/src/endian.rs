//! Host/wire byte order conversion
//!
//! USB descriptor fields travel little-endian. These are the identity on
//! little-endian hosts and a byte swap on big-endian ones.

/// Host order to USB wire order (16-bit)
#[inline]
pub const fn host_to_wire16(value: u16) -> u16 {
    value.to_le()
}

/// USB wire order to host order (16-bit)
#[inline]
pub const fn wire_to_host16(value: u16) -> u16 {
    u16::from_le(value)
}

/// Host order to USB wire order (32-bit)
#[inline]
pub const fn host_to_wire32(value: u32) -> u32 {
    value.to_le()
}

/// USB wire order to host order (32-bit)
#[inline]
pub const fn wire_to_host32(value: u32) -> u32 {
    u32::from_le(value)
}

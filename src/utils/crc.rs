//! Integrity checks for the datagram channel.
//!
//! `crc32` is the standard IEEE 802.3 polynomial (the zlib/PNG variant).
//! `crc16` folds the upper half of that value into the lower half and is
//! used where a full 32-bit checksum would waste space on a short packet.

/// 32-bit cyclic redundancy check over `data`.
#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// 16-bit checksum derived by XOR-folding the 32-bit CRC.
///
/// `crc16(x) == ((crc32(x) >> 16) ^ crc32(x)) & 0xFFFF`
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    let c = crc32(data);
    (((c >> 16) ^ c) & 0xFFFF) as u16
}

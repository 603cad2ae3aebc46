// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Frame integrity checks shared by the KFT and XMODEM engines.
//!
//! Both protocols use CRC-16/XMODEM: polynomial 0x1021, MSB-first, zero
//! initial value, no final XOR. XMODEM's 128-byte mode uses a plain 8-bit sum.

use ::crc::{Crc, Digest, CRC_16_XMODEM};

pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// CRC-16 of a single contiguous buffer.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Incremental CRC-16 for data that arrives in pieces (header, then payload).
pub fn crc16_digest() -> Digest<'static, u16> {
    CRC16.digest()
}

/// 8-bit arithmetic sum of all bytes, wrapping on overflow.
pub fn checksum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

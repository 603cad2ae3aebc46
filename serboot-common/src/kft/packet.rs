// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! KFT framing wire format.
//!
//! Sync packet:  `[0x5A, type]`
//! Data packet:  `[0x5A, type, len_lo, len_hi, crc_lo, crc_hi, payload...]`
//! Ping reply:   `[0x5A, 0xA7, bugfix, minor, major, 'P', opt_lo, opt_hi, crc_lo, crc_hi]`
//!
//! Multi-byte fields are little-endian. The data packet CRC covers the four
//! header bytes before it plus the payload.

use crate::crc::{crc16, crc16_digest};

pub const START_BYTE: u8 = 0x5A;

/// Bytes before the payload of a data packet.
pub const DATA_HEADER_LEN: usize = 6;

/// Largest payload the framing buffers can hold.
pub const MAX_PACKET_SIZE: usize = 32;

/// Default inter-byte timeout for a partially received packet.
pub const DEFAULT_BYTE_TIMEOUT_MS: u32 = 10;

pub const PING_RESPONSE_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PacketType {
    Ack = 0xA1,
    Nak = 0xA2,
    AckAbort = 0xA3,
    Command = 0xA4,
    Data = 0xA5,
    Ping = 0xA6,
    PingResponse = 0xA7,
}

impl PacketType {
    /// Command and data packets carry a length, CRC and payload.
    pub fn has_payload(self) -> bool {
        matches!(self, Self::Command | Self::Data)
    }
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(b: u8) -> Result<Self, u8> {
        Ok(match b {
            0xA1 => Self::Ack,
            0xA2 => Self::Nak,
            0xA3 => Self::AckAbort,
            0xA4 => Self::Command,
            0xA5 => Self::Data,
            0xA6 => Self::Ping,
            0xA7 => Self::PingResponse,
            other => return Err(other),
        })
    }
}

/// Version quadruple used by the ping response and the version properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Version {
    pub name: u8,
    pub major: u8,
    pub minor: u8,
    pub bugfix: u8,
}

impl Version {
    pub const fn new(name: u8, major: u8, minor: u8, bugfix: u8) -> Self {
        Self {
            name,
            major,
            minor,
            bugfix,
        }
    }

    /// Packed as `name << 24 | major << 16 | minor << 8 | bugfix`.
    pub fn as_u32(self) -> u32 {
        u32::from_be_bytes([self.name, self.major, self.minor, self.bugfix])
    }

    pub fn from_u32(v: u32) -> Self {
        let [name, major, minor, bugfix] = v.to_be_bytes();
        Self::new(name, major, minor, bugfix)
    }
}

/// Serial framing protocol version reported in ping responses.
pub const PROTOCOL_VERSION: Version = Version::new(b'P', 1, 2, 0);

pub fn sync_packet(ty: PacketType) -> [u8; 2] {
    [START_BYTE, ty as u8]
}

/// CRC of a data packet: start byte, type, length, then payload.
pub fn data_packet_crc(ty: PacketType, payload: &[u8]) -> u16 {
    let len = (payload.len() as u16).to_le_bytes();
    let mut digest = crc16_digest();
    digest.update(&[START_BYTE, ty as u8, len[0], len[1]]);
    digest.update(payload);
    digest.finalize()
}

/// Header for a data packet carrying `payload`.
pub fn data_header(ty: PacketType, payload: &[u8]) -> [u8; DATA_HEADER_LEN] {
    let len = (payload.len() as u16).to_le_bytes();
    let crc = data_packet_crc(ty, payload).to_le_bytes();
    [START_BYTE, ty as u8, len[0], len[1], crc[0], crc[1]]
}

pub fn ping_response(version: Version, options: u16) -> [u8; PING_RESPONSE_LEN] {
    let opt = options.to_le_bytes();
    let mut out = [
        START_BYTE,
        PacketType::PingResponse as u8,
        version.bugfix,
        version.minor,
        version.major,
        version.name,
        opt[0],
        opt[1],
        0,
        0,
    ];
    let crc = crc16(&out[..8]).to_le_bytes();
    out[8] = crc[0];
    out[9] = crc[1];
    out
}

/// Parse a ping response. Returns `None` on a bad start/type byte or CRC.
pub fn parse_ping_response(bytes: &[u8; PING_RESPONSE_LEN]) -> Option<(Version, u16)> {
    if bytes[0] != START_BYTE || bytes[1] != PacketType::PingResponse as u8 {
        return None;
    }
    let crc = u16::from_le_bytes([bytes[8], bytes[9]]);
    if crc16(&bytes[..8]) != crc {
        return None;
    }
    let version = Version::new(bytes[5], bytes[4], bytes[3], bytes[2]);
    Some((version, u16::from_le_bytes([bytes[6], bytes[7]])))
}

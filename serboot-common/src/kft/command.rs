// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! KFT command and response packets (the payload of a framing packet).
//!
//! `[tag, flags, reserved = 0, param_count, params[param_count] as u32 LE]`

use heapless::Vec;
use thiserror::Error;

use super::packet::MAX_PACKET_SIZE;
use super::status::Status;

pub const HEADER_LEN: usize = 4;

/// Parameters that fit in one packet after the header.
pub const MAX_PARAMS: usize = (MAX_PACKET_SIZE - HEADER_LEN) / 4;

/// Command flag: a data phase follows this command or response.
pub const FLAG_HAS_DATA_PHASE: u8 = 0x01;

/// Tags with this high nibble are responses.
pub const RESPONSE_TAG_MASK: u8 = 0xA0;

pub type Params = Vec<u32, MAX_PARAMS>;
pub type EncodedPacket = Vec<u8, MAX_PACKET_SIZE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CommandTag {
    FlashEraseAll = 0x01,
    FlashEraseRegion = 0x02,
    ReadMemory = 0x03,
    WriteMemory = 0x04,
    FillMemory = 0x05,
    FlashSecurityDisable = 0x06,
    GetProperty = 0x07,
    ReceiveSbFile = 0x08,
    Execute = 0x09,
    Call = 0x0A,
    Reset = 0x0B,
    SetProperty = 0x0C,
    FlashEraseAllUnsecure = 0x0D,
    FlashProgramOnce = 0x0E,
    FlashReadOnce = 0x0F,
    FlashReadResource = 0x10,
    ConfigureQuadSpi = 0x11,
    ReliableUpdate = 0x12,
}

impl CommandTag {
    pub const FIRST: u8 = 0x01;
    pub const LAST: u8 = 0x12;

    pub fn from_u8(b: u8) -> Option<Self> {
        use CommandTag::*;
        Some(match b {
            0x01 => FlashEraseAll,
            0x02 => FlashEraseRegion,
            0x03 => ReadMemory,
            0x04 => WriteMemory,
            0x05 => FillMemory,
            0x06 => FlashSecurityDisable,
            0x07 => GetProperty,
            0x08 => ReceiveSbFile,
            0x09 => Execute,
            0x0A => Call,
            0x0B => Reset,
            0x0C => SetProperty,
            0x0D => FlashEraseAllUnsecure,
            0x0E => FlashProgramOnce,
            0x0F => FlashReadOnce,
            0x10 => FlashReadResource,
            0x11 => ConfigureQuadSpi,
            0x12 => ReliableUpdate,
            _ => return None,
        })
    }

    /// Accepted parameter count range (inclusive).
    pub fn param_range(self) -> (usize, usize) {
        use CommandTag::*;
        match self {
            FlashEraseAll => (0, 1),
            FlashEraseRegion => (2, 3),
            ReadMemory => (2, 3),
            WriteMemory => (2, 3),
            FillMemory => (3, 3),
            FlashSecurityDisable => (2, 2),
            GetProperty => (1, 2),
            ReceiveSbFile => (1, 1),
            Execute => (3, 3),
            Call => (2, 2),
            Reset => (0, 0),
            SetProperty => (2, 2),
            FlashEraseAllUnsecure => (0, 0),
            FlashProgramOnce => (3, 4),
            FlashReadOnce => (2, 2),
            FlashReadResource => (3, 3),
            ConfigureQuadSpi => (2, 2),
            ReliableUpdate => (1, 1),
        }
    }

    /// Bit for this command in the available-commands property.
    pub fn mask(self) -> u32 {
        1 << (self as u8 - Self::FIRST)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ResponseTag {
    Generic = 0xA0,
    ReadMemory = 0xA3,
    GetProperty = 0xA7,
    FlashReadOnce = 0xAF,
    FlashReadResource = 0xB0,
}

impl ResponseTag {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0xA0 => Self::Generic,
            0xA3 => Self::ReadMemory,
            0xA7 => Self::GetProperty,
            0xAF => Self::FlashReadOnce,
            0xB0 => Self::FlashReadResource,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    #[error("packet shorter than its header")]
    Truncated,
    #[error("unknown command tag {0:#04x}")]
    UnknownTag(u8),
    #[error("parameter count does not match the command")]
    ParameterCount,
}

impl DecodeError {
    pub fn status(self) -> Status {
        match self {
            DecodeError::UnknownTag(_) => Status::UnknownCommand,
            DecodeError::Truncated | DecodeError::ParameterCount => Status::InvalidArgument,
        }
    }
}

/// Header and parameters of any command or response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub tag: u8,
    pub flags: u8,
    pub params: Params,
}

impl RawPacket {
    /// Field-by-field decode. Trailing bytes past the declared parameters are
    /// ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::Truncated);
        }
        let count = bytes[3] as usize;
        if count > MAX_PARAMS || bytes.len() < HEADER_LEN + count * 4 {
            return Err(DecodeError::ParameterCount);
        }
        let mut params = Params::new();
        for chunk in bytes[HEADER_LEN..HEADER_LEN + count * 4].chunks_exact(4) {
            let v = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            // count <= MAX_PARAMS was checked above
            let _ = params.push(v);
        }
        Ok(Self {
            tag: bytes[0],
            flags: bytes[1],
            params,
        })
    }

    pub fn encode(&self) -> EncodedPacket {
        let mut out = EncodedPacket::new();
        let _ = out.extend_from_slice(&[self.tag, self.flags, 0, self.params.len() as u8]);
        for p in &self.params {
            let _ = out.extend_from_slice(&p.to_le_bytes());
        }
        out
    }

    pub fn has_data_phase(&self) -> bool {
        self.flags & FLAG_HAS_DATA_PHASE != 0
    }

    pub fn param(&self, index: usize) -> u32 {
        self.params.get(index).copied().unwrap_or(0)
    }
}

/// A validated host command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub tag: CommandTag,
    pub flags: u8,
    pub params: Params,
}

impl Command {
    pub fn new(tag: CommandTag, params: &[u32]) -> Self {
        let mut p = Params::new();
        for &v in params.iter().take(MAX_PARAMS) {
            let _ = p.push(v);
        }
        Self {
            tag,
            flags: 0,
            params: p,
        }
    }

    pub fn with_data_phase(mut self) -> Self {
        self.flags |= FLAG_HAS_DATA_PHASE;
        self
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw = RawPacket::decode(bytes)?;
        let tag = CommandTag::from_u8(raw.tag).ok_or(DecodeError::UnknownTag(raw.tag))?;
        let (min, max) = tag.param_range();
        if raw.params.len() < min || raw.params.len() > max {
            return Err(DecodeError::ParameterCount);
        }
        Ok(Self {
            tag,
            flags: raw.flags,
            params: raw.params,
        })
    }

    pub fn encode(&self) -> EncodedPacket {
        RawPacket {
            tag: self.tag as u8,
            flags: self.flags,
            params: self.params.clone(),
        }
        .encode()
    }

    pub fn param(&self, index: usize) -> u32 {
        self.params.get(index).copied().unwrap_or(0)
    }

    pub fn has_data_phase(&self) -> bool {
        self.flags & FLAG_HAS_DATA_PHASE != 0
    }
}

// --- Responses ---

/// Response packets the device emits and the host parses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Status of any command, echoing its tag.
    Generic { status: u32, command: u8 },
    GetProperty { status: u32, values: Params },
    /// First half of a read: the data phase follows when `status` is success.
    ReadMemory { status: u32, byte_count: u32 },
}

impl Response {
    pub fn generic(status: Status, command: u8) -> Self {
        Self::Generic {
            status: status.code(),
            command,
        }
    }

    pub fn tag(&self) -> ResponseTag {
        match self {
            Self::Generic { .. } => ResponseTag::Generic,
            Self::GetProperty { .. } => ResponseTag::GetProperty,
            Self::ReadMemory { .. } => ResponseTag::ReadMemory,
        }
    }

    pub fn status(&self) -> u32 {
        match self {
            Self::Generic { status, .. }
            | Self::GetProperty { status, .. }
            | Self::ReadMemory { status, .. } => *status,
        }
    }

    pub fn encode(&self) -> EncodedPacket {
        let mut params = Params::new();
        let mut flags = 0;
        match self {
            Self::Generic { status, command } => {
                let _ = params.push(*status);
                let _ = params.push(*command as u32);
            }
            Self::GetProperty { status, values } => {
                let _ = params.push(*status);
                for &v in values.iter().take(MAX_PARAMS - 1) {
                    let _ = params.push(v);
                }
            }
            Self::ReadMemory { status, byte_count } => {
                if *status == Status::Success.code() {
                    flags = FLAG_HAS_DATA_PHASE;
                }
                let _ = params.push(*status);
                let _ = params.push(*byte_count);
            }
        }
        RawPacket {
            tag: self.tag() as u8,
            flags,
            params,
        }
        .encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw = RawPacket::decode(bytes)?;
        let tag = ResponseTag::from_u8(raw.tag).ok_or(DecodeError::UnknownTag(raw.tag))?;
        if raw.params.is_empty() {
            return Err(DecodeError::ParameterCount);
        }
        let status = raw.params[0];
        Ok(match tag {
            ResponseTag::Generic => {
                if raw.params.len() != 2 {
                    return Err(DecodeError::ParameterCount);
                }
                Self::Generic {
                    status,
                    command: raw.params[1] as u8,
                }
            }
            ResponseTag::GetProperty => {
                let mut values = Params::new();
                for &v in &raw.params[1..] {
                    let _ = values.push(v);
                }
                Self::GetProperty { status, values }
            }
            ResponseTag::ReadMemory => {
                if raw.params.len() != 2 {
                    return Err(DecodeError::ParameterCount);
                }
                Self::ReadMemory {
                    status,
                    byte_count: raw.params[1],
                }
            }
            ResponseTag::FlashReadOnce | ResponseTag::FlashReadResource => {
                return Err(DecodeError::UnknownTag(raw.tag))
            }
        })
    }
}

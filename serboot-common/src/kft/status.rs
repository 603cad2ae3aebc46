// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Status codes carried in KFT response packets.
//!
//! Codes are `group * 100 + code`: generic group 0, bootloader group 100,
//! memory interface group 102, property store group 103.

use crate::flash::FlashError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum Status {
    Success = 0,
    Fail = 1,
    InvalidArgument = 2,

    // --- Bootloader ---
    UnknownCommand = 10000,
    SecurityViolation = 10001,
    AbortDataPhase = 10002,
    Ping = 10003,
    NoResponse = 10004,
    NoResponseExpected = 10005,

    // --- Memory interface ---
    MemoryRangeInvalid = 10200,
    MemoryReadFailed = 10201,
    MemoryWriteFailed = 10202,
    MemoryVerifyFailed = 10207,

    // --- Property store ---
    UnknownProperty = 10300,
    ReadOnlyProperty = 10301,
    InvalidPropertyValue = 10302,
}

impl Status {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::Success,
            1 => Self::Fail,
            2 => Self::InvalidArgument,
            10000 => Self::UnknownCommand,
            10001 => Self::SecurityViolation,
            10002 => Self::AbortDataPhase,
            10003 => Self::Ping,
            10004 => Self::NoResponse,
            10005 => Self::NoResponseExpected,
            10200 => Self::MemoryRangeInvalid,
            10201 => Self::MemoryReadFailed,
            10202 => Self::MemoryWriteFailed,
            10207 => Self::MemoryVerifyFailed,
            10300 => Self::UnknownProperty,
            10301 => Self::ReadOnlyProperty,
            10302 => Self::InvalidPropertyValue,
            _ => return None,
        })
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl From<Status> for u32 {
    fn from(s: Status) -> u32 {
        s.code()
    }
}

impl From<FlashError> for Status {
    fn from(e: FlashError) -> Self {
        match e {
            FlashError::OutOfBounds => Status::MemoryRangeInvalid,
            FlashError::Unaligned => Status::InvalidArgument,
            FlashError::Erase => Status::Fail,
            FlashError::Program => Status::MemoryWriteFailed,
            FlashError::Read => Status::MemoryReadFailed,
            FlashError::Verify => Status::MemoryVerifyFailed,
            FlashError::NotReady => Status::Fail,
        }
    }
}

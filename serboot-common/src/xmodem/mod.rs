// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! XMODEM receive and transmit engines.
//!
//! Both sides are byte-driven state machines: feed every received byte to
//! `on_byte`, call `tick` from a periodic timer, and drain outgoing bytes
//! with `next_tx_byte` (or `flush`). Results come back as events.

mod receiver;
mod sender;

pub use receiver::{Receiver, ReceiverState, RxEvent};
pub use sender::{Sender, SenderState, TxEvent};

use thiserror::Error;

use crate::crc::{checksum8, crc16};

// --- Control bytes ---

pub const SOH: u8 = 0x01;
pub const STX: u8 = 0x02;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;
/// Filler for the unused tail of the last frame.
pub const SUB: u8 = 0x1A;
/// Receiver's request for CRC mode.
pub const CRC_MODE: u8 = b'C';

pub const FRAME_128: usize = 128;
pub const FRAME_1K: usize = 1024;

/// CAN bytes sent for a cancel.
pub const CANCEL_COUNT: usize = 3;

pub const DEFAULT_MAX_RETRIES: u8 = 10;
pub const DEFAULT_TIMEOUT_MS: u32 = 3000;

/// Frame validation trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Checksum {
    /// 8-bit arithmetic sum, one trailer byte.
    Sum8,
    /// CRC-16/XMODEM, two trailer bytes, big-endian.
    Crc16,
}

impl Checksum {
    pub fn trailer_len(self) -> usize {
        match self {
            Self::Sum8 => 1,
            Self::Crc16 => 2,
        }
    }

    /// Trailer bytes for `data`. Only the first `trailer_len()` are used.
    pub fn trailer(self, data: &[u8]) -> [u8; 2] {
        match self {
            Self::Sum8 => [checksum8(data), 0],
            Self::Crc16 => crc16(data).to_be_bytes(),
        }
    }

    pub fn verify(self, data: &[u8], trailer: &[u8]) -> bool {
        let expected = self.trailer(data);
        trailer == &expected[..self.trailer_len()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReceiverConfig {
    pub checksum: Checksum,
    pub max_retries: u8,
    pub timeout_ms: u32,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            checksum: Checksum::Crc16,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SenderConfig {
    pub max_retries: u8,
    pub timeout_ms: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum XmodemError {
    #[error("operation not valid in the current state")]
    InvalidState,
    #[error("frame buffer too small for a {0}-byte frame")]
    BufferTooSmall(usize),
    #[error("frame larger than the negotiated frame size")]
    FrameTooLarge,
}

/// One-shot countdown. Armed on entry to every state that waits for the
/// peer, disarmed as soon as a byte is consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Countdown {
    remaining_ms: Option<u32>,
}

impl Countdown {
    pub fn arm(&mut self, ms: u32) {
        self.remaining_ms = Some(ms);
    }

    pub fn disarm(&mut self) {
        self.remaining_ms = None;
    }

    pub fn is_armed(&self) -> bool {
        self.remaining_ms.is_some()
    }

    /// Advance by `elapsed_ms`. Returns true exactly once, when it fires.
    pub fn tick(&mut self, elapsed_ms: u32) -> bool {
        match self.remaining_ms {
            Some(ms) if ms <= elapsed_ms => {
                self.remaining_ms = None;
                true
            }
            Some(ms) => {
                self.remaining_ms = Some(ms - elapsed_ms);
                false
            }
            None => false,
        }
    }
}

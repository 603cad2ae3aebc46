// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Flash-programming collaborator.
//!
//! The protocol engines never touch flash hardware directly. They go through
//! [`Flash`], which the bootloader implements with the ROM routines and tests
//! implement with a RAM-backed mock. Every call is blocking and is only made
//! from the main loop.

use thiserror::Error;

/// Flash geometry as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashInfo {
    /// Absolute address of the first byte of flash.
    pub start: u32,
    /// Total size in bytes.
    pub size: u32,
    /// Smallest erasable unit in bytes.
    pub sector_size: u32,
    /// Smallest programmable unit in bytes.
    pub page_size: u32,
}

impl FlashInfo {
    /// One past the last flash address.
    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.size)
    }

    pub fn contains(&self, addr: u32, len: u32) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.start && end <= self.end(),
            None => false,
        }
    }

    pub fn is_sector_aligned(&self, value: u32) -> bool {
        self.sector_size != 0 && value % self.sector_size == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    #[error("address range outside flash")]
    OutOfBounds,
    #[error("address or length not aligned")]
    Unaligned,
    #[error("erase failed")]
    Erase,
    #[error("program failed")]
    Program,
    #[error("read failed")]
    Read,
    #[error("readback does not match written data")]
    Verify,
    #[error("flash driver not initialized")]
    NotReady,
}

pub trait Flash {
    fn info(&self) -> FlashInfo;

    /// Erase `len` bytes starting at `addr`. Both must be sector aligned.
    fn erase_region(&mut self, addr: u32, len: u32) -> Result<(), FlashError>;

    /// Program `data` at `addr`. The target must already be erased.
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;
}

impl<F: Flash + ?Sized> Flash for &mut F {
    fn info(&self) -> FlashInfo {
        (**self).info()
    }

    fn erase_region(&mut self, addr: u32, len: u32) -> Result<(), FlashError> {
        (**self).erase_region(addr, len)
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).program(addr, data)
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(addr, buf)
    }
}

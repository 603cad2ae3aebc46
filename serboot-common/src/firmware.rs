// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Streaming firmware image store.
//!
//! Receives an image in arbitrarily sized pieces (XMODEM frames, KFT data
//! packets) and programs it to flash in whole `B`-byte chunks. When the image
//! size is known up front the destination is erased once in `start`; when it
//! is unknown (size 0) sectors are erased just ahead of the programming
//! pointer as data arrives.

use thiserror::Error;

use crate::flash::{Flash, FlashError};

/// Filler for the unused tail of the final program chunk.
pub const PAD_BYTE: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FirmwareError {
    #[error("flash sector size is not a power of two")]
    SectorSize,
    #[error("program buffer size is not a power of two")]
    BufferSize,
    #[error("destination is not sector aligned")]
    Unaligned,
    #[error("image does not fit in the destination region")]
    OutOfBounds,
    #[error("store_bytes or finish called before start")]
    NotStarted,
    #[error("flash: {0}")]
    Flash(#[from] FlashError),
}

/// Writes a firmware image to `dst..dst + capacity` through `F`.
pub struct FirmwareStore<F: Flash, const B: usize> {
    flash: F,
    dst: u32,
    capacity: u32,
    /// Declared image size, or `None` when streaming an unknown size.
    expected: Option<u32>,
    active: bool,
    received: u32,
    program_addr: u32,
    /// First address not yet erased.
    erased_end: u32,
    buf: [u8; B],
    buffered: usize,
}

impl<F: Flash, const B: usize> FirmwareStore<F, B> {
    pub fn new(flash: F, dst: u32, capacity: u32) -> Self {
        Self {
            flash,
            dst,
            capacity,
            expected: None,
            active: false,
            received: 0,
            program_addr: dst,
            erased_end: dst,
            buf: [PAD_BYTE; B],
            buffered: 0,
        }
    }

    /// Begin a new image. `total_size == 0` means the size is not known yet.
    pub fn start(&mut self, total_size: u32) -> Result<(), FirmwareError> {
        let info = self.flash.info();

        // Erase-as-you-go rounds with masks.
        if !info.sector_size.is_power_of_two() {
            return Err(FirmwareError::SectorSize);
        }
        if !B.is_power_of_two() {
            return Err(FirmwareError::BufferSize);
        }
        if self.dst < info.start || (self.dst - info.start) & (info.sector_size - 1) != 0 {
            return Err(FirmwareError::Unaligned);
        }
        if total_size > self.capacity || !info.contains(self.dst, total_size) {
            return Err(FirmwareError::OutOfBounds);
        }

        self.active = false;
        self.received = 0;
        self.program_addr = self.dst;
        self.erased_end = self.dst;
        self.buffered = 0;

        let first_erase = if total_size == 0 {
            self.expected = None;
            info.sector_size
        } else {
            self.expected = Some(total_size);
            align_up(total_size, info.sector_size)
        };
        if !info.contains(self.dst, first_erase) {
            return Err(FirmwareError::OutOfBounds);
        }

        info!("firmware: start dst=0x{:08x} size={}", self.dst, total_size);
        self.flash.erase_region(self.dst, first_erase)?;
        self.erased_end = self.dst + first_erase;
        self.active = true;
        Ok(())
    }

    /// Append the next piece of the image.
    pub fn store_bytes(&mut self, data: &[u8]) -> Result<(), FirmwareError> {
        if !self.active {
            return Err(FirmwareError::NotStarted);
        }
        let limit = self.expected.unwrap_or(self.capacity);
        let new_total = u32::try_from(data.len())
            .ok()
            .and_then(|n| self.received.checked_add(n))
            .ok_or(FirmwareError::OutOfBounds)?;
        if new_total > limit {
            return Err(FirmwareError::OutOfBounds);
        }

        let mut rest = data;
        while !rest.is_empty() {
            let n = (B - self.buffered).min(rest.len());
            self.buf[self.buffered..self.buffered + n].copy_from_slice(&rest[..n]);
            self.buffered += n;
            rest = &rest[n..];
            if self.buffered == B {
                self.program_buffer()?;
            }
        }
        self.received = new_total;
        Ok(())
    }

    /// Pad and program the buffered tail. Returns the image size received.
    pub fn finish(&mut self) -> Result<u32, FirmwareError> {
        if !self.active {
            return Err(FirmwareError::NotStarted);
        }
        if self.buffered != 0 {
            self.buf[self.buffered..].fill(PAD_BYTE);
            self.program_buffer()?;
        }
        self.active = false;
        info!("firmware: finished, {} bytes", self.received);
        Ok(self.received)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn destination(&self) -> u32 {
        self.dst
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    fn program_buffer(&mut self) -> Result<(), FirmwareError> {
        let chunk_end = self.program_addr + B as u32;
        self.ensure_erased(chunk_end)?;
        self.flash.program(self.program_addr, &self.buf)?;
        self.program_addr = chunk_end;
        self.buffered = 0;
        Ok(())
    }

    fn ensure_erased(&mut self, end: u32) -> Result<(), FirmwareError> {
        if end <= self.erased_end {
            return Ok(());
        }
        let info = self.flash.info();
        let target = align_up(end, info.sector_size);
        let len = target - self.erased_end;
        if target > self.dst.saturating_add(align_up(self.capacity, info.sector_size))
            || !info.contains(self.erased_end, len)
        {
            return Err(FirmwareError::OutOfBounds);
        }
        debug!("firmware: erase 0x{:08x} +{}", self.erased_end, len);
        self.flash.erase_region(self.erased_end, len)?;
        self.erased_end = target;
        Ok(())
    }
}

/// Round `value` up to a multiple of `align`, which must be a power of two.
fn align_up(value: u32, align: u32) -> u32 {
    (value + (align - 1)) & !(align - 1)
}

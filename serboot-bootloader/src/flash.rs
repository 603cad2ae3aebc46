// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Flash read/write/erase using RP2040 ROM routines.
//!
//! On RP2040, flash operations (erase/program) require disabling XIP first.
//! The full sequence is:
//!   1. connect_internal_flash()
//!   2. flash_exit_xip()
//!   3. flash_range_erase() or flash_range_program()
//!   4. flash_flush_cache()
//!   5. flash_enter_cmd_xip()
//!
//! All code executing during steps 1-5 must run from RAM, not flash, so the
//! ROM pointers are resolved once by [`init`] and the sequence itself lives
//! in a single `.data` function.
//!
//! [`RomFlash`] wraps these routines behind the protocol crate's [`Flash`]
//! trait, so the KFT dispatcher and the XMODEM image store share one driver.

use crc::{Crc, CRC_32_ISO_HDLC};
use serboot_common::{Flash, FlashError, FlashInfo};

pub const FLASH_BASE: u32 = 0x1000_0000;
pub const FLASH_SIZE: u32 = 2 * 1024 * 1024;
pub const FLASH_SECTOR_SIZE: u32 = 4096;
pub const FLASH_PAGE_SIZE: u32 = 256;

/// SPI sector-erase opcode passed to the ROM erase routine.
const SECTOR_ERASE_CMD: u8 = 0x20;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

type RomFnVoid = unsafe extern "C" fn();
type RomFnErase = unsafe extern "C" fn(u32, usize, u32, u8);
type RomFnProgram = unsafe extern "C" fn(u32, *const u8, usize);

/// Boot ROM flash routines, looked up by their two-character tags.
#[derive(Clone, Copy)]
struct RomFlashFns {
    connect_internal_flash: RomFnVoid,
    exit_xip: RomFnVoid,
    range_erase: RomFnErase,
    range_program: RomFnProgram,
    flush_cache: RomFnVoid,
    enter_cmd_xip: RomFnVoid,
}

static mut ROM_FNS: Option<RomFlashFns> = None;

/// ROM table pointer at 0x14 and lookup function at 0x18 are 16-bit halfword pointers.
unsafe fn rom_func_lookup<F: Copy>(tag: &[u8; 2]) -> F {
    let fn_table = *(0x14 as *const u16) as *const u16;
    let lookup: unsafe extern "C" fn(*const u16, u32) -> usize =
        core::mem::transmute(*(0x18 as *const u16) as usize);
    let addr = lookup(fn_table, u16::from_le_bytes(*tag) as u32);
    core::mem::transmute_copy(&addr)
}

/// Resolve the ROM flash routines. Lookups need XIP, so this runs before any
/// erase or program.
pub fn init() {
    unsafe {
        let fns = RomFlashFns {
            connect_internal_flash: rom_func_lookup(b"IF"),
            exit_xip: rom_func_lookup(b"EX"),
            range_erase: rom_func_lookup(b"RE"),
            range_program: rom_func_lookup(b"RP"),
            flush_cache: rom_func_lookup(b"FC"),
            enter_cmd_xip: rom_func_lookup(b"CX"),
        };
        *core::ptr::addr_of_mut!(ROM_FNS) = Some(fns);
    }
}

fn rom_fns() -> Result<RomFlashFns, FlashError> {
    unsafe { *core::ptr::addr_of!(ROM_FNS) }.ok_or(FlashError::NotReady)
}

#[derive(Clone, Copy)]
enum RomOp {
    Erase { offset: u32, len: u32 },
    Program { offset: u32, data: *const u8, len: usize },
}

/// XIP is down while `op` runs, so this function and everything it touches
/// must live in RAM. `fns` arrives by value to keep statics out of the way.
#[link_section = ".data"]
#[inline(never)]
unsafe fn run_rom_op(fns: RomFlashFns, op: RomOp) {
    let primask = cortex_m::register::primask::read();
    cortex_m::interrupt::disable();

    (fns.connect_internal_flash)();
    (fns.exit_xip)();
    match op {
        RomOp::Erase { offset, len } => {
            (fns.range_erase)(offset, len as usize, FLASH_SECTOR_SIZE, SECTOR_ERASE_CMD)
        }
        RomOp::Program { offset, data, len } => (fns.range_program)(offset, data, len),
    }
    (fns.flush_cache)();
    (fns.enter_cmd_xip)();

    if primask.is_active() {
        cortex_m::interrupt::enable();
    }
}

/// Read bytes from an absolute XIP flash address via volatile reads.
fn flash_read(abs_addr: u32, buf: &mut [u8]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = unsafe { ((abs_addr + i as u32) as *const u8).read_volatile() };
    }
}

/// Compute CRC-32 (ISO HDLC) over flash data at the given absolute address.
pub fn compute_crc32(abs_addr: u32, size: u32) -> u32 {
    let mut digest = CRC32.digest();
    let mut remaining = size as usize;
    let mut addr = abs_addr;
    let mut chunk = [0u8; 256];

    while remaining > 0 {
        let n = remaining.min(chunk.len());
        flash_read(addr, &mut chunk[..n]);
        digest.update(&chunk[..n]);
        addr += n as u32;
        remaining -= n;
    }

    digest.finalize()
}

/// On-chip QSPI flash driven through the boot ROM.
///
/// Zero-sized: the ROM pointers are global, so every copy drives the same
/// device. Erase and program fail with `NotReady` until `init()` has run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RomFlash;

impl RomFlash {
    pub const INFO: FlashInfo = FlashInfo {
        start: FLASH_BASE,
        size: FLASH_SIZE,
        sector_size: FLASH_SECTOR_SIZE,
        page_size: FLASH_PAGE_SIZE,
    };
}

impl Flash for RomFlash {
    fn info(&self) -> FlashInfo {
        Self::INFO
    }

    fn erase_region(&mut self, addr: u32, len: u32) -> Result<(), FlashError> {
        if !Self::INFO.contains(addr, len) {
            return Err(FlashError::OutOfBounds);
        }
        if !Self::INFO.is_sector_aligned(addr) || !Self::INFO.is_sector_aligned(len) {
            return Err(FlashError::Unaligned);
        }
        if len == 0 {
            return Ok(());
        }
        let fns = rom_fns()?;
        unsafe {
            run_rom_op(
                fns,
                RomOp::Erase {
                    offset: addr - FLASH_BASE,
                    len,
                },
            )
        };
        Ok(())
    }

    /// The ROM programs whole pages. Each touched page is staged as 0xFF with
    /// `data` merged in, so bytes outside `data` keep their current content.
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        let len = u32::try_from(data.len()).map_err(|_| FlashError::OutOfBounds)?;
        if !Self::INFO.contains(addr, len) {
            return Err(FlashError::OutOfBounds);
        }

        let fns = rom_fns()?;
        let mut page = [0xFFu8; FLASH_PAGE_SIZE as usize];
        let mut cursor = addr;
        let mut rest = data;
        while !rest.is_empty() {
            let page_addr = cursor & !(FLASH_PAGE_SIZE - 1);
            let in_page = (cursor - page_addr) as usize;
            let n = rest.len().min(page.len() - in_page);

            page.fill(0xFF);
            page[in_page..in_page + n].copy_from_slice(&rest[..n]);
            let op = RomOp::Program {
                offset: page_addr - FLASH_BASE,
                data: page.as_ptr(),
                len: page.len(),
            };
            unsafe { run_rom_op(fns, op) };

            cursor += n as u32;
            rest = &rest[n..];
        }
        Ok(())
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let len = u32::try_from(buf.len()).map_err(|_| FlashError::OutOfBounds)?;
        if !Self::INFO.contains(addr, len) {
            return Err(FlashError::OutOfBounds);
        }
        flash_read(addr, buf);
        Ok(())
    }
}

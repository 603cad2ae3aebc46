// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::cell::Cell;

use serboot_common::kft::command::{Command, Response};
use serboot_common::kft::packet::{data_header, PacketType, START_BYTE};
use serboot_common::kft::serial::SerialConfig;
use serboot_common::kft::{
    CommandDispatcher, CommandPump, Memory, MemoryRegion, SystemControl, TargetInfo,
};
use serboot_common::xmodem::{Checksum, FRAME_128, SOH, STX};
use serboot_common::{Flash, FlashError, FlashInfo, Transport};

// --- Target geometry ---

pub const FLASH_START: u32 = 0x1000_0000;
pub const FLASH_SIZE: u32 = 0x4_0000;
pub const SECTOR_SIZE: u32 = 4096;
pub const PAGE_SIZE: u32 = 256;
pub const APP_START: u32 = 0x1001_0000;
pub const RAM_START: u32 = 0x2000_0000;
pub const RAM_SIZE: u32 = 0x1000;

pub fn target() -> TargetInfo {
    TargetInfo {
        ram: MemoryRegion::new(RAM_START, RAM_SIZE),
        app_start: APP_START,
        peripherals: 1,
    }
}

// =============================================================================
// Transport
// =============================================================================

#[derive(Default)]
pub struct RecordingTransport {
    pub bytes: Vec<u8>,
    pub starts: usize,
    pub flushes: usize,
}

impl RecordingTransport {
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }
}

impl Transport for RecordingTransport {
    fn start_transmit(&mut self) {
        self.starts += 1;
    }

    fn write_blocking(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    fn flush(&mut self) {
        self.flushes += 1;
    }
}

// =============================================================================
// Flash (NOR semantics: erase to 0xFF, program can only clear bits)
// =============================================================================

pub struct RamFlash {
    pub info: FlashInfo,
    pub data: Vec<u8>,
    pub erase_calls: Vec<(u32, u32)>,
    pub program_calls: Vec<(u32, usize)>,
    pub fail_erase: bool,
    pub reads: Cell<usize>,
}

impl RamFlash {
    pub fn new() -> Self {
        Self::with_geometry(FLASH_START, FLASH_SIZE, SECTOR_SIZE)
    }

    pub fn with_geometry(start: u32, size: u32, sector_size: u32) -> Self {
        Self {
            info: FlashInfo {
                start,
                size,
                sector_size,
                page_size: PAGE_SIZE,
            },
            data: vec![0xFF; size as usize],
            erase_calls: Vec::new(),
            program_calls: Vec::new(),
            fail_erase: false,
            reads: Cell::new(0),
        }
    }

    pub fn slice(&self, addr: u32, len: usize) -> &[u8] {
        let off = (addr - self.info.start) as usize;
        &self.data[off..off + len]
    }

    /// Put bytes in flash directly, bypassing NOR rules.
    pub fn preload(&mut self, addr: u32, bytes: &[u8]) {
        let off = (addr - self.info.start) as usize;
        self.data[off..off + bytes.len()].copy_from_slice(bytes);
    }
}

impl Flash for RamFlash {
    fn info(&self) -> FlashInfo {
        self.info
    }

    fn erase_region(&mut self, addr: u32, len: u32) -> Result<(), FlashError> {
        self.erase_calls.push((addr, len));
        if self.fail_erase {
            return Err(FlashError::Erase);
        }
        if !self.info.contains(addr, len) {
            return Err(FlashError::OutOfBounds);
        }
        if addr % self.info.sector_size != 0 || len % self.info.sector_size != 0 {
            return Err(FlashError::Unaligned);
        }
        let off = (addr - self.info.start) as usize;
        self.data[off..off + len as usize].fill(0xFF);
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        self.program_calls.push((addr, data.len()));
        if !self.info.contains(addr, data.len() as u32) {
            return Err(FlashError::OutOfBounds);
        }
        let off = (addr - self.info.start) as usize;
        for (dst, src) in self.data[off..off + data.len()].iter_mut().zip(data) {
            *dst &= *src;
        }
        Ok(())
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.reads.set(self.reads.get() + 1);
        if !self.info.contains(addr, buf.len() as u32) {
            return Err(FlashError::OutOfBounds);
        }
        buf.copy_from_slice(self.slice(addr, buf.len()));
        Ok(())
    }
}

// =============================================================================
// RAM and system control
// =============================================================================

pub struct RamMemory {
    pub start: u32,
    pub data: Vec<u8>,
}

impl RamMemory {
    pub fn new() -> Self {
        Self {
            start: RAM_START,
            data: vec![0; RAM_SIZE as usize],
        }
    }
}

impl Memory for RamMemory {
    fn read(&self, addr: u32, buf: &mut [u8]) {
        let off = (addr - self.start) as usize;
        buf.copy_from_slice(&self.data[off..off + buf.len()]);
    }

    fn write(&mut self, addr: u32, data: &[u8]) {
        let off = (addr - self.start) as usize;
        self.data[off..off + data.len()].copy_from_slice(data);
    }
}

/// Control transfers panic so tests can observe them with `catch_unwind`.
#[derive(Default)]
pub struct PanicSystem {
    pub calls: Vec<(u32, u32)>,
    pub call_result: u32,
}

impl SystemControl for PanicSystem {
    fn reset(&mut self) -> ! {
        panic!("system reset");
    }

    fn execute(&mut self, entry: u32, arg: u32, stack_pointer: u32) -> ! {
        panic!("execute {entry:#x} {arg} {stack_pointer:#x}");
    }

    fn call(&mut self, entry: u32, arg: u32) -> u32 {
        self.calls.push((entry, arg));
        self.call_result
    }
}

// =============================================================================
// Wire helpers
// =============================================================================

/// A complete data packet as the host would send it.
pub fn framed(ty: PacketType, payload: &[u8]) -> Vec<u8> {
    let mut out = data_header(ty, payload).to_vec();
    out.extend_from_slice(payload);
    out
}

pub fn command_packet(cmd: &Command) -> Vec<u8> {
    framed(PacketType::Command, &cmd.encode())
}

pub fn sync(ty: PacketType) -> Vec<u8> {
    vec![START_BYTE, ty as u8]
}

/// One packet as seen on the wire from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wire {
    Sync(PacketType),
    Data(PacketType, Vec<u8>),
    PingResponse(Vec<u8>),
}

impl Wire {
    /// Decode a command-type packet as a response.
    pub fn response(&self) -> Option<Response> {
        match self {
            Wire::Data(PacketType::Command, payload) => Response::decode(payload).ok(),
            _ => None,
        }
    }
}

/// Split device output into packets. Panics on malformed output.
pub fn parse_wire(bytes: &[u8]) -> Vec<Wire> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        assert_eq!(bytes[i], START_BYTE, "expected start byte at {i}");
        let ty = PacketType::try_from(bytes[i + 1]).expect("packet type");
        match ty {
            PacketType::Command | PacketType::Data => {
                let len = u16::from_le_bytes([bytes[i + 2], bytes[i + 3]]) as usize;
                let payload = bytes[i + 6..i + 6 + len].to_vec();
                assert_eq!(&bytes[i..i + 6], &data_header(ty, &payload)[..], "bad header");
                out.push(Wire::Data(ty, payload));
                i += 6 + len;
            }
            PacketType::PingResponse => {
                out.push(Wire::PingResponse(bytes[i..i + 10].to_vec()));
                i += 10;
            }
            _ => {
                out.push(Wire::Sync(ty));
                i += 2;
            }
        }
    }
    out
}

// =============================================================================
// Command pump
// =============================================================================

pub type Pump = CommandPump<RamFlash, RamMemory, PanicSystem>;

pub fn pump_with(flash: RamFlash, system: PanicSystem, config: SerialConfig) -> Pump {
    let dispatcher = CommandDispatcher::new(flash, RamMemory::new(), system, target());
    CommandPump::new(config, dispatcher)
}

pub fn make_pump() -> Pump {
    pump_with(RamFlash::new(), PanicSystem::default(), SerialConfig::default())
}

/// Feed host bytes, send whatever the device queued, and split it into packets.
pub fn exchange(pump: &mut Pump, t: &mut RecordingTransport, bytes: &[u8]) -> Vec<Wire> {
    for &b in bytes {
        pump.on_byte(b, t);
    }
    pump.transmit(t);
    parse_wire(&t.take())
}

// =============================================================================
// XMODEM frames
// =============================================================================

/// One XMODEM frame as a sender would put it on the wire.
pub fn xmodem_frame(seq: u8, data: &[u8], checksum: Checksum) -> Vec<u8> {
    let header = if data.len() == FRAME_128 { SOH } else { STX };
    let mut out = vec![header, seq, !seq];
    out.extend_from_slice(data);
    out.extend_from_slice(&checksum.trailer(data)[..checksum.trailer_len()]);
    out
}

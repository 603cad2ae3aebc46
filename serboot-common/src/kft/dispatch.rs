// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! KFT command dispatcher.
//!
//! Decodes command packets, validates them against the property store's
//! geometry, performs the action through the flash / RAM / system
//! collaborators and queues exactly one response per accepted command.
//! Write and read memory add a data phase tracked in [`DataPhase`].

use crate::flash::Flash;
use crate::transport::Transport;

use super::command::{Command, CommandTag, Params, Response};
use super::packet::MAX_PACKET_SIZE;
use super::property::{PropertyStore, TargetInfo};
use super::serial::{SerialEvent, SerialPacketizer};
use super::status::Status;

/// Commands this dispatcher implements. Everything else in the tag space
/// answers `UnknownCommand`.
pub const SUPPORTED_COMMANDS: [CommandTag; 10] = [
    CommandTag::FlashEraseAll,
    CommandTag::FlashEraseRegion,
    CommandTag::ReadMemory,
    CommandTag::WriteMemory,
    CommandTag::FillMemory,
    CommandTag::GetProperty,
    CommandTag::Execute,
    CommandTag::Call,
    CommandTag::Reset,
    CommandTag::SetProperty,
];

/// Bitmask reported by the `AvailableCommands` property.
pub fn available_commands() -> u32 {
    SUPPORTED_COMMANDS.iter().fold(0, |acc, t| acc | t.mask())
}

/// Byte-addressable RAM, used for write/read/fill outside flash.
pub trait Memory {
    fn read(&self, addr: u32, buf: &mut [u8]);
    fn write(&mut self, addr: u32, data: &[u8]);
}

/// Transfers of control out of the bootloader.
pub trait SystemControl {
    fn reset(&mut self) -> !;

    /// Jump to `entry` with `arg` in r0. A zero `stack_pointer` keeps the
    /// current stack.
    fn execute(&mut self, entry: u32, arg: u32, stack_pointer: u32) -> !;

    /// Call `entry(arg)` and return its status word.
    fn call(&mut self, entry: u32, arg: u32) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MemoryTarget {
    Flash,
    Ram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataPhase {
    Idle,
    /// Host to device: data packets are stored at `addr`.
    Write {
        target: MemoryTarget,
        addr: u32,
        remaining: u32,
    },
    /// Device to host: each host ACK releases the next chunk.
    Read {
        target: MemoryTarget,
        addr: u32,
        remaining: u32,
    },
}

pub struct CommandDispatcher<F: Flash, M: Memory, S: SystemControl> {
    flash: F,
    memory: M,
    system: S,
    properties: PropertyStore,
    phase: DataPhase,
}

impl<F: Flash, M: Memory, S: SystemControl> CommandDispatcher<F, M, S> {
    pub fn new(flash: F, memory: M, system: S, target: TargetInfo) -> Self {
        let properties = PropertyStore::new(&flash, &target, available_commands());
        Self {
            flash,
            memory,
            system,
            properties,
            phase: DataPhase::Idle,
        }
    }

    pub fn properties(&self) -> &PropertyStore {
        &self.properties
    }

    pub fn phase(&self) -> DataPhase {
        self.phase
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn handle<T: Transport + ?Sized>(
        &mut self,
        event: SerialEvent,
        serial: &mut SerialPacketizer,
        transport: &mut T,
    ) {
        match event {
            SerialEvent::Command(payload) => self.on_command(&payload, serial, transport),
            SerialEvent::Data(payload) => self.on_data(&payload, serial),
            SerialEvent::HostAck => self.on_host_ack(serial),
            SerialEvent::HostAbort => self.on_host_abort(serial),
        }
    }

    // --- Command packets ---

    fn on_command<T: Transport + ?Sized>(
        &mut self,
        payload: &[u8],
        serial: &mut SerialPacketizer,
        transport: &mut T,
    ) {
        if self.phase != DataPhase::Idle {
            warn!("dispatch: command during data phase, phase dropped");
            self.phase = DataPhase::Idle;
        }

        let cmd = match Command::decode(payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                let tag = payload.first().copied().unwrap_or(0);
                // A tag we never implement is unknown whatever its parameters
                let status = match CommandTag::from_u8(tag) {
                    Some(known) if !SUPPORTED_COMMANDS.contains(&known) => Status::UnknownCommand,
                    _ => e.status(),
                };
                warn!("dispatch: rejected command 0x{:02x}", tag);
                respond(serial, Response::generic(status, tag));
                return;
            }
        };
        debug!("dispatch: command 0x{:02x}", cmd.tag as u8);

        let status = match cmd.tag {
            CommandTag::FlashEraseAll => self.erase_all(&cmd),
            CommandTag::FlashEraseRegion => self.erase_region(&cmd),
            CommandTag::ReadMemory => return self.read_memory(&cmd, serial),
            CommandTag::WriteMemory => self.write_memory(&cmd),
            CommandTag::FillMemory => self.fill_memory(&cmd),
            CommandTag::GetProperty => return self.get_property(&cmd, serial),
            CommandTag::SetProperty => self.set_property(&cmd),
            CommandTag::Execute => self.execute(&cmd, serial, transport),
            CommandTag::Call => return self.call(&cmd, serial),
            CommandTag::Reset => {
                info!("dispatch: reset");
                serial.finalize();
                serial.flush(transport);
                self.system.reset()
            }
            _ => Err(Status::UnknownCommand),
        };
        let status = status.err().unwrap_or(Status::Success);
        respond(serial, Response::generic(status, cmd.tag as u8));
    }

    fn erase_all(&mut self, cmd: &Command) -> Result<(), Status> {
        check_memory_id(cmd.param(0))?;
        let flash = self.properties.flash_region();
        let start = self.properties.reserved_flash().end().max(flash.start);
        let len = flash.end().saturating_sub(start);
        if len == 0 {
            return Ok(());
        }
        info!("dispatch: erase all 0x{:08x}+{}", start, len);
        self.flash.erase_region(start, len)?;
        Ok(())
    }

    fn erase_region(&mut self, cmd: &Command) -> Result<(), Status> {
        let (start, len) = (cmd.param(0), cmd.param(1));
        check_memory_id(cmd.param(2))?;

        let sector = self.properties.flash_sector_size();
        if sector == 0 || start % sector != 0 || len % sector != 0 {
            return Err(Status::InvalidArgument);
        }
        if !self.properties.flash_region().contains(start, len)
            || self.properties.reserved_flash().overlaps(start, len)
        {
            return Err(Status::MemoryRangeInvalid);
        }
        if len == 0 {
            return Ok(());
        }
        info!("dispatch: erase 0x{:08x}+{}", start, len);
        self.flash.erase_region(start, len)?;
        Ok(())
    }

    fn write_memory(&mut self, cmd: &Command) -> Result<(), Status> {
        let (addr, len) = (cmd.param(0), cmd.param(1));
        check_memory_id(cmd.param(2))?;
        let target = self.writable_target(addr, len)?;
        if len > 0 {
            debug!("dispatch: write phase 0x{:08x}+{}", addr, len);
            self.phase = DataPhase::Write {
                target,
                addr,
                remaining: len,
            };
        }
        Ok(())
    }

    fn fill_memory(&mut self, cmd: &Command) -> Result<(), Status> {
        let (addr, len, pattern) = (cmd.param(0), cmd.param(1), cmd.param(2));
        let target = self.writable_target(addr, len)?;
        let pattern = pattern.to_le_bytes();

        let mut chunk = [0u8; MAX_PACKET_SIZE];
        for (i, b) in chunk.iter_mut().enumerate() {
            *b = pattern[i % 4];
        }
        let mut offset = 0;
        while offset < len {
            let n = (len - offset).min(MAX_PACKET_SIZE as u32);
            self.store(target, addr + offset, &chunk[..n as usize])?;
            offset += n;
        }
        Ok(())
    }

    fn read_memory(&mut self, cmd: &Command, serial: &mut SerialPacketizer) {
        let (addr, len) = (cmd.param(0), cmd.param(1));
        let result = check_memory_id(cmd.param(2)).and_then(|_| self.readable_target(addr, len));
        match result {
            Ok(target) => {
                self.phase = DataPhase::Read {
                    target,
                    addr,
                    remaining: len,
                };
                respond(
                    serial,
                    Response::ReadMemory {
                        status: Status::Success.code(),
                        byte_count: len,
                    },
                );
            }
            Err(status) => respond(
                serial,
                Response::ReadMemory {
                    status: status.code(),
                    byte_count: 0,
                },
            ),
        }
    }

    fn get_property(&mut self, cmd: &Command, serial: &mut SerialPacketizer) {
        let max_packet = serial.max_packet_size() as u32;
        let response = match self.properties.get(cmd.param(0), max_packet) {
            Ok(value) => {
                let mut values = Params::new();
                let _ = values.extend_from_slice(value.words());
                Response::GetProperty {
                    status: Status::Success.code(),
                    values,
                }
            }
            Err(status) => Response::GetProperty {
                status: status.code(),
                values: Params::new(),
            },
        };
        respond(serial, response);
    }

    fn set_property(&mut self, cmd: &Command) -> Result<(), Status> {
        self.properties.set(cmd.param(0), cmd.param(1))
    }

    fn execute<T: Transport + ?Sized>(
        &mut self,
        cmd: &Command,
        serial: &mut SerialPacketizer,
        transport: &mut T,
    ) -> Result<(), Status> {
        let (entry, arg, sp) = (cmd.param(0), cmd.param(1), cmd.param(2));
        self.check_entry(entry)?;
        let ram = self.properties.ram_region();
        if sp != 0 && (sp < ram.start || sp > ram.end()) {
            return Err(Status::InvalidArgument);
        }
        info!("dispatch: execute 0x{:08x} arg={} sp=0x{:08x}", entry, arg, sp);
        serial.finalize();
        serial.flush(transport);
        self.system.execute(entry, arg, sp)
    }

    fn call(&mut self, cmd: &Command, serial: &mut SerialPacketizer) {
        let (entry, arg) = (cmd.param(0), cmd.param(1));
        let status = match self.check_entry(entry) {
            Ok(()) => self.system.call(entry, arg),
            Err(status) => status.code(),
        };
        respond(
            serial,
            Response::Generic {
                status,
                command: CommandTag::Call as u8,
            },
        );
    }

    // --- Data phase ---

    fn on_data(&mut self, payload: &[u8], serial: &mut SerialPacketizer) {
        let DataPhase::Write {
            target,
            addr,
            remaining,
        } = self.phase
        else {
            debug!("dispatch: data packet outside write phase ignored");
            serial.release();
            return;
        };

        let n = (payload.len() as u32).min(remaining);
        if let Err(status) = self.store(target, addr, &payload[..n as usize]) {
            warn!("dispatch: write failed at 0x{:08x}", addr);
            self.phase = DataPhase::Idle;
            serial.abort_data_phase();
            respond(serial, Response::generic(status, CommandTag::WriteMemory as u8));
            return;
        }

        let remaining = remaining - n;
        if remaining == 0 {
            self.phase = DataPhase::Idle;
            respond(
                serial,
                Response::generic(Status::Success, CommandTag::WriteMemory as u8),
            );
        } else {
            self.phase = DataPhase::Write {
                target,
                addr: addr + n,
                remaining,
            };
            serial.release();
        }
    }

    fn on_host_ack(&mut self, serial: &mut SerialPacketizer) {
        let DataPhase::Read {
            target,
            addr,
            remaining,
        } = self.phase
        else {
            return;
        };

        if remaining == 0 {
            self.phase = DataPhase::Idle;
            respond(
                serial,
                Response::generic(Status::Success, CommandTag::ReadMemory as u8),
            );
            return;
        }

        let n = remaining.min(serial.max_packet_size() as u32);
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let chunk = &mut buf[..n as usize];
        if let Err(status) = self.load(target, addr, chunk) {
            self.phase = DataPhase::Idle;
            respond(serial, Response::generic(status, CommandTag::ReadMemory as u8));
            return;
        }
        serial.send_data_packet(chunk);
        self.phase = DataPhase::Read {
            target,
            addr: addr + n,
            remaining: remaining - n,
        };
    }

    fn on_host_abort(&mut self, serial: &mut SerialPacketizer) {
        if let DataPhase::Read { .. } = self.phase {
            warn!("dispatch: host aborted read");
            self.phase = DataPhase::Idle;
            respond(
                serial,
                Response::generic(Status::AbortDataPhase, CommandTag::ReadMemory as u8),
            );
        }
    }

    // --- Memory access ---

    fn writable_target(&self, addr: u32, len: u32) -> Result<MemoryTarget, Status> {
        if self.properties.flash_region().contains(addr, len) {
            if self.properties.reserved_flash().overlaps(addr, len) {
                return Err(Status::MemoryRangeInvalid);
            }
            Ok(MemoryTarget::Flash)
        } else if self.properties.ram_region().contains(addr, len) {
            Ok(MemoryTarget::Ram)
        } else {
            Err(Status::MemoryRangeInvalid)
        }
    }

    fn readable_target(&self, addr: u32, len: u32) -> Result<MemoryTarget, Status> {
        if self.properties.flash_region().contains(addr, len) {
            Ok(MemoryTarget::Flash)
        } else if self.properties.ram_region().contains(addr, len) {
            Ok(MemoryTarget::Ram)
        } else {
            Err(Status::MemoryRangeInvalid)
        }
    }

    /// Entry points must be outside the bootloader, in flash or RAM.
    fn check_entry(&self, entry: u32) -> Result<(), Status> {
        let addr = entry & !1;
        let in_app = self.properties.flash_region().contains(addr, 2)
            && !self.properties.reserved_flash().overlaps(addr, 2);
        if in_app || self.properties.ram_region().contains(addr, 2) {
            Ok(())
        } else {
            Err(Status::InvalidArgument)
        }
    }

    fn store(&mut self, target: MemoryTarget, addr: u32, data: &[u8]) -> Result<(), Status> {
        match target {
            MemoryTarget::Ram => {
                self.memory.write(addr, data);
                Ok(())
            }
            MemoryTarget::Flash => {
                self.flash.program(addr, data)?;
                if self.properties.verify_writes() {
                    verify(&self.flash, addr, data)?;
                }
                Ok(())
            }
        }
    }

    fn load(&self, target: MemoryTarget, addr: u32, buf: &mut [u8]) -> Result<(), Status> {
        match target {
            MemoryTarget::Ram => {
                self.memory.read(addr, buf);
                Ok(())
            }
            MemoryTarget::Flash => Ok(self.flash.read(addr, buf)?),
        }
    }
}

fn respond(serial: &mut SerialPacketizer, response: Response) {
    serial.send_command_packet(&response.encode());
}

/// Only the internal memory (id 0) is addressable.
fn check_memory_id(id: u32) -> Result<(), Status> {
    if id == 0 {
        Ok(())
    } else {
        Err(Status::InvalidArgument)
    }
}

/// Read back what was just programmed.
fn verify<F: Flash + ?Sized>(flash: &F, addr: u32, data: &[u8]) -> Result<(), Status> {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let mut offset = 0;
    for chunk in data.chunks(MAX_PACKET_SIZE) {
        let readback = &mut buf[..chunk.len()];
        flash.read(addr + offset, readback)?;
        if readback != chunk {
            return Err(Status::MemoryVerifyFailed);
        }
        offset += chunk.len() as u32;
    }
    Ok(())
}

// Fill chunks are built from a u32 pattern, keep the chunk a whole number of words.
const _: () = assert!(MAX_PACKET_SIZE % 4 == 0);

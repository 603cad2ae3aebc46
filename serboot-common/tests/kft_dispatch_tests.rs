// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command dispatcher tests, driven through the framing layer the way a host
//! would drive them.

mod common;

use std::panic::{catch_unwind, AssertUnwindSafe};

use common::*;
use serboot_common::kft::command::{Command, CommandTag, Response};
use serboot_common::kft::dispatch::{available_commands, DataPhase};
use serboot_common::kft::packet::PacketType;
use serboot_common::kft::property::PropertyTag;
use serboot_common::kft::serial::SerialConfig;
use serboot_common::kft::Status;

fn run(pump: &mut Pump, t: &mut RecordingTransport, cmd: Command) -> Vec<Wire> {
    exchange(pump, t, &command_packet(&cmd))
}

fn generic(status: Status, tag: CommandTag) -> Option<Response> {
    Some(Response::generic(status, tag as u8))
}

/// The single response following the command ACK.
fn reply(wire: &[Wire]) -> Option<Response> {
    assert_eq!(wire.len(), 2, "expected ACK + response, got {wire:?}");
    assert_eq!(wire[0], Wire::Sync(PacketType::Ack));
    wire[1].response()
}

fn get_property(pump: &mut Pump, t: &mut RecordingTransport, tag: PropertyTag) -> Response {
    let wire = run(pump, t, Command::new(CommandTag::GetProperty, &[tag as u32]));
    reply(&wire).unwrap()
}

fn values(words: &[u32]) -> heapless::Vec<u32, 7> {
    heapless::Vec::from_slice(words).unwrap()
}

// =============================================================================
// GetProperty / SetProperty
// =============================================================================

#[test]
fn test_get_flash_size() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    assert_eq!(
        get_property(&mut pump, &mut t, PropertyTag::FlashSizeInBytes),
        Response::GetProperty {
            status: 0,
            values: values(&[FLASH_SIZE]),
        }
    );
}

#[test]
fn test_get_unknown_property() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let wire = run(&mut pump, &mut t, Command::new(CommandTag::GetProperty, &[0x7F]));
    assert_eq!(
        reply(&wire),
        Some(Response::GetProperty {
            status: Status::UnknownProperty.code(),
            values: values(&[]),
        })
    );
}

#[test]
fn test_available_commands_lists_supported_tags() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let mask = available_commands();
    assert_ne!(mask & CommandTag::WriteMemory.mask(), 0);
    assert_eq!(mask & CommandTag::ReceiveSbFile.mask(), 0);
    assert_eq!(
        get_property(&mut pump, &mut t, PropertyTag::AvailableCommands),
        Response::GetProperty {
            status: 0,
            values: values(&[mask]),
        }
    );
}

#[test]
fn test_max_packet_size_reflects_framing_config() {
    let config = SerialConfig {
        max_packet_size: 16,
        ..SerialConfig::default()
    };
    let mut pump = pump_with(RamFlash::new(), PanicSystem::default(), config);
    let mut t = RecordingTransport::default();
    assert_eq!(
        get_property(&mut pump, &mut t, PropertyTag::MaxPacketSize),
        Response::GetProperty {
            status: 0,
            values: values(&[16]),
        }
    );
}

#[test]
fn test_reserved_regions_cover_bootloader() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    assert_eq!(
        get_property(&mut pump, &mut t, PropertyTag::ReservedRegions),
        Response::GetProperty {
            status: 0,
            values: values(&[FLASH_START, APP_START - 1, 0, 0]),
        }
    );
}

#[test]
fn test_set_read_only_property_is_rejected() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let tag = PropertyTag::FlashSizeInBytes as u32;
    let wire = run(&mut pump, &mut t, Command::new(CommandTag::SetProperty, &[tag, 1]));
    assert_eq!(reply(&wire), generic(Status::ReadOnlyProperty, CommandTag::SetProperty));

    assert_eq!(
        get_property(&mut pump, &mut t, PropertyTag::FlashSizeInBytes),
        Response::GetProperty {
            status: 0,
            values: values(&[FLASH_SIZE]),
        }
    );
}

#[test]
fn test_set_verify_writes_round_trip() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let tag = PropertyTag::VerifyWrites as u32;

    let wire = run(&mut pump, &mut t, Command::new(CommandTag::SetProperty, &[tag, 0]));
    assert_eq!(reply(&wire), generic(Status::Success, CommandTag::SetProperty));
    assert!(!pump.dispatcher().properties().verify_writes());

    let wire = run(&mut pump, &mut t, Command::new(CommandTag::SetProperty, &[tag, 2]));
    assert_eq!(reply(&wire), generic(Status::InvalidPropertyValue, CommandTag::SetProperty));
    assert!(!pump.dispatcher().properties().verify_writes());

    let wire = run(&mut pump, &mut t, Command::new(CommandTag::SetProperty, &[tag, 1]));
    assert_eq!(reply(&wire), generic(Status::Success, CommandTag::SetProperty));
    assert_eq!(
        get_property(&mut pump, &mut t, PropertyTag::VerifyWrites),
        Response::GetProperty {
            status: 0,
            values: values(&[1]),
        }
    );
}

// =============================================================================
// Erase
// =============================================================================

#[test]
fn test_unaligned_erase_is_rejected_without_touching_flash() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let cmd = Command::new(CommandTag::FlashEraseRegion, &[APP_START + 1, SECTOR_SIZE]);
    let wire = run(&mut pump, &mut t, cmd);

    assert_eq!(reply(&wire), generic(Status::InvalidArgument, CommandTag::FlashEraseRegion));
    assert!(pump.dispatcher().flash().erase_calls.is_empty());
}

#[test]
fn test_unaligned_length_is_rejected() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let cmd = Command::new(CommandTag::FlashEraseRegion, &[APP_START, 100]);
    let wire = run(&mut pump, &mut t, cmd);

    assert_eq!(reply(&wire), generic(Status::InvalidArgument, CommandTag::FlashEraseRegion));
    assert!(pump.dispatcher().flash().erase_calls.is_empty());
}

#[test]
fn test_erase_region_erases_sectors() {
    let mut flash = RamFlash::new();
    flash.preload(APP_START, &[0u8; 16]);
    let mut pump = pump_with(flash, PanicSystem::default(), SerialConfig::default());
    let mut t = RecordingTransport::default();

    let cmd = Command::new(CommandTag::FlashEraseRegion, &[APP_START, 2 * SECTOR_SIZE]);
    let wire = run(&mut pump, &mut t, cmd);

    assert_eq!(reply(&wire), generic(Status::Success, CommandTag::FlashEraseRegion));
    let flash = pump.dispatcher().flash();
    assert_eq!(flash.erase_calls, vec![(APP_START, 2 * SECTOR_SIZE)]);
    assert!(flash.slice(APP_START, 16).iter().all(|&b| b == 0xFF));
}

#[test]
fn test_erase_of_bootloader_region_is_range_invalid() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let cmd = Command::new(CommandTag::FlashEraseRegion, &[APP_START - SECTOR_SIZE, 2 * SECTOR_SIZE]);
    let wire = run(&mut pump, &mut t, cmd);

    assert_eq!(reply(&wire), generic(Status::MemoryRangeInvalid, CommandTag::FlashEraseRegion));
    assert!(pump.dispatcher().flash().erase_calls.is_empty());
}

#[test]
fn test_erase_past_flash_end_is_range_invalid() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let cmd = Command::new(CommandTag::FlashEraseRegion, &[FLASH_START + FLASH_SIZE, SECTOR_SIZE]);
    let wire = run(&mut pump, &mut t, cmd);

    assert_eq!(reply(&wire), generic(Status::MemoryRangeInvalid, CommandTag::FlashEraseRegion));
}

#[test]
fn test_erase_with_external_memory_id_is_rejected() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let cmd = Command::new(CommandTag::FlashEraseRegion, &[APP_START, SECTOR_SIZE, 1]);
    let wire = run(&mut pump, &mut t, cmd);

    assert_eq!(reply(&wire), generic(Status::InvalidArgument, CommandTag::FlashEraseRegion));
}

#[test]
fn test_erase_failure_reports_fail() {
    let mut flash = RamFlash::new();
    flash.fail_erase = true;
    let mut pump = pump_with(flash, PanicSystem::default(), SerialConfig::default());
    let mut t = RecordingTransport::default();

    let cmd = Command::new(CommandTag::FlashEraseRegion, &[APP_START, SECTOR_SIZE]);
    let wire = run(&mut pump, &mut t, cmd);
    assert_eq!(reply(&wire), generic(Status::Fail, CommandTag::FlashEraseRegion));
}

#[test]
fn test_erase_all_spares_bootloader() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let wire = run(&mut pump, &mut t, Command::new(CommandTag::FlashEraseAll, &[]));

    assert_eq!(reply(&wire), generic(Status::Success, CommandTag::FlashEraseAll));
    assert_eq!(
        pump.dispatcher().flash().erase_calls,
        vec![(APP_START, FLASH_START + FLASH_SIZE - APP_START)]
    );
}

// =============================================================================
// WriteMemory
// =============================================================================

fn write_command(addr: u32, len: u32) -> Command {
    Command::new(CommandTag::WriteMemory, &[addr, len]).with_data_phase()
}

#[test]
fn test_write_memory_to_flash() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let image: Vec<u8> = (0..40u8).collect();

    let wire = run(&mut pump, &mut t, write_command(APP_START, 40));
    assert_eq!(reply(&wire), generic(Status::Success, CommandTag::WriteMemory));
    assert!(matches!(pump.dispatcher().phase(), DataPhase::Write { remaining: 40, .. }));

    // Intermediate data packets get a bare ACK
    let wire = exchange(&mut pump, &mut t, &framed(PacketType::Data, &image[..32]));
    assert_eq!(wire, vec![Wire::Sync(PacketType::Ack)]);

    let wire = exchange(&mut pump, &mut t, &framed(PacketType::Data, &image[32..]));
    assert_eq!(reply(&wire), generic(Status::Success, CommandTag::WriteMemory));

    assert_eq!(pump.dispatcher().phase(), DataPhase::Idle);
    assert_eq!(pump.dispatcher().flash().slice(APP_START, 40), &image[..]);
}

#[test]
fn test_write_memory_to_ram() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();

    let wire = run(&mut pump, &mut t, write_command(RAM_START + 8, 4));
    assert_eq!(reply(&wire), generic(Status::Success, CommandTag::WriteMemory));

    // Extra bytes past the announced length are dropped
    let wire = exchange(&mut pump, &mut t, &framed(PacketType::Data, &[1, 2, 3, 4, 5, 6]));
    assert_eq!(reply(&wire), generic(Status::Success, CommandTag::WriteMemory));

    let ram = &pump.dispatcher().memory().data;
    assert_eq!(&ram[8..13], &[1, 2, 3, 4, 0]);
}

#[test]
fn test_write_memory_into_bootloader_is_rejected() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();

    let wire = run(&mut pump, &mut t, write_command(FLASH_START, 16));
    assert_eq!(reply(&wire), generic(Status::MemoryRangeInvalid, CommandTag::WriteMemory));
    assert_eq!(pump.dispatcher().phase(), DataPhase::Idle);
}

#[test]
fn test_write_memory_outside_any_region_is_rejected() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();

    let wire = run(&mut pump, &mut t, write_command(0x4000_0000, 4));
    assert_eq!(reply(&wire), generic(Status::MemoryRangeInvalid, CommandTag::WriteMemory));
}

#[test]
fn test_write_verify_failure_aborts_data_phase() {
    let mut flash = RamFlash::new();
    // Not erased: programming 0xAA over 0x00 reads back 0x00
    flash.preload(APP_START, &[0u8; 8]);
    let mut pump = pump_with(flash, PanicSystem::default(), SerialConfig::default());
    let mut t = RecordingTransport::default();

    run(&mut pump, &mut t, write_command(APP_START, 16));
    let wire = exchange(&mut pump, &mut t, &framed(PacketType::Data, &[0xAA; 16]));

    assert_eq!(wire.len(), 2);
    assert_eq!(wire[0], Wire::Sync(PacketType::AckAbort));
    assert_eq!(
        wire[1].response(),
        generic(Status::MemoryVerifyFailed, CommandTag::WriteMemory)
    );
    assert_eq!(pump.dispatcher().phase(), DataPhase::Idle);
}

#[test]
fn test_write_without_verify_ignores_readback() {
    let mut flash = RamFlash::new();
    flash.preload(APP_START, &[0u8; 8]);
    let mut pump = pump_with(flash, PanicSystem::default(), SerialConfig::default());
    let mut t = RecordingTransport::default();

    let tag = PropertyTag::VerifyWrites as u32;
    run(&mut pump, &mut t, Command::new(CommandTag::SetProperty, &[tag, 0]));
    run(&mut pump, &mut t, write_command(APP_START, 8));
    let wire = exchange(&mut pump, &mut t, &framed(PacketType::Data, &[0xAA; 8]));

    assert_eq!(reply(&wire), generic(Status::Success, CommandTag::WriteMemory));
}

#[test]
fn test_command_during_write_phase_drops_phase() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();

    run(&mut pump, &mut t, write_command(APP_START, 64));
    exchange(&mut pump, &mut t, &framed(PacketType::Data, &[0x11; 32]));
    get_property(&mut pump, &mut t, PropertyTag::CurrentVersion);

    assert_eq!(pump.dispatcher().phase(), DataPhase::Idle);
}

#[test]
fn test_stray_data_packet_is_acked_and_ignored() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();

    let wire = exchange(&mut pump, &mut t, &framed(PacketType::Data, &[1, 2, 3]));
    assert_eq!(wire, vec![Wire::Sync(PacketType::Ack)]);
    assert!(pump.dispatcher().flash().program_calls.is_empty());
}

// =============================================================================
// ReadMemory
// =============================================================================

fn read_response(status: u32, byte_count: u32) -> Option<Response> {
    Some(Response::ReadMemory { status, byte_count })
}

#[test]
fn test_read_memory_streams_chunks_on_host_ack() {
    let image: Vec<u8> = (0..40u8).map(|b| b ^ 0x5A).collect();
    let mut flash = RamFlash::new();
    flash.preload(APP_START, &image);
    let mut pump = pump_with(flash, PanicSystem::default(), SerialConfig::default());
    let mut t = RecordingTransport::default();

    let wire = run(&mut pump, &mut t, Command::new(CommandTag::ReadMemory, &[APP_START, 40]));
    assert_eq!(reply(&wire), read_response(0, 40));

    let wire = exchange(&mut pump, &mut t, &sync(PacketType::Ack));
    assert_eq!(wire, vec![Wire::Data(PacketType::Data, image[..32].to_vec())]);

    let wire = exchange(&mut pump, &mut t, &sync(PacketType::Ack));
    assert_eq!(wire, vec![Wire::Data(PacketType::Data, image[32..].to_vec())]);

    let wire = exchange(&mut pump, &mut t, &sync(PacketType::Ack));
    assert_eq!(wire.len(), 1);
    assert_eq!(wire[0].response(), generic(Status::Success, CommandTag::ReadMemory));
    assert_eq!(pump.dispatcher().phase(), DataPhase::Idle);
}

#[test]
fn test_read_memory_chunk_follows_max_packet_size() {
    let config = SerialConfig {
        max_packet_size: 16,
        ..SerialConfig::default()
    };
    let mut pump = pump_with(RamFlash::new(), PanicSystem::default(), config);
    let mut t = RecordingTransport::default();

    run(&mut pump, &mut t, Command::new(CommandTag::ReadMemory, &[RAM_START, 20]));
    let wire = exchange(&mut pump, &mut t, &sync(PacketType::Ack));
    assert_eq!(wire, vec![Wire::Data(PacketType::Data, vec![0; 16])]);
}

#[test]
fn test_zero_length_read_goes_straight_to_final_response() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();

    let wire = run(&mut pump, &mut t, Command::new(CommandTag::ReadMemory, &[RAM_START, 0]));
    assert_eq!(reply(&wire), read_response(0, 0));

    let wire = exchange(&mut pump, &mut t, &sync(PacketType::Ack));
    assert_eq!(wire.len(), 1);
    assert_eq!(wire[0].response(), generic(Status::Success, CommandTag::ReadMemory));
}

#[test]
fn test_read_memory_out_of_range() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();

    let wire = run(
        &mut pump,
        &mut t,
        Command::new(CommandTag::ReadMemory, &[FLASH_START + FLASH_SIZE - 4, 8]),
    );
    assert_eq!(reply(&wire), read_response(Status::MemoryRangeInvalid.code(), 0));
    assert_eq!(pump.dispatcher().phase(), DataPhase::Idle);
}

#[test]
fn test_host_abort_ends_read() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();

    run(&mut pump, &mut t, Command::new(CommandTag::ReadMemory, &[RAM_START, 64]));
    exchange(&mut pump, &mut t, &sync(PacketType::Ack));

    let wire = exchange(&mut pump, &mut t, &sync(PacketType::AckAbort));
    assert_eq!(wire.len(), 1);
    assert_eq!(wire[0].response(), generic(Status::AbortDataPhase, CommandTag::ReadMemory));
    assert_eq!(pump.dispatcher().phase(), DataPhase::Idle);
}

#[test]
fn test_host_nak_resends_chunk() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();

    run(&mut pump, &mut t, Command::new(CommandTag::ReadMemory, &[RAM_START, 64]));
    let first = exchange(&mut pump, &mut t, &sync(PacketType::Ack));
    let again = exchange(&mut pump, &mut t, &sync(PacketType::Nak));
    assert_eq!(first, again);
    assert!(matches!(pump.dispatcher().phase(), DataPhase::Read { remaining: 32, .. }));
}

// =============================================================================
// FillMemory
// =============================================================================

#[test]
fn test_fill_ram_repeats_pattern_little_endian() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();

    let cmd = Command::new(CommandTag::FillMemory, &[RAM_START + 4, 10, 0x1122_3344]);
    let wire = run(&mut pump, &mut t, cmd);
    assert_eq!(reply(&wire), generic(Status::Success, CommandTag::FillMemory));

    let ram = &pump.dispatcher().memory().data;
    assert_eq!(
        &ram[4..15],
        &[0x44, 0x33, 0x22, 0x11, 0x44, 0x33, 0x22, 0x11, 0x44, 0x33, 0]
    );
}

#[test]
fn test_fill_flash_spanning_several_chunks() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();

    let cmd = Command::new(CommandTag::FillMemory, &[APP_START, 100, 0xA5A5_A5A5]);
    let wire = run(&mut pump, &mut t, cmd);
    assert_eq!(reply(&wire), generic(Status::Success, CommandTag::FillMemory));

    let flash = pump.dispatcher().flash();
    assert!(flash.slice(APP_START, 100).iter().all(|&b| b == 0xA5));
    assert_eq!(flash.slice(APP_START + 100, 1), &[0xFF]);
    assert_eq!(flash.program_calls.len(), 4);
}

#[test]
fn test_fill_reserved_flash_is_rejected() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();

    let cmd = Command::new(CommandTag::FillMemory, &[FLASH_START, 4, 0]);
    let wire = run(&mut pump, &mut t, cmd);
    assert_eq!(reply(&wire), generic(Status::MemoryRangeInvalid, CommandTag::FillMemory));
    assert!(pump.dispatcher().flash().program_calls.is_empty());
}

// =============================================================================
// Execute / Call / Reset
// =============================================================================

fn panic_message(err: Box<dyn std::any::Any + Send>) -> String {
    match err.downcast::<String>() {
        Ok(s) => *s,
        Err(err) => err.downcast::<&str>().map(|s| s.to_string()).unwrap_or_default(),
    }
}

#[test]
fn test_execute_acks_then_jumps() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let cmd = Command::new(CommandTag::Execute, &[APP_START + 0x101, 7, RAM_START + RAM_SIZE]);
    let packet = command_packet(&cmd);

    let result = catch_unwind(AssertUnwindSafe(|| {
        for &b in &packet {
            pump.on_byte(b, &mut t);
        }
    }));

    let msg = panic_message(result.unwrap_err());
    assert_eq!(msg, "execute 0x10010101 7 0x20001000");
    // ACK went out before control left; no response follows
    assert_eq!(parse_wire(&t.bytes), vec![Wire::Sync(PacketType::Ack)]);
    assert_eq!(t.flushes, 1);
}

#[test]
fn test_execute_into_bootloader_is_rejected() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let wire = run(&mut pump, &mut t, Command::new(CommandTag::Execute, &[FLASH_START + 0x101, 0, 0]));
    assert_eq!(reply(&wire), generic(Status::InvalidArgument, CommandTag::Execute));
}

#[test]
fn test_execute_with_stack_outside_ram_is_rejected() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let cmd = Command::new(CommandTag::Execute, &[APP_START + 0x101, 0, 0x3000_0000]);
    let wire = run(&mut pump, &mut t, cmd);
    assert_eq!(reply(&wire), generic(Status::InvalidArgument, CommandTag::Execute));
}

#[test]
#[should_panic(expected = "system reset")]
fn test_reset_transfers_control() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    run(&mut pump, &mut t, Command::new(CommandTag::Reset, &[]));
}

#[test]
fn test_reset_flushes_ack_first() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let packet = command_packet(&Command::new(CommandTag::Reset, &[]));

    let result = catch_unwind(AssertUnwindSafe(|| {
        for &b in &packet {
            pump.on_byte(b, &mut t);
        }
    }));

    assert_eq!(panic_message(result.unwrap_err()), "system reset");
    assert_eq!(parse_wire(&t.bytes), vec![Wire::Sync(PacketType::Ack)]);
    assert_eq!(t.flushes, 1);
}

#[test]
fn test_call_returns_callee_status() {
    let system = PanicSystem {
        call_result: 0x55,
        ..PanicSystem::default()
    };
    let mut pump = pump_with(RamFlash::new(), system, SerialConfig::default());
    let mut t = RecordingTransport::default();

    let wire = run(&mut pump, &mut t, Command::new(CommandTag::Call, &[RAM_START + 1, 3]));
    assert_eq!(
        reply(&wire),
        Some(Response::Generic {
            status: 0x55,
            command: CommandTag::Call as u8,
        })
    );
}

#[test]
fn test_call_outside_memory_is_rejected() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let wire = run(&mut pump, &mut t, Command::new(CommandTag::Call, &[0x4000_0001, 0]));
    assert_eq!(reply(&wire), generic(Status::InvalidArgument, CommandTag::Call));
}

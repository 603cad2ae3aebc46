// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Tests for the KFT framing layer and the command pump on top of it.

mod common;

use common::*;
use serboot_common::kft::command::{Command, CommandTag, Response};
use serboot_common::kft::packet::{
    parse_ping_response, PacketType, MAX_PACKET_SIZE, PING_RESPONSE_LEN, PROTOCOL_VERSION,
};
use serboot_common::kft::serial::{SerialConfig, SerialEvent, SerialPacketizer};
use serboot_common::kft::Status;
use serboot_common::transport::RxQueue;

fn drain(s: &mut SerialPacketizer) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(b) = s.next_tx_byte() {
        out.push(b);
    }
    out
}

fn feed_serial(s: &mut SerialPacketizer, bytes: &[u8]) -> Vec<SerialEvent> {
    bytes.iter().filter_map(|&b| s.on_byte(b)).collect()
}

// =============================================================================
// Command receipt
// =============================================================================

#[test]
fn test_unknown_tag_gets_one_ack_and_one_response() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();

    let packet = framed(PacketType::Command, &[0x13, 0, 0, 0]);
    let wire = exchange(&mut pump, &mut t, &packet);

    assert_eq!(wire.len(), 2);
    assert_eq!(wire[0], Wire::Sync(PacketType::Ack));
    assert_eq!(
        wire[1].response(),
        Some(Response::Generic {
            status: Status::UnknownCommand.code(),
            command: 0x13,
        })
    );
}

#[test]
fn test_unimplemented_command_is_unknown() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();

    let cmd = Command::new(CommandTag::ReceiveSbFile, &[16]);
    let wire = exchange(&mut pump, &mut t, &command_packet(&cmd));

    assert_eq!(wire[0], Wire::Sync(PacketType::Ack));
    assert_eq!(
        wire[1].response().map(|r| r.status()),
        Some(Status::UnknownCommand.code())
    );
}

#[test]
fn test_unimplemented_command_with_odd_params_is_still_unknown() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();

    // FlashSecurityDisable declares two parameters; send none
    let packet = framed(PacketType::Command, &[CommandTag::FlashSecurityDisable as u8, 0, 0, 0]);
    let wire = exchange(&mut pump, &mut t, &packet);

    assert_eq!(wire.len(), 2);
    assert_eq!(wire[0], Wire::Sync(PacketType::Ack));
    assert_eq!(
        wire[1].response(),
        Some(Response::Generic {
            status: Status::UnknownCommand.code(),
            command: CommandTag::FlashSecurityDisable as u8,
        })
    );
}

#[test]
fn test_bad_parameter_count_is_invalid_argument() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();

    // GetProperty with no parameters
    let packet = framed(PacketType::Command, &[0x07, 0, 0, 0]);
    let wire = exchange(&mut pump, &mut t, &packet);

    assert_eq!(
        wire[1].response(),
        Some(Response::Generic {
            status: Status::InvalidArgument.code(),
            command: 0x07,
        })
    );
}

// =============================================================================
// CRC and resync
// =============================================================================

#[test]
fn test_crc_mismatch_naks_without_dispatch() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();

    let good = command_packet(&Command::new(CommandTag::GetProperty, &[4]));
    let mut bad = good.clone();
    bad[4] ^= 0x01;

    let wire = exchange(&mut pump, &mut t, &bad);
    assert_eq!(wire, vec![Wire::Sync(PacketType::Nak)]);

    // The identical correct bytes go through afterwards
    let wire = exchange(&mut pump, &mut t, &good);
    assert_eq!(wire[0], Wire::Sync(PacketType::Ack));
    assert_eq!(
        wire[1].response(),
        Some(Response::GetProperty {
            status: 0,
            values: heapless::Vec::from_slice(&[FLASH_SIZE]).unwrap(),
        })
    );
}

#[test]
fn test_corrupted_payload_is_not_delivered() {
    let mut s = SerialPacketizer::default();
    let mut packet = command_packet(&Command::new(CommandTag::Reset, &[]));
    let last = packet.len() - 1;
    packet[last] ^= 0xFF;

    assert!(feed_serial(&mut s, &packet).is_empty());
    assert_eq!(drain(&mut s), sync(PacketType::Nak));
    assert!(!s.flags().is_ack_needed);
}

#[test]
fn test_oversized_length_naks_and_resyncs() {
    let mut s = SerialPacketizer::default();
    let len = (MAX_PACKET_SIZE as u16 + 1).to_le_bytes();
    assert!(feed_serial(&mut s, &[0x5A, 0xA4, len[0], len[1]]).is_empty());
    assert_eq!(drain(&mut s), sync(PacketType::Nak));
    assert!(!s.is_receiving());

    let packet = command_packet(&Command::new(CommandTag::Reset, &[]));
    let events = feed_serial(&mut s, &packet);
    assert_eq!(events.len(), 1);
}

#[test]
fn test_configured_max_packet_size_limits_length() {
    let mut s = SerialPacketizer::new(SerialConfig {
        max_packet_size: 8,
        ..SerialConfig::default()
    });
    assert_eq!(s.max_packet_size(), 8);

    let packet = framed(PacketType::Data, &[0u8; 9]);
    assert!(feed_serial(&mut s, &packet[..4]).is_empty());
    assert_eq!(drain(&mut s), sync(PacketType::Nak));
}

#[test]
fn test_max_packet_size_is_clamped_to_buffer() {
    let s = SerialPacketizer::new(SerialConfig {
        max_packet_size: 4096,
        ..SerialConfig::default()
    });
    assert_eq!(s.max_packet_size(), MAX_PACKET_SIZE);
}

#[test]
fn test_noise_before_start_byte_is_ignored() {
    let mut s = SerialPacketizer::default();
    let mut bytes = vec![0x00, 0x13, 0xFF];
    bytes.extend(command_packet(&Command::new(CommandTag::Reset, &[])));

    let events = feed_serial(&mut s, &bytes);
    assert_eq!(events.len(), 1);
    assert!(drain(&mut s).is_empty());
}

#[test]
fn test_unknown_packet_type_resyncs_silently() {
    let mut s = SerialPacketizer::default();
    let mut bytes = vec![0x5A, 0x42];
    bytes.extend(command_packet(&Command::new(CommandTag::Reset, &[])));

    let events = feed_serial(&mut s, &bytes);
    assert_eq!(events.len(), 1);
    assert!(drain(&mut s).is_empty());
}

#[test]
fn test_repeated_start_byte_is_accepted() {
    let mut s = SerialPacketizer::default();
    let mut bytes = vec![0x5A];
    bytes.extend(command_packet(&Command::new(CommandTag::Reset, &[])));

    assert_eq!(feed_serial(&mut s, &bytes).len(), 1);
}

#[test]
fn test_partial_packet_times_out() {
    let mut s = SerialPacketizer::default();
    let packet = command_packet(&Command::new(CommandTag::Reset, &[]));

    assert!(feed_serial(&mut s, &packet[..3]).is_empty());
    s.tick(5);
    assert!(drain(&mut s).is_empty());
    s.tick(6);
    assert_eq!(drain(&mut s), sync(PacketType::Nak));
    assert!(!s.is_receiving());

    assert_eq!(feed_serial(&mut s, &packet).len(), 1);
}

#[test]
fn test_idle_parser_never_times_out() {
    let mut s = SerialPacketizer::default();
    s.tick(1000);
    assert!(drain(&mut s).is_empty());
}

// =============================================================================
// Ping
// =============================================================================

#[test]
fn test_ping_is_answered_immediately() {
    let mut s = SerialPacketizer::default();
    assert!(feed_serial(&mut s, &sync(PacketType::Ping)).is_empty());

    let out = drain(&mut s);
    assert_eq!(out.len(), PING_RESPONSE_LEN);
    let bytes: [u8; PING_RESPONSE_LEN] = out.try_into().unwrap();
    assert_eq!(parse_ping_response(&bytes), Some((PROTOCOL_VERSION, 0)));
}

#[test]
fn test_ping_does_not_consume_pending_ack() {
    let mut s = SerialPacketizer::default();
    let events = feed_serial(&mut s, &framed(PacketType::Data, &[1, 2, 3]));
    assert_eq!(events.len(), 1);
    feed_serial(&mut s, &sync(PacketType::Ping));

    let out = drain(&mut s);
    assert_eq!(out.len(), PING_RESPONSE_LEN);
    assert!(s.flags().is_ack_needed);
}

// =============================================================================
// Deferred ACK and data phase flags
// =============================================================================

#[test]
fn test_data_packet_ack_is_deferred_until_release() {
    let mut s = SerialPacketizer::default();
    let events = feed_serial(&mut s, &framed(PacketType::Data, &[9; 4]));
    assert_eq!(events, vec![SerialEvent::Data(heapless::Vec::from_slice(&[9; 4]).unwrap())]);

    let flags = s.flags();
    assert!(flags.is_ack_needed);
    assert!(flags.is_back_to_back_write);
    assert!(drain(&mut s).is_empty());

    s.release();
    assert_eq!(drain(&mut s), sync(PacketType::Ack));
    assert!(!s.flags().is_ack_needed);
}

#[test]
fn test_abort_turns_pending_ack_into_ack_abort() {
    let mut s = SerialPacketizer::default();
    feed_serial(&mut s, &framed(PacketType::Data, &[1]));

    s.abort_data_phase();
    s.send_command_packet(&Response::generic(Status::Fail, 0x04).encode());

    let wire = parse_wire(&drain(&mut s));
    assert_eq!(wire[0], Wire::Sync(PacketType::AckAbort));
    assert_eq!(wire[1].response().map(|r| r.status()), Some(1));
    assert!(!s.flags().is_ack_abort_needed);
}

#[test]
fn test_release_after_command_sends_nothing() {
    let mut s = SerialPacketizer::default();
    feed_serial(&mut s, &command_packet(&Command::new(CommandTag::Reset, &[])));
    s.release();
    assert!(drain(&mut s).is_empty());
    s.finalize();
    assert_eq!(drain(&mut s), sync(PacketType::Ack));
}

#[test]
fn test_second_packet_flushes_unanswered_ack() {
    let mut s = SerialPacketizer::default();
    feed_serial(&mut s, &framed(PacketType::Data, &[1]));
    feed_serial(&mut s, &framed(PacketType::Data, &[2]));
    assert_eq!(drain(&mut s), sync(PacketType::Ack));
    assert!(s.flags().is_ack_needed);
}

// =============================================================================
// Host acknowledgements
// =============================================================================

#[test]
fn test_host_nak_resends_last_packet() {
    let mut s = SerialPacketizer::default();
    s.send_data_packet(&[1, 2, 3, 4]);
    let first = drain(&mut s);

    assert!(feed_serial(&mut s, &sync(PacketType::Nak)).is_empty());
    assert_eq!(drain(&mut s), first);
}

#[test]
fn test_host_ack_and_abort_are_reported() {
    let mut s = SerialPacketizer::default();
    s.send_data_packet(&[1]);
    drain(&mut s);

    assert_eq!(feed_serial(&mut s, &sync(PacketType::Ack)), vec![SerialEvent::HostAck]);
    // Nothing left to resend once acknowledged
    feed_serial(&mut s, &sync(PacketType::Nak));
    assert!(drain(&mut s).is_empty());

    assert_eq!(
        feed_serial(&mut s, &sync(PacketType::AckAbort)),
        vec![SerialEvent::HostAbort]
    );
}

// =============================================================================
// Pump
// =============================================================================

#[test]
fn test_pump_drains_receive_queue_and_starts_transmit() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let mut queue = RxQueue::new();
    let (mut producer, mut consumer) = queue.split();

    let packet = command_packet(&Command::new(CommandTag::GetProperty, &[1]));
    for &b in &packet {
        producer.enqueue(b).unwrap();
    }

    assert_eq!(pump.pump(&mut consumer, &mut t), packet.len());
    assert_eq!(t.starts, 1);

    let mut out = Vec::new();
    while let Some(b) = pump.next_tx_byte() {
        out.push(b);
    }
    let wire = parse_wire(&out);
    assert_eq!(wire[0], Wire::Sync(PacketType::Ack));
    assert_eq!(
        wire[1].response(),
        Some(Response::GetProperty {
            status: 0,
            values: heapless::Vec::from_slice(&[0x6B01_0000]).unwrap(),
        })
    );
}

#[test]
fn test_pump_with_empty_queue_does_nothing() {
    let mut pump = make_pump();
    let mut t = RecordingTransport::default();
    let mut queue = RxQueue::new();
    let (_producer, mut consumer) = queue.split();

    assert_eq!(pump.pump(&mut consumer, &mut t), 0);
    assert_eq!(t.starts, 0);
}

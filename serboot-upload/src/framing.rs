// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Host-side KFT packet reader.
//!
//! Bytes from the serial port are pushed one at a time. Anything before a
//! start byte is line noise and is skipped. Data packets are checked against
//! their CRC before they are handed out.

use serboot_common::kft::packet::{
    data_header, data_packet_crc, parse_ping_response, sync_packet, PacketType, Version,
    DATA_HEADER_LEN, MAX_PACKET_SIZE, PING_RESPONSE_LEN, START_BYTE,
};

/// One complete packet from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Sync(PacketType),
    Data { ty: PacketType, payload: Vec<u8> },
    PingResponse { version: Version, options: u16 },
}

/// Result of pushing a byte that completed a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Packet(Packet),
    /// Length or CRC check failed; the caller should NAK.
    Corrupt,
}

#[derive(Default)]
pub struct PacketReader {
    buf: Vec<u8>,
}

impl PacketReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partial packet.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn push(&mut self, byte: u8) -> Option<Decoded> {
        if self.buf.is_empty() {
            if byte == START_BYTE {
                self.buf.push(byte);
            }
            return None;
        }
        self.buf.push(byte);

        let ty = match PacketType::try_from(self.buf[1]) {
            Ok(ty) => ty,
            Err(_) => {
                // Not a packet after all; a repeated start byte may begin one.
                self.buf.clear();
                if byte == START_BYTE {
                    self.buf.push(byte);
                }
                return None;
            }
        };

        if ty == PacketType::PingResponse {
            if self.buf.len() < PING_RESPONSE_LEN {
                return None;
            }
            let mut raw = [0u8; PING_RESPONSE_LEN];
            raw.copy_from_slice(&self.buf);
            self.buf.clear();
            return Some(match parse_ping_response(&raw) {
                Some((version, options)) => Decoded::Packet(Packet::PingResponse { version, options }),
                None => Decoded::Corrupt,
            });
        }

        if !ty.has_payload() {
            self.buf.clear();
            return Some(Decoded::Packet(Packet::Sync(ty)));
        }

        if self.buf.len() < DATA_HEADER_LEN {
            return None;
        }
        let len = u16::from_le_bytes([self.buf[2], self.buf[3]]) as usize;
        if len > MAX_PACKET_SIZE {
            self.buf.clear();
            return Some(Decoded::Corrupt);
        }
        if self.buf.len() < DATA_HEADER_LEN + len {
            return None;
        }

        let crc = u16::from_le_bytes([self.buf[4], self.buf[5]]);
        let payload = self.buf.split_off(DATA_HEADER_LEN);
        self.buf.clear();
        if data_packet_crc(ty, &payload) != crc {
            return Some(Decoded::Corrupt);
        }
        Some(Decoded::Packet(Packet::Data { ty, payload }))
    }
}

/// Complete wire bytes of a data packet.
pub fn encode_data_packet(ty: PacketType, payload: &[u8]) -> Vec<u8> {
    let mut out = data_header(ty, payload).to_vec();
    out.extend_from_slice(payload);
    out
}

pub fn encode_sync_packet(ty: PacketType) -> Vec<u8> {
    sync_packet(ty).to_vec()
}

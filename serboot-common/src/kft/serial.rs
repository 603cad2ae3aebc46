// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! KFT serial framing: packet parser, ACK/NAK flow control and ping.
//!
//! Bytes are fed one at a time with [`SerialPacketizer::on_byte`]. A complete
//! command or data packet with a good CRC is returned as a [`SerialEvent`];
//! everything else (sync packets, noise, bad CRC) is handled here.
//!
//! The ACK for a received packet is deferred: it goes out right before the
//! next outgoing packet, or when the consumer calls [`release`] for a data
//! packet that needs no response. This keeps ACK and response in order on
//! the wire and lets a data-phase error turn the ACK into ACK_ABORT.
//!
//! [`release`]: SerialPacketizer::release

use heapless::Vec;

use crate::transport::{Outbox, Transport};

use super::packet::{
    data_header, data_packet_crc, ping_response, sync_packet, PacketType, DATA_HEADER_LEN,
    DEFAULT_BYTE_TIMEOUT_MS, MAX_PACKET_SIZE, PROTOCOL_VERSION, START_BYTE,
};

/// Outgoing byte capacity: a pending ACK, one full data packet and a ping
/// response, with room to spare.
pub const OUTBOX_LEN: usize = 128;

pub type Payload = Vec<u8, MAX_PACKET_SIZE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SerialConfig {
    /// Largest accepted payload, clamped to [`MAX_PACKET_SIZE`].
    pub max_packet_size: usize,
    /// A partial packet older than this is dropped and NAKed.
    pub byte_timeout_ms: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            byte_timeout_ms: DEFAULT_BYTE_TIMEOUT_MS,
        }
    }
}

/// What the framing layer hands upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialEvent {
    Command(Payload),
    Data(Payload),
    /// Host acknowledged our last packet.
    HostAck,
    /// Host asked to stop the current device-to-host data phase.
    HostAbort,
}

/// ACK bookkeeping for the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionFlags {
    /// A received packet has not been acknowledged yet.
    pub is_ack_needed: bool,
    /// The unacknowledged packet was a data packet with no response pending.
    pub is_back_to_back_write: bool,
    /// The next ACK goes out as ACK_ABORT.
    pub is_ack_abort_needed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Start,
    Type,
    LengthLo,
    LengthHi,
    CrcLo,
    CrcHi,
    Payload,
}

pub struct SerialPacketizer {
    config: SerialConfig,
    flags: SessionFlags,

    state: RxState,
    rx_type: PacketType,
    rx_len: u16,
    rx_crc: u16,
    rx_buf: Payload,
    /// Milliseconds since the last byte of a partial packet.
    idle_ms: u32,

    outbox: Outbox<OUTBOX_LEN>,
    /// Last data packet sent, kept for resend on host NAK.
    last_sent: Vec<u8, { DATA_HEADER_LEN + MAX_PACKET_SIZE }>,
}

impl SerialPacketizer {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config: SerialConfig {
                max_packet_size: config.max_packet_size.min(MAX_PACKET_SIZE),
                ..config
            },
            flags: SessionFlags::default(),
            state: RxState::Start,
            rx_type: PacketType::Command,
            rx_len: 0,
            rx_crc: 0,
            rx_buf: Payload::new(),
            idle_ms: 0,
            outbox: Outbox::new(),
            last_sent: Vec::new(),
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.config.max_packet_size
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    // --- Receive ---

    /// Feed one received byte.
    pub fn on_byte(&mut self, byte: u8) -> Option<SerialEvent> {
        self.idle_ms = 0;
        match self.state {
            RxState::Start => {
                if byte == START_BYTE {
                    self.state = RxState::Type;
                }
                None
            }
            RxState::Type => self.on_type(byte),
            RxState::LengthLo => {
                self.rx_len = byte as u16;
                self.state = RxState::LengthHi;
                None
            }
            RxState::LengthHi => {
                self.rx_len |= (byte as u16) << 8;
                if self.rx_len as usize > self.config.max_packet_size {
                    warn!("serial: length {} over limit", self.rx_len);
                    self.reject();
                } else {
                    self.state = RxState::CrcLo;
                }
                None
            }
            RxState::CrcLo => {
                self.rx_crc = byte as u16;
                self.state = RxState::CrcHi;
                None
            }
            RxState::CrcHi => {
                self.rx_crc |= (byte as u16) << 8;
                self.rx_buf.clear();
                if self.rx_len == 0 {
                    self.complete()
                } else {
                    self.state = RxState::Payload;
                    None
                }
            }
            RxState::Payload => {
                // Capacity was checked against rx_len in LengthHi
                let _ = self.rx_buf.push(byte);
                if self.rx_buf.len() == self.rx_len as usize {
                    self.complete()
                } else {
                    None
                }
            }
        }
    }

    fn on_type(&mut self, byte: u8) -> Option<SerialEvent> {
        self.state = RxState::Start;
        let ty = match PacketType::try_from(byte) {
            Ok(ty) => ty,
            Err(b) => {
                // A repeated start byte may be the real one
                if b == START_BYTE {
                    self.state = RxState::Type;
                }
                return None;
            }
        };
        match ty {
            PacketType::Command | PacketType::Data => {
                self.rx_type = ty;
                self.state = RxState::LengthLo;
                None
            }
            PacketType::Ping => {
                self.outbox.extend(&ping_response(PROTOCOL_VERSION, 0));
                None
            }
            PacketType::Ack => {
                self.last_sent.clear();
                Some(SerialEvent::HostAck)
            }
            PacketType::Nak => {
                if !self.last_sent.is_empty() {
                    debug!("serial: host NAK, resending {} bytes", self.last_sent.len());
                    self.outbox.extend(&self.last_sent);
                }
                None
            }
            PacketType::AckAbort => {
                self.last_sent.clear();
                Some(SerialEvent::HostAbort)
            }
            PacketType::PingResponse => None,
        }
    }

    fn complete(&mut self) -> Option<SerialEvent> {
        self.state = RxState::Start;
        if data_packet_crc(self.rx_type, &self.rx_buf) != self.rx_crc {
            warn!("serial: CRC mismatch, NAK");
            self.rx_buf.clear();
            self.send_sync(PacketType::Nak);
            return None;
        }

        // Never two unacknowledged packets.
        if self.flags.is_ack_needed {
            self.send_pending_ack();
        }
        self.flags.is_ack_needed = true;

        let payload = core::mem::take(&mut self.rx_buf);
        Some(match self.rx_type {
            PacketType::Data => {
                self.flags.is_back_to_back_write = true;
                SerialEvent::Data(payload)
            }
            _ => SerialEvent::Command(payload),
        })
    }

    /// Drop the packet in progress, NAK it, and wait for a new start byte.
    fn reject(&mut self) {
        self.state = RxState::Start;
        self.rx_buf.clear();
        self.send_sync(PacketType::Nak);
    }

    /// Advance the inter-byte timer.
    pub fn tick(&mut self, elapsed_ms: u32) {
        if self.state == RxState::Start {
            return;
        }
        self.idle_ms = self.idle_ms.saturating_add(elapsed_ms);
        if self.idle_ms > self.config.byte_timeout_ms {
            warn!("serial: partial packet timed out");
            self.idle_ms = 0;
            self.reject();
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.state != RxState::Start
    }

    // --- Acknowledgement ---

    fn send_sync(&mut self, ty: PacketType) {
        self.outbox.extend(&sync_packet(ty));
    }

    fn send_pending_ack(&mut self) {
        if !self.flags.is_ack_needed {
            return;
        }
        let ty = if self.flags.is_ack_abort_needed {
            PacketType::AckAbort
        } else {
            PacketType::Ack
        };
        self.send_sync(ty);
        self.flags = SessionFlags::default();
    }

    /// The consumer is done with a data packet and has no response for it.
    pub fn release(&mut self) {
        if self.flags.is_back_to_back_write {
            self.send_pending_ack();
        }
    }

    /// Make the next pending ACK an ACK_ABORT.
    pub fn abort_data_phase(&mut self) {
        self.flags.is_ack_abort_needed = true;
    }

    /// Send any pending ACK now. Used before control leaves the bootloader.
    pub fn finalize(&mut self) {
        self.send_pending_ack();
    }

    // --- Transmit ---

    /// Queue a data packet (response or read-memory chunk), preceded by the
    /// pending ACK if there is one.
    pub fn send_packet(&mut self, ty: PacketType, payload: &[u8]) {
        let payload = &payload[..payload.len().min(MAX_PACKET_SIZE)];
        self.send_pending_ack();

        self.last_sent.clear();
        let _ = self.last_sent.extend_from_slice(&data_header(ty, payload));
        let _ = self.last_sent.extend_from_slice(payload);
        self.outbox.extend(&self.last_sent);
    }

    pub fn send_command_packet(&mut self, payload: &[u8]) {
        self.send_packet(PacketType::Command, payload);
    }

    pub fn send_data_packet(&mut self, payload: &[u8]) {
        self.send_packet(PacketType::Data, payload);
    }

    /// Next byte for the transmitter, if any.
    pub fn next_tx_byte(&mut self) -> Option<u8> {
        self.outbox.pop()
    }

    pub fn has_pending_tx(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Push every queued byte to `transport` before returning.
    pub fn flush<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        self.outbox.drain_into(transport);
    }
}

impl Default for SerialPacketizer {
    fn default() -> Self {
        Self::new(SerialConfig::default())
    }
}

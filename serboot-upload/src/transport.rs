// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Serial link to the bootloader: KFT packet exchange plus raw byte access
//! for XMODEM.

use anyhow::{bail, Context, Result};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;

use serboot_common::kft::command::{Command, Response};
use serboot_common::kft::packet::{PacketType, Version, MAX_PACKET_SIZE};

use crate::framing::{encode_data_packet, encode_sync_packet, Decoded, Packet, PacketReader};

/// Default timeout for serial operations in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_BAUD: u32 = 115_200;

/// Resends of one packet after a NAK before giving up.
const MAX_RESENDS: usize = 3;

/// How the device answered an outgoing packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Accepted,
    /// ACK-ABORT: the device stopped the data phase; a response follows.
    Aborted,
}

pub struct Transport {
    port: Box<dyn SerialPort>,
    reader: PacketReader,
    max_packet_size: usize,
}

impl Transport {
    pub fn new(port_name: &str, baud: u32, timeout_ms: u64) -> Result<Self> {
        let port = serialport::new(port_name, baud)
            .timeout(Duration::from_millis(timeout_ms))
            .open()
            .with_context(|| format!("Failed to open serial port {}", port_name))?;

        Ok(Self {
            port,
            reader: PacketReader::new(),
            max_packet_size: MAX_PACKET_SIZE,
        })
    }

    /// Get the port name.
    pub fn port_name(&self) -> String {
        self.port.name().unwrap_or_else(|| "?".to_string())
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Use the device's reported limit for outgoing data packets.
    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size.clamp(1, MAX_PACKET_SIZE);
    }

    // --- Raw bytes ---

    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.port
            .write_all(bytes)
            .context("Failed to write to serial port")?;
        self.port.flush()?;
        Ok(())
    }

    /// One byte, or `None` if nothing arrived within the port timeout.
    pub fn read_raw(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(1) => return Ok(Some(byte[0])),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
                Err(e) => bail!("Serial read error: {}", e),
            }
        }
    }

    /// Run `f` with a different port timeout, restoring the old one after.
    pub fn with_timeout<R>(
        &mut self,
        timeout: Duration,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let old_timeout = self.port.timeout();
        self.port
            .set_timeout(timeout)
            .context("Failed to set timeout")?;
        let result = f(self);
        let _ = self.port.set_timeout(old_timeout);
        result
    }

    fn drain_rx(&mut self) {
        let mut buf = [0u8; 64];
        let old_timeout = self.port.timeout();
        let _ = self.port.set_timeout(Duration::from_millis(10));
        while self.port.read(&mut buf).unwrap_or(0) > 0 {}
        let _ = self.port.set_timeout(old_timeout);
        self.reader.reset();
    }

    // --- Packets ---

    /// Next valid packet. Corrupt frames are NAKed and skipped.
    fn read_packet(&mut self) -> Result<Packet> {
        loop {
            let Some(byte) = self.read_raw()? else {
                bail!("Timeout waiting for response");
            };
            match self.reader.push(byte) {
                Some(Decoded::Packet(packet)) => return Ok(packet),
                Some(Decoded::Corrupt) => self.send_sync(PacketType::Nak)?,
                None => {}
            }
        }
    }

    fn send_sync(&mut self, ty: PacketType) -> Result<()> {
        self.write_raw(&encode_sync_packet(ty))
    }

    /// Send a data packet until the device ACKs it.
    fn send_acked(&mut self, ty: PacketType, payload: &[u8]) -> Result<Ack> {
        let wire = encode_data_packet(ty, payload);
        for _ in 0..=MAX_RESENDS {
            self.write_raw(&wire)?;
            match self.read_packet()? {
                Packet::Sync(PacketType::Ack) => return Ok(Ack::Accepted),
                Packet::Sync(PacketType::AckAbort) => return Ok(Ack::Aborted),
                Packet::Sync(PacketType::Nak) => continue,
                other => bail!("Expected ACK, got {:?}", other),
            }
        }
        bail!("Device NAKed the packet {} times", MAX_RESENDS + 1)
    }

    /// Read the next response packet and acknowledge it.
    pub fn read_response(&mut self) -> Result<Response> {
        loop {
            match self.read_packet()? {
                Packet::Data {
                    ty: PacketType::Command,
                    payload,
                } => {
                    self.send_sync(PacketType::Ack)?;
                    return Response::decode(&payload)
                        .with_context(|| format!("Malformed response {:02x?}", payload));
                }
                // Deferred ACK ahead of the response
                Packet::Sync(PacketType::Ack) => continue,
                other => bail!("Expected a response packet, got {:?}", other),
            }
        }
    }

    /// Send a command and wait for its ACK. No response is read.
    pub fn send_command(&mut self, cmd: &Command) -> Result<()> {
        self.drain_rx();
        match self.send_acked(PacketType::Command, &cmd.encode())? {
            Ack::Accepted => Ok(()),
            Ack::Aborted => bail!("Device aborted command {:?}", cmd.tag),
        }
    }

    /// Send a command and wait for the response.
    pub fn command(&mut self, cmd: &Command) -> Result<Response> {
        self.send_command(cmd)?;
        self.read_response()
    }

    /// Stream `data` as data packets. Returns false if the device aborted
    /// the data phase. `progress` sees the byte count sent so far.
    pub fn write_data(&mut self, data: &[u8], mut progress: impl FnMut(usize)) -> Result<bool> {
        let mut sent = 0;
        for chunk in data.chunks(self.max_packet_size) {
            if self.send_acked(PacketType::Data, chunk)? == Ack::Aborted {
                return Ok(false);
            }
            sent += chunk.len();
            progress(sent);
        }
        Ok(true)
    }

    /// Collect `count` bytes of device-to-host data packets, ACKing each.
    pub fn read_data(&mut self, count: usize, mut progress: impl FnMut(usize)) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            match self.read_packet()? {
                Packet::Data {
                    ty: PacketType::Data,
                    payload,
                } => {
                    self.send_sync(PacketType::Ack)?;
                    out.extend_from_slice(&payload);
                    progress(out.len());
                }
                other => bail!("Expected a data packet at byte {}, got {:?}", out.len(), other),
            }
        }
        Ok(out)
    }

    pub fn ping(&mut self) -> Result<(Version, u16)> {
        self.drain_rx();
        self.send_sync(PacketType::Ping)?;
        loop {
            match self.read_packet()? {
                Packet::PingResponse { version, options } => return Ok((version, options)),
                // A pending ACK may go out ahead of the ping response
                Packet::Sync(PacketType::Ack) => continue,
                other => bail!("Expected a ping response, got {:?}", other),
            }
        }
    }
}

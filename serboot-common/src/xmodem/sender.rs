// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! XMODEM transmitter.
//!
//! The receiver's first byte fixes the mode for the whole transfer: `'C'`
//! selects 1K frames with a CRC-16 trailer, NAK selects 128-byte frames with
//! an 8-bit checksum. Frames are handed over with [`Sender::send_frame`] and
//! emitted byte by byte through [`Sender::next_tx_byte`]. A frame shorter than
//! the frame size is padded with SUB and ends the transfer: EOT follows its
//! ACK automatically. Otherwise [`Sender::finish`] sends EOT.

use crate::transport::{Outbox, Transport};

use super::{
    Checksum, Countdown, SenderConfig, XmodemError, ACK, CAN, CANCEL_COUNT, CRC_MODE, EOT,
    FRAME_128, FRAME_1K, NAK, SOH, STX, SUB,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SenderState {
    Idle,
    /// Waiting for 'C' or NAK from the receiver.
    AwaitMode,
    /// Waiting for the caller's next frame.
    AwaitFrame,
    SendHeader,
    SendSequence,
    SendSequenceComplement,
    SendData,
    SendChecksum,
    AwaitAck,
    AwaitEotAck,
    Done,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxEvent {
    ModeSelected {
        frame_size: usize,
        checksum: Checksum,
    },
    /// The receiver accepted a frame; the caller may queue the next one.
    FrameAcked,
    /// EOT was acknowledged.
    Complete,
    /// The receiver sent CAN.
    Cancelled,
    RetriesExhausted,
    TimedOut,
}

pub struct Sender<'a> {
    config: SenderConfig,
    buf: &'a mut [u8],
    state: SenderState,
    frame_size: usize,
    checksum: Checksum,
    seq: u8,
    /// Position inside the data or trailer being sent.
    cursor: usize,
    trailer: [u8; 2],
    /// Payload length of the frame in flight, before padding.
    frame_payload: usize,
    last_frame: bool,
    retries: u8,
    document_bytes: u32,
    timer: Countdown,
    outbox: Outbox<8>,
}

impl<'a> Sender<'a> {
    /// `buf` holds one frame: at least 128 bytes, 1024 to use 1K frames.
    pub fn new(config: SenderConfig, buf: &'a mut [u8]) -> Result<Self, XmodemError> {
        if buf.len() < FRAME_128 {
            return Err(XmodemError::BufferTooSmall(FRAME_128));
        }
        Ok(Self {
            config,
            buf,
            state: SenderState::Idle,
            frame_size: FRAME_128,
            checksum: Checksum::Sum8,
            seq: 1,
            cursor: 0,
            trailer: [0; 2],
            frame_payload: 0,
            last_frame: false,
            retries: 0,
            document_bytes: 0,
            timer: Countdown::default(),
            outbox: Outbox::new(),
        })
    }

    /// Wait for the receiver's mode request.
    pub fn start(&mut self) {
        self.state = SenderState::AwaitMode;
        self.seq = 1;
        self.retries = 0;
        self.document_bytes = 0;
        self.last_frame = false;
        self.outbox.clear();
        self.timer.disarm();
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn checksum(&self) -> Checksum {
        self.checksum
    }

    /// Payload bytes acknowledged so far.
    pub fn bytes_sent(&self) -> u32 {
        self.document_bytes
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            SenderState::Done | SenderState::Cancelled | SenderState::Failed
        )
    }

    /// Queue the next frame. Only valid after `FrameAcked` or `ModeSelected`.
    pub fn send_frame(&mut self, data: &[u8]) -> Result<(), XmodemError> {
        if self.state != SenderState::AwaitFrame {
            return Err(XmodemError::InvalidState);
        }
        if data.len() > self.frame_size {
            return Err(XmodemError::FrameTooLarge);
        }
        if data.is_empty() {
            return self.finish();
        }
        let frame = &mut self.buf[..self.frame_size];
        frame[..data.len()].copy_from_slice(data);
        frame[data.len()..].fill(SUB);
        self.trailer = self.checksum.trailer(frame);
        self.frame_payload = data.len();
        self.last_frame = data.len() < self.frame_size;
        self.retries = 0;
        self.begin_frame();
        Ok(())
    }

    /// End of file: send EOT and wait for its ACK.
    pub fn finish(&mut self) -> Result<(), XmodemError> {
        if self.state != SenderState::AwaitFrame {
            return Err(XmodemError::InvalidState);
        }
        self.retries = 0;
        self.send_eot();
        Ok(())
    }

    /// Abort from our side.
    pub fn cancel(&mut self) {
        self.send_cancel();
        self.state = SenderState::Cancelled;
    }

    fn begin_frame(&mut self) {
        self.cursor = 0;
        self.state = SenderState::SendHeader;
        self.timer.disarm();
    }

    fn send_eot(&mut self) {
        self.outbox.push(EOT);
        self.state = SenderState::AwaitEotAck;
        self.timer.arm(self.config.timeout_ms);
    }

    fn send_cancel(&mut self) {
        for _ in 0..CANCEL_COUNT {
            self.outbox.push(CAN);
        }
        self.timer.disarm();
    }

    /// Count a NAK; past the budget, cancel and report.
    fn retry(&mut self) -> Result<(), TxEvent> {
        self.retries = self.retries.saturating_add(1);
        if self.retries > self.config.max_retries {
            warn!("xmodem tx: retries exhausted on frame {}", self.seq);
            self.send_cancel();
            self.state = SenderState::Failed;
            return Err(TxEvent::RetriesExhausted);
        }
        Ok(())
    }

    pub fn on_byte(&mut self, byte: u8) -> Option<TxEvent> {
        if self.is_finished() || self.state == SenderState::Idle {
            return None;
        }
        if byte == CAN {
            warn!("xmodem tx: cancelled by receiver");
            self.state = SenderState::Cancelled;
            self.timer.disarm();
            return Some(TxEvent::Cancelled);
        }

        match self.state {
            SenderState::AwaitMode => {
                let (frame_size, checksum) = match byte {
                    CRC_MODE if self.buf.len() >= FRAME_1K => (FRAME_1K, Checksum::Crc16),
                    CRC_MODE => (FRAME_128, Checksum::Crc16),
                    NAK => (FRAME_128, Checksum::Sum8),
                    _ => return None,
                };
                info!("xmodem tx: mode {} byte frames", frame_size);
                self.frame_size = frame_size;
                self.checksum = checksum;
                self.state = SenderState::AwaitFrame;
                Some(TxEvent::ModeSelected {
                    frame_size,
                    checksum,
                })
            }
            SenderState::AwaitAck => {
                self.timer.disarm();
                match byte {
                    ACK => {
                        self.document_bytes += self.frame_payload as u32;
                        self.seq = self.seq.wrapping_add(1);
                        if self.last_frame {
                            self.retries = 0;
                            self.send_eot();
                        } else {
                            self.state = SenderState::AwaitFrame;
                        }
                        Some(TxEvent::FrameAcked)
                    }
                    NAK => {
                        if let Err(event) = self.retry() {
                            return Some(event);
                        }
                        debug!("xmodem tx: NAK, resending frame {}", self.seq);
                        self.begin_frame();
                        None
                    }
                    _ => {
                        self.timer.arm(self.config.timeout_ms);
                        None
                    }
                }
            }
            SenderState::AwaitEotAck => match byte {
                ACK => {
                    info!("xmodem tx: complete, {} bytes", self.document_bytes);
                    self.timer.disarm();
                    self.state = SenderState::Done;
                    Some(TxEvent::Complete)
                }
                NAK => {
                    if let Err(event) = self.retry() {
                        return Some(event);
                    }
                    self.send_eot();
                    None
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Advance the ACK timeout. A lost ACK cancels the transfer.
    pub fn tick(&mut self, elapsed_ms: u32) -> Option<TxEvent> {
        if !matches!(self.state, SenderState::AwaitAck | SenderState::AwaitEotAck) {
            return None;
        }
        if !self.timer.tick(elapsed_ms) {
            return None;
        }
        warn!("xmodem tx: ACK timeout");
        self.send_cancel();
        self.state = SenderState::Failed;
        Some(TxEvent::TimedOut)
    }

    /// Next byte to transmit: control bytes first, then the frame in flight.
    pub fn next_tx_byte(&mut self) -> Option<u8> {
        if let Some(b) = self.outbox.pop() {
            return Some(b);
        }
        let byte = match self.state {
            SenderState::SendHeader => {
                self.state = SenderState::SendSequence;
                if self.frame_size == FRAME_1K {
                    STX
                } else {
                    SOH
                }
            }
            SenderState::SendSequence => {
                self.state = SenderState::SendSequenceComplement;
                self.seq
            }
            SenderState::SendSequenceComplement => {
                self.state = SenderState::SendData;
                self.cursor = 0;
                !self.seq
            }
            SenderState::SendData => {
                let b = self.buf[self.cursor];
                self.cursor += 1;
                if self.cursor == self.frame_size {
                    self.cursor = 0;
                    self.state = SenderState::SendChecksum;
                }
                b
            }
            SenderState::SendChecksum => {
                let b = self.trailer[self.cursor];
                self.cursor += 1;
                if self.cursor == self.checksum.trailer_len() {
                    self.state = SenderState::AwaitAck;
                    self.timer.arm(self.config.timeout_ms);
                }
                b
            }
            _ => return None,
        };
        Some(byte)
    }

    pub fn has_pending_tx(&self) -> bool {
        !self.outbox.is_empty()
            || matches!(
                self.state,
                SenderState::SendHeader
                    | SenderState::SendSequence
                    | SenderState::SendSequenceComplement
                    | SenderState::SendData
                    | SenderState::SendChecksum
            )
    }

    pub fn flush<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        while let Some(b) = self.next_tx_byte() {
            transport.write_blocking(b);
        }
        transport.flush();
    }
}

// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! XMODEM receiver.
//!
//! ```text
//! WaitHeader --SOH/STX--> WaitSequence --> WaitSequenceComplement --> ReceiveData
//!     ^                                          |  bad                    |
//!     |                                          v                         |
//!     +<-- CAN/EOT/ACK ------------------- BadHeader --other: NAK--> SkipFrame
//!     +-------------------------- ACK / NAK ------------------------------+
//! WaitHeader --EOT--> Done        WaitHeader --CAN--> Cancelled
//! ```
//!
//! Every failure (bad trailer, bad sequence, noise while waiting for a header)
//! counts against one retry budget. Each one is NAKed; the failure that brings
//! the count to `max_retries` also stops the session in `Failed` and reports
//! [`RxEvent::RetriesExhausted`] once. A timeout sends one NAK (or the mode
//! request again, while no frame has arrived yet) and reports
//! [`RxEvent::TimedOut`] once.
//!
//! After a bad sequence or complement the next byte is classified: CAN
//! cancels, EOT ends the transfer, ACK is ignored. Anything else is NAKed and
//! the rest of that frame is discarded silently.

use crate::transport::{Outbox, Transport};

use super::{
    Checksum, Countdown, ReceiverConfig, XmodemError, ACK, CAN, CANCEL_COUNT, CRC_MODE, EOT,
    FRAME_128, FRAME_1K, NAK, SOH, STX,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReceiverState {
    Idle,
    WaitHeader,
    WaitSequence,
    WaitSequenceComplement,
    ReceiveData,
    /// Sequence or complement was bad; the next byte decides what happens.
    BadHeader,
    /// Discarding the rest of a frame whose header was bad.
    SkipFrame,
    Done,
    Cancelled,
    Failed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RxEvent<'a> {
    /// A new frame passed validation and was ACKed.
    Frame(&'a [u8]),
    /// Sender finished with EOT.
    Done,
    /// Sender cancelled with CAN.
    Cancelled,
    RetriesExhausted,
    TimedOut,
}

pub struct Receiver<'a> {
    config: ReceiverConfig,
    buf: &'a mut [u8],
    state: ReceiverState,
    expected_seq: u8,
    seq: u8,
    frame_len: usize,
    /// Data plus trailer bytes received for the current frame.
    received: usize,
    trailer: [u8; 2],
    skip_remaining: usize,
    errors: u8,
    frames: u32,
    timer: Countdown,
    outbox: Outbox<8>,
}

impl<'a> Receiver<'a> {
    /// `buf` holds one frame: at least 128 bytes, 1024 to accept STX frames.
    pub fn new(config: ReceiverConfig, buf: &'a mut [u8]) -> Result<Self, XmodemError> {
        if buf.len() < FRAME_128 {
            return Err(XmodemError::BufferTooSmall(FRAME_128));
        }
        Ok(Self {
            config,
            buf,
            state: ReceiverState::Idle,
            expected_seq: 1,
            seq: 0,
            frame_len: FRAME_128,
            received: 0,
            trailer: [0; 2],
            skip_remaining: 0,
            errors: 0,
            frames: 0,
            timer: Countdown::default(),
            outbox: Outbox::new(),
        })
    }

    /// Begin a session: request CRC mode with 'C', checksum mode with NAK.
    pub fn start(&mut self) {
        self.state = ReceiverState::WaitHeader;
        self.expected_seq = 1;
        self.errors = 0;
        self.frames = 0;
        self.received = 0;
        self.outbox.clear();
        self.outbox.push(self.mode_request());
        self.timer.arm(self.config.timeout_ms);
    }

    fn mode_request(&self) -> u8 {
        match self.config.checksum {
            Checksum::Crc16 => CRC_MODE,
            Checksum::Sum8 => NAK,
        }
    }

    /// Abort from our side: three CANs, then stop.
    pub fn cancel(&mut self) {
        for _ in 0..CANCEL_COUNT {
            self.outbox.push(CAN);
        }
        self.state = ReceiverState::Cancelled;
        self.timer.disarm();
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn expected_sequence(&self) -> u8 {
        self.expected_seq
    }

    pub fn frames_received(&self) -> u32 {
        self.frames
    }

    pub fn retry_count(&self) -> u8 {
        self.errors
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            ReceiverState::Idle
                | ReceiverState::Done
                | ReceiverState::Cancelled
                | ReceiverState::Failed
        )
    }

    pub fn on_byte(&mut self, byte: u8) -> Option<RxEvent<'_>> {
        if self.is_finished() {
            return None;
        }
        self.timer.disarm();

        let event = match self.state {
            ReceiverState::WaitHeader => self.on_header(byte),
            ReceiverState::WaitSequence => {
                self.seq = byte;
                self.state = ReceiverState::WaitSequenceComplement;
                None
            }
            ReceiverState::WaitSequenceComplement => {
                let duplicate =
                    self.frames > 0 && self.seq == self.expected_seq.wrapping_sub(1);
                let seq_ok = self.seq == self.expected_seq || duplicate;
                if byte == !self.seq && seq_ok {
                    self.received = 0;
                    self.state = ReceiverState::ReceiveData;
                } else {
                    warn!("xmodem rx: bad sequence {} (expected {})", self.seq, self.expected_seq);
                    self.skip_remaining = self.frame_len + self.config.checksum.trailer_len();
                    self.state = ReceiverState::BadHeader;
                }
                None
            }
            ReceiverState::ReceiveData => return self.on_data(byte),
            ReceiverState::BadHeader => self.on_bad_header(byte),
            ReceiverState::SkipFrame => {
                self.skip_remaining = self.skip_remaining.saturating_sub(1);
                if self.skip_remaining == 0 {
                    self.state = ReceiverState::WaitHeader;
                }
                None
            }
            ReceiverState::Idle
            | ReceiverState::Done
            | ReceiverState::Cancelled
            | ReceiverState::Failed => None,
        };

        if !self.is_finished() {
            self.timer.arm(self.config.timeout_ms);
        }
        event
    }

    fn on_header(&mut self, byte: u8) -> Option<RxEvent<'static>> {
        match byte {
            SOH => {
                self.frame_len = FRAME_128;
                self.state = ReceiverState::WaitSequence;
                None
            }
            STX if self.buf.len() >= FRAME_1K => {
                self.frame_len = FRAME_1K;
                self.state = ReceiverState::WaitSequence;
                None
            }
            EOT => {
                info!("xmodem rx: EOT after {} frames", self.frames);
                self.outbox.push(ACK);
                self.state = ReceiverState::Done;
                Some(RxEvent::Done)
            }
            CAN => {
                warn!("xmodem rx: cancelled by sender");
                self.state = ReceiverState::Cancelled;
                Some(RxEvent::Cancelled)
            }
            ACK => None,
            _ => self.fail(),
        }
    }

    fn on_bad_header(&mut self, byte: u8) -> Option<RxEvent<'static>> {
        match byte {
            CAN | EOT | ACK => {
                self.state = ReceiverState::WaitHeader;
                self.on_header(byte)
            }
            _ => {
                self.skip_remaining = self.skip_remaining.saturating_sub(1);
                self.state = if self.skip_remaining == 0 {
                    ReceiverState::WaitHeader
                } else {
                    ReceiverState::SkipFrame
                };
                self.fail()
            }
        }
    }

    fn on_data(&mut self, byte: u8) -> Option<RxEvent<'_>> {
        let trailer_len = self.config.checksum.trailer_len();
        if self.received < self.frame_len {
            self.buf[self.received] = byte;
        } else {
            self.trailer[self.received - self.frame_len] = byte;
        }
        self.received += 1;

        if self.received < self.frame_len + trailer_len {
            self.timer.arm(self.config.timeout_ms);
            return None;
        }

        self.state = ReceiverState::WaitHeader;
        self.timer.arm(self.config.timeout_ms);
        let data = &self.buf[..self.frame_len];
        if !self.config.checksum.verify(data, &self.trailer[..trailer_len]) {
            warn!("xmodem rx: bad trailer on frame {}", self.seq);
            return self.fail();
        }

        self.outbox.push(ACK);
        self.errors = 0;
        if self.seq != self.expected_seq {
            // Our ACK for the previous frame was lost.
            debug!("xmodem rx: duplicate frame {}", self.seq);
            return None;
        }
        self.expected_seq = self.expected_seq.wrapping_add(1);
        self.frames += 1;
        Some(RxEvent::Frame(&self.buf[..self.frame_len]))
    }

    /// Count a failure and NAK it. Reaching the budget ends the session.
    fn fail(&mut self) -> Option<RxEvent<'static>> {
        self.errors = self.errors.saturating_add(1);
        self.outbox.push(NAK);
        if self.errors >= self.config.max_retries {
            warn!("xmodem rx: retries exhausted");
            self.state = ReceiverState::Failed;
            self.timer.disarm();
            return Some(RxEvent::RetriesExhausted);
        }
        None
    }

    /// Advance the timeout. Fires at most once per armed period.
    pub fn tick(&mut self, elapsed_ms: u32) -> Option<RxEvent<'static>> {
        if self.is_finished() || !self.timer.tick(elapsed_ms) {
            return None;
        }
        warn!("xmodem rx: timeout");
        self.state = ReceiverState::WaitHeader;
        self.received = 0;
        // A NAK before the first frame would switch the sender to checksum mode
        let reply = if self.frames == 0 { self.mode_request() } else { NAK };
        self.outbox.push(reply);
        Some(RxEvent::TimedOut)
    }

    pub fn next_tx_byte(&mut self) -> Option<u8> {
        self.outbox.pop()
    }

    pub fn has_pending_tx(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub fn flush<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        self.outbox.drain_into(transport);
    }
}

// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Byte-stream collaborator seen by the protocol engines.
//!
//! Receive side: the ISR pushes every byte into an [`RxQueue`] producer and the
//! main loop drains the consumer into an engine. Transmit side: engines queue
//! replies into an [`Outbox`] and expose them one byte at a time through
//! `next_tx_byte()`; the transport pulls from there when its FIFO has room.

use heapless::spsc::Queue;
use heapless::Deque;

/// Capacity of the ISR-to-main-loop receive ring.
pub const RX_QUEUE_LEN: usize = 64;

/// Single-producer (ISR) single-consumer (main loop) receive ring.
pub type RxQueue = Queue<u8, RX_QUEUE_LEN>;

/// Hardware side of the byte stream.
pub trait Transport {
    /// Tell the transport that the engine has bytes ready; it will start
    /// pulling them through the engine's `next_tx_byte`.
    fn start_transmit(&mut self);

    /// Put one byte into the peripheral, spinning only on hardware readiness.
    fn write_blocking(&mut self, byte: u8);

    /// Push out anything the peripheral buffers internally. Called after each
    /// burst, so a reply is on the wire before control leaves the bootloader.
    fn flush(&mut self) {}
}

/// Fixed-capacity queue of bytes waiting to go out.
pub struct Outbox<const N: usize> {
    bytes: Deque<u8, N>,
    overflowed: bool,
}

impl<const N: usize> Outbox<N> {
    pub const fn new() -> Self {
        Self {
            bytes: Deque::new(),
            overflowed: false,
        }
    }

    pub fn push(&mut self, byte: u8) {
        if self.bytes.push_back(byte).is_err() {
            self.overflowed = true;
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push(b);
        }
    }

    pub fn pop(&mut self) -> Option<u8> {
        self.bytes.pop_front()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// True if a push was dropped since the last call. Clears the flag.
    pub fn take_overflow(&mut self) -> bool {
        core::mem::take(&mut self.overflowed)
    }

    /// Push everything queued into `transport` with blocking writes.
    pub fn drain_into<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        while let Some(b) = self.pop() {
            transport.write_blocking(b);
        }
        transport.flush();
    }
}

impl<const N: usize> Default for Outbox<N> {
    fn default() -> Self {
        Self::new()
    }
}

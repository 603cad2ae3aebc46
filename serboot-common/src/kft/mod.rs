// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! KFT serial bootloader protocol.
//!
//! Layers, leaf first: [`packet`] wire format, [`serial`] framing and flow
//! control, [`command`] codec, [`property`] store, [`dispatch`] command
//! execution. [`CommandPump`] ties framing and dispatch together for the
//! bootloader main loop.

pub mod command;
pub mod dispatch;
pub mod packet;
pub mod property;
pub mod serial;
pub mod status;

use heapless::spsc::Consumer;

use crate::flash::Flash;
use crate::guard::InterruptGuard;
use crate::transport::Transport;

pub use dispatch::{CommandDispatcher, Memory, SystemControl};
pub use property::{MemoryRegion, PropertyStore, TargetInfo};
pub use serial::{SerialConfig, SerialEvent, SerialPacketizer};
pub use status::Status;

/// Framing layer plus dispatcher, fed from the receive ring.
pub struct CommandPump<F: Flash, M: Memory, S: SystemControl> {
    serial: SerialPacketizer,
    dispatcher: CommandDispatcher<F, M, S>,
}

impl<F: Flash, M: Memory, S: SystemControl> CommandPump<F, M, S> {
    pub fn new(config: SerialConfig, dispatcher: CommandDispatcher<F, M, S>) -> Self {
        Self {
            serial: SerialPacketizer::new(config),
            dispatcher,
        }
    }

    /// Process one received byte; any reply is queued, not sent.
    pub fn on_byte<T: Transport + ?Sized>(&mut self, byte: u8, transport: &mut T) {
        if let Some(event) = self.serial.on_byte(byte) {
            self.dispatcher.handle(event, &mut self.serial, transport);
        }
    }

    /// Drain every byte currently in the receive ring. Returns how many were
    /// processed. Starts the transmitter when replies are waiting.
    pub fn pump<T: Transport + ?Sized, const N: usize>(
        &mut self,
        rx: &mut Consumer<'_, u8, N>,
        transport: &mut T,
    ) -> usize {
        let mut count = 0;
        while let Some(byte) = rx.dequeue() {
            self.on_byte(byte, transport);
            count += 1;
        }
        if self.serial.has_pending_tx() {
            transport.start_transmit();
        }
        count
    }

    /// Advance protocol timers.
    pub fn tick(&mut self, elapsed_ms: u32) {
        self.serial.tick(elapsed_ms);
    }

    /// Byte source for an interrupt-driven transmitter.
    pub fn next_tx_byte(&mut self) -> Option<u8> {
        self.serial.next_tx_byte()
    }

    /// Send all queued bytes as one burst with interrupts masked.
    pub fn transmit<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        let _guard = InterruptGuard::new();
        self.serial.flush(transport);
    }

    pub fn serial(&self) -> &SerialPacketizer {
        &self.serial
    }

    pub fn dispatcher(&self) -> &CommandDispatcher<F, M, S> {
        &self.dispatcher
    }
}

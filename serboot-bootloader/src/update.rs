// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Update mode over USB CDC.
//!
//! The device starts in `Detect`, offering an XMODEM download by sending
//! 'C' every few seconds. The first meaningful host byte picks the session:
//! - `0x5A` (KFT start byte): a KFT command session for the rest of the boot
//! - `SOH`/`STX`: an XMODEM image download into the application area
//!
//! A failed or cancelled download drops back to `Detect`. A completed one
//! resets the chip so the new image goes through normal validation.

use crate::boot::{self, RamMemory, Rp2040System, APP_START};
use crate::flash::{RomFlash, FLASH_BASE, FLASH_PAGE_SIZE, FLASH_SIZE};
use crate::peripherals::Peripherals;
use crate::usb_transport::UsbTransport;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{OutputPin, StatefulOutputPin};
use rp2040_hal as hal;
use serboot_common::firmware::FirmwareStore;
use serboot_common::kft::packet::START_BYTE;
use serboot_common::kft::{CommandDispatcher, CommandPump, SerialConfig, SystemControl};
use serboot_common::xmodem::{Receiver, ReceiverConfig, RxEvent, FRAME_1K, SOH, STX};
use serboot_common::RxQueue;

/// An XMODEM download with no traffic for this long is abandoned.
const DOWNLOAD_IDLE_MS: u32 = 10_000;

type ImageStore = FirmwareStore<RomFlash, { FLASH_PAGE_SIZE as usize }>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// No host has spoken yet.
    Detect,
    Kft,
    Xmodem,
}

/// What one received byte did to an XMODEM download.
enum Step {
    Continue,
    /// Local failure; cancel the transfer.
    Abort,
    /// The sender gave up or cancelled.
    Failed,
    Complete,
}

/// Millisecond deltas from the free-running 1 MHz timer.
struct Millis {
    last_us: u64,
}

impl Millis {
    fn new(timer: &hal::Timer) -> Self {
        Self {
            last_us: timer.get_counter().ticks(),
        }
    }

    /// Whole milliseconds since the previous call. The sub-millisecond
    /// remainder carries over.
    fn elapsed(&mut self, timer: &hal::Timer) -> u32 {
        let now = timer.get_counter().ticks();
        let ms = now.wrapping_sub(self.last_us) / 1000;
        self.last_us += ms * 1000;
        ms as u32
    }
}

/// Enter update mode: bring up USB and serve the host.
///
/// With `window_ms` set (valid application, no forced update), a host that
/// stays silent for that long lets the application boot after all.
pub fn enter_update_mode(p: &mut Peripherals, window_ms: Option<u32>) -> ! {
    defmt::println!("Update mode, detection window {:?} ms", window_ms);

    let Some(usb) = p.usb.take() else {
        defmt::panic!("USB peripherals already taken");
    };
    let mut transport = UsbTransport::new(usb.into_bus());

    defmt::println!("USB CDC initialized, waiting for host");
    p.led_pin.set_high().ok();

    run_update_mode(p, &mut transport, window_ms)
}

fn run_update_mode(p: &mut Peripherals, usb: &mut UsbTransport, window_ms: Option<u32>) -> ! {
    let mut rx_queue = RxQueue::new();
    let (mut producer, mut consumer) = rx_queue.split();

    let dispatcher =
        CommandDispatcher::new(RomFlash, RamMemory, Rp2040System, boot::target_info());
    let mut kft = CommandPump::new(SerialConfig::default(), dispatcher);

    let mut frame_buf = [0u8; FRAME_1K];
    let Ok(mut receiver) = Receiver::new(ReceiverConfig::default(), &mut frame_buf) else {
        defmt::panic!("XMODEM frame buffer too small");
    };
    receiver.start();

    let mut store = ImageStore::new(RomFlash, APP_START, FLASH_BASE + FLASH_SIZE - APP_START);

    let mut clock = Millis::new(&p.timer);
    let mut mode = Mode::Detect;
    let mut waited_ms: u32 = 0;
    let mut idle_ms: u32 = 0;

    loop {
        usb.poll(&mut producer);
        let elapsed = clock.elapsed(&p.timer);

        match mode {
            Mode::Detect => {
                if receiver.is_finished() {
                    receiver.start();
                }

                while let Some(byte) = consumer.dequeue() {
                    match byte {
                        START_BYTE => {
                            defmt::println!("KFT host detected");
                            mode = Mode::Kft;
                            kft.on_byte(byte, usb);
                            break;
                        }
                        SOH | STX => {
                            defmt::println!("XMODEM download into 0x{:08x}", APP_START);
                            if let Err(e) = store.start(0) {
                                defmt::println!("Cannot prepare application area: {}", e);
                                receiver.cancel();
                                break;
                            }
                            mode = Mode::Xmodem;
                            idle_ms = 0;
                            receiver.on_byte(byte);
                            break;
                        }
                        // Line noise before a host speaks.
                        _ => {}
                    }
                }

                if mode == Mode::Detect {
                    waited_ms = waited_ms.saturating_add(elapsed);
                    if window_ms.is_some_and(|w| waited_ms >= w) {
                        defmt::println!("No host within {} ms", waited_ms);
                        boot::jump_to_application(&mut p.timer);
                    }
                    if let Some(RxEvent::TimedOut) = receiver.tick(elapsed) {
                        // Keep offering the download
                        receiver.start();
                    }
                }
            }
            Mode::Kft => {
                kft.pump(&mut consumer, usb);
                kft.tick(elapsed);
                if usb.take_transmit_request() || kft.serial().has_pending_tx() {
                    kft.transmit(usb);
                }
            }
            Mode::Xmodem => {
                idle_ms = idle_ms.saturating_add(elapsed);
                while let Some(byte) = consumer.dequeue() {
                    idle_ms = 0;
                    let step = match receiver.on_byte(byte) {
                        Some(RxEvent::Frame(data)) => match store.store_bytes(data) {
                            Ok(()) => {
                                p.led_pin.toggle().ok();
                                Step::Continue
                            }
                            Err(e) => {
                                defmt::println!("Image store failed: {}", e);
                                Step::Abort
                            }
                        },
                        Some(RxEvent::Done) => Step::Complete,
                        Some(RxEvent::Cancelled) | Some(RxEvent::RetriesExhausted) => Step::Failed,
                        Some(RxEvent::TimedOut) | None => Step::Continue,
                    };

                    match step {
                        Step::Continue => continue,
                        Step::Abort => receiver.cancel(),
                        Step::Failed => {
                            defmt::println!("Download failed after {} frames", receiver.frames_received())
                        }
                        Step::Complete => {
                            receiver.flush(usb);
                            finish_download(p, &mut store);
                        }
                    }
                    mode = Mode::Detect;
                    waited_ms = 0;
                    break;
                }

                if mode == Mode::Xmodem {
                    receiver.tick(elapsed);
                    if idle_ms >= DOWNLOAD_IDLE_MS {
                        defmt::println!("Download stalled, cancelling");
                        receiver.cancel();
                        mode = Mode::Detect;
                        waited_ms = 0;
                    }
                }
            }
        }

        if receiver.has_pending_tx() {
            receiver.flush(usb);
        }
    }
}

/// Write the tail of a completed download, then reboot into it. On failure
/// the caller returns to detection.
fn finish_download(p: &mut Peripherals, store: &mut ImageStore) {
    match store.finish() {
        Ok(size) => {
            defmt::println!("Download complete: {} bytes, rebooting", size);
            // Give the host time to collect the final ACK.
            p.timer.delay_ms(50u32);
            Rp2040System.reset()
        }
        Err(e) => defmt::println!("Finishing image failed: {}", e),
    }
}

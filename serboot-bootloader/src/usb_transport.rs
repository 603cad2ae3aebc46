// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! USB CDC byte stream for the protocol engines.
//!
//! Received bytes go into the [`RxQueue`](serboot_common::RxQueue) producer on
//! every poll. Outgoing bytes are collected one at a time through the
//! [`Transport`] impl and written to the CDC endpoint in packet-sized bursts.

use heapless::spsc::Producer;
use heapless::Vec;
use rp2040_hal::usb::UsbBus;
use serboot_common::Transport;
use usb_device::class_prelude::UsbBusAllocator;
use usb_device::prelude::*;
use usbd_serial::SerialPort;

/// Full-speed bulk endpoint size.
const USB_PACKET_SIZE: usize = 64;

pub struct UsbTransport {
    serial: SerialPort<'static, UsbBus>,
    usb_dev: UsbDevice<'static, UsbBus>,
    tx_buf: Vec<u8, USB_PACKET_SIZE>,
    tx_requested: bool,
}

impl UsbTransport {
    pub fn new(usb_bus: &'static UsbBusAllocator<UsbBus>) -> Self {
        let serial = SerialPort::new(usb_bus);
        let builder = UsbDeviceBuilder::new(usb_bus, UsbVidPid(0x2E8A, 0x000A));
        let builder = match builder.strings(&[StringDescriptors::default()
            .manufacturer("ADNT")
            .product("Serboot Bootloader")
            .serial_number("0001")])
        {
            Ok(b) => b,
            Err(_) => defmt::panic!("USB string descriptors rejected"),
        };
        let usb_dev = builder.device_class(usbd_serial::USB_CLASS_CDC).build();

        Self {
            serial,
            usb_dev,
            tx_buf: Vec::new(),
            tx_requested: false,
        }
    }

    /// Poll the USB device and move any received bytes into `rx`.
    /// Must be called frequently. Returns true if bytes were queued.
    pub fn poll<const N: usize>(&mut self, rx: &mut Producer<'_, u8, N>) -> bool {
        if !self.usb_dev.poll(&mut [&mut self.serial]) {
            return false;
        }

        let mut tmp = [0u8; USB_PACKET_SIZE];
        let count = match self.serial.read(&mut tmp) {
            Ok(count) => count,
            Err(_) => return false,
        };
        for &byte in &tmp[..count] {
            if rx.enqueue(byte).is_err() {
                defmt::warn!("rx queue full, dropping byte 0x{:02x}", byte);
            }
        }
        count > 0
    }

    /// True once an engine has asked for its output to be sent.
    pub fn take_transmit_request(&mut self) -> bool {
        core::mem::take(&mut self.tx_requested)
    }
}

impl Transport for UsbTransport {
    fn start_transmit(&mut self) {
        self.tx_requested = true;
    }

    fn write_blocking(&mut self, byte: u8) {
        if self.tx_buf.is_full() {
            self.flush();
        }
        // Cannot fail: the buffer was just drained if it was full.
        let _ = self.tx_buf.push(byte);
    }

    /// Write everything buffered so far to the CDC endpoint.
    fn flush(&mut self) {
        let mut offset = 0;
        while offset < self.tx_buf.len() {
            match self.serial.write(&self.tx_buf[offset..]) {
                Ok(n) => offset += n,
                Err(UsbError::WouldBlock) => {
                    self.usb_dev.poll(&mut [&mut self.serial]);
                }
                Err(_) => break,
            }
        }
        self.tx_buf.clear();
    }
}

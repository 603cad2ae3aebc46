// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Peripheral initialization for the bootloader.

use rp2040_hal as hal;
use rp2040_hal::usb::UsbBus;
use usb_device::class_prelude::UsbBusAllocator;

pub type LedPin =
    hal::gpio::Pin<hal::gpio::bank0::Gpio25, hal::gpio::FunctionSioOutput, hal::gpio::PullDown>;
/// Update pin: held low at reset to stay in the bootloader.
pub type UpdatePin =
    hal::gpio::Pin<hal::gpio::bank0::Gpio2, hal::gpio::FunctionSioInput, hal::gpio::PullUp>;

/// On-board crystal.
const XOSC_HZ: u32 = 12_000_000;

/// Static storage for UsbBusAllocator (required by usb-device for 'static lifetime).
static mut USB_BUS: Option<UsbBusAllocator<UsbBus>> = None;

pub struct Peripherals {
    pub led_pin: LedPin,
    pub update_pin: UpdatePin,
    pub timer: hal::Timer,
    pub usb: Option<UsbPeripherals>,
}

/// USB controller resources, held until update mode needs them.
pub struct UsbPeripherals {
    regs: hal::pac::USBCTRL_REGS,
    dpram: hal::pac::USBCTRL_DPRAM,
    clock: hal::clocks::UsbClock,
    resets: hal::pac::RESETS,
}

impl UsbPeripherals {
    /// Bring up the USB controller and park the bus allocator in static
    /// storage. Consumes the peripherals, so it can only happen once.
    pub fn into_bus(mut self) -> &'static UsbBusAllocator<UsbBus> {
        let bus = UsbBusAllocator::new(UsbBus::new(
            self.regs,
            self.dpram,
            self.clock,
            true,
            &mut self.resets,
        ));
        // SAFETY: `self` is unique, so this runs at most once and nothing
        // else holds a reference into USB_BUS.
        unsafe { (*core::ptr::addr_of_mut!(USB_BUS)).insert(bus) }
    }
}

pub fn init() -> Peripherals {
    let mut pac = unsafe { hal::pac::Peripherals::steal() };

    let mut watchdog = hal::Watchdog::new(pac.WATCHDOG);
    let Ok(clocks) = hal::clocks::init_clocks_and_plls(
        XOSC_HZ,
        pac.XOSC,
        pac.CLOCKS,
        pac.PLL_SYS,
        pac.PLL_USB,
        &mut pac.RESETS,
        &mut watchdog,
    ) else {
        defmt::panic!("clock init failed");
    };

    let timer = hal::Timer::new(pac.TIMER, &mut pac.RESETS, &clocks);
    let sio = hal::Sio::new(pac.SIO);
    let pins = hal::gpio::Pins::new(
        pac.IO_BANK0,
        pac.PADS_BANK0,
        sio.gpio_bank0,
        &mut pac.RESETS,
    );

    Peripherals {
        led_pin: pins.gpio25.into_push_pull_output(),
        update_pin: pins.gpio2.into_pull_up_input(),
        timer,
        usb: Some(UsbPeripherals {
            regs: pac.USBCTRL_REGS,
            dpram: pac.USBCTRL_DPRAM,
            clock: clocks.usb_clock,
            resets: pac.RESETS,
        }),
    }
}

// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Serboot: KFT/XMODEM serial bootloader for RP2040 over USB CDC.

#![no_std]
#![no_main]

mod boot;
mod flash;
mod peripherals;
mod update;
mod usb_transport;

use defmt_rtt as _;
use embedded_hal::digital::InputPin;
use panic_probe as _;
use serboot_common::kft::property::BootloaderConfig;

defmt::timestamp!("{=u64:us}", { 0 });

use cortex_m_rt::entry;

#[unsafe(link_section = ".boot2")]
#[used]
pub static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_GENERIC_03H;

#[entry]
fn main() -> ! {
    defmt::println!("Bootloader init");

    let mut p = peripherals::init();
    flash::init();

    let config = BootloaderConfig::load(&flash::RomFlash, boot::APP_START);
    let forced = p.update_pin.is_low().unwrap_or(false);
    let app_valid = boot::validate_application(&config);

    defmt::println!(
        "update pin low={}, app valid={}, configured={}",
        forced,
        app_valid,
        config.is_configured()
    );

    if !forced && app_valid {
        match config.detection_timeout_ms() {
            Some(ms) if ms > 0 => update::enter_update_mode(&mut p, Some(u32::from(ms))),
            _ => boot::jump_to_application(&mut p.timer),
        }
    }

    update::enter_update_mode(&mut p, None)
}

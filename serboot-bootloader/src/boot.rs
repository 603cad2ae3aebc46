// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Boot management: memory layout, application validation, and handoff.
//!
//! Also hosts the target hooks the KFT dispatcher needs for RAM access and
//! for the Execute/Call/Reset commands.

use crate::flash::{self, FLASH_BASE, FLASH_SIZE};
use serboot_common::kft::property::{BootloaderConfig, PERIPHERAL_UART};
use serboot_common::kft::{Memory, MemoryRegion, SystemControl, TargetInfo};

/// First byte of the application image (its vector table).
pub const APP_START: u32 = 0x1001_0000;

const RAM_START: u32 = 0x2000_0000;
/// One past the last SRAM byte, striped banks plus the two scratch banks.
const RAM_END: u32 = 0x2004_2000;
/// RAM the host may read and write. The bootloader's own RAM sits above it.
const HOST_RAM_SIZE: u32 = 0x3_0000;

/// Board facts reported through the property store.
pub fn target_info() -> TargetInfo {
    TargetInfo {
        ram: MemoryRegion::new(RAM_START, HOST_RAM_SIZE),
        app_start: APP_START,
        // USB CDC shows up to the host as a plain serial port.
        peripherals: PERIPHERAL_UART,
    }
}

struct VectorTable {
    initial_sp: u32,
    reset_vector: u32,
}

impl VectorTable {
    unsafe fn read_from(addr: u32) -> Self {
        Self {
            initial_sp: (addr as *const u32).read_volatile(),
            reset_vector: (addr as *const u32).offset(1).read_volatile(),
        }
    }

    /// Stack in SRAM, reset handler a Thumb address inside the app area.
    fn is_valid_for_flash_execution(&self) -> bool {
        let handler = self.reset_vector & !1;
        (RAM_START..=RAM_END).contains(&self.initial_sp)
            && self.reset_vector & 1 == 1
            && (APP_START..FLASH_BASE + FLASH_SIZE).contains(&handler)
    }
}

/// Check the application's vector table and, when the configuration block
/// names a CRC range, the CRC-32 over that range.
pub fn validate_application(config: &BootloaderConfig) -> bool {
    let vt = unsafe { VectorTable::read_from(APP_START) };
    if !vt.is_valid_for_flash_execution() {
        defmt::println!(
            "No valid application: sp=0x{:08x} reset=0x{:08x}",
            vt.initial_sp,
            vt.reset_vector
        );
        return false;
    }

    if config.crc_byte_count == u32::MAX {
        return true;
    }

    let start = config.crc_start_address;
    let in_flash = start >= FLASH_BASE
        && start
            .checked_add(config.crc_byte_count)
            .is_some_and(|end| end <= FLASH_BASE + FLASH_SIZE);
    if !in_flash {
        defmt::println!(
            "CRC range 0x{:08x}+{} outside flash",
            start,
            config.crc_byte_count
        );
        return false;
    }

    let actual_crc = flash::compute_crc32(start, config.crc_byte_count);
    if actual_crc != config.crc_expected_value {
        defmt::println!(
            "CRC mismatch at 0x{:08x}: expected 0x{:08x}, got 0x{:08x}",
            start,
            config.crc_expected_value,
            actual_crc
        );
        return false;
    }

    true
}

/// Prepare the system for firmware handoff.
/// Clocks are left configured; the application re-initializes them.
unsafe fn prepare_for_firmware_handoff() {
    // Disable all interrupts
    cortex_m::interrupt::disable();

    // Clear all pending interrupts in NVIC
    const NVIC_ICPR: *mut u32 = 0xE000_E280 as *mut u32;
    NVIC_ICPR.write_volatile(0xFFFF_FFFF);

    // Disable all NVIC interrupts
    const NVIC_ICER: *mut u32 = 0xE000_E180 as *mut u32;
    NVIC_ICER.write_volatile(0xFFFF_FFFF);
}

/// Hold the USB controller in reset so the application enumerates from a
/// clean state. A no-op if update mode never brought USB up.
unsafe fn reset_usb_controller() {
    const RESETS_SET: *mut u32 = (0x4000_C000 + 0x2000) as *mut u32;
    const USBCTRL_RESET_BIT: u32 = 1 << 24;
    RESETS_SET.write_volatile(USBCTRL_RESET_BIT);
}

unsafe fn relocate_vector_table(base: u32) {
    const SCB_VTOR: *mut u32 = 0xE000_ED08 as *mut u32;
    SCB_VTOR.write_volatile(base);

    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

unsafe fn jump_to_firmware(initial_sp: u32, reset_vector: u32) -> ! {
    core::arch::asm!(
        "msr msp, {sp}",
        "cpsie i",  // Re-enable interrupts before jumping (SDK expects PRIMASK=0)
        "bx {reset}",
        sp = in(reg) initial_sp,
        reset = in(reg) reset_vector,
        options(noreturn)
    );
}

/// Hand control to the application at [`APP_START`]. Only call after
/// [`validate_application`] succeeded.
pub fn jump_to_application(timer: &mut rp2040_hal::Timer) -> ! {
    use embedded_hal::delay::DelayNs;

    defmt::println!("Jumping to application at 0x{:08x}", APP_START);
    // Let RTT drain before the application takes over.
    timer.delay_ms(10u32);

    unsafe {
        prepare_for_firmware_handoff();
        reset_usb_controller();
        relocate_vector_table(APP_START);
        let vt = VectorTable::read_from(APP_START);
        jump_to_firmware(vt.initial_sp, vt.reset_vector)
    }
}

// =============================================================================
// Dispatcher hooks
// =============================================================================

/// Direct SRAM access. The dispatcher range-checks every address first.
#[derive(Debug, Clone, Copy, Default)]
pub struct RamMemory;

impl Memory for RamMemory {
    fn read(&self, addr: u32, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = unsafe { ((addr + i as u32) as *const u8).read_volatile() };
        }
    }

    fn write(&mut self, addr: u32, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            unsafe { ((addr + i as u32) as *mut u8).write_volatile(byte) };
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Rp2040System;

impl SystemControl for Rp2040System {
    fn reset(&mut self) -> ! {
        cortex_m::peripheral::SCB::sys_reset()
    }

    fn execute(&mut self, entry: u32, arg: u32, stack_pointer: u32) -> ! {
        defmt::println!(
            "Execute 0x{:08x}(0x{:08x}) sp=0x{:08x}",
            entry,
            arg,
            stack_pointer
        );
        unsafe {
            prepare_for_firmware_handoff();
            if stack_pointer != 0 {
                core::arch::asm!(
                    "msr msp, {sp}",
                    "cpsie i",
                    "bx {entry}",
                    sp = in(reg) stack_pointer,
                    entry = in(reg) entry | 1,
                    in("r0") arg,
                    options(noreturn)
                );
            } else {
                core::arch::asm!(
                    "cpsie i",
                    "bx {entry}",
                    entry = in(reg) entry | 1,
                    in("r0") arg,
                    options(noreturn)
                );
            }
        }
    }

    fn call(&mut self, entry: u32, arg: u32) -> u32 {
        // SAFETY: the host vouches for `entry` being a function taking and
        // returning one word under the C ABI. Bit 0 selects Thumb state.
        let f = unsafe {
            core::mem::transmute::<usize, extern "C" fn(u32) -> u32>((entry | 1) as usize)
        };
        f(arg)
    }
}

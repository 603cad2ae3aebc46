// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Property store: the bootloader's capabilities and memory geometry as seen
//! by the host through GetProperty / SetProperty.

use crate::flash::{Flash, FlashInfo};

use super::packet::Version;
use super::status::Status;

/// Bootloader version reported by `CurrentVersion`.
pub const BOOTLOADER_VERSION: Version = Version::new(b'k', 1, 0, 0);

/// Target build version reported by `TargetVersion`.
pub const TARGET_VERSION: Version = Version::new(b'T', 1, 0, 0);

/// Flash block = this many sectors.
pub const SECTORS_PER_BLOCK: u32 = 4;

/// Highest accepted `FlashReadMargin` value.
pub const MAX_READ_MARGIN: u32 = 2;

/// `FlashSecurityState` is fixed.
pub const FLASH_SECURITY_STATE: u32 = 1;

// --- Available peripherals bitmask ---

pub const PERIPHERAL_UART: u32 = 1 << 0;
pub const PERIPHERAL_I2C: u32 = 1 << 1;
pub const PERIPHERAL_SPI: u32 = 1 << 2;
pub const PERIPHERAL_CAN: u32 = 1 << 3;
pub const PERIPHERAL_USB_HID: u32 = 1 << 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum PropertyTag {
    CurrentVersion = 0x01,
    AvailablePeripherals = 0x02,
    FlashStartAddress = 0x03,
    FlashSizeInBytes = 0x04,
    FlashSectorSize = 0x05,
    FlashBlockCount = 0x06,
    AvailableCommands = 0x07,
    VerifyWrites = 0x0A,
    MaxPacketSize = 0x0B,
    ReservedRegions = 0x0C,
    RamStartAddress = 0x0E,
    RamSizeInBytes = 0x0F,
    FlashSecurityState = 0x11,
    FlashReadMargin = 0x16,
    TargetVersion = 0x18,
}

impl PropertyTag {
    pub fn from_u32(v: u32) -> Option<Self> {
        use PropertyTag::*;
        Some(match v {
            0x01 => CurrentVersion,
            0x02 => AvailablePeripherals,
            0x03 => FlashStartAddress,
            0x04 => FlashSizeInBytes,
            0x05 => FlashSectorSize,
            0x06 => FlashBlockCount,
            0x07 => AvailableCommands,
            0x0A => VerifyWrites,
            0x0B => MaxPacketSize,
            0x0C => ReservedRegions,
            0x0E => RamStartAddress,
            0x0F => RamSizeInBytes,
            0x11 => FlashSecurityState,
            0x16 => FlashReadMargin,
            0x18 => TargetVersion,
            _ => return None,
        })
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Self::VerifyWrites | Self::FlashReadMargin)
    }
}

/// A contiguous address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MemoryRegion {
    pub start: u32,
    pub size: u32,
}

impl MemoryRegion {
    pub const fn new(start: u32, size: u32) -> Self {
        Self { start, size }
    }

    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.size)
    }

    /// True if `addr..addr + len` lies entirely inside this region.
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.start && end <= self.end(),
            None => false,
        }
    }

    pub fn overlaps(&self, addr: u32, len: u32) -> bool {
        if self.size == 0 || len == 0 {
            return false;
        }
        let end = addr.saturating_add(len);
        addr < self.end() && end > self.start
    }

    /// `[start, end]` with an inclusive end, `[0, 0]` when empty.
    pub fn as_inclusive(&self) -> [u32; 2] {
        if self.size == 0 {
            [0, 0]
        } else {
            [self.start, self.end() - 1]
        }
    }
}

impl From<FlashInfo> for MemoryRegion {
    fn from(info: FlashInfo) -> Self {
        Self::new(info.start, info.size)
    }
}

/// Board facts the property store cannot learn from the flash driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TargetInfo {
    pub ram: MemoryRegion,
    /// First application address; everything below it in flash is reserved.
    pub app_start: u32,
    /// `PERIPHERAL_*` bits.
    pub peripherals: u32,
}

// --- Persisted configuration ---

/// Offset of the configuration block inside the application image.
pub const CONFIG_OFFSET: u32 = 0x3C0;
pub const CONFIG_LEN: usize = 64;
/// `'kcfg'` read as a little-endian word.
pub const CONFIG_TAG: u32 = u32::from_le_bytes(*b"kcfg");

/// Configuration block stored in the application's vector-table region.
///
/// An unrecognized tag yields the all-ones pattern, so every field reads as
/// "not configured".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootloaderConfig {
    pub tag: u32,
    pub crc_start_address: u32,
    pub crc_byte_count: u32,
    pub crc_expected_value: u32,
    pub enabled_peripherals: u8,
    pub i2c_slave_address: u8,
    pub peripheral_detection_timeout_ms: u16,
    pub usb_vid: u16,
    pub usb_pid: u16,
    pub usb_strings_pointer: u32,
    pub clock_flags: u8,
    pub clock_divider: u8,
    pub boot_flags: u8,
}

impl BootloaderConfig {
    pub fn unconfigured() -> Self {
        Self::decode(&[0xFF; CONFIG_LEN])
    }

    pub fn decode(raw: &[u8; CONFIG_LEN]) -> Self {
        let u32_at = |o: usize| u32::from_le_bytes([raw[o], raw[o + 1], raw[o + 2], raw[o + 3]]);
        let u16_at = |o: usize| u16::from_le_bytes([raw[o], raw[o + 1]]);
        Self {
            tag: u32_at(0),
            crc_start_address: u32_at(4),
            crc_byte_count: u32_at(8),
            crc_expected_value: u32_at(12),
            enabled_peripherals: raw[16],
            i2c_slave_address: raw[17],
            peripheral_detection_timeout_ms: u16_at(18),
            usb_vid: u16_at(20),
            usb_pid: u16_at(22),
            usb_strings_pointer: u32_at(24),
            clock_flags: raw[28],
            clock_divider: raw[29],
            boot_flags: raw[30],
        }
    }

    /// Read the block from flash. A missing or untagged block is unconfigured.
    pub fn load<F: Flash + ?Sized>(flash: &F, app_start: u32) -> Self {
        let mut raw = [0xFFu8; CONFIG_LEN];
        let addr = app_start.wrapping_add(CONFIG_OFFSET);
        if !flash.info().contains(addr, CONFIG_LEN as u32) || flash.read(addr, &mut raw).is_err() {
            return Self::unconfigured();
        }
        let cfg = Self::decode(&raw);
        if cfg.tag == CONFIG_TAG {
            cfg
        } else {
            warn!("property: no configuration block at 0x{:08x}", addr);
            Self::unconfigured()
        }
    }

    pub fn is_configured(&self) -> bool {
        self.tag == CONFIG_TAG
    }

    /// Host detection window, `None` when unset.
    pub fn detection_timeout_ms(&self) -> Option<u16> {
        match self.peripheral_detection_timeout_ms {
            0xFFFF => None,
            ms => Some(ms),
        }
    }
}

/// Value returned by a property read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyValue {
    Word(u32),
    /// Flash then RAM reserved region, each `[start, end]` inclusive.
    Regions([u32; 4]),
}

impl PropertyValue {
    pub fn words(&self) -> &[u32] {
        match self {
            Self::Word(w) => core::slice::from_ref(w),
            Self::Regions(r) => r,
        }
    }
}

pub struct PropertyStore {
    bootloader_version: Version,
    target_version: Version,
    available_peripherals: u32,
    available_commands: u32,
    flash: MemoryRegion,
    flash_sector_size: u32,
    flash_block_size: u32,
    flash_block_count: u32,
    ram: MemoryRegion,
    reserved_flash: MemoryRegion,
    reserved_ram: MemoryRegion,
    verify_writes: bool,
    flash_read_margin: u32,
    config: BootloaderConfig,
}

impl PropertyStore {
    /// Build the store from compile-time constants, the flash driver's
    /// geometry and the persisted configuration block, in that order.
    pub fn new<F: Flash + ?Sized>(flash: &F, target: &TargetInfo, available_commands: u32) -> Self {
        let info = flash.info();
        let flash_block_size = info.sector_size * SECTORS_PER_BLOCK;
        let flash_block_count = if flash_block_size == 0 {
            0
        } else {
            info.size / flash_block_size
        };
        let reserved_len = target.app_start.saturating_sub(info.start).min(info.size);

        let store = Self {
            bootloader_version: BOOTLOADER_VERSION,
            target_version: TARGET_VERSION,
            available_peripherals: target.peripherals,
            available_commands,
            flash: info.into(),
            flash_sector_size: info.sector_size,
            flash_block_size,
            flash_block_count,
            ram: target.ram,
            reserved_flash: MemoryRegion::new(info.start, reserved_len),
            reserved_ram: MemoryRegion::default(),
            verify_writes: true,
            flash_read_margin: 0,
            config: BootloaderConfig::load(flash, target.app_start),
        };
        debug!(
            "property: flash 0x{:08x}+{} ram 0x{:08x}+{}",
            store.flash.start, store.flash.size, store.ram.start, store.ram.size
        );
        store
    }

    /// Read a property. `max_packet_size` is the framing layer's live value.
    pub fn get(&self, tag: u32, max_packet_size: u32) -> Result<PropertyValue, Status> {
        use PropertyValue::Word;
        let tag = PropertyTag::from_u32(tag).ok_or(Status::UnknownProperty)?;
        Ok(match tag {
            PropertyTag::CurrentVersion => Word(self.bootloader_version.as_u32()),
            PropertyTag::AvailablePeripherals => Word(self.available_peripherals),
            PropertyTag::FlashStartAddress => Word(self.flash.start),
            PropertyTag::FlashSizeInBytes => Word(self.flash.size),
            PropertyTag::FlashSectorSize => Word(self.flash_sector_size),
            PropertyTag::FlashBlockCount => Word(self.flash_block_count),
            PropertyTag::AvailableCommands => Word(self.available_commands),
            PropertyTag::VerifyWrites => Word(self.verify_writes as u32),
            PropertyTag::MaxPacketSize => Word(max_packet_size),
            PropertyTag::ReservedRegions => {
                let [fs, fe] = self.reserved_flash.as_inclusive();
                let [rs, re] = self.reserved_ram.as_inclusive();
                PropertyValue::Regions([fs, fe, rs, re])
            }
            PropertyTag::RamStartAddress => Word(self.ram.start),
            PropertyTag::RamSizeInBytes => Word(self.ram.size),
            PropertyTag::FlashSecurityState => Word(FLASH_SECURITY_STATE),
            PropertyTag::FlashReadMargin => Word(self.flash_read_margin),
            PropertyTag::TargetVersion => Word(self.target_version.as_u32()),
        })
    }

    /// Write a property. The store is untouched unless this returns `Ok`.
    pub fn set(&mut self, tag: u32, value: u32) -> Result<(), Status> {
        let tag = PropertyTag::from_u32(tag).ok_or(Status::UnknownProperty)?;
        match tag {
            PropertyTag::VerifyWrites => {
                if value > 1 {
                    return Err(Status::InvalidPropertyValue);
                }
                self.verify_writes = value == 1;
            }
            PropertyTag::FlashReadMargin => {
                if value > MAX_READ_MARGIN {
                    return Err(Status::InvalidPropertyValue);
                }
                self.flash_read_margin = value;
            }
            _ => return Err(Status::ReadOnlyProperty),
        }
        info!("property: set {} = {}", tag as u32, value);
        Ok(())
    }

    pub fn verify_writes(&self) -> bool {
        self.verify_writes
    }

    pub fn flash_region(&self) -> MemoryRegion {
        self.flash
    }

    pub fn flash_sector_size(&self) -> u32 {
        self.flash_sector_size
    }

    pub fn flash_block_size(&self) -> u32 {
        self.flash_block_size
    }

    pub fn ram_region(&self) -> MemoryRegion {
        self.ram
    }

    pub fn reserved_flash(&self) -> MemoryRegion {
        self.reserved_flash
    }

    pub fn config(&self) -> &BootloaderConfig {
        &self.config
    }
}

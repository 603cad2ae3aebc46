// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command-line interface definitions.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use serboot_common::kft::property::PropertyTag;

use crate::commands;
use crate::transport::{Transport, DEFAULT_BAUD, DEFAULT_TIMEOUT_MS};

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "serboot-upload")]
#[command(about = "Host tool for the serboot KFT/XMODEM bootloader")]
pub struct Cli {
    /// Serial port (e.g., /dev/ttyACM0)
    #[arg(short, long)]
    pub port: String,

    /// Baud rate (ignored by USB CDC devices)
    #[arg(short, long, default_value_t = DEFAULT_BAUD)]
    pub baud: u32,

    /// Response timeout in milliseconds
    #[arg(short, long, default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout: u64,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands. Numbers accept a `0x` prefix.
#[derive(Subcommand)]
pub enum Commands {
    /// Check that the bootloader answers and show its protocol version
    Ping,

    /// Read a property by name (e.g. max-packet-size) or tag number
    GetProperty {
        #[arg(value_name = "PROPERTY", value_parser = parse_property)]
        tag: u32,
    },

    /// Change a writable property
    SetProperty {
        #[arg(value_name = "PROPERTY", value_parser = parse_property)]
        tag: u32,
        #[arg(value_name = "VALUE", value_parser = parse_u32)]
        value: u32,
    },

    /// Erase a sector-aligned flash range
    EraseRegion {
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32)]
        length: u32,
    },

    /// Erase all application flash
    EraseAll,

    /// Write a binary file to flash or RAM
    WriteMemory {
        #[arg(value_parser = parse_u32)]
        address: u32,

        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Erase the covered flash sectors first
        #[arg(short, long)]
        erase: bool,
    },

    /// Read memory to a file, or dump it as hex
    ReadMemory {
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32)]
        length: u32,

        /// Output file
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Fill a range with a repeated 32-bit pattern
    FillMemory {
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32)]
        length: u32,
        #[arg(value_parser = parse_u32)]
        pattern: u32,
    },

    /// Jump to an address; the bootloader does not come back
    Execute {
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32, default_value = "0")]
        arg: u32,
        /// Initial stack pointer, 0 to keep the current one
        #[arg(long, value_parser = parse_u32, default_value = "0")]
        stack_pointer: u32,
    },

    /// Call a function and print the status it returns
    Call {
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32, default_value = "0")]
        arg: u32,
    },

    /// Reset the device
    Reset,

    /// Send an image with XMODEM (device must be waiting for a download)
    XmodemSend {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

/// Decimal or `0x`-prefixed hexadecimal.
pub fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

const PROPERTY_NAMES: [(&str, PropertyTag); 15] = [
    ("current-version", PropertyTag::CurrentVersion),
    ("available-peripherals", PropertyTag::AvailablePeripherals),
    ("flash-start-address", PropertyTag::FlashStartAddress),
    ("flash-size", PropertyTag::FlashSizeInBytes),
    ("flash-sector-size", PropertyTag::FlashSectorSize),
    ("flash-block-count", PropertyTag::FlashBlockCount),
    ("available-commands", PropertyTag::AvailableCommands),
    ("verify-writes", PropertyTag::VerifyWrites),
    ("max-packet-size", PropertyTag::MaxPacketSize),
    ("reserved-regions", PropertyTag::ReservedRegions),
    ("ram-start-address", PropertyTag::RamStartAddress),
    ("ram-size", PropertyTag::RamSizeInBytes),
    ("flash-security-state", PropertyTag::FlashSecurityState),
    ("flash-read-margin", PropertyTag::FlashReadMargin),
    ("target-version", PropertyTag::TargetVersion),
];

/// Property name or raw tag number.
pub fn parse_property(s: &str) -> Result<u32, String> {
    if let Some((_, tag)) = PROPERTY_NAMES.iter().find(|(name, _)| *name == s) {
        return Ok(*tag as u32);
    }
    parse_u32(s).map_err(|_| {
        let names: Vec<&str> = PROPERTY_NAMES.iter().map(|(n, _)| *n).collect();
        format!("unknown property '{}' (expected a tag number or one of: {})", s, names.join(", "))
    })
}

/// Execute the parsed CLI command.
pub fn run(cli: Cli) -> Result<()> {
    let mut transport = Transport::new(&cli.port, cli.baud, cli.timeout)?;

    match cli.command {
        Commands::Ping => commands::ping(&mut transport),
        Commands::GetProperty { tag } => commands::get_property(&mut transport, tag),
        Commands::SetProperty { tag, value } => commands::set_property(&mut transport, tag, value),
        Commands::EraseRegion { address, length } => {
            commands::erase_region(&mut transport, address, length)
        }
        Commands::EraseAll => commands::erase_all(&mut transport),
        Commands::WriteMemory {
            address,
            file,
            erase,
        } => commands::write_memory(&mut transport, address, &file, erase),
        Commands::ReadMemory {
            address,
            length,
            output,
        } => commands::read_memory(&mut transport, address, length, output.as_deref()),
        Commands::FillMemory {
            address,
            length,
            pattern,
        } => commands::fill_memory(&mut transport, address, length, pattern),
        Commands::Execute {
            address,
            arg,
            stack_pointer,
        } => commands::execute(&mut transport, address, arg, stack_pointer),
        Commands::Call { address, arg } => commands::call(&mut transport, address, arg),
        Commands::Reset => commands::reset(&mut transport),
        Commands::XmodemSend { file } => commands::xmodem_send(&mut transport, &file),
    }
}

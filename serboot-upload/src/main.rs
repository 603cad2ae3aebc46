// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Host tool for the serboot bootloader over a serial port.
//!
//! Usage:
//!   serboot-upload --port /dev/ttyACM0 ping
//!   serboot-upload --port /dev/ttyACM0 get-property max-packet-size
//!   serboot-upload --port /dev/ttyACM0 write-memory 0x10010000 app.bin --erase
//!   serboot-upload --port /dev/ttyACM0 xmodem-send app.bin
//!   serboot-upload --port /dev/ttyACM0 reset

mod cli;
mod commands;
mod framing;
mod transport;

use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    cli::run(args)
}

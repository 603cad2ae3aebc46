// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command implementations for bootloader operations.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use crc::{Crc, CRC_32_ISO_HDLC};
use indicatif::{ProgressBar, ProgressStyle};

use serboot_common::kft::command::{Command, CommandTag, Response};
use serboot_common::kft::packet::Version;
use serboot_common::kft::property::PropertyTag;
use serboot_common::xmodem::{Sender, SenderConfig, SenderState, TxEvent, FRAME_1K};
use serboot_common::Status;

use crate::transport::Transport;

/// Same CRC the bootloader checks the application image against.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Poll interval while an XMODEM transfer waits for the receiver.
const XMODEM_POLL_MS: u64 = 100;

fn progress_bar(len: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Status code with its name when it is one we know.
fn describe(status: u32) -> String {
    match Status::from_code(status) {
        Some(s) => format!("{:?} ({})", s, status),
        None => status.to_string(),
    }
}

fn expect_success(response: &Response, what: &str) -> Result<()> {
    if response.status() != Status::Success.code() {
        bail!("{} failed: {}", what, describe(response.status()));
    }
    Ok(())
}

fn format_version(v: Version) -> String {
    let name = if v.name.is_ascii_graphic() {
        (v.name as char).to_string()
    } else {
        format!("0x{:02x}", v.name)
    };
    format!("{}{}.{}.{}", name, v.major, v.minor, v.bugfix)
}

/// Ask the device for its packet size limit and use it for data phases.
fn negotiate_packet_size(transport: &mut Transport) -> Result<()> {
    let cmd = Command::new(CommandTag::GetProperty, &[PropertyTag::MaxPacketSize as u32]);
    let response = transport.command(&cmd)?;
    if let Response::GetProperty { status: 0, values } = &response {
        if let Some(&size) = values.first() {
            transport.set_max_packet_size(size as usize);
        }
    }
    Ok(())
}

/// Ping the device and show its framing protocol version.
pub fn ping(transport: &mut Transport) -> Result<()> {
    let (version, options) = transport.ping()?;
    println!("Protocol version: {}", format_version(version));
    println!("Options:          0x{:04x}", options);
    Ok(())
}

/// Read one property and print its value(s).
pub fn get_property(transport: &mut Transport, tag: u32) -> Result<()> {
    let response = transport.command(&Command::new(CommandTag::GetProperty, &[tag]))?;
    let Response::GetProperty { status, values } = response else {
        bail!("Unexpected response: {:?}", response);
    };
    if status != Status::Success.code() {
        bail!("GetProperty 0x{:02x} failed: {}", tag, describe(status));
    }

    let label = PropertyTag::from_u32(tag)
        .map(|t| format!("{:?}", t))
        .unwrap_or_else(|| format!("0x{:02x}", tag));

    match PropertyTag::from_u32(tag) {
        Some(PropertyTag::CurrentVersion | PropertyTag::TargetVersion) => {
            let v = values.first().copied().unwrap_or(0);
            println!("{}: {}", label, format_version(Version::from_u32(v)));
        }
        Some(PropertyTag::ReservedRegions) => {
            println!("{}:", label);
            for pair in values.chunks(2) {
                if let [start, end] = pair {
                    if *start == 0 && *end == 0 {
                        println!("  (none)");
                    } else {
                        println!("  0x{:08x}..=0x{:08x}", start, end);
                    }
                }
            }
        }
        _ => {
            for v in values.iter() {
                println!("{}: 0x{:08x} ({})", label, v, v);
            }
        }
    }
    Ok(())
}

pub fn set_property(transport: &mut Transport, tag: u32, value: u32) -> Result<()> {
    let response = transport.command(&Command::new(CommandTag::SetProperty, &[tag, value]))?;
    expect_success(&response, "SetProperty")?;
    println!("Property 0x{:02x} set to {}", tag, value);
    Ok(())
}

pub fn erase_region(transport: &mut Transport, address: u32, length: u32) -> Result<()> {
    print!("Erasing 0x{:08x}+{}... ", address, length);
    std::io::stdout().flush()?;

    // Large erases can take a while on QSPI flash
    let cmd = Command::new(CommandTag::FlashEraseRegion, &[address, length, 0]);
    let response = transport.with_timeout(Duration::from_secs(60), |t| t.command(&cmd))?;
    expect_success(&response, "FlashEraseRegion")?;
    println!("OK");
    Ok(())
}

pub fn erase_all(transport: &mut Transport) -> Result<()> {
    print!("Erasing application flash... ");
    std::io::stdout().flush()?;

    let cmd = Command::new(CommandTag::FlashEraseAll, &[0]);
    let response = transport.with_timeout(Duration::from_secs(120), |t| t.command(&cmd))?;
    expect_success(&response, "FlashEraseAll")?;
    println!("OK");
    Ok(())
}

/// Write a file to memory, optionally erasing the covered flash sectors first.
pub fn write_memory(transport: &mut Transport, address: u32, file: &Path, erase: bool) -> Result<()> {
    let data = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let size = u32::try_from(data.len()).context("File too large")?;
    if size == 0 {
        bail!("{} is empty", file.display());
    }

    println!("File:   {} ({} bytes)", file.display(), size);
    println!("CRC32:  0x{:08x}", CRC32.checksum(&data));
    println!("Target: 0x{:08x}", address);
    println!();

    if erase {
        let sector = read_word_property(transport, PropertyTag::FlashSectorSize)?;
        if sector == 0 {
            bail!("Device reported a zero flash sector size");
        }
        let end = address
            .checked_add(size)
            .context("Range runs past the end of the address space")?;
        let start = address - address % sector;
        let end = end.div_ceil(sector) * sector;
        erase_region(transport, start, end - start)?;
    }

    negotiate_packet_size(transport)?;
    println!("Packet size: {} bytes", transport.max_packet_size());

    let cmd = Command::new(CommandTag::WriteMemory, &[address, size, 0]).with_data_phase();
    let response = transport.command(&cmd)?;
    expect_success(&response, "WriteMemory")?;

    let pb = progress_bar(size as u64)?;
    let completed = transport.write_data(&data, |sent| pb.set_position(sent as u64))?;
    let response = transport.read_response()?;
    if !completed {
        pb.abandon();
        bail!("Device aborted the write: {}", describe(response.status()));
    }
    if response.status() != Status::Success.code() {
        pb.abandon();
        bail!("WriteMemory failed: {}", describe(response.status()));
    }
    pb.finish_with_message("Write complete");

    println!();
    println!("Wrote {} bytes to 0x{:08x}", size, address);
    Ok(())
}

/// Read memory into a file, or hex-dump it when no file is given.
pub fn read_memory(
    transport: &mut Transport,
    address: u32,
    length: u32,
    out: Option<&Path>,
) -> Result<()> {
    let response = transport.command(&Command::new(
        CommandTag::ReadMemory,
        &[address, length, 0],
    ))?;
    let Response::ReadMemory { status, byte_count } = response else {
        bail!("Unexpected response: {:?}", response);
    };
    if status != Status::Success.code() {
        bail!("ReadMemory failed: {}", describe(status));
    }

    let pb = progress_bar(byte_count as u64)?;
    let data = transport.read_data(byte_count as usize, |got| pb.set_position(got as u64))?;
    let response = transport.read_response()?;
    expect_success(&response, "ReadMemory")?;
    pb.finish_and_clear();

    match out {
        Some(path) => {
            fs::write(path, &data).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Read {} bytes from 0x{:08x} into {}", data.len(), address, path.display());
        }
        None => hexdump(address, &data),
    }
    Ok(())
}

fn hexdump(address: u32, data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = line
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
            .collect();
        println!("{:08x}  {:<47}  {}", address as usize + i * 16, hex.join(" "), ascii);
    }
}

pub fn fill_memory(transport: &mut Transport, address: u32, length: u32, pattern: u32) -> Result<()> {
    let cmd = Command::new(CommandTag::FillMemory, &[address, length, pattern]);
    let response = transport.with_timeout(Duration::from_secs(60), |t| t.command(&cmd))?;
    expect_success(&response, "FillMemory")?;
    println!("Filled 0x{:08x}+{} with 0x{:08x}", address, length, pattern);
    Ok(())
}

/// Jump to `address`. The device only ACKs; a response means it refused.
pub fn execute(transport: &mut Transport, address: u32, arg: u32, stack_pointer: u32) -> Result<()> {
    transport.send_command(&Command::new(
        CommandTag::Execute,
        &[address, arg, stack_pointer],
    ))?;
    expect_no_response(transport, "Execute")?;
    println!("Executing at 0x{:08x}", address);
    Ok(())
}

pub fn call(transport: &mut Transport, address: u32, arg: u32) -> Result<()> {
    let response = transport.command(&Command::new(CommandTag::Call, &[address, arg]))?;
    println!("Call returned {}", describe(response.status()));
    Ok(())
}

/// Reset the device.
pub fn reset(transport: &mut Transport) -> Result<()> {
    print!("Resetting device on {}... ", transport.port_name());
    std::io::stdout().flush()?;

    transport.send_command(&Command::new(CommandTag::Reset, &[]))?;
    println!("OK");
    Ok(())
}

fn expect_no_response(transport: &mut Transport, what: &str) -> Result<()> {
    let refused = transport.with_timeout(Duration::from_millis(200), |t| match t.read_response() {
        Ok(response) => Ok(Some(response)),
        Err(_) => Ok(None),
    })?;
    if let Some(response) = refused {
        bail!("{} refused: {}", what, describe(response.status()));
    }
    Ok(())
}

fn read_word_property(transport: &mut Transport, tag: PropertyTag) -> Result<u32> {
    let response = transport.command(&Command::new(CommandTag::GetProperty, &[tag as u32]))?;
    match response {
        Response::GetProperty { status: 0, values } if !values.is_empty() => Ok(values[0]),
        other => bail!("GetProperty {:?} failed: {}", tag, describe(other.status())),
    }
}

/// Send a file with XMODEM. The receiver picks the frame size and checksum.
pub fn xmodem_send(transport: &mut Transport, file: &Path) -> Result<()> {
    let image = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    println!("Image: {} ({} bytes)", file.display(), image.len());
    println!("Waiting for receiver...");

    let mut frame_buf = [0u8; FRAME_1K];
    let mut sender = Sender::new(SenderConfig::default(), &mut frame_buf)?;
    sender.start();

    let pb = progress_bar(image.len() as u64)?;
    let mut offset = 0usize;
    let mut last_tick = Instant::now();

    transport.with_timeout(Duration::from_millis(XMODEM_POLL_MS), |t| loop {
        let input = t.read_raw()?;
        let elapsed = last_tick.elapsed().as_millis() as u32;
        last_tick += Duration::from_millis(elapsed as u64);

        let (out, outcome) = xmodem_poll(&mut sender, &image, &mut offset, input, elapsed, &pb)?;
        // Written before any outcome is acted on, so a final CAN burst still goes out
        if !out.is_empty() {
            t.write_raw(&out)?;
        }

        match outcome {
            Some(Ok(())) => {
                pb.finish_with_message("Transfer complete");
                println!();
                println!("Sent {} bytes", image.len());
                return Ok(());
            }
            Some(Err(e)) => {
                pb.abandon();
                return Err(e);
            }
            None => {}
        }
    })
}

/// One pass of the send loop: react to the received byte and elapsed time,
/// queue the next frame or EOT, and collect the bytes to write. The second
/// value is set once the transfer is over.
fn xmodem_poll(
    sender: &mut Sender<'_>,
    image: &[u8],
    offset: &mut usize,
    input: Option<u8>,
    elapsed_ms: u32,
    pb: &ProgressBar,
) -> Result<(Vec<u8>, Option<Result<()>>)> {
    let mut events = Vec::with_capacity(2);
    if let Some(byte) = input {
        events.extend(sender.on_byte(byte));
    }
    if elapsed_ms > 0 {
        events.extend(sender.tick(elapsed_ms));
    }

    let mut outcome = None;
    for event in events {
        match event {
            TxEvent::ModeSelected { frame_size, checksum } => {
                pb.println(format!("Receiver ready: {}-byte frames, {:?}", frame_size, checksum));
            }
            TxEvent::FrameAcked => pb.set_position(sender.bytes_sent() as u64),
            TxEvent::Complete => outcome = Some(Ok(())),
            TxEvent::Cancelled => outcome = Some(Err(anyhow!("Receiver cancelled the transfer"))),
            TxEvent::RetriesExhausted => {
                outcome = Some(Err(anyhow!("Too many NAKs at byte {}", sender.bytes_sent())));
            }
            TxEvent::TimedOut => {
                outcome = Some(Err(anyhow!(
                    "Receiver stopped answering at byte {}",
                    sender.bytes_sent()
                )));
            }
        }
    }

    if outcome.is_none() && sender.state() == SenderState::AwaitFrame {
        if *offset < image.len() {
            let n = sender.frame_size().min(image.len() - *offset);
            sender.send_frame(&image[*offset..*offset + n])?;
            *offset += n;
        } else {
            sender.finish()?;
        }
    }

    let out: Vec<u8> = std::iter::from_fn(|| sender.next_tx_byte()).collect();
    Ok((out, outcome))
}

// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Protocol engines for the serboot serial bootloader.
//!
//! This crate holds everything the bootloader speaks over its byte stream:
//! - [`kft`]: the framed KFT command protocol (framing, ACK/NAK flow control,
//!   command dispatch, property store)
//! - [`xmodem`]: XMODEM receive and transmit state machines
//! - [`firmware`]: streaming firmware image store on top of a [`flash::Flash`]
//!
//! The crate is `no_std` by default. Enable `std` for host tools and `defmt`
//! to get protocol logging on target.

#![cfg_attr(not(feature = "std"), no_std)]

#[macro_use]
mod log;

pub mod crc;
pub mod firmware;
pub mod flash;
pub mod guard;
pub mod kft;
pub mod transport;
pub mod xmodem;

pub use flash::{Flash, FlashError, FlashInfo};
pub use guard::InterruptGuard;
pub use kft::{CommandPump, Status};
pub use transport::{RxQueue, Transport};

//! # sdspi-nb
//!
//! > A cooperative, non-blocking SD/SDHC/SDXC driver for Embedded Rust
//!
//! This crate talks the SD SPI-mode protocol to a single card and exposes it
//! as a 512-byte block device. It is written in pure-Rust, is `#![no_std]`
//! and does not use `alloc`. Unlike most SPI SD drivers it never parks the
//! CPU inside a card operation: every operation is a small state machine that
//! advances by one bounded unit of work (one command, or one byte on the bus)
//! each time it is invoked, then hands control straight back to the caller.
//!
//! The intended shape is a periodic task in a superloop or RTOS tick:
//!
//! 1. the client submits a request (init, read or write) to [`SdServer`],
//! 2. the scheduler calls [`SdServer::tick`] once per pass,
//! 3. the client collects the [`Completion`] when the request finishes.
//!
//! Buffers move into the server when a request is accepted and move back out
//! with the completion, so the borrow checker enforces the one rule the
//! mailbox has: nobody touches an in-flight buffer.
//!
//! ```rust
//! use sdspi_nb::{Request, SdBus, SdError, SdServer};
//!
//! /// A bus with no card attached: the data line floats high and the
//! /// timeout timer never runs.
//! struct NoCard;
//!
//! impl SdBus for NoCard {
//!     fn exchange(&mut self, _out: u8) -> u8 { 0xFF }
//!     fn select(&mut self) {}
//!     fn deselect(&mut self) {}
//!     fn set_high_speed(&mut self, _enabled: bool) {}
//!     fn start_timeout(&mut self, _ms: u32) {}
//!     fn timeout_active(&mut self) -> bool { false }
//!     fn cancel_timeout(&mut self) {}
//! }
//!
//! let mut server = SdServer::new(NoCard);
//! server.submit(Request::Init).unwrap();
//! let completion = loop {
//!     server.tick();
//!     if let Some(c) = server.take_completion() {
//!         break c;
//!     }
//! };
//! assert_eq!(completion.result(), Err(SdError::NotInitialized));
//! ```
//!
//! If you would rather block, the `blocking` feature wraps the very same
//! state machines in a [`blocking::SdCard`] that loops them to completion and
//! implements [`BlockDevice`].
//!
//! ## Features
//!
//! * `log`: Enabled by default. Generates log messages using the `log` crate.
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over
//!   defmt instead.
//! * `blocking`: Enabled by default. Builds the blocking frontend.
//!
//! You cannot enable both the `log` feature and the `defmt-log` feature.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod structure;

pub mod blockdevice;
pub mod bus;
pub mod proto;

mod cmd;
mod device;
mod init;
mod read;
mod server;
mod write;

#[cfg(feature = "blocking")]
pub mod blocking;

pub use blockdevice::{Block, BlockCount, BlockDevice, BlockIdx, BLOCK_LEN};
pub use bus::{MonotonicMs, SdBus, SpiTransport};
pub use device::{CardType, SdDevice, TransferStats};
pub use init::InitOpts;
pub use server::{Completion, Request, SdServer, ServerStatus};

/// Outcome of a card operation: success, or one of the closed set of
/// [`SdError`] codes.
pub type SdResult = Result<(), SdError>;

/// The possible errors this crate can generate.
///
/// Every operation terminates in exactly one of these (or in success), and
/// the set is part of the stable API. There is deliberately no transport
/// error here: the bus contract is infallible and transport trouble shows up
/// as a protocol timeout instead.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SdError {
    /// The card never reached the mounted state (reset/negotiation retry
    /// budget exhausted, or no card present).
    NotInitialized,
    /// The card declined a command or broke off mid-transfer.
    DeviceError,
    /// Caller misuse, detected before any bus traffic: sector out of range,
    /// zero-length read, undersized buffer.
    InvalidParameter,
    /// The card was still programming when the wait window lapsed. Not a
    /// failure of the write itself: retry later.
    Busy,
    /// The card's data-response token rejected the written block.
    Rejected,
    /// No response arrived on the bus within the command timeout.
    NoResponse,
}

impl SdError {
    /// Short mnemonic for log lines, matching the classic result table.
    pub fn as_str(&self) -> &'static str {
        match self {
            SdError::NotInitialized => "NOINIT",
            SdError::DeviceError => "ERROR",
            SdError::InvalidParameter => "PARERR",
            SdError::Busy => "BUSY",
            SdError::Rejected => "REJECT",
            SdError::NoResponse => "NORESP",
        }
    }
}

/// What a state machine did with its latest micro-step.
#[derive(Debug)]
pub(crate) enum Progress {
    /// Protocol still pending; invoke again next tick.
    Pending,
    /// The operation finished with this result.
    Done(SdResult),
}

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::debug! but does nothing at all
macro_rules! debug {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::trace! but does nothing at all
macro_rules! trace {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::warn! but does nothing at all
macro_rules! warn {
    ($($arg:tt)+) => {};
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

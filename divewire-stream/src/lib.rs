#![cfg_attr(not(feature = "std"), no_std)]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

extern crate alloc;

/// The error kinds shared by every divewire crate
pub mod error;
pub use error::Error;

/// The byte-stream transport contract
pub mod stream;
pub use stream::{
    Direction, FlowControl, LineConfig, Lines, Parity, StopBits, Stream,
    Timeout,
};

/// HDLC byte-stuffing decorator
pub mod hdlc;
pub use hdlc::Hdlc;

/// SLIP byte-stuffing decorator
pub mod slip;
pub use slip::Slip;

/// Scripted mock stream for protocol tests
#[cfg(feature = "std")]
pub mod mocks;

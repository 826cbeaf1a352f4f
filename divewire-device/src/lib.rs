#![cfg_attr(not(feature = "std"), no_std)]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

extern crate alloc;

mod debug;

/// Model identification: version patterns and serial decoding
pub mod ident;
pub use ident::{ModelMatch, SerialFormat};

/// Echo-based half-duplex serial family
pub mod aquon;
pub use aquon::AquonDevice;

/// ACK/NAK serial family
pub mod bathytec;
pub use bathytec::BathytecDevice;

/// Length-prefixed-over-HDLC cradle family
pub mod nereid;
pub use nereid::NereidDevice;

/// BLE GATT family
pub mod calypso;
pub use calypso::CalypsoDevice;

/// SLIP-framed multi-packet family
pub mod pelagic;
pub use pelagic::PelagicDevice;

use core::future::Future;
use divewire_proto::Events;
use divewire_stream::Error;

/// Per-session tuning knobs
///
/// Defaults come from each family's `default_options()`; a caller with
/// a flaky cable raises `retries`, a caller bulk-archiving raises the
/// page batching.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DeviceOptions {
    /// Transport timeout applied at open, in milliseconds.
    pub timeout_ms: u32,
    /// Packet retries after the first attempt.
    pub retries: u32,
    /// Initial inter-packet delay, in milliseconds.
    pub inter_packet_delay_ms: u32,
    /// Pages per "fast" read command, for families that have one.
    pub bigpage_pages: u32,
    /// Pages batched into one ordinary read command.
    pub multipage_pages: u32,
    /// Ceiling for the adaptive inter-packet delay, in milliseconds.
    pub adaptive_delay_cap_ms: u32,
    /// Host tick value paired with the device clock in `on_clock`.
    pub now_ticks: u64,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            retries: 3,
            inter_packet_delay_ms: 0,
            bigpage_pages: 4,
            multipage_pages: 4,
            adaptive_delay_cap_ms: 128,
            now_ticks: 0,
        }
    }
}

/// A wall-clock moment for time synchronisation
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DateTime {
    /// Full year, e.g. 2026.
    pub year: u16,
    /// Month, 1..=12.
    pub month: u8,
    /// Day of month, 1..=31.
    pub day: u8,
    /// Hour, 0..=23.
    pub hour: u8,
    /// Minute, 0..=59.
    pub minute: u8,
    /// Second, 0..=59.
    pub second: u8,
}

/// One open download session with a dive computer
///
/// The family modules each provide an `open()` returning an
/// implementation. A session is single-threaded: everything here takes
/// `&mut self`, and the only cross-thread channel is the
/// [`CancelFlag`](divewire_proto::CancelFlag) the session was opened
/// with.
pub trait Device {
    /// Install the fingerprint of the newest dive already downloaded;
    /// the next download stops when it sees it. The slice length is
    /// family-specific.
    fn set_fingerprint(&mut self, fingerprint: &[u8]) -> Result<(), Error>;

    /// Download dives, newest first, reporting into `events`.
    fn download<E: Events>(
        &mut self,
        events: &mut E,
    ) -> impl Future<Output = Result<(), Error>>;

    /// Set the device clock, where the family supports it.
    fn timesync(
        &mut self,
        _time: &DateTime,
    ) -> impl Future<Output = Result<(), Error>> {
        futures::future::ready(Err(Error::Unsupported))
    }

    /// Send the family's quit frame, where one exists, and end the
    /// session.
    fn close(&mut self) -> impl Future<Output = Result<(), Error>> {
        futures::future::ready(Ok(()))
    }
}

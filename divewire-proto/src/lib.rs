#![cfg_attr(not(feature = "std"), no_std)]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

extern crate alloc;

mod debug;

/// Checksum primitives used by the family framings
pub mod checksum;

/// The shared packet-transfer contract: retries, cancellation,
/// adaptive pacing
pub mod transfer;
pub use transfer::{transfer, AdaptiveDelay, CancelFlag, Link, RetryPolicy};

/// BLE GATT fragmentation framer
pub mod ble;
pub use ble::BleFramer;

/// Addressable flash abstraction with a page cache
pub mod memory;
pub use memory::{
    DeviceMemory, HighMem, MemoryLayout, PagedMemory, PageReader, Region,
};

/// Ring-buffer arithmetic primitives
pub mod ring;
pub use ring::{Fill, RingLayout};

/// Lazy cursor over one on-device ring
pub mod rbstream;
pub use rbstream::{Heading, RingStream};

/// Event sink contract and progress bookkeeping
pub mod event;
pub use event::{Clock, DeviceInfo, Events, Progress};

/// The two-pass ring-extraction engine
pub mod extract;
pub use extract::{
    entry_blank, DiveGeometry, EntryCodec, Extractor, RingPointers,
};

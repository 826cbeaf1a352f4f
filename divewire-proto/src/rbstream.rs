use crate::event::{Events, Progress};
use crate::memory::DeviceMemory;
use crate::ring::RingLayout;
use crate::transfer::CancelFlag;
use alloc::vec;
use alloc::vec::Vec;
use divewire_stream::Error;

/// Which way a [`RingStream`] travels
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Heading {
    /// Consecutive reads yield ring bytes in increasing address order.
    Forward,
    /// Consecutive reads move towards older data; each read still
    /// fills its buffer in logical (increasing-address) order.
    Backward,
}

/// A lazy cursor over one on-device ring
///
/// The cursor address is always page-aligned; an unaligned starting
/// byte is remembered as a skip count and discarded out of the first
/// fetch. Fetches go through [`DeviceMemory`] a packet at a time,
/// clamped so they never cross the ring boundary, wrapping begin⇄end
/// as needed, and each fetched packet advances the progress report.
/// The cancel flag is observed once per fetch, so a long read stops
/// at the next packet boundary rather than at its end.
///
/// Backward is the direction that earns its keep: anchored at the
/// end-of-profile pointer, successive reads peel dives off the profile
/// ring newest first while each dive's own bytes stay in device order.
pub struct RingStream<'a, M: DeviceMemory> {
    memory: &'a mut M,
    cancel: &'a CancelFlag,
    ring: RingLayout,
    heading: Heading,
    address: u32,
    packet_size: u32,
    cache: Vec<u8>,
    // backward: unconsumed bytes are cache[..available]
    available: usize,
    // forward: unconsumed bytes are cache[offset..filled]
    offset: usize,
    filled: usize,
    skip: usize,
}

impl<'a, M: DeviceMemory> RingStream<'a, M> {
    /// A backward cursor anchored at `start` (typically the
    /// end-of-profile pointer): reads yield the bytes immediately
    /// before the anchor, then the bytes before those, and so on.
    pub fn backward(
        memory: &'a mut M,
        ring: RingLayout,
        start: u32,
        packet_size: u32,
        cancel: &'a CancelFlag,
    ) -> Result<Self, Error> {
        Self::new(memory, ring, start, packet_size, cancel, Heading::Backward)
    }

    /// A forward cursor starting at `start`.
    pub fn forward(
        memory: &'a mut M,
        ring: RingLayout,
        start: u32,
        packet_size: u32,
        cancel: &'a CancelFlag,
    ) -> Result<Self, Error> {
        Self::new(memory, ring, start, packet_size, cancel, Heading::Forward)
    }

    fn new(
        memory: &'a mut M,
        ring: RingLayout,
        start: u32,
        packet_size: u32,
        cancel: &'a CancelFlag,
        heading: Heading,
    ) -> Result<Self, Error> {
        let pagesize = memory.pagesize_at(ring.begin);
        if ring.begin % pagesize != 0 || ring.size() % pagesize != 0 {
            return Err(Error::InvalidArgs);
        }
        if start < ring.begin || start > ring.end {
            return Err(Error::InvalidArgs);
        }
        let packet_size = packet_size
            .max(pagesize)
            .min(ring.size())
            / pagesize
            * pagesize;

        let misalign = ((start - ring.begin) % pagesize) as usize;
        // round towards the anchor's page boundary; whatever the first
        // fetch covers beyond the anchor is dropped via `skip`
        let (address, skip) = match heading {
            Heading::Backward => {
                if misalign == 0 {
                    (start, 0)
                } else {
                    (
                        start + (pagesize - misalign as u32),
                        pagesize as usize - misalign,
                    )
                }
            }
            Heading::Forward => (start - misalign as u32, misalign),
        };
        Ok(Self {
            memory,
            cancel,
            ring,
            heading,
            address,
            packet_size,
            cache: vec![0; packet_size as usize],
            available: 0,
            offset: 0,
            filled: 0,
            skip,
        })
    }

    async fn fetch<E: Events>(
        &mut self,
        progress: &mut Progress,
        events: &mut E,
    ) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.heading {
            Heading::Backward => {
                if self.address == self.ring.begin {
                    self.address = self.ring.end;
                }
                let distance = self.address - self.ring.begin;
                let packet = self.packet_size.min(distance);
                self.address -= packet;
                self.memory
                    .read(self.address, &mut self.cache[..packet as usize])
                    .await?;
                self.filled = packet as usize;
                self.available = self.filled - self.skip;
                self.skip = 0;
                progress.advance(packet, events);
            }
            Heading::Forward => {
                if self.address == self.ring.end {
                    self.address = self.ring.begin;
                }
                let distance = self.ring.end - self.address;
                let packet = self.packet_size.min(distance);
                self.memory
                    .read(self.address, &mut self.cache[..packet as usize])
                    .await?;
                self.address += packet;
                self.filled = packet as usize;
                self.offset = self.skip;
                self.skip = 0;
                progress.advance(packet, events);
            }
        }
        Ok(())
    }

    /// Fill `out` from the ring and advance the cursor.
    ///
    /// Backward: `out` receives the `out.len()` bytes immediately
    /// preceding the cursor position, in logical order, and the cursor
    /// moves back past them.
    pub async fn read<E: Events>(
        &mut self,
        out: &mut [u8],
        progress: &mut Progress,
        events: &mut E,
    ) -> Result<(), Error> {
        match self.heading {
            Heading::Backward => {
                let mut remaining = out.len();
                while remaining > 0 {
                    if self.available == 0 {
                        self.fetch(progress, events).await?;
                    }
                    let take = self.available.min(remaining);
                    out[remaining - take..remaining].copy_from_slice(
                        &self.cache[self.available - take..self.available],
                    );
                    self.available -= take;
                    remaining -= take;
                }
            }
            Heading::Forward => {
                let mut pos = 0;
                while pos < out.len() {
                    if self.offset == self.filled {
                        self.fetch(progress, events).await?;
                    }
                    let take =
                        (self.filled - self.offset).min(out.len() - pos);
                    out[pos..pos + take].copy_from_slice(
                        &self.cache[self.offset..self.offset + take],
                    );
                    self.offset += take;
                    pos += take;
                }
            }
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/rbstream.rs"]
mod tests;

use crate::debug;
use crate::event::{Events, Progress};
use crate::memory::DeviceMemory;
use crate::rbstream::RingStream;
use crate::ring::{self, Fill, RingLayout};
use crate::transfer::CancelFlag;
use alloc::vec;
use alloc::vec::Vec;
use divewire_stream::Error;

/// The logbook/profile ring pair of one device model
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DiveGeometry {
    /// The ring of fixed-size logbook entries, one per dive.
    pub logbook: RingLayout,
    /// The ring of variable-length profile payloads.
    pub profile: RingLayout,
    /// Size of one logbook entry in bytes.
    pub entry_size: u32,
}

impl DiveGeometry {
    /// Number of entry slots in the logbook ring.
    pub fn entries(&self) -> u32 {
        self.logbook.size() / self.entry_size
    }
}

/// How to interpret one raw logbook entry
///
/// A family is a data table plus a few plain function values; these
/// are the functions. `profile_start` extracts the absolute profile
/// ring address where the entry's dive begins. `profile_end`, for
/// families that store it, extracts where it ends, used only to detect
/// continuity breaks. `is_blank` recognises never-written entries
/// (conventionally all 0xFF).
#[derive(Clone)]
pub struct EntryCodec {
    /// Absolute profile-ring address of the dive's first byte.
    pub profile_start: fn(&[u8]) -> u32,
    /// Absolute profile-ring address just past the dive's last byte,
    /// for families whose entries carry it.
    pub profile_end: Option<fn(&[u8]) -> u32>,
    /// Does this entry slot hold no dive at all?
    pub is_blank: fn(&[u8]) -> bool,
    /// The fingerprint slice within the assembled record (the record
    /// starts with the logbook entry, so entry offsets work).
    pub fingerprint: core::ops::Range<usize>,
}

/// The conventional blank test: every byte erased to 0xFF.
pub fn entry_blank(entry: &[u8]) -> bool {
    entry.iter().all(|&b| b == 0xFF)
}

/// Ring pointers recovered from the device's config area
///
/// `first` and `last` are inclusive logbook entry indices, oldest and
/// newest; families whose hardware stores addresses or one-past-end
/// conventions convert before handing them over. `eop` is the
/// absolute address just past the newest dive's profile bytes.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct RingPointers {
    /// Index of the oldest logbook entry.
    pub first: u32,
    /// Index of the newest logbook entry.
    pub last: u32,
    /// End-of-profile address.
    pub eop: u32,
}

struct Planned {
    index: u32,
    size: u32,
    blank: bool,
}

/// The two-pass backward walk over one device's rings
///
/// Pass A sizes every dive by walking the logbook backward from the
/// newest entry, measuring each profile against the running previous
/// start pointer. Pass B anchors a backward [`RingStream`] at the
/// end-of-profile pointer and peels the dives off the profile ring
/// into one buffer, back to front, handing each record to the sink
/// until the fingerprint matches, the sink declines, or the plan runs
/// out.
pub struct Extractor<'a, M: DeviceMemory> {
    memory: &'a mut M,
    geometry: &'a DiveGeometry,
    codec: &'a EntryCodec,
    cancel: &'a CancelFlag,
    /// Stop before the dive whose fingerprint slice equals this.
    pub fingerprint: Option<&'a [u8]>,
    /// Fetch size for the profile ring stream, in bytes; rounded to
    /// the ring's page size.
    pub packet_size: u32,
}

impl<'a, M: DeviceMemory> Extractor<'a, M> {
    /// An extractor over `memory` with no fingerprint installed and
    /// packet-sized fetches of one page.
    pub fn new(
        memory: &'a mut M,
        geometry: &'a DiveGeometry,
        codec: &'a EntryCodec,
        cancel: &'a CancelFlag,
    ) -> Self {
        let packet_size = memory.pagesize_at(geometry.profile.begin);
        Self {
            memory,
            geometry,
            codec,
            cancel,
            fingerprint: None,
            packet_size,
        }
    }

    /// Run the walk. `pointers` of `None` means the device reported
    /// itself empty: success, zero dives.
    pub async fn run<E: Events>(
        &mut self,
        pointers: Option<RingPointers>,
        events: &mut E,
    ) -> Result<(), Error> {
        let Some(pointers) = pointers else {
            events.on_progress(0, 0);
            return Ok(());
        };
        let geometry = *self.geometry;
        let entries = geometry.entries();
        let entry_size = geometry.entry_size as usize;
        if pointers.first >= entries || pointers.last >= entries {
            return Err(Error::DataFormat);
        }
        if !geometry.profile.contains(pointers.eop)
            && pointers.eop != geometry.profile.end
        {
            return Err(Error::DataFormat);
        }
        let count =
            ring::distance(pointers.first, pointers.last, entries, Fill::Empty)
                + 1;

        let mut progress = Progress::new(geometry.logbook.size());
        progress.report(events);

        // the whole logbook in one aligned read; entries are then
        // indexed out of it
        let mut logbook = vec![0u8; geometry.logbook.size() as usize];
        self.memory
            .read(geometry.logbook.begin, &mut logbook)
            .await?;
        progress.advance(geometry.logbook.size(), events);

        // pass A: size each dive against the running previous start
        let mut plan: Vec<Planned> = Vec::with_capacity(count as usize);
        let mut previous = pointers.eop;
        let mut total: u32 = 0;
        let mut index = pointers.last;
        for _ in 0..count {
            let entry = &logbook[index as usize * entry_size..][..entry_size];
            if (self.codec.is_blank)(entry) {
                debug::println!(
                    "logbook entry {} is uninitialised; skipped",
                    index
                );
                plan.push(Planned {
                    index,
                    size: 0,
                    blank: true,
                });
            } else {
                let start = (self.codec.profile_start)(entry);
                if !geometry.profile.contains(start) {
                    return Err(Error::DataFormat);
                }
                let length = ring::distance(
                    start,
                    previous,
                    geometry.profile.size(),
                    Fill::Full,
                );
                if let Some(profile_end) = self.codec.profile_end {
                    let end = profile_end(entry);
                    if end != previous {
                        debug::println!(
                            "profile continuity break at entry {}: \
                             end {}, expected {}",
                            index,
                            end,
                            previous
                        );
                    }
                }
                if total + length > geometry.profile.size() {
                    debug::println!(
                        "profile ring overflow; truncating to {} dives",
                        plan.len()
                    );
                    break;
                }
                total += length;
                plan.push(Planned {
                    index,
                    size: length,
                    blank: false,
                });
                previous = start;
            }
            index = if index == 0 { entries - 1 } else { index - 1 };
        }

        progress.extend(total, events);

        // pass B: peel the profiles off the ring, newest first,
        // filling one buffer back to front
        let mut buffer = vec![0u8; total as usize];
        let mut stream = RingStream::backward(
            &mut *self.memory,
            geometry.profile,
            pointers.eop,
            self.packet_size,
            self.cancel,
        )?;
        let mut remaining = total as usize;
        let mut delivered = 0usize;
        let mut late_error = None;
        for planned in &plan {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if planned.blank {
                debug::println!(
                    "skipping uninitialised logbook entry {}",
                    planned.index
                );
                continue;
            }
            let size = planned.size as usize;
            if size > remaining {
                late_error = Some(Error::DataFormat);
                break;
            }
            let slice = &mut buffer[remaining - size..remaining];
            stream.read(slice, &mut progress, events).await?;
            remaining -= size;

            let mut record = Vec::with_capacity(entry_size + size);
            record.extend_from_slice(
                &logbook[planned.index as usize * entry_size..][..entry_size],
            );
            record.extend_from_slice(&buffer[remaining..remaining + size]);
            let fingerprint = &record[self.codec.fingerprint.clone()];
            if let Some(wanted) = self.fingerprint {
                if wanted == fingerprint {
                    break;
                }
            }
            if !events.on_dive(&record, fingerprint) {
                break;
            }
            delivered += 1;
        }

        match late_error {
            Some(e) if delivered == 0 => Err(e),
            Some(_) => {
                debug::println!(
                    "profile data inconsistent after {} dives; \
                     keeping what was delivered",
                    delivered
                );
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/extract.rs"]
mod tests;

use alloc::vec;
use alloc::vec::Vec;
use core::future::Future;
use divewire_stream::Error;

/// Which half of a split address space an address falls in
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Region {
    /// Below the split address (or everywhere, without a split).
    Low,
    /// At or above the split address.
    High,
}

/// The upper region of a device with a partitioned address space
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct HighMem {
    /// First address of the high region; always a multiple of both
    /// page sizes.
    pub split: u32,
    /// Page size of the high region.
    pub pagesize: u32,
}

/// Geometry of one device's flash
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Total memory size in bytes.
    pub size: u32,
    /// Page size of the (low) region.
    pub pagesize: u32,
    /// Optional split high region with its own page size.
    pub highmem: Option<HighMem>,
}

impl MemoryLayout {
    /// The region `address` falls in.
    pub fn region(&self, address: u32) -> Region {
        match self.highmem {
            Some(h) if address >= h.split => Region::High,
            _ => Region::Low,
        }
    }

    /// The page size governing `address`.
    pub fn pagesize_at(&self, address: u32) -> u32 {
        match (self.region(address), self.highmem) {
            (Region::High, Some(h)) => h.pagesize,
            _ => self.pagesize,
        }
    }

    /// One past the last address of the region `address` falls in.
    fn region_end(&self, address: u32) -> u32 {
        match (self.region(address), self.highmem) {
            (Region::Low, Some(h)) => h.split,
            _ => self.size,
        }
    }
}

/// An addressable view of device flash
///
/// What the ring-extraction machinery consumes: `read` with a
/// page-aligned address and length. Implementations batch, cache and
/// checksum underneath.
pub trait DeviceMemory {
    /// Total memory size in bytes.
    fn size(&self) -> u32;

    /// The page size governing `address`.
    fn pagesize_at(&self, address: u32) -> u32;

    /// Fill `data` from flash starting at `address`. Both `address`
    /// and `data.len()` must be page-aligned.
    fn read(
        &mut self,
        address: u32,
        data: &mut [u8],
    ) -> impl Future<Output = Result<(), Error>>;
}

/// A family's raw page-group fetch
///
/// One call issues one read command for `data.len()` bytes at
/// `address`; the adapter guarantees the range is page-aligned, within
/// one region, and no longer than the negotiated batch size. The
/// implementation validates whatever per-page checksums its wire
/// format carries.
pub trait PageReader {
    /// Fetch `data.len()` bytes at `address` from the device.
    fn read_pages(
        &mut self,
        address: u32,
        data: &mut [u8],
    ) -> impl Future<Output = Result<(), Error>>;
}

struct CacheTag {
    region: Region,
    address: u32,
    len: usize,
}

/// Page-cached [`DeviceMemory`] over a family's [`PageReader`]
///
/// Reads are broken into aligned batches of up to `multipage` pages
/// and served through a one-batch cache keyed by region and address.
/// Fetching from the other region replaces (invalidates) the cache;
/// any write to the device must call [`invalidate`](Self::invalidate)
/// explicitly.
pub struct PagedMemory<R: PageReader> {
    reader: R,
    layout: MemoryLayout,
    multipage: u32,
    cache: Vec<u8>,
    tag: Option<CacheTag>,
}

impl<R: PageReader> PagedMemory<R> {
    /// Wrap `reader`, batching up to `multipage` pages per fetch.
    pub fn new(reader: R, layout: MemoryLayout, multipage: u32) -> Self {
        let multipage = multipage.max(1);
        let biggest = match layout.highmem {
            Some(h) => layout.pagesize.max(h.pagesize),
            None => layout.pagesize,
        };
        Self {
            reader,
            layout,
            multipage,
            cache: vec![0; (multipage * biggest) as usize],
            tag: None,
        }
    }

    /// Drop the cache; required after any write to the device.
    pub fn invalidate(&mut self) {
        self.tag = None;
    }

    /// Offset into the cache where `len` bytes at `address` start, if
    /// the whole range was part of the last fetch.
    fn cached(&self, region: Region, address: u32, len: usize) -> Option<usize> {
        let t = self.tag.as_ref()?;
        if t.region == region
            && address >= t.address
            && (address - t.address) as usize + len <= t.len
        {
            Some((address - t.address) as usize)
        } else {
            None
        }
    }
}

impl<R: PageReader> DeviceMemory for PagedMemory<R> {
    fn size(&self) -> u32 {
        self.layout.size
    }

    fn pagesize_at(&self, address: u32) -> u32 {
        self.layout.pagesize_at(address)
    }

    async fn read(
        &mut self,
        address: u32,
        data: &mut [u8],
    ) -> Result<(), Error> {
        let len = data.len() as u32;
        let end = match address.checked_add(len) {
            Some(end) if end <= self.layout.size => end,
            _ => return Err(Error::InvalidArgs),
        };
        if end > self.layout.region_end(address) {
            // reads do not span the low/high split
            return Err(Error::InvalidArgs);
        }
        let region = self.layout.region(address);
        let pagesize = self.layout.pagesize_at(address);
        if address % pagesize != 0 || len % pagesize != 0 {
            return Err(Error::InvalidArgs);
        }

        let batch = (self.multipage * pagesize) as usize;
        let mut address = address;
        let mut data = data;
        while !data.is_empty() {
            let chunk = data.len().min(batch);
            let (head, rest) =
                core::mem::take(&mut data).split_at_mut(chunk);
            if let Some(start) = self.cached(region, address, chunk) {
                head.copy_from_slice(&self.cache[start..start + chunk]);
            } else {
                self.reader
                    .read_pages(address, &mut self.cache[..chunk])
                    .await?;
                self.tag = Some(CacheTag {
                    region,
                    address,
                    len: chunk,
                });
                head.copy_from_slice(&self.cache[..chunk]);
            }
            address += chunk as u32;
            data = rest;
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/memory.rs"]
pub(crate) mod tests;

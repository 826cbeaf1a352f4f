//! The bathytec family: ACK/NAK serial
//!
//! Every exchange is command, one-byte ACK or NAK, then (for reads) a
//! payload whose last byte is a sum-8 of the rest. A NAK is the device
//! asking for the command again; these units drop bytes when the host
//! crowds them, so the retry loop's adaptive inter-packet delay does
//! real work here. Newer firmware adds a fast read returning several
//! pages per command, each page carrying its own check byte.
//!
//! The logbook pointers in the config page are byte addresses, and the
//! "last" pointer is one past the newest entry (wrap-aware); the
//! conversion to inclusive entry indices happens here, not in the
//! engine.

use crate::debug;
use crate::ident::{self, ModelMatch, SerialFormat};
use crate::{Device, DeviceOptions};
use alloc::vec;
use alloc::vec::Vec;
use divewire_proto::checksum;
use divewire_proto::extract::{entry_blank, EntryCodec, RingPointers};
use divewire_proto::memory::{
    DeviceMemory, MemoryLayout, PagedMemory, PageReader,
};
use divewire_proto::ring::{self, RingLayout};
use divewire_proto::transfer::{
    transfer, AdaptiveDelay, CancelFlag, Link, RetryPolicy,
};
use divewire_proto::{DeviceInfo, DiveGeometry, Events, Extractor};
use divewire_stream::{
    Direction, Error, FlowControl, LineConfig, Parity, StopBits, Stream,
    Timeout,
};

const ACK: u8 = 0x5A;
const NAK: u8 = 0xA5;

const CMD_HANDSHAKE: u8 = 0xA8;
const CMD_VERSION: u8 = 0x84;
const CMD_READ: u8 = 0xB1;
const CMD_READ_FAST: u8 = 0xB4;
const CMD_QUIT: u8 = 0x6A;

const PAGESIZE: u32 = 0x100;
const VERSION_SIZE: usize = 16;
const ENTRY_SIZE: u32 = 0x20;

/// Fingerprint slice length for this family.
pub const FINGERPRINT_SIZE: usize = 12;

// config page 0 field offsets
const CF_SERIAL: usize = 0x20;
const CF_FIRST: usize = 0x30;
const CF_LAST: usize = 0x32;
const CF_EOP: usize = 0x34;

/// Memory and ring layout of one bathytec model
pub struct BathytecLayout {
    /// Flash geometry.
    pub memory: MemoryLayout,
    /// Logbook/profile rings.
    pub geometry: DiveGeometry,
    /// Serial number encoding in config page 0.
    pub serial: SerialFormat,
}

static TERRA: BathytecLayout = BathytecLayout {
    memory: MemoryLayout {
        size: 0x8000,
        pagesize: PAGESIZE,
        highmem: None,
    },
    geometry: DiveGeometry {
        logbook: RingLayout {
            begin: 0x0600,
            end: 0x0E00,
        },
        profile: RingLayout {
            begin: 0x0E00,
            end: 0x8000,
        },
        entry_size: ENTRY_SIZE,
    },
    serial: SerialFormat::PackedBcd,
};

static MAKO: BathytecLayout = BathytecLayout {
    memory: MemoryLayout {
        size: 0x10000,
        pagesize: PAGESIZE,
        highmem: None,
    },
    geometry: DiveGeometry {
        logbook: RingLayout {
            begin: 0x0600,
            end: 0x1600,
        },
        profile: RingLayout {
            begin: 0x1600,
            end: 0x10000,
        },
        entry_size: ENTRY_SIZE,
    },
    serial: SerialFormat::PackedBcd,
};

/// Version record: an ASCII family tag, the model byte, firmware, a
/// CR, then padding.
pub static MODELS: &[ModelMatch<BathytecLayout>] = &[
    ModelMatch {
        pattern: &[
            b'B', b'T', 0x22, 0, 0, 0x0D, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ],
        firmware_min: 0,
        model: 0x22,
        name: "Bathytec Terra",
        layout: &TERRA,
    },
    ModelMatch {
        pattern: &[
            b'B', b'T', 0x25, 0, 0, 0x0D, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ],
        firmware_min: 0x0130,
        model: 0x25,
        name: "Bathytec Mako",
        layout: &MAKO,
    },
];

fn profile_start(entry: &[u8]) -> u32 {
    u16::from_le_bytes([entry[12], entry[13]]) as u32
}

fn profile_end(entry: &[u8]) -> u32 {
    u16::from_le_bytes([entry[14], entry[15]]) as u32
}

static CODEC: EntryCodec = EntryCodec {
    profile_start,
    profile_end: Some(profile_end),
    is_blank: entry_blank,
    fingerprint: 0..FINGERPRINT_SIZE,
};

struct BathytecLink<S: Stream> {
    stream: S,
}

impl<S: Stream> BathytecLink<S> {
    /// Read `n` payload bytes followed by their sum-8 check byte.
    async fn checked(
        &mut self,
        out: &mut [u8],
    ) -> Result<(), Error> {
        self.stream.read_exact(out).await?;
        let mut check = [0u8; 1];
        self.stream.read_exact(&mut check).await?;
        if checksum::sum8(out, 0) != check[0] {
            return Err(Error::Protocol);
        }
        Ok(())
    }
}

impl<S: Stream> Link for BathytecLink<S> {
    async fn packet(
        &mut self,
        cmd: &[u8],
        rsp: &mut [u8],
    ) -> Result<usize, Error> {
        self.stream.write_all(cmd).await?;
        let mut ack = [0u8; 1];
        self.stream.read_exact(&mut ack).await?;
        if ack[0] == NAK {
            // ask-again: let the retry loop pace and resend
            return Err(Error::Protocol);
        }
        if ack[0] != ACK {
            return Err(Error::Protocol);
        }
        match cmd[0] {
            CMD_HANDSHAKE | CMD_QUIT => Ok(0),
            CMD_VERSION => {
                let mut version = [0u8; VERSION_SIZE];
                self.checked(&mut version).await?;
                rsp[..VERSION_SIZE].copy_from_slice(&version);
                Ok(VERSION_SIZE)
            }
            CMD_READ => {
                self.checked(rsp).await?;
                Ok(rsp.len())
            }
            CMD_READ_FAST => {
                // each page carries its own check byte
                for page in rsp.chunks_mut(PAGESIZE as usize) {
                    self.checked(page).await?;
                }
                Ok(rsp.len())
            }
            _ => Err(Error::InvalidArgs),
        }
    }

    fn sleep(&mut self, ms: u32) -> impl core::future::Future<Output = ()> {
        self.stream.sleep(ms)
    }

    async fn recover(&mut self) -> Result<(), Error> {
        self.stream.purge(Direction::INPUT).await
    }
}

struct BathytecIo<'d, S: Stream> {
    link: &'d mut BathytecLink<S>,
    policy: RetryPolicy,
    delay: &'d mut AdaptiveDelay,
    cancel: &'d CancelFlag,
    bigpage: u32,
}

impl<S: Stream> PageReader for BathytecIo<'_, S> {
    async fn read_pages(
        &mut self,
        address: u32,
        data: &mut [u8],
    ) -> Result<(), Error> {
        let pages = data.len() as u32 / PAGESIZE;
        let page = address / PAGESIZE;
        if pages > 1 && self.bigpage > 1 {
            let cmd = [
                CMD_READ_FAST,
                page as u8,
                (page >> 8) as u8,
                pages as u8,
            ];
            transfer(
                &mut *self.link,
                self.cancel,
                &self.policy,
                self.delay,
                &cmd,
                data,
            )
            .await?;
        } else {
            let mut page = page;
            for chunk in data.chunks_mut(PAGESIZE as usize) {
                let cmd = [CMD_READ, page as u8, (page >> 8) as u8];
                transfer(
                    &mut *self.link,
                    self.cancel,
                    &self.policy,
                    self.delay,
                    &cmd,
                    chunk,
                )
                .await?;
                page += 1;
            }
        }
        Ok(())
    }
}

fn parse_pointers(
    layout: &BathytecLayout,
    config: &[u8],
) -> Result<Option<RingPointers>, Error> {
    let first =
        u16::from_le_bytes([config[CF_FIRST], config[CF_FIRST + 1]]) as u32;
    let last =
        u16::from_le_bytes([config[CF_LAST], config[CF_LAST + 1]]) as u32;
    if first == 0xFFFF || last == 0xFFFF {
        return Ok(None);
    }
    let logbook = layout.geometry.logbook;
    // addresses, entry-aligned; `last` is one past the newest entry
    if !logbook.contains(first)
        || (first - logbook.begin) % ENTRY_SIZE != 0
    {
        return Err(Error::DataFormat);
    }
    if last <= logbook.begin
        || last > logbook.end
        || (last - logbook.begin) % ENTRY_SIZE != 0
    {
        return Err(Error::DataFormat);
    }
    let newest = ring::decrement(
        ring::normalize(last, logbook.begin, logbook.end),
        ENTRY_SIZE,
        logbook.begin,
        logbook.end,
    );
    let eop =
        u16::from_le_bytes([config[CF_EOP], config[CF_EOP + 1]]) as u32;
    if !layout.geometry.profile.contains(eop) {
        return Err(Error::DataFormat);
    }
    Ok(Some(RingPointers {
        first: (first - logbook.begin) / ENTRY_SIZE,
        last: (newest - logbook.begin) / ENTRY_SIZE,
        eop,
    }))
}

/// One open session with a bathytec device
pub struct BathytecDevice<'a, S: Stream> {
    link: BathytecLink<S>,
    options: DeviceOptions,
    policy: RetryPolicy,
    delay: AdaptiveDelay,
    cancel: &'a CancelFlag,
    layout: &'static BathytecLayout,
    version: [u8; VERSION_SIZE],
    model: u32,
    firmware: u32,
    fingerprint: Option<Vec<u8>>,
}

impl<'a, S: Stream> BathytecDevice<'a, S> {
    /// Family-tuned defaults: these devices want pacing headroom.
    pub fn default_options() -> DeviceOptions {
        DeviceOptions {
            timeout_ms: 3000,
            retries: 2,
            inter_packet_delay_ms: 0,
            bigpage_pages: 4,
            adaptive_delay_cap_ms: 128,
            ..Default::default()
        }
    }

    /// Open a session: line settings, handshake, version match.
    pub async fn open(
        mut stream: S,
        options: &DeviceOptions,
        cancel: &'a CancelFlag,
    ) -> Result<Self, Error> {
        stream
            .configure(&LineConfig {
                baud: 38400,
                data_bits: 8,
                parity: Parity::None,
                stop_bits: StopBits::One,
                flow: FlowControl::None,
            })
            .await?;
        stream.set_timeout(Timeout::Bounded(options.timeout_ms))?;
        stream.sleep(100).await;
        stream.purge(Direction::ALL).await?;

        let mut link = BathytecLink { stream };
        let policy = RetryPolicy {
            retries: options.retries,
            backoff_ms: 50,
        };
        let mut delay = AdaptiveDelay::new(
            options.inter_packet_delay_ms,
            32,
            options.adaptive_delay_cap_ms,
        );
        transfer(
            &mut link,
            cancel,
            &policy,
            &mut delay,
            &[CMD_HANDSHAKE, 0x99, 0x00],
            &mut [],
        )
        .await?;
        let mut version = [0u8; VERSION_SIZE];
        transfer(
            &mut link,
            cancel,
            &policy,
            &mut delay,
            &[CMD_VERSION, 0x00],
            &mut version,
        )
        .await?;
        let (row, firmware) = ident::match_version(MODELS, &version)
            .ok_or(Error::Unsupported)?;
        debug::println!("bathytec: matched {}", row.name);
        Ok(Self {
            link,
            options: *options,
            policy,
            delay,
            cancel,
            layout: row.layout,
            version,
            model: row.model,
            firmware,
            fingerprint: None,
        })
    }
}

impl<S: Stream> Device for BathytecDevice<'_, S> {
    fn set_fingerprint(&mut self, fingerprint: &[u8]) -> Result<(), Error> {
        if fingerprint.len() != FINGERPRINT_SIZE {
            return Err(Error::InvalidArgs);
        }
        self.fingerprint = Some(fingerprint.to_vec());
        Ok(())
    }

    async fn download<E: Events>(
        &mut self,
        events: &mut E,
    ) -> Result<(), Error> {
        let layout = self.layout;
        let io = BathytecIo {
            link: &mut self.link,
            policy: self.policy,
            delay: &mut self.delay,
            cancel: self.cancel,
            bigpage: self.options.bigpage_pages,
        };
        let mut memory =
            PagedMemory::new(io, layout.memory, self.options.bigpage_pages);

        // config page 0 carries both the serial and the ring pointers
        let mut config = vec![0u8; PAGESIZE as usize];
        memory.read(0, &mut config).await?;
        let serial = ident::decode_serial(
            &config[CF_SERIAL..CF_SERIAL + 4],
            layout.serial,
        );
        events.on_vendor(&self.version);
        events.on_devinfo(&DeviceInfo {
            model: self.model,
            firmware: self.firmware,
            serial,
        });
        let pointers = parse_pointers(layout, &config)?;

        let mut extractor = Extractor::new(
            &mut memory,
            &layout.geometry,
            &CODEC,
            self.cancel,
        );
        extractor.fingerprint = self.fingerprint.as_deref();
        extractor.packet_size =
            PAGESIZE * self.options.bigpage_pages.max(1);
        extractor.run(pointers, events).await
    }

    async fn close(&mut self) -> Result<(), Error> {
        transfer(
            &mut self.link,
            self.cancel,
            &self.policy,
            &mut self.delay,
            &[CMD_QUIT, 0x00],
            &mut [],
        )
        .await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/bathytec.rs"]
mod tests;

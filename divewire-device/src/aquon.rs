//! The aquon family: half-duplex echo serial
//!
//! Aquon devices speak 9600 8O1 over a half-duplex RS-232 level
//! shifter: the host raises RTS to transmit and drops it to listen,
//! with model-specific settle times. Every command byte is echoed by
//! the interface and must match; an echo of the complemented byte is
//! the device's way of saying it does not know the command. Replies
//! end with a constant trailer byte, and the version record
//! additionally carries an XOR-8 check byte.

use crate::debug;
use crate::ident::{self, ModelMatch, SerialFormat};
use crate::{Device, DeviceOptions};
use alloc::vec;
use alloc::vec::Vec;
use divewire_proto::checksum;
use divewire_proto::extract::{entry_blank, EntryCodec, RingPointers};
use divewire_proto::memory::{
    DeviceMemory, HighMem, MemoryLayout, PagedMemory, PageReader,
};
use divewire_proto::ring::RingLayout;
use divewire_proto::transfer::{
    transfer, AdaptiveDelay, CancelFlag, Link, RetryPolicy,
};
use divewire_proto::{DeviceInfo, DiveGeometry, Events, Extractor};
use divewire_stream::{
    Direction, Error, FlowControl, LineConfig, Parity, StopBits, Stream,
    Timeout,
};

const CMD_VERSION: u8 = 0x56;
const CMD_READ: u8 = 0x52;
const TRAILER: u8 = 0x45;
const VERSION_SIZE: usize = 16;

/// Fingerprint slice length for this family.
pub const FINGERPRINT_SIZE: usize = 8;

const ENTRY_SIZE: u32 = 16;

/// Half-duplex turnaround timing
///
/// Protocol-critical on real hardware; carried per model as data, not
/// buried in the code.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct AquonTiming {
    /// Settle after raising RTS, before the first command byte.
    pub rts_settle_ms: u32,
    /// Wait after dropping RTS, before the reply appears.
    pub reply_wait_ms: u32,
}

/// Memory and ring layout of one aquon model
pub struct AquonLayout {
    /// Flash geometry.
    pub memory: MemoryLayout,
    /// Address of the config page holding the ring pointers.
    pub config: u32,
    /// Logbook/profile rings.
    pub geometry: DiveGeometry,
    /// Serial number encoding in the version record.
    pub serial: SerialFormat,
    /// Half-duplex waits.
    pub timing: AquonTiming,
}

static DEFAULT_TIMING: AquonTiming = AquonTiming {
    rts_settle_ms: 200,
    reply_wait_ms: 100,
};

static STRIDE: AquonLayout = AquonLayout {
    memory: MemoryLayout {
        size: 0x8000,
        pagesize: 0x80,
        highmem: None,
    },
    config: 0x4080,
    geometry: DiveGeometry {
        logbook: RingLayout {
            begin: 0x4100,
            end: 0x4500,
        },
        profile: RingLayout {
            begin: 0x4800,
            end: 0x8000,
        },
        entry_size: ENTRY_SIZE,
    },
    serial: SerialFormat::Bcd,
    timing: AquonTiming {
        rts_settle_ms: 100,
        reply_wait_ms: 40,
    },
};

// the Vista keeps its profile in a second flash bank with bigger pages
static VISTA: AquonLayout = AquonLayout {
    memory: MemoryLayout {
        size: 0x10000,
        pagesize: 0x80,
        highmem: Some(HighMem {
            split: 0x8000,
            pagesize: 0x200,
        }),
    },
    config: 0x4080,
    geometry: DiveGeometry {
        logbook: RingLayout {
            begin: 0x4100,
            end: 0x4500,
        },
        profile: RingLayout {
            begin: 0x8000,
            end: 0x10000,
        },
        entry_size: ENTRY_SIZE,
    },
    serial: SerialFormat::Bcd,
    timing: AquonTiming {
        rts_settle_ms: 150,
        reply_wait_ms: 60,
    },
};

/// Version record: family id, model id, firmware, a space, BCD
/// serial, a space, then the padded model name.
pub static MODELS: &[ModelMatch<AquonLayout>] = &[
    ModelMatch {
        pattern: &[
            0x0A, 0x01, 0, 0, 0x20, 0, 0, 0, 0, 0x20, b'S', b'T', b'R',
            b'I', b'D', b'E',
        ],
        firmware_min: 0x0100,
        model: 0x01,
        name: "Aquon Stride",
        layout: &STRIDE,
    },
    ModelMatch {
        pattern: &[
            0x0A, 0x04, 0, 0, 0x20, 0, 0, 0, 0, 0x20, b'V', b'I', b'S',
            b'T', b'A', 0x20,
        ],
        firmware_min: 0x0200,
        model: 0x04,
        name: "Aquon Vista",
        layout: &VISTA,
    },
];

fn profile_start(entry: &[u8]) -> u32 {
    u16::from_le_bytes([entry[8], entry[9]]) as u32
}

fn profile_end(entry: &[u8]) -> u32 {
    u16::from_le_bytes([entry[10], entry[11]]) as u32
}

static CODEC: EntryCodec = EntryCodec {
    profile_start,
    profile_end: Some(profile_end),
    is_blank: entry_blank,
    fingerprint: 0..FINGERPRINT_SIZE,
};

struct AquonLink<S: Stream> {
    stream: S,
    timing: &'static AquonTiming,
}

impl<S: Stream> AquonLink<S> {
    async fn trailer(&mut self) -> Result<(), Error> {
        let mut trailer = [0u8; 1];
        self.stream.read_exact(&mut trailer).await?;
        if trailer[0] != TRAILER {
            return Err(Error::Protocol);
        }
        Ok(())
    }
}

impl<S: Stream> Link for AquonLink<S> {
    async fn packet(
        &mut self,
        cmd: &[u8],
        rsp: &mut [u8],
    ) -> Result<usize, Error> {
        // transmit half: RTS up, bytes echoed one at a time
        self.stream.set_rts(true).await?;
        self.stream.sleep(self.timing.rts_settle_ms).await;
        for &b in cmd {
            self.stream.write_all(&[b]).await?;
            let mut echo = [0u8; 1];
            self.stream.read_exact(&mut echo).await?;
            if echo[0] == !b {
                // complemented echo: command unknown to this firmware
                return Err(Error::Unsupported);
            }
            if echo[0] != b {
                return Err(Error::Protocol);
            }
        }
        self.stream.flush().await?;

        // receive half
        self.stream.set_rts(false).await?;
        self.stream.sleep(self.timing.reply_wait_ms).await;
        match cmd[0] {
            CMD_VERSION => {
                let mut payload = [0u8; VERSION_SIZE + 1];
                self.stream.read_exact(&mut payload).await?;
                if checksum::xor8(&payload[..VERSION_SIZE], 0)
                    != payload[VERSION_SIZE]
                {
                    return Err(Error::Protocol);
                }
                self.trailer().await?;
                rsp[..VERSION_SIZE].copy_from_slice(&payload[..VERSION_SIZE]);
                Ok(VERSION_SIZE)
            }
            CMD_READ => {
                self.stream.read_exact(rsp).await?;
                self.trailer().await?;
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

struct AquonIo<'d, S: Stream> {
    link: &'d mut AquonLink<S>,
    policy: RetryPolicy,
    delay: &'d mut AdaptiveDelay,
    cancel: &'d CancelFlag,
    layout: &'static AquonLayout,
}

impl<S: Stream> PageReader for AquonIo<'_, S> {
    async fn read_pages(
        &mut self,
        address: u32,
        data: &mut [u8],
    ) -> Result<(), Error> {
        let pagesize = self.layout.memory.pagesize_at(address) as usize;
        let mut address = address;
        for page in data.chunks_mut(pagesize) {
            let cmd = [CMD_READ, address as u8, (address >> 8) as u8];
            transfer(
                &mut *self.link,
                self.cancel,
                &self.policy,
                self.delay,
                &cmd,
                page,
            )
            .await?;
            address += pagesize as u32;
        }
        Ok(())
    }
}

fn parse_pointers(
    layout: &AquonLayout,
    config: &[u8],
) -> Result<Option<RingPointers>, Error> {
    let first = config[0];
    let last = config[1];
    if first == 0xFF || last == 0xFF {
        // factory-fresh: the logbook has never been written
        return Ok(None);
    }
    let entries = layout.geometry.entries();
    if first as u32 >= entries || last as u32 >= entries {
        return Err(Error::DataFormat);
    }
    let eop = u16::from_le_bytes([config[2], config[3]]) as u32;
    if !layout.geometry.profile.contains(eop) {
        return Err(Error::DataFormat);
    }
    Ok(Some(RingPointers {
        first: first as u32,
        last: last as u32,
        eop,
    }))
}

/// One open session with an aquon device
pub struct AquonDevice<'a, S: Stream> {
    link: AquonLink<S>,
    policy: RetryPolicy,
    delay: AdaptiveDelay,
    cancel: &'a CancelFlag,
    layout: &'static AquonLayout,
    version: [u8; VERSION_SIZE],
    info: DeviceInfo,
    fingerprint: Option<Vec<u8>>,
}

impl<'a, S: Stream> AquonDevice<'a, S> {
    /// Family-tuned defaults: patient timeouts, no pacing.
    pub fn default_options() -> DeviceOptions {
        DeviceOptions {
            timeout_ms: 2000,
            retries: 2,
            multipage_pages: 1,
            ..Default::default()
        }
    }

    /// Open a session: apply line settings, wake the interface, read
    /// and match the version record.
    pub async fn open(
        mut stream: S,
        options: &DeviceOptions,
        cancel: &'a CancelFlag,
    ) -> Result<Self, Error> {
        stream
            .configure(&LineConfig {
                baud: 9600,
                data_bits: 8,
                parity: Parity::Odd,
                stop_bits: StopBits::One,
                flow: FlowControl::None,
            })
            .await?;
        stream.set_timeout(Timeout::Bounded(options.timeout_ms))?;
        // the interface is powered from DTR; give it time to charge
        stream.set_dtr(true).await?;
        stream.set_rts(false).await?;
        stream.sleep(300).await;
        stream.purge(Direction::ALL).await?;

        let mut link = AquonLink {
            stream,
            timing: &DEFAULT_TIMING,
        };
        let policy = RetryPolicy {
            retries: options.retries,
            backoff_ms: 100,
        };
        let mut delay =
            AdaptiveDelay::fixed(options.inter_packet_delay_ms);
        let mut version = [0u8; VERSION_SIZE];
        transfer(
            &mut link,
            cancel,
            &policy,
            &mut delay,
            &[CMD_VERSION],
            &mut version,
        )
        .await?;
        let (row, firmware) = ident::match_version(MODELS, &version)
            .ok_or(Error::Unsupported)?;
        debug::println!("aquon: matched {}", row.name);
        link.timing = &row.layout.timing;
        let serial =
            ident::decode_serial(&version[5..9], row.layout.serial);
        Ok(Self {
            link,
            policy,
            delay,
            cancel,
            layout: row.layout,
            version,
            info: DeviceInfo {
                model: row.model,
                firmware,
                serial,
            },
            fingerprint: None,
        })
    }
}

impl<S: Stream> Device for AquonDevice<'_, S> {
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
        events.on_vendor(&self.version);
        events.on_devinfo(&self.info);

        let layout = self.layout;
        let io = AquonIo {
            link: &mut self.link,
            policy: self.policy,
            delay: &mut self.delay,
            cancel: self.cancel,
            layout,
        };
        let mut memory = PagedMemory::new(io, layout.memory, 1);

        let mut config = vec![0u8; layout.memory.pagesize as usize];
        memory.read(layout.config, &mut config).await?;
        let pointers = parse_pointers(layout, &config)?;

        let mut extractor = Extractor::new(
            &mut memory,
            &layout.geometry,
            &CODEC,
            self.cancel,
        );
        extractor.fingerprint = self.fingerprint.as_deref();
        extractor.run(pointers, events).await
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/aquon.rs"]
mod tests;

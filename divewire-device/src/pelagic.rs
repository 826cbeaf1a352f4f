//! The pelagic family: checksummed multi-packet responses over SLIP
//!
//! Every packet is one SLIP frame: a five-byte header (start byte,
//! flags, command, checksum, payload length) followed by the payload.
//! The checksum is the vendor's rotate-and-xor polynomial computed
//! over header plus payload with the checksum byte zeroed. A response
//! is a run of data packets closed by a packet with the LAST flag,
//! whose single payload byte is a response code with a
//! command-specific expected value.

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
use divewire_proto::ring::RingLayout;
use divewire_proto::transfer::{
    transfer, AdaptiveDelay, CancelFlag, Link, RetryPolicy,
};
use divewire_proto::{DeviceInfo, DiveGeometry, Events, Extractor};
use divewire_stream::{
    Direction, Error, FlowControl, LineConfig, Parity, Slip, StopBits,
    Stream, Timeout,
};

/// First byte of every packet header.
pub const STARTBYTE: u8 = 0xE5;
/// Flag closing a multi-packet response.
pub const FLAG_LAST: u8 = 0x80;

const CMD_VERSION: u8 = 0x10;
const CMD_READ: u8 = 0x20;
const CMD_QUIT: u8 = 0xFF;

const HEADER_SIZE: usize = 5;
const PAGESIZE: u32 = 0x80;
const VERSION_SIZE: usize = 16;
const ENTRY_SIZE: u32 = 16;

/// Fingerprint slice length for this family.
pub const FINGERPRINT_SIZE: usize = 6;

/// The response code each command's closing packet must carry.
fn expected_rc(cmd: u8) -> Option<u8> {
    match cmd {
        CMD_VERSION => Some(0x01),
        CMD_READ => Some(0x42),
        CMD_QUIT => Some(0x00),
        _ => None,
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
struct PacketHeader {
    start: u8,
    flags: u8,
    command: u8,
    checksum: u8,
    length: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for PacketHeader {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for PacketHeader {}

/// Rotate-xor checksum of a packet, with the checksum byte zeroed.
fn packet_checksum(header: &[u8], payload: &[u8]) -> u8 {
    let mut cs = checksum::shift_xor(&header[..3], 0);
    // the zeroed checksum slot contributes only its rotation
    cs = cs.rotate_left(1);
    cs = checksum::shift_xor(&header[4..], cs);
    checksum::shift_xor(payload, cs)
}

/// Memory and ring layout of one pelagic model
pub struct PelagicLayout {
    /// Flash geometry.
    pub memory: MemoryLayout,
    /// Logbook/profile rings.
    pub geometry: DiveGeometry,
    /// Serial number encoding in the version record.
    pub serial: SerialFormat,
}

static DX: PelagicLayout = PelagicLayout {
    memory: MemoryLayout {
        size: 0x20000,
        pagesize: PAGESIZE,
        highmem: None,
    },
    geometry: DiveGeometry {
        logbook: RingLayout {
            begin: 0x0400,
            end: 0x0800,
        },
        profile: RingLayout {
            begin: 0x0800,
            end: 0x20000,
        },
        entry_size: ENTRY_SIZE,
    },
    serial: SerialFormat::Binary,
};

static QUEST: PelagicLayout = PelagicLayout {
    memory: MemoryLayout {
        size: 0x40000,
        pagesize: PAGESIZE,
        highmem: None,
    },
    geometry: DiveGeometry {
        logbook: RingLayout {
            begin: 0x0400,
            end: 0x0C00,
        },
        profile: RingLayout {
            begin: 0x0C00,
            end: 0x40000,
        },
        entry_size: ENTRY_SIZE,
    },
    serial: SerialFormat::Binary,
};

/// Version record: an ASCII family tag, the model byte, firmware, a
/// separator, then the binary serial.
pub static MODELS: &[ModelMatch<PelagicLayout>] = &[
    ModelMatch {
        pattern: &[
            b'P', b'X', 0x71, 0, 0, 0x2E, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ],
        firmware_min: 0,
        model: 0x71,
        name: "Pelagic DX",
        layout: &DX,
    },
    ModelMatch {
        pattern: &[
            b'P', b'X', 0x74, 0, 0, 0x2E, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ],
        firmware_min: 0x0105,
        model: 0x74,
        name: "Pelagic Quest",
        layout: &QUEST,
    },
];

fn u24_le(bytes: &[u8]) -> u32 {
    bytes[0] as u32 | (bytes[1] as u32) << 8 | (bytes[2] as u32) << 16
}

fn profile_start(entry: &[u8]) -> u32 {
    u24_le(&entry[6..9])
}

fn profile_end(entry: &[u8]) -> u32 {
    u24_le(&entry[9..12])
}

static CODEC: EntryCodec = EntryCodec {
    profile_start,
    profile_end: Some(profile_end),
    is_blank: entry_blank,
    fingerprint: 0..FINGERPRINT_SIZE,
};

struct PelagicLink<S: Stream> {
    stream: Slip<S>,
    buffer: Vec<u8>,
}

impl<S: Stream> Link for PelagicLink<S> {
    async fn packet(
        &mut self,
        cmd: &[u8],
        rsp: &mut [u8],
    ) -> Result<usize, Error> {
        let rc = expected_rc(cmd[0]).ok_or(Error::InvalidArgs)?;
        let args = &cmd[1..];
        let mut header = PacketHeader {
            start: STARTBYTE,
            flags: FLAG_LAST,
            command: cmd[0],
            checksum: 0,
            length: args.len() as u8,
        };
        header.checksum =
            packet_checksum(bytemuck::bytes_of(&header), args);
        let mut frame = Vec::with_capacity(HEADER_SIZE + args.len());
        frame.extend_from_slice(bytemuck::bytes_of(&header));
        frame.extend_from_slice(args);
        self.stream.write(&frame).await?;

        let mut offset = 0;
        loop {
            let n = self.stream.read(&mut self.buffer).await?;
            if n < HEADER_SIZE {
                return Err(Error::Protocol);
            }
            let frame = &self.buffer[..n];
            if frame[0] != STARTBYTE || frame[2] != cmd[0] {
                return Err(Error::Protocol);
            }
            let length = frame[4] as usize;
            if n != HEADER_SIZE + length {
                return Err(Error::Protocol);
            }
            if packet_checksum(&frame[..HEADER_SIZE], &frame[HEADER_SIZE..])
                != frame[3]
            {
                return Err(Error::Protocol);
            }
            if frame[1] & FLAG_LAST != 0 {
                if length != 1 || frame[HEADER_SIZE] != rc {
                    return Err(Error::Protocol);
                }
                return Ok(offset);
            }
            if offset + length > rsp.len() {
                return Err(Error::Protocol);
            }
            rsp[offset..offset + length]
                .copy_from_slice(&frame[HEADER_SIZE..HEADER_SIZE + length]);
            offset += length;
        }
    }

    fn sleep(&mut self, ms: u32) -> impl core::future::Future<Output = ()> {
        self.stream.sleep(ms)
    }

    async fn recover(&mut self) -> Result<(), Error> {
        self.stream.purge(Direction::INPUT).await
    }
}

struct PelagicIo<'d, S: Stream> {
    link: &'d mut PelagicLink<S>,
    policy: RetryPolicy,
    delay: &'d mut AdaptiveDelay,
    cancel: &'d CancelFlag,
}

impl<S: Stream> PageReader for PelagicIo<'_, S> {
    async fn read_pages(
        &mut self,
        address: u32,
        data: &mut [u8],
    ) -> Result<(), Error> {
        let mut cmd = [0u8; 6];
        cmd[0] = CMD_READ;
        cmd[1..4].copy_from_slice(&address.to_le_bytes()[..3]);
        cmd[4..6].copy_from_slice(&(data.len() as u16).to_le_bytes());
        let n = transfer(
            &mut *self.link,
            self.cancel,
            &self.policy,
            self.delay,
            &cmd,
            data,
        )
        .await?;
        if n != data.len() {
            return Err(Error::Protocol);
        }
        Ok(())
    }
}

fn parse_pointers(
    layout: &PelagicLayout,
    config: &[u8],
) -> Result<Option<RingPointers>, Error> {
    let first = u16::from_le_bytes([config[0], config[1]]) as u32;
    let last = u16::from_le_bytes([config[2], config[3]]) as u32;
    if first == 0xFFFF || last == 0xFFFF {
        return Ok(None);
    }
    let entries = layout.geometry.entries();
    if first >= entries || last >= entries {
        return Err(Error::DataFormat);
    }
    let eop =
        u32::from_le_bytes([config[4], config[5], config[6], config[7]]);
    if !layout.geometry.profile.contains(eop) {
        return Err(Error::DataFormat);
    }
    Ok(Some(RingPointers { first, last, eop }))
}

/// One open session with a pelagic device
pub struct PelagicDevice<'a, S: Stream> {
    link: PelagicLink<S>,
    options: DeviceOptions,
    policy: RetryPolicy,
    delay: AdaptiveDelay,
    cancel: &'a CancelFlag,
    layout: &'static PelagicLayout,
    version: [u8; VERSION_SIZE],
    info: DeviceInfo,
    fingerprint: Option<Vec<u8>>,
}

impl<'a, S: Stream> PelagicDevice<'a, S> {
    /// Family-tuned defaults.
    pub fn default_options() -> DeviceOptions {
        DeviceOptions {
            timeout_ms: 3000,
            retries: 2,
            multipage_pages: 4,
            ..Default::default()
        }
    }

    /// Open a session: line settings, version match.
    pub async fn open(
        stream: S,
        options: &DeviceOptions,
        cancel: &'a CancelFlag,
    ) -> Result<Self, Error> {
        let mut stream = Slip::with_frame_size(stream, 512);
        stream
            .configure(&LineConfig {
                baud: 115200,
                data_bits: 8,
                parity: Parity::None,
                stop_bits: StopBits::One,
                flow: FlowControl::None,
            })
            .await?;
        stream.set_timeout(Timeout::Bounded(options.timeout_ms))?;
        stream.purge(Direction::ALL).await?;

        let mut link = PelagicLink {
            stream,
            buffer: vec![0; HEADER_SIZE + 0xFF],
        };
        let policy = RetryPolicy {
            retries: options.retries,
            backoff_ms: 100,
        };
        let mut delay =
            AdaptiveDelay::fixed(options.inter_packet_delay_ms);
        let mut version = [0u8; VERSION_SIZE];
        let n = transfer(
            &mut link,
            cancel,
            &policy,
            &mut delay,
            &[CMD_VERSION],
            &mut version,
        )
        .await?;
        if n != VERSION_SIZE {
            return Err(Error::Protocol);
        }
        let (row, firmware) = ident::match_version(MODELS, &version)
            .ok_or(Error::Unsupported)?;
        debug::println!("pelagic: matched {}", row.name);
        let serial =
            ident::decode_serial(&version[6..10], row.layout.serial);
        Ok(Self {
            link,
            options: *options,
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

impl<S: Stream> Device for PelagicDevice<'_, S> {
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
        let io = PelagicIo {
            link: &mut self.link,
            policy: self.policy,
            delay: &mut self.delay,
            cancel: self.cancel,
        };
        let mut memory = PagedMemory::new(
            io,
            layout.memory,
            self.options.multipage_pages,
        );
        let mut config = vec![0u8; PAGESIZE as usize];
        memory.read(0, &mut config).await?;
        let pointers = parse_pointers(layout, &config)?;

        let mut extractor = Extractor::new(
            &mut memory,
            &layout.geometry,
            &CODEC,
            self.cancel,
        );
        extractor.fingerprint = self.fingerprint.as_deref();
        extractor.packet_size =
            PAGESIZE * self.options.multipage_pages.max(1);
        extractor.run(pointers, events).await
    }

    async fn close(&mut self) -> Result<(), Error> {
        transfer(
            &mut self.link,
            self.cancel,
            &self.policy,
            &mut self.delay,
            &[CMD_QUIT],
            &mut [],
        )
        .await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/pelagic.rs"]
mod tests;

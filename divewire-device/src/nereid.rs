//! The nereid family: length-prefixed frames over HDLC
//!
//! Nereid cradles push a short announce frame the moment a device is
//! docked; until then the line is silent, so a download begins by
//! telling the sink we are waiting. Every frame, both ways, is HDLC
//! byte-stuffed and carries a header byte, a little-endian length, the
//! command, a CRC-16/CCITT over command and payload, and a trailer
//! byte. Replies echo the command with the top bit set.
//!
//! Unusually for this hardware generation, the ring pointers live in a
//! dedicated flash-map record with its own command, not in a config
//! page, and the device accepts a time-set command.

use crate::debug;
use crate::ident::{self, ModelMatch, SerialFormat};
use crate::{DateTime, Device, DeviceOptions};
use alloc::vec;
use alloc::vec::Vec;
use divewire_proto::checksum;
use divewire_proto::extract::{entry_blank, EntryCodec, RingPointers};
use divewire_proto::memory::{MemoryLayout, PagedMemory, PageReader};
use divewire_proto::ring::RingLayout;
use divewire_proto::transfer::{
    transfer, AdaptiveDelay, CancelFlag, Link, RetryPolicy,
};
use divewire_proto::{DeviceInfo, DiveGeometry, Events, Extractor};
use divewire_stream::{
    Direction, Error, FlowControl, Hdlc, LineConfig, Parity, StopBits,
    Stream, Timeout,
};

const HEADER: u8 = 0xA6;
const TRAILER: u8 = 0xA9;
const REPLY: u8 = 0x80;

const CMD_ANNOUNCE: u8 = 0x3F;
const CMD_HANDSHAKE: u8 = 0x10;
const CMD_READ: u8 = 0x28;
const CMD_MAP: u8 = 0x29;
const CMD_QUIT: u8 = 0x50;
const CMD_TIME: u8 = 0x51;

const PAGESIZE: u32 = 0x200;
const HANDSHAKE_SIZE: usize = 12;
const MAP_SIZE: usize = 16;
const ENTRY_SIZE: u32 = 0x20;
// header + length16 + command + crc16 + trailer
const FRAME_OVERHEAD: usize = 7;

/// Fingerprint slice length for this family.
pub const FINGERPRINT_SIZE: usize = 12;

/// Memory and ring layout of one nereid model
pub struct NereidLayout {
    /// Flash geometry.
    pub memory: MemoryLayout,
    /// Logbook/profile rings.
    pub geometry: DiveGeometry,
    /// Serial number encoding in the handshake reply.
    pub serial: SerialFormat,
}

static TRACE: NereidLayout = NereidLayout {
    memory: MemoryLayout {
        size: 0x20000,
        pagesize: PAGESIZE,
        highmem: None,
    },
    geometry: DiveGeometry {
        logbook: RingLayout {
            begin: 0x1000,
            end: 0x1800,
        },
        profile: RingLayout {
            begin: 0x1800,
            end: 0x20000,
        },
        entry_size: ENTRY_SIZE,
    },
    serial: SerialFormat::Binary,
};

static SOUND: NereidLayout = NereidLayout {
    memory: MemoryLayout {
        size: 0x40000,
        pagesize: PAGESIZE,
        highmem: None,
    },
    geometry: DiveGeometry {
        logbook: RingLayout {
            begin: 0x1000,
            end: 0x2000,
        },
        profile: RingLayout {
            begin: 0x2000,
            end: 0x40000,
        },
        entry_size: ENTRY_SIZE,
    },
    serial: SerialFormat::Binary,
};

/// Handshake reply: model, firmware, a hardware-revision byte, then
/// the binary serial.
pub static MODELS: &[ModelMatch<NereidLayout>] = &[
    ModelMatch {
        pattern: &[0x31, 0, 0, 0x01, 0, 0, 0, 0, 0, 0, 0, 0],
        firmware_min: 0,
        model: 0x31,
        name: "Nereid Trace",
        layout: &TRACE,
    },
    ModelMatch {
        pattern: &[0x32, 0, 0, 0x01, 0, 0, 0, 0, 0, 0, 0, 0],
        firmware_min: 0,
        model: 0x32,
        name: "Nereid Sound",
        layout: &SOUND,
    },
];

fn profile_start(entry: &[u8]) -> u32 {
    u32::from_le_bytes([entry[12], entry[13], entry[14], entry[15]])
}

static CODEC: EntryCodec = EntryCodec {
    profile_start,
    profile_end: None,
    is_blank: entry_blank,
    fingerprint: 0..FINGERPRINT_SIZE,
};

struct NereidLink<S: Stream> {
    stream: Hdlc<S>,
    buffer: Vec<u8>,
}

impl<S: Stream> NereidLink<S> {
    fn new(stream: Hdlc<S>, frame_size: usize) -> Self {
        Self {
            stream,
            buffer: vec![0; frame_size],
        }
    }

    /// Read one frame and return its payload, validating every field
    /// against `expect_cmd | REPLY`.
    async fn read_frame(&mut self, expect: u8) -> Result<&[u8], Error> {
        let n = self.stream.read(&mut self.buffer).await?;
        let frame = &self.buffer[..n];
        if n < FRAME_OVERHEAD || frame[0] != HEADER {
            return Err(Error::Protocol);
        }
        let length = u16::from_le_bytes([frame[1], frame[2]]) as usize;
        if n != 3 + length + 3 {
            return Err(Error::Protocol);
        }
        if frame[3] != expect {
            return Err(Error::Protocol);
        }
        let crc = checksum::crc16_ccitt(&frame[3..3 + length], 0xFFFF);
        if frame[3 + length] != (crc >> 8) as u8
            || frame[3 + length + 1] != crc as u8
        {
            return Err(Error::Protocol);
        }
        if frame[n - 1] != TRAILER {
            return Err(Error::Protocol);
        }
        Ok(&self.buffer[4..3 + length])
    }
}

impl<S: Stream> Link for NereidLink<S> {
    async fn packet(
        &mut self,
        cmd: &[u8],
        rsp: &mut [u8],
    ) -> Result<usize, Error> {
        let length = cmd.len() as u16;
        let mut frame = Vec::with_capacity(cmd.len() + FRAME_OVERHEAD - 1);
        frame.push(HEADER);
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(cmd);
        let crc = checksum::crc16_ccitt(cmd, 0xFFFF);
        frame.push((crc >> 8) as u8);
        frame.push(crc as u8);
        frame.push(TRAILER);
        self.stream.write(&frame).await?;

        let payload = self.read_frame(cmd[0] | REPLY).await?;
        if payload.len() > rsp.len() {
            return Err(Error::Protocol);
        }
        rsp[..payload.len()].copy_from_slice(payload);
        Ok(payload.len())
    }

    fn sleep(&mut self, ms: u32) -> impl core::future::Future<Output = ()> {
        self.stream.sleep(ms)
    }

    async fn recover(&mut self) -> Result<(), Error> {
        self.stream.purge(Direction::INPUT).await
    }
}

struct NereidIo<'d, S: Stream> {
    link: &'d mut NereidLink<S>,
    policy: RetryPolicy,
    delay: &'d mut AdaptiveDelay,
    cancel: &'d CancelFlag,
}

impl<S: Stream> PageReader for NereidIo<'_, S> {
    async fn read_pages(
        &mut self,
        address: u32,
        data: &mut [u8],
    ) -> Result<(), Error> {
        // one read command covers the whole batch
        let mut cmd = [0u8; 7];
        cmd[0] = CMD_READ;
        cmd[1..5].copy_from_slice(&address.to_le_bytes());
        cmd[5..7].copy_from_slice(&(data.len() as u16).to_le_bytes());
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

fn parse_map(
    layout: &NereidLayout,
    map: &[u8],
) -> Result<Option<RingPointers>, Error> {
    let first = u16::from_le_bytes([map[0], map[1]]) as u32;
    let last = u16::from_le_bytes([map[2], map[3]]) as u32;
    if first == 0xFFFF || last == 0xFFFF {
        return Ok(None);
    }
    let entries = layout.geometry.entries();
    if first >= entries || last >= entries {
        return Err(Error::DataFormat);
    }
    let eop = u32::from_le_bytes([map[4], map[5], map[6], map[7]]);
    if !layout.geometry.profile.contains(eop) {
        return Err(Error::DataFormat);
    }
    Ok(Some(RingPointers { first, last, eop }))
}

/// One open session with a nereid cradle
///
/// Identification happens at the start of the first download, after
/// the cradle announces a docked device; until then the session knows
/// nothing about the model.
pub struct NereidDevice<'a, S: Stream> {
    link: NereidLink<S>,
    options: DeviceOptions,
    policy: RetryPolicy,
    delay: AdaptiveDelay,
    cancel: &'a CancelFlag,
    identity: Option<Identity>,
    fingerprint: Option<Vec<u8>>,
}

struct Identity {
    layout: &'static NereidLayout,
    version: [u8; HANDSHAKE_SIZE],
    info: DeviceInfo,
}

impl<'a, S: Stream> NereidDevice<'a, S> {
    /// Family-tuned defaults.
    pub fn default_options() -> DeviceOptions {
        DeviceOptions {
            timeout_ms: 5000,
            retries: 3,
            multipage_pages: 4,
            ..Default::default()
        }
    }

    /// Open a session on the cradle's serial port.
    pub async fn open(
        stream: S,
        options: &DeviceOptions,
        cancel: &'a CancelFlag,
    ) -> Result<Self, Error> {
        let frame_size =
            (PAGESIZE * options.multipage_pages.max(1)) as usize
                + FRAME_OVERHEAD;
        let mut stream = Hdlc::with_frame_size(stream, frame_size);
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
        Ok(Self {
            link: NereidLink::new(stream, frame_size),
            options: *options,
            policy: RetryPolicy {
                retries: options.retries,
                backoff_ms: 100,
            },
            delay: AdaptiveDelay::fixed(options.inter_packet_delay_ms),
            cancel,
            identity: None,
            fingerprint: None,
        })
    }

    /// Block until the cradle announces a docked device.
    async fn wait_announce(&mut self) -> Result<(), Error> {
        let payload = self.link.read_frame(CMD_ANNOUNCE).await?;
        if !payload.is_empty() {
            return Err(Error::Protocol);
        }
        Ok(())
    }

    async fn identify(&mut self) -> Result<(), Error> {
        let mut version = [0u8; HANDSHAKE_SIZE];
        let n = transfer(
            &mut self.link,
            self.cancel,
            &self.policy,
            &mut self.delay,
            &[CMD_HANDSHAKE],
            &mut version,
        )
        .await?;
        if n != HANDSHAKE_SIZE {
            return Err(Error::Protocol);
        }
        let (row, firmware) = ident::match_version(MODELS, &version)
            .ok_or(Error::Unsupported)?;
        debug::println!("nereid: matched {}", row.name);
        let serial =
            ident::decode_serial(&version[4..8], row.layout.serial);
        self.identity = Some(Identity {
            layout: row.layout,
            version,
            info: DeviceInfo {
                model: row.model,
                firmware,
                serial,
            },
        });
        Ok(())
    }
}

impl<S: Stream> Device for NereidDevice<'_, S> {
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
        if self.identity.is_none() {
            events.on_waiting();
            self.wait_announce().await?;
            self.identify().await?;
        }
        let Some(identity) = &self.identity else {
            return Err(Error::Protocol);
        };
        let layout = identity.layout;
        events.on_vendor(&identity.version);
        events.on_devinfo(&identity.info);

        // the ring pointers live in a flash-map record of their own
        let mut map = [0u8; MAP_SIZE];
        let n = transfer(
            &mut self.link,
            self.cancel,
            &self.policy,
            &mut self.delay,
            &[CMD_MAP],
            &mut map,
        )
        .await?;
        if n != MAP_SIZE {
            return Err(Error::Protocol);
        }
        let pointers = parse_map(layout, &map)?;

        let io = NereidIo {
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

    async fn timesync(&mut self, time: &DateTime) -> Result<(), Error> {
        if time.year < 2000 || time.year > 2255 {
            return Err(Error::InvalidArgs);
        }
        let cmd = [
            CMD_TIME,
            (time.year - 2000) as u8,
            time.month,
            time.day,
            time.hour,
            time.minute,
            time.second,
        ];
        let mut rsp = [0u8; 1];
        let n = transfer(
            &mut self.link,
            self.cancel,
            &self.policy,
            &mut self.delay,
            &cmd,
            &mut rsp,
        )
        .await?;
        if n != 1 || rsp[0] != 0x00 {
            return Err(Error::Protocol);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Error> {
        // nothing to say to an empty cradle
        if self.identity.is_none() {
            return Ok(());
        }
        let mut rsp = [0u8; 1];
        transfer(
            &mut self.link,
            self.cancel,
            &self.policy,
            &mut self.delay,
            &[CMD_QUIT],
            &mut rsp,
        )
        .await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/nereid.rs"]
mod tests;

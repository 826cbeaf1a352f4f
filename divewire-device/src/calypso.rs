//! The calypso family: BLE GATT
//!
//! Calypso devices speak type-length-value commands over the GATT
//! fragmentation framer. The link must be authenticated before it
//! says anything useful: the passphrase is either the access code a
//! previous session stored with the transport, or is derived from the
//! advertised Bluetooth name. The radio drops an idle-looking link
//! mid-download, so the handshake is re-run every few packets as a
//! keepalive.

use crate::debug;
use crate::ident::{self, ModelMatch, SerialFormat};
use crate::{DateTime, Device, DeviceOptions};
use alloc::vec;
use alloc::vec::Vec;
use divewire_proto::ble::BleFramer;
use divewire_proto::extract::{entry_blank, EntryCodec, RingPointers};
use divewire_proto::memory::{
    DeviceMemory, MemoryLayout, PagedMemory, PageReader,
};
use divewire_proto::ring::RingLayout;
use divewire_proto::transfer::{
    transfer, AdaptiveDelay, CancelFlag, Link, RetryPolicy,
};
use divewire_proto::{Clock, DeviceInfo, DiveGeometry, Events, Extractor};
use divewire_stream::stream::ioctl;
use divewire_stream::{Direction, Error, Stream, Timeout};

const CMD_AUTH: u8 = 0x01;
const CMD_VERSION: u8 = 0x02;
const CMD_SERIAL: u8 = 0x04;
const CMD_TIME: u8 = 0x05;
const CMD_READ: u8 = 0x06;
const CMD_CLOCK: u8 = 0x0A;
const CMD_SLEEP: u8 = 0x0F;

const REPLY: u8 = 0x80;
const AUTH_OK: u8 = 0x01;

const PAGESIZE: u32 = 0x100;
const VERSION_SIZE: usize = 16;
const ENTRY_SIZE: u32 = 0x20;
const ACCESS_CODE_SIZE: usize = 4;

/// Fingerprint slice length for this family.
pub const FINGERPRINT_SIZE: usize = 16;

/// Packets between keepalive handshakes while downloading.
pub const HANDSHAKE_INTERVAL: u32 = 8;

// config page 0 field offsets
const CF_FIRST: usize = 0x00;
const CF_LAST: usize = 0x02;
const CF_EOP: usize = 0x04;

/// Memory and ring layout of one calypso model
pub struct CalypsoLayout {
    /// Flash geometry.
    pub memory: MemoryLayout,
    /// Logbook/profile rings.
    pub geometry: DiveGeometry,
    /// Serial number encoding in the serial reply.
    pub serial: SerialFormat,
}

static ONE: CalypsoLayout = CalypsoLayout {
    memory: MemoryLayout {
        size: 0x20000,
        pagesize: PAGESIZE,
        highmem: None,
    },
    geometry: DiveGeometry {
        logbook: RingLayout {
            begin: 0x0100,
            end: 0x0900,
        },
        profile: RingLayout {
            begin: 0x0900,
            end: 0x20000,
        },
        entry_size: ENTRY_SIZE,
    },
    serial: SerialFormat::Binary,
};

static PRO: CalypsoLayout = CalypsoLayout {
    memory: MemoryLayout {
        size: 0x40000,
        pagesize: PAGESIZE,
        highmem: None,
    },
    geometry: DiveGeometry {
        logbook: RingLayout {
            begin: 0x0100,
            end: 0x1100,
        },
        profile: RingLayout {
            begin: 0x1100,
            end: 0x40000,
        },
        entry_size: ENTRY_SIZE,
    },
    serial: SerialFormat::Binary,
};

/// Version record: model, a hardware-revision byte, firmware, then an
/// ASCII tag.
pub static MODELS: &[ModelMatch<CalypsoLayout>] = &[
    ModelMatch {
        pattern: &[
            0x51, 0x01, 0, 0, b'C', b'A', b'L', b'Y', 0, 0, 0, 0, 0, 0,
            0, 0,
        ],
        firmware_min: 0,
        model: 0x51,
        name: "Calypso One",
        layout: &ONE,
    },
    ModelMatch {
        pattern: &[
            0x52, 0x01, 0, 0, b'C', b'A', b'L', b'Y', 0, 0, 0, 0, 0, 0,
            0, 0,
        ],
        firmware_min: 0,
        model: 0x52,
        name: "Calypso Pro",
        layout: &PRO,
    },
];

fn profile_start(entry: &[u8]) -> u32 {
    u32::from_le_bytes([entry[16], entry[17], entry[18], entry[19]])
}

fn profile_end(entry: &[u8]) -> u32 {
    u32::from_le_bytes([entry[20], entry[21], entry[22], entry[23]])
}

static CODEC: EntryCodec = EntryCodec {
    profile_start,
    profile_end: Some(profile_end),
    is_blank: entry_blank,
    fingerprint: 0..FINGERPRINT_SIZE,
};

/// The last `ACCESS_CODE_SIZE` characters of the advertised name.
fn derive_passphrase(name: &[u8]) -> Result<[u8; ACCESS_CODE_SIZE], Error> {
    let name = match name.iter().position(|&b| b == 0) {
        Some(end) => &name[..end],
        None => name,
    };
    if name.len() < ACCESS_CODE_SIZE {
        return Err(Error::Protocol);
    }
    let mut code = [0u8; ACCESS_CODE_SIZE];
    code.copy_from_slice(&name[name.len() - ACCESS_CODE_SIZE..]);
    Ok(code)
}

struct CalypsoLink<S: Stream> {
    stream: S,
    framer: BleFramer,
    buffer: Vec<u8>,
    packets: u32,
    access_code: Option<[u8; ACCESS_CODE_SIZE]>,
}

impl<S: Stream> CalypsoLink<S> {
    /// One TLV exchange, below the keepalive bookkeeping.
    async fn exchange(
        &mut self,
        cmd: &[u8],
        rsp: &mut [u8],
    ) -> Result<usize, Error> {
        let mut request = Vec::with_capacity(3 + cmd.len() - 1);
        request.push(cmd[0]);
        request
            .extend_from_slice(&((cmd.len() - 1) as u16).to_le_bytes());
        request.extend_from_slice(&cmd[1..]);
        self.framer.send(&mut self.stream, &request).await?;
        let n = self
            .framer
            .receive(&mut self.stream, &mut self.buffer)
            .await?;
        if n < 3 || self.buffer[0] != cmd[0] | REPLY {
            return Err(Error::Protocol);
        }
        let length =
            u16::from_le_bytes([self.buffer[1], self.buffer[2]]) as usize;
        if n != 3 + length || length > rsp.len() {
            return Err(Error::Protocol);
        }
        rsp[..length].copy_from_slice(&self.buffer[3..3 + length]);
        Ok(length)
    }

    /// Authenticate the link; also the keepalive.
    async fn handshake(&mut self) -> Result<(), Error> {
        self.packets = 0;
        let (code, fresh) = match self.access_code {
            Some(code) => (code, false),
            None => {
                let mut name = [0u8; 32];
                let n = self
                    .stream
                    .ioctl(ioctl::BLE_NAME, &mut name)
                    .await?;
                (derive_passphrase(&name[..n])?, true)
            }
        };
        let cmd = [CMD_AUTH, code[0], code[1], code[2], code[3]];
        let mut rsp = [0u8; 1];
        let n = self.exchange(&cmd, &mut rsp).await?;
        if n != 1 || rsp[0] != AUTH_OK {
            return Err(Error::Protocol);
        }
        if fresh {
            self.access_code = Some(code);
            // remember it for the next session; the transport may
            // decline, which costs nothing
            let mut stored = code;
            let _ = self
                .stream
                .ioctl(ioctl::BLE_ACCESS_CODE_WRITE, &mut stored)
                .await;
        }
        Ok(())
    }
}

impl<S: Stream> Link for CalypsoLink<S> {
    async fn packet(
        &mut self,
        cmd: &[u8],
        rsp: &mut [u8],
    ) -> Result<usize, Error> {
        if self.packets >= HANDSHAKE_INTERVAL {
            self.handshake().await?;
        }
        self.packets += 1;
        self.exchange(cmd, rsp).await
    }

    fn sleep(&mut self, ms: u32) -> impl core::future::Future<Output = ()> {
        self.stream.sleep(ms)
    }

    async fn recover(&mut self) -> Result<(), Error> {
        self.stream.purge(Direction::INPUT).await
    }
}

struct CalypsoIo<'d, S: Stream> {
    link: &'d mut CalypsoLink<S>,
    policy: RetryPolicy,
    delay: &'d mut AdaptiveDelay,
    cancel: &'d CancelFlag,
}

impl<S: Stream> PageReader for CalypsoIo<'_, S> {
    async fn read_pages(
        &mut self,
        address: u32,
        data: &mut [u8],
    ) -> Result<(), Error> {
        let mut cmd = [0u8; 6];
        cmd[0] = CMD_READ;
        cmd[1..5].copy_from_slice(&address.to_le_bytes());
        cmd[5] = (data.len() as u32 / PAGESIZE) as u8;
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
    layout: &CalypsoLayout,
    config: &[u8],
) -> Result<Option<RingPointers>, Error> {
    let first =
        u16::from_le_bytes([config[CF_FIRST], config[CF_FIRST + 1]]) as u32;
    let last =
        u16::from_le_bytes([config[CF_LAST], config[CF_LAST + 1]]) as u32;
    if first == 0xFFFF || last == 0xFFFF {
        return Ok(None);
    }
    let entries = layout.geometry.entries();
    if first >= entries || last >= entries {
        return Err(Error::DataFormat);
    }
    let eop = u32::from_le_bytes([
        config[CF_EOP],
        config[CF_EOP + 1],
        config[CF_EOP + 2],
        config[CF_EOP + 3],
    ]);
    if !layout.geometry.profile.contains(eop) {
        return Err(Error::DataFormat);
    }
    Ok(Some(RingPointers { first, last, eop }))
}

/// One open session with a calypso device
pub struct CalypsoDevice<'a, S: Stream> {
    link: CalypsoLink<S>,
    options: DeviceOptions,
    policy: RetryPolicy,
    delay: AdaptiveDelay,
    cancel: &'a CancelFlag,
    layout: &'static CalypsoLayout,
    version: [u8; VERSION_SIZE],
    info: DeviceInfo,
    fingerprint: Option<Vec<u8>>,
}

impl<'a, S: Stream> CalypsoDevice<'a, S> {
    /// Family-tuned defaults: BLE is slow, be generous.
    pub fn default_options() -> DeviceOptions {
        DeviceOptions {
            timeout_ms: 8000,
            retries: 3,
            multipage_pages: 4,
            ..Default::default()
        }
    }

    /// Open a session: authenticate, then identify.
    pub async fn open(
        mut stream: S,
        options: &DeviceOptions,
        cancel: &'a CancelFlag,
    ) -> Result<Self, Error> {
        stream.set_timeout(Timeout::Bounded(options.timeout_ms))?;

        // an access code stored by a previous session skips the
        // name-derived passphrase
        let mut code = [0u8; ACCESS_CODE_SIZE];
        let stored = match stream
            .ioctl(ioctl::BLE_ACCESS_CODE_READ, &mut code)
            .await
        {
            Ok(n) if n == ACCESS_CODE_SIZE => Some(code),
            Ok(_) => None,
            Err(Error::Unsupported) => None,
            Err(e) => return Err(e),
        };

        let batch = (PAGESIZE * options.multipage_pages.max(1)) as usize;
        let mut link = CalypsoLink {
            stream,
            framer: BleFramer::new(),
            buffer: vec![0; 3 + batch],
            packets: 0,
            access_code: stored,
        };
        link.handshake().await?;

        let policy = RetryPolicy {
            retries: options.retries,
            backoff_ms: 200,
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
        debug::println!("calypso: matched {}", row.name);

        let mut serial_bytes = [0u8; 4];
        let n = transfer(
            &mut link,
            cancel,
            &policy,
            &mut delay,
            &[CMD_SERIAL],
            &mut serial_bytes,
        )
        .await?;
        if n != serial_bytes.len() {
            return Err(Error::Protocol);
        }
        let serial =
            ident::decode_serial(&serial_bytes, row.layout.serial);
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

impl<S: Stream> Device for CalypsoDevice<'_, S> {
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

        // pair the device clock with the caller's tick sample
        let mut ticks = [0u8; 4];
        let n = transfer(
            &mut self.link,
            self.cancel,
            &self.policy,
            &mut self.delay,
            &[CMD_CLOCK],
            &mut ticks,
        )
        .await?;
        if n != ticks.len() {
            return Err(Error::Protocol);
        }
        events.on_clock(&Clock {
            system: self.options.now_ticks,
            device: u32::from_be_bytes(ticks),
        });

        let layout = self.layout;
        let io = CalypsoIo {
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
        let mut rsp = [0u8; 1];
        transfer(
            &mut self.link,
            self.cancel,
            &self.policy,
            &mut self.delay,
            &[CMD_SLEEP],
            &mut rsp,
        )
        .await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/calypso.rs"]
mod tests;

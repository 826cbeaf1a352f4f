use super::*;
use divewire_stream::mocks::{run, ScriptedStream};
use std::collections::VecDeque;

#[derive(Default)]
struct Collector {
    vendor: Vec<Vec<u8>>,
    devinfo: Vec<DeviceInfo>,
    dives: Vec<Vec<u8>>,
}

impl Events for Collector {
    fn on_vendor(&mut self, data: &[u8]) {
        self.vendor.push(data.to_vec());
    }

    fn on_devinfo(&mut self, info: &DeviceInfo) {
        self.devinfo.push(*info);
    }

    fn on_dive(&mut self, record: &[u8], _fingerprint: &[u8]) -> bool {
        self.dives.push(record.to_vec());
        true
    }
}

fn page_with_sum(seed: u8) -> Vec<u8> {
    let mut page: Vec<u8> = (0..PAGESIZE)
        .map(|i| seed.wrapping_add(i as u8))
        .collect();
    page.push(checksum::sum8(&page, 0));
    page
}

#[test]
fn nak_backoff_grows_the_adaptive_delay() {
    // the device NAKs twice, then serves the page; the inter-packet
    // delay is bumped on each NAK and paces the retries
    let page = page_with_sum(0x11);
    let script = ScriptedStream::new()
        .expect(&[0xB1, 0x02, 0x00])
        .supply(&[NAK])
        .expect(&[0xB1, 0x02, 0x00])
        .supply(&[NAK])
        .expect(&[0xB1, 0x02, 0x00])
        .supply(&[ACK])
        .supply(&page);
    let mut link = BathytecLink { stream: script };
    let cancel = CancelFlag::new();
    let policy = RetryPolicy {
        retries: 2,
        backoff_ms: 0,
    };
    let mut delay = AdaptiveDelay::new(0, 32, 128);
    let mut rsp = [0u8; PAGESIZE as usize];
    let result = run(transfer(
        &mut link,
        &cancel,
        &policy,
        &mut delay,
        &[0xB1, 0x02, 0x00],
        &mut rsp,
    ));
    assert_eq!(result, Ok(PAGESIZE as usize));
    assert_eq!(rsp.to_vec(), page[..PAGESIZE as usize].to_vec());
    assert!(link.stream.finished());
    // two increments, and the retries were paced by them
    assert_eq!(delay.current(), 64);
    assert_eq!(link.stream.sleeps, vec![32, 64]);
    // input purged between attempts
    assert_eq!(link.stream.purges.len(), 2);
}

#[test]
fn bad_checksum_is_a_protocol_error() {
    let mut page = page_with_sum(0x11);
    let last = page.len() - 1;
    page[last] ^= 0xFF;
    let script = ScriptedStream::new()
        .expect(&[0xB1, 0x00, 0x00])
        .supply(&[ACK])
        .supply(&page);
    let mut link = BathytecLink { stream: script };
    let cancel = CancelFlag::new();
    let policy = RetryPolicy {
        retries: 0,
        backoff_ms: 0,
    };
    let mut delay = AdaptiveDelay::fixed(0);
    let mut rsp = [0u8; PAGESIZE as usize];
    let result = run(transfer(
        &mut link,
        &cancel,
        &policy,
        &mut delay,
        &[0xB1, 0x00, 0x00],
        &mut rsp,
    ));
    assert_eq!(result, Err(Error::Protocol));
}

#[test]
fn fast_read_checks_every_page() {
    let page1 = page_with_sum(0x40);
    let page2 = page_with_sum(0x90);
    let script = ScriptedStream::new()
        .expect(&[0xB4, 0x04, 0x00, 0x02])
        .supply(&[ACK])
        .supply(&page1)
        .supply(&page2);
    let mut link = BathytecLink { stream: script };
    let cancel = CancelFlag::new();
    let policy = RetryPolicy {
        retries: 0,
        backoff_ms: 0,
    };
    let mut delay = AdaptiveDelay::fixed(0);
    let mut rsp = [0u8; 2 * PAGESIZE as usize];
    let result = run(transfer(
        &mut link,
        &cancel,
        &policy,
        &mut delay,
        &[0xB4, 0x04, 0x00, 0x02],
        &mut rsp,
    ));
    assert_eq!(result, Ok(2 * PAGESIZE as usize));
    assert_eq!(
        rsp[..PAGESIZE as usize].to_vec(),
        page1[..PAGESIZE as usize].to_vec()
    );
    assert_eq!(
        rsp[PAGESIZE as usize..].to_vec(),
        page2[..PAGESIZE as usize].to_vec()
    );
}

/// A scripted bathytec device over a flash image.
struct BathytecSim {
    image: Vec<u8>,
    version: [u8; VERSION_SIZE],
    pending: VecDeque<u8>,
    cmd: Vec<u8>,
    naks_left: u32,
}

impl BathytecSim {
    fn new(image: Vec<u8>, version: [u8; VERSION_SIZE]) -> Self {
        Self {
            image,
            version,
            pending: VecDeque::new(),
            cmd: Vec::new(),
            naks_left: 0,
        }
    }

    fn push_checked(&mut self, from: usize, len: usize) {
        let sum = checksum::sum8(&self.image[from..from + len], 0);
        for i in 0..len {
            self.pending.push_back(self.image[from + i]);
        }
        self.pending.push_back(sum);
    }

    fn execute(&mut self) {
        let wanted = match self.cmd[0] {
            CMD_HANDSHAKE => 3,
            CMD_VERSION | CMD_QUIT => 2,
            CMD_READ => 3,
            CMD_READ_FAST => 4,
            c => panic!("simulator got unknown command {c:#x}"),
        };
        if self.cmd.len() < wanted {
            return;
        }
        if self.naks_left > 0 {
            self.naks_left -= 1;
            self.pending.push_back(NAK);
            self.cmd.clear();
            return;
        }
        self.pending.push_back(ACK);
        match self.cmd[0] {
            CMD_HANDSHAKE | CMD_QUIT => {}
            CMD_VERSION => {
                let version = self.version;
                for &b in &version {
                    self.pending.push_back(b);
                }
                self.pending.push_back(checksum::sum8(&version, 0));
            }
            CMD_READ => {
                let page =
                    u16::from_le_bytes([self.cmd[1], self.cmd[2]]) as usize;
                self.push_checked(page * PAGESIZE as usize, PAGESIZE as usize);
            }
            CMD_READ_FAST => {
                let page =
                    u16::from_le_bytes([self.cmd[1], self.cmd[2]]) as usize;
                for p in 0..self.cmd[3] as usize {
                    self.push_checked(
                        (page + p) * PAGESIZE as usize,
                        PAGESIZE as usize,
                    );
                }
            }
            _ => unreachable!(),
        }
        self.cmd.clear();
    }
}

impl Stream for BathytecSim {
    fn set_timeout(&mut self, _timeout: Timeout) -> Result<(), Error> {
        Ok(())
    }

    async fn configure(&mut self, _config: &LineConfig) -> Result<(), Error> {
        Ok(())
    }

    async fn read(&mut self, data: &mut [u8]) -> Result<usize, Error> {
        let mut n = 0;
        while n < data.len() {
            match self.pending.pop_front() {
                Some(b) => {
                    data[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        if n == 0 {
            Err(Error::Timeout)
        } else {
            Ok(n)
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.cmd.extend_from_slice(data);
        self.execute();
        Ok(data.len())
    }

    async fn purge(&mut self, direction: Direction) -> Result<(), Error> {
        if direction.contains(Direction::INPUT) {
            self.pending.clear();
        }
        Ok(())
    }

    async fn sleep(&mut self, _ms: u32) {}
}

fn terra_version() -> [u8; VERSION_SIZE] {
    let mut version = [0u8; VERSION_SIZE];
    version[..6].copy_from_slice(&[b'B', b'T', 0x22, 0x01, 0x44, 0x0D]);
    version
}

fn terra_image() -> Vec<u8> {
    let mut image = vec![0xFF; 0x8000];
    for i in 0x0E00..0x8000 {
        image[i] = i as u8;
    }
    // config page 0: packed-BCD serial and ring pointers
    image[..0x100].fill(0);
    image[CF_SERIAL..CF_SERIAL + 4]
        .copy_from_slice(&[0x00, 0x12, 0x34, 0x56]);
    // two entries used; `last` points one past the newest
    image[CF_FIRST..CF_FIRST + 2]
        .copy_from_slice(&0x0600u16.to_le_bytes());
    image[CF_LAST..CF_LAST + 2]
        .copy_from_slice(&0x0640u16.to_le_bytes());
    image[CF_EOP..CF_EOP + 2].copy_from_slice(&0x1200u16.to_le_bytes());
    for index in 0..2u16 {
        let at = 0x0600 + (index as usize) * ENTRY_SIZE as usize;
        let entry = &mut image[at..at + ENTRY_SIZE as usize];
        entry.fill(0);
        entry[0] = 0xB0 | index as u8;
        let start = 0x0E00 + index * 0x200;
        entry[12..14].copy_from_slice(&start.to_le_bytes());
        entry[14..16].copy_from_slice(&(start + 0x200).to_le_bytes());
    }
    image
}

#[test]
fn whole_session_against_the_simulator() {
    let sim = BathytecSim::new(terra_image(), terra_version());
    let cancel = CancelFlag::new();
    let options = BathytecDevice::<BathytecSim>::default_options();
    let mut device =
        run(BathytecDevice::open(sim, &options, &cancel)).unwrap();
    assert_eq!(device.model, 0x22);
    assert_eq!(device.firmware, 0x0144);

    let mut events = Collector::default();
    run(device.download(&mut events)).unwrap();
    assert_eq!(events.vendor, vec![terra_version().to_vec()]);
    assert_eq!(events.devinfo.len(), 1);
    // packed BCD: 00 12 34 56 reads as 123456
    assert_eq!(events.devinfo[0].serial, 123_456);
    let order: Vec<u8> = events.dives.iter().map(|d| d[0]).collect();
    assert_eq!(order, vec![0xB1, 0xB0]);
    for dive in &events.dives {
        assert_eq!(dive.len(), ENTRY_SIZE as usize + 0x200);
    }
    run(device.close()).unwrap();
}

#[test]
fn session_survives_a_nak_storm() {
    let mut sim = BathytecSim::new(terra_image(), terra_version());
    sim.naks_left = 2;
    let cancel = CancelFlag::new();
    let options = BathytecDevice::<BathytecSim>::default_options();
    let mut device =
        run(BathytecDevice::open(sim, &options, &cancel)).unwrap();
    let mut events = Collector::default();
    run(device.download(&mut events)).unwrap();
    assert_eq!(events.dives.len(), 2);
    // the NAKs cost two delay bumps that persist for the session
    assert_eq!(device.delay.current(), 64);
}

#[test]
fn old_firmware_is_unsupported() {
    let mut version = [0u8; VERSION_SIZE];
    version[..6].copy_from_slice(&[b'B', b'T', 0x25, 0x01, 0x00, 0x0D]);
    let sim = BathytecSim::new(terra_image(), version);
    let cancel = CancelFlag::new();
    let options = BathytecDevice::<BathytecSim>::default_options();
    // the Mako table row demands firmware 1.48 or newer
    assert!(matches!(
        run(BathytecDevice::open(sim, &options, &cancel)),
        Err(Error::Unsupported)
    ));
}

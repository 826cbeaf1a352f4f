use super::*;
use divewire_stream::mocks::{run, ScriptedStream};
use std::collections::VecDeque;

#[derive(Default)]
struct Collector {
    devinfo: Vec<DeviceInfo>,
    dives: Vec<Vec<u8>>,
}

impl Events for Collector {
    fn on_devinfo(&mut self, info: &DeviceInfo) {
        self.devinfo.push(*info);
    }

    fn on_dive(&mut self, record: &[u8], _fingerprint: &[u8]) -> bool {
        self.dives.push(record.to_vec());
        true
    }
}

fn make_packet(flag: u8, cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![STARTBYTE, flag, cmd, 0, payload.len() as u8];
    packet.extend_from_slice(payload);
    packet[3] = packet_checksum(&packet[..HEADER_SIZE], payload);
    packet
}

fn stuff(frame: &[u8]) -> Vec<u8> {
    let mut wire = vec![0xC0];
    for &b in frame {
        match b {
            0xC0 => wire.extend_from_slice(&[0xDB, 0xDC]),
            0xDB => wire.extend_from_slice(&[0xDB, 0xDD]),
            b => wire.push(b),
        }
    }
    wire.push(0xC0);
    wire
}

fn unstuff(wire: &[u8]) -> Vec<u8> {
    assert_eq!(wire.first(), Some(&0xC0));
    assert_eq!(wire.last(), Some(&0xC0));
    let mut frame = Vec::new();
    let mut escaped = false;
    for &b in &wire[1..wire.len() - 1] {
        if escaped {
            frame.push(match b {
                0xDC => 0xC0,
                0xDD => 0xDB,
                _ => panic!("bad escape"),
            });
            escaped = false;
        } else if b == 0xDB {
            escaped = true;
        } else {
            frame.push(b);
        }
    }
    frame
}

fn scripted_link(script: ScriptedStream) -> PelagicLink<ScriptedStream> {
    PelagicLink {
        stream: Slip::with_frame_size(script, 512),
        buffer: vec![0; HEADER_SIZE + 0xFF],
    }
}

#[test]
fn multi_packet_responses_reassemble() {
    let request = make_packet(FLAG_LAST, CMD_VERSION, &[]);
    let data1 = make_packet(0x00, CMD_VERSION, &[1, 2, 3]);
    let data2 = make_packet(0x00, CMD_VERSION, &[4, 5]);
    let done = make_packet(FLAG_LAST, CMD_VERSION, &[0x01]);
    let script = ScriptedStream::new()
        .expect(&stuff(&request))
        .supply(&stuff(&data1))
        .supply(&stuff(&data2))
        .supply(&stuff(&done));
    let mut link = scripted_link(script);
    let mut rsp = [0u8; 16];
    let result = run(link.packet(&[CMD_VERSION], &mut rsp));
    assert_eq!(result, Ok(5));
    assert_eq!(&rsp[..5], &[1, 2, 3, 4, 5]);
}

#[test]
fn unexpected_response_code_is_a_protocol_error() {
    let request = make_packet(FLAG_LAST, CMD_VERSION, &[]);
    // 0x42 closes reads, not version queries
    let done = make_packet(FLAG_LAST, CMD_VERSION, &[0x42]);
    let script = ScriptedStream::new()
        .expect(&stuff(&request))
        .supply(&stuff(&done));
    let mut link = scripted_link(script);
    let mut rsp = [0u8; 16];
    assert_eq!(
        run(link.packet(&[CMD_VERSION], &mut rsp)),
        Err(Error::Protocol)
    );
}

#[test]
fn corrupted_checksum_is_a_protocol_error() {
    let request = make_packet(FLAG_LAST, CMD_VERSION, &[]);
    let mut done = make_packet(FLAG_LAST, CMD_VERSION, &[0x01]);
    done[3] ^= 0x55;
    let script = ScriptedStream::new()
        .expect(&stuff(&request))
        .supply(&stuff(&done));
    let mut link = scripted_link(script);
    let mut rsp = [0u8; 16];
    assert_eq!(
        run(link.packet(&[CMD_VERSION], &mut rsp)),
        Err(Error::Protocol)
    );
}

#[test]
fn unknown_commands_are_rejected_locally() {
    let script = ScriptedStream::new();
    let mut link = scripted_link(script);
    let mut rsp = [0u8; 16];
    assert_eq!(
        run(link.packet(&[0x77], &mut rsp)),
        Err(Error::InvalidArgs)
    );
}

/// A scripted pelagic device at the SLIP level.
struct PelagicSim {
    image: Vec<u8>,
    version: [u8; VERSION_SIZE],
    pending: VecDeque<u8>,
}

impl PelagicSim {
    fn new(image: Vec<u8>, version: [u8; VERSION_SIZE]) -> Self {
        Self {
            image,
            version,
            pending: VecDeque::new(),
        }
    }

    fn respond(&mut self, flag: u8, cmd: u8, payload: &[u8]) {
        for b in stuff(&make_packet(flag, cmd, payload)) {
            self.pending.push_back(b);
        }
    }

    fn handle(&mut self, packet: &[u8]) {
        assert_eq!(packet[0], STARTBYTE);
        let cmd = packet[2];
        let length = packet[4] as usize;
        let payload = packet[HEADER_SIZE..HEADER_SIZE + length].to_vec();
        match cmd {
            CMD_VERSION => {
                let version = self.version;
                self.respond(0x00, cmd, &version);
                self.respond(FLAG_LAST, cmd, &[0x01]);
            }
            CMD_READ => {
                let address = u24_le(&payload[0..3]) as usize;
                let len =
                    u16::from_le_bytes([payload[3], payload[4]]) as usize;
                let data = self.image[address..address + len].to_vec();
                for chunk in data.chunks(PAGESIZE as usize) {
                    self.respond(0x00, cmd, chunk);
                }
                self.respond(FLAG_LAST, cmd, &[0x42]);
            }
            CMD_QUIT => self.respond(FLAG_LAST, cmd, &[0x00]),
            c => panic!("simulator got unknown command {c:#x}"),
        }
    }
}

impl Stream for PelagicSim {
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
        let packet = unstuff(data);
        self.handle(&packet);
        Ok(data.len())
    }

    async fn purge(&mut self, _direction: Direction) -> Result<(), Error> {
        Ok(())
    }

    async fn sleep(&mut self, _ms: u32) {}
}

fn dx_version() -> [u8; VERSION_SIZE] {
    let mut version = [0u8; VERSION_SIZE];
    version[..10].copy_from_slice(&[
        b'P', b'X', 0x71, 0x02, 0x01, 0x2E, 0x00, 0x0B, 0xDC, 0x04,
    ]);
    version
}

fn dx_image() -> Vec<u8> {
    let mut image = vec![0xFF; 0x20000];
    for i in 0x800..0x1000 {
        image[i] = (i >> 3) as u8;
    }
    image[..0x80].fill(0);
    image[0..2].copy_from_slice(&0u16.to_le_bytes());
    image[2..4].copy_from_slice(&1u16.to_le_bytes());
    image[4..8].copy_from_slice(&0x1000u32.to_le_bytes());
    for index in 0..2u32 {
        let at = 0x400 + (index as usize) * ENTRY_SIZE as usize;
        let entry = &mut image[at..at + ENTRY_SIZE as usize];
        entry.fill(0);
        entry[0] = 0x70;
        entry[1] = index as u8;
        let start = 0x800 + index * 0x400;
        entry[6..9].copy_from_slice(&start.to_le_bytes()[..3]);
        entry[9..12]
            .copy_from_slice(&(start + 0x400).to_le_bytes()[..3]);
    }
    image
}

#[test]
fn whole_session_against_the_simulator() {
    let sim = PelagicSim::new(dx_image(), dx_version());
    let cancel = CancelFlag::new();
    let options = PelagicDevice::<PelagicSim>::default_options();
    let mut device =
        run(PelagicDevice::open(sim, &options, &cancel)).unwrap();
    assert_eq!(device.info.model, 0x71);
    assert_eq!(device.info.firmware, 0x0201);
    assert_eq!(device.info.serial, 0x000BDC04);

    let mut events = Collector::default();
    run(device.download(&mut events)).unwrap();
    assert_eq!(events.devinfo.len(), 1);
    let order: Vec<u8> = events.dives.iter().map(|d| d[1]).collect();
    assert_eq!(order, vec![1, 0]);
    for dive in &events.dives {
        assert_eq!(dive.len(), ENTRY_SIZE as usize + 0x400);
    }
    run(device.close()).unwrap();
}

#[test]
fn fingerprint_cutoff_in_a_full_session() {
    let sim = PelagicSim::new(dx_image(), dx_version());
    let cancel = CancelFlag::new();
    let options = PelagicDevice::<PelagicSim>::default_options();
    let mut device =
        run(PelagicDevice::open(sim, &options, &cancel)).unwrap();
    // the older dive's fingerprint: only the newer one arrives
    let fp = [0x70, 0x00, 0, 0, 0, 0];
    device.set_fingerprint(&fp).unwrap();
    let mut events = Collector::default();
    run(device.download(&mut events)).unwrap();
    let order: Vec<u8> = events.dives.iter().map(|d| d[1]).collect();
    assert_eq!(order, vec![1]);
}

#[test]
fn too_old_firmware_is_unsupported() {
    let mut version = dx_version();
    version[2] = 0x74;
    version[3] = 0x01;
    version[4] = 0x00;
    let sim = PelagicSim::new(dx_image(), version);
    let cancel = CancelFlag::new();
    let options = PelagicDevice::<PelagicSim>::default_options();
    assert!(matches!(
        run(PelagicDevice::open(sim, &options, &cancel)),
        Err(Error::Unsupported)
    ));
}

use super::*;
use divewire_stream::mocks::{run, ScriptedStream};
use std::collections::VecDeque;

#[derive(Default)]
struct Collector {
    vendor: Vec<Vec<u8>>,
    devinfo: Vec<DeviceInfo>,
    dives: Vec<Vec<u8>>,
    waits: u32,
}

impl Events for Collector {
    fn on_vendor(&mut self, data: &[u8]) {
        self.vendor.push(data.to_vec());
    }

    fn on_devinfo(&mut self, info: &DeviceInfo) {
        self.devinfo.push(*info);
    }

    fn on_waiting(&mut self) {
        self.waits += 1;
    }

    fn on_dive(&mut self, record: &[u8], _fingerprint: &[u8]) -> bool {
        self.dives.push(record.to_vec());
        true
    }
}

fn frame(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 7);
    body.push(HEADER);
    body.extend_from_slice(&(1 + payload.len() as u16).to_le_bytes());
    body.push(cmd);
    body.extend_from_slice(payload);
    let crc = checksum::crc16_ccitt(&body[3..], 0xFFFF);
    body.push((crc >> 8) as u8);
    body.push(crc as u8);
    body.push(TRAILER);
    body
}

fn stuff(frame: &[u8]) -> Vec<u8> {
    let mut wire = vec![0x7E];
    for &b in frame {
        if b == 0x7E || b == 0x7D {
            wire.push(0x7D);
            wire.push(b ^ 0x20);
        } else {
            wire.push(b);
        }
    }
    wire.push(0x7E);
    wire
}

fn unstuff(wire: &[u8]) -> Vec<u8> {
    assert_eq!(wire.first(), Some(&0x7E));
    assert_eq!(wire.last(), Some(&0x7E));
    let mut frame = Vec::new();
    let mut escaped = false;
    for &b in &wire[1..wire.len() - 1] {
        if escaped {
            frame.push(b ^ 0x20);
            escaped = false;
        } else if b == 0x7D {
            escaped = true;
        } else {
            frame.push(b);
        }
    }
    frame
}

/// A scripted nereid cradle speaking HDLC-framed packets over a
/// flash image. The announce frame is queued from the start.
struct NereidSim {
    image: Vec<u8>,
    version: [u8; HANDSHAKE_SIZE],
    map: [u8; MAP_SIZE],
    pending: VecDeque<u8>,
    bad_clock: bool,
}

impl NereidSim {
    fn new(
        image: Vec<u8>,
        version: [u8; HANDSHAKE_SIZE],
        map: [u8; MAP_SIZE],
    ) -> Self {
        let mut sim = Self {
            image,
            version,
            map,
            pending: VecDeque::new(),
            bad_clock: false,
        };
        sim.respond(CMD_ANNOUNCE, &[]);
        sim
    }

    fn respond(&mut self, cmd: u8, payload: &[u8]) {
        for b in stuff(&frame(cmd, payload)) {
            self.pending.push_back(b);
        }
    }

    fn handle(&mut self, request: &[u8]) {
        assert_eq!(request[0], HEADER);
        let length =
            u16::from_le_bytes([request[1], request[2]]) as usize;
        let cmd = request[3];
        let payload = request[4..3 + length].to_vec();
        match cmd {
            CMD_HANDSHAKE => {
                let version = self.version;
                self.respond(cmd | REPLY, &version);
            }
            CMD_MAP => {
                let map = self.map;
                self.respond(cmd | REPLY, &map);
            }
            CMD_READ => {
                let address = u32::from_le_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]) as usize;
                let len = u16::from_le_bytes([payload[4], payload[5]])
                    as usize;
                let data = self.image[address..address + len].to_vec();
                self.respond(cmd | REPLY, &data);
            }
            CMD_TIME => {
                let rc = if self.bad_clock { 0x13 } else { 0x00 };
                self.respond(cmd | REPLY, &[rc]);
            }
            CMD_QUIT => self.respond(cmd | REPLY, &[0x00]),
            c => panic!("simulator got unknown command {c:#x}"),
        }
    }
}

impl Stream for NereidSim {
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
        let request = unstuff(data);
        self.handle(&request);
        Ok(data.len())
    }

    async fn purge(&mut self, _direction: Direction) -> Result<(), Error> {
        Ok(())
    }

    async fn sleep(&mut self, _ms: u32) {}
}

fn trace_version() -> [u8; HANDSHAKE_SIZE] {
    let mut version = [0u8; HANDSHAKE_SIZE];
    version[..8].copy_from_slice(&[
        0x31, 0x02, 0x07, 0x01, 0x00, 0xBC, 0x61, 0x4E,
    ]);
    version
}

fn trace_map() -> [u8; MAP_SIZE] {
    let mut map = [0u8; MAP_SIZE];
    map[0..2].copy_from_slice(&0u16.to_le_bytes());
    map[2..4].copy_from_slice(&1u16.to_le_bytes());
    map[4..8].copy_from_slice(&0x2000u32.to_le_bytes());
    map
}

fn trace_image() -> Vec<u8> {
    let mut image = vec![0xFF; 0x20000];
    for i in 0x1800..0x2000 {
        image[i] = i as u8;
    }
    for index in 0..2u32 {
        let at = 0x1000 + (index as usize) * ENTRY_SIZE as usize;
        let entry = &mut image[at..at + ENTRY_SIZE as usize];
        entry.fill(0);
        entry[0] = 0x4E;
        entry[1] = index as u8;
        let start = 0x1800 + index * 0x400;
        entry[12..16].copy_from_slice(&start.to_le_bytes());
    }
    image
}

#[test]
fn whole_session_against_the_simulator() {
    let sim = NereidSim::new(trace_image(), trace_version(), trace_map());
    let cancel = CancelFlag::new();
    let options = NereidDevice::<NereidSim>::default_options();
    let mut device =
        run(NereidDevice::open(sim, &options, &cancel)).unwrap();

    let mut events = Collector::default();
    run(device.download(&mut events)).unwrap();
    assert_eq!(events.waits, 1);
    assert_eq!(events.vendor, vec![trace_version().to_vec()]);
    assert_eq!(events.devinfo.len(), 1);
    assert_eq!(events.devinfo[0].model, 0x31);
    assert_eq!(events.devinfo[0].firmware, 0x0207);
    assert_eq!(events.devinfo[0].serial, 0x00BC614E);
    let order: Vec<u8> = events.dives.iter().map(|d| d[1]).collect();
    assert_eq!(order, vec![1, 0]);
    run(device.close()).unwrap();
}

#[test]
fn timesync_validates_the_response_code() {
    let mut sim =
        NereidSim::new(trace_image(), trace_version(), trace_map());
    sim.bad_clock = true;
    let cancel = CancelFlag::new();
    let options = NereidDevice::<NereidSim>::default_options();
    let mut device =
        run(NereidDevice::open(sim, &options, &cancel)).unwrap();
    let time = DateTime {
        year: 2026,
        month: 8,
        day: 1,
        hour: 12,
        minute: 30,
        second: 0,
    };
    assert_eq!(run(device.timesync(&time)), Err(Error::Protocol));

    let sim = NereidSim::new(trace_image(), trace_version(), trace_map());
    let mut device =
        run(NereidDevice::open(sim, &options, &cancel)).unwrap();
    assert_eq!(run(device.timesync(&time)), Ok(()));
}

#[test]
fn timesync_rejects_out_of_range_years() {
    let sim = NereidSim::new(trace_image(), trace_version(), trace_map());
    let cancel = CancelFlag::new();
    let options = NereidDevice::<NereidSim>::default_options();
    let mut device =
        run(NereidDevice::open(sim, &options, &cancel)).unwrap();
    let time = DateTime {
        year: 1999,
        month: 12,
        day: 31,
        hour: 23,
        minute: 59,
        second: 59,
    };
    assert_eq!(run(device.timesync(&time)), Err(Error::InvalidArgs));
}

#[test]
fn empty_map_downloads_zero_dives() {
    let mut map = trace_map();
    map[0] = 0xFF;
    map[1] = 0xFF;
    let sim = NereidSim::new(trace_image(), trace_version(), map);
    let cancel = CancelFlag::new();
    let options = NereidDevice::<NereidSim>::default_options();
    let mut device =
        run(NereidDevice::open(sim, &options, &cancel)).unwrap();
    let mut events = Collector::default();
    run(device.download(&mut events)).unwrap();
    assert!(events.dives.is_empty());
}

#[test]
fn corrupted_crc_is_a_protocol_error() {
    // a handshake reply whose CRC was flipped
    let mut reply = frame(CMD_HANDSHAKE | REPLY, &trace_version());
    let at = reply.len() - 2;
    reply[at] ^= 0xFF;
    let script = ScriptedStream::new()
        .expect(&stuff(&frame(CMD_HANDSHAKE, &[])))
        .supply(&stuff(&reply));
    let mut link = NereidLink::new(Hdlc::new(script), 64);
    let mut rsp = [0u8; HANDSHAKE_SIZE];
    let result = run(link.packet(&[CMD_HANDSHAKE], &mut rsp));
    assert_eq!(result, Err(Error::Protocol));
}

#[test]
fn frame_bytes_are_exact_on_the_wire() {
    let reply = frame(CMD_MAP | REPLY, &trace_map());
    let script = ScriptedStream::new()
        .expect(&stuff(&frame(CMD_MAP, &[])))
        .supply(&stuff(&reply));
    let mut link = NereidLink::new(Hdlc::new(script), 64);
    let mut rsp = [0u8; MAP_SIZE];
    let result = run(link.packet(&[CMD_MAP], &mut rsp));
    assert_eq!(result, Ok(MAP_SIZE));
    assert_eq!(rsp.to_vec(), trace_map().to_vec());
}

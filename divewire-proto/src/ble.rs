use divewire_stream::{Error, Stream};

/// Vendor marker carried in byte 0 of every GATT packet.
pub const MARKER: u8 = 0xCD;

/// Largest payload carried by one GATT fragment.
pub const MAX_FRAGMENT: usize = 16;

/// Direction bit: set on device-to-host packets.
const DIRECTION: u8 = 0x80;
/// Constant marker bit, always set.
const RESERVED: u8 = 0x40;
/// Continuation bit: set when more fragments follow.
const CONTINUATION: u8 = 0x20;
/// Mask of the 5-bit per-command packet sequence number.
const SEQUENCE_MASK: u8 = 0x1F;

#[repr(C)]
#[derive(Copy, Clone)]
struct Header {
    marker: u8,
    control: u8,
    command: u8,
    length: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for Header {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for Header {}

/// The GATT fragmentation framer used by BLE families
///
/// Payloads travel as a run of fixed-shape notifications: a vendor
/// marker, a control byte (`d/1/c/sssss`: direction, a constant one,
/// continuation, and a 5-bit packet sequence number reset to zero per
/// command), a command sequence number incremented per command across
/// the session, a payload length of 1..=16, then the payload bytes.
///
/// On receive every header byte is verified, including that the
/// reply's direction bit is set and its command sequence matches the
/// most recent outgoing command; fragments are reassembled and a
/// response longer than the caller's buffer is a protocol error.
#[derive(Default)]
pub struct BleFramer {
    next: u8,
    last: u8,
}

impl BleFramer {
    /// A framer with its command sequence at zero, as after connect.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fragment `payload` and put it on the wire as one command.
    pub async fn send<S: Stream>(
        &mut self,
        stream: &mut S,
        payload: &[u8],
    ) -> Result<(), Error> {
        if payload.is_empty()
            || payload.len() > MAX_FRAGMENT * (SEQUENCE_MASK as usize + 1)
        {
            return Err(Error::InvalidArgs);
        }
        let command = self.next;
        self.next = self.next.wrapping_add(1);
        self.last = command;

        let mut packet = [0u8; 4 + MAX_FRAGMENT];
        for (index, chunk) in payload.chunks(MAX_FRAGMENT).enumerate() {
            let more = (index + 1) * MAX_FRAGMENT < payload.len();
            let header = Header {
                marker: MARKER,
                control: RESERVED
                    | if more { CONTINUATION } else { 0 }
                    | (index as u8 & SEQUENCE_MASK),
                command,
                length: chunk.len() as u8,
            };
            packet[..4].copy_from_slice(bytemuck::bytes_of(&header));
            packet[4..4 + chunk.len()].copy_from_slice(chunk);
            stream.write_all(&packet[..4 + chunk.len()]).await?;
        }
        Ok(())
    }

    /// Reassemble the response to the most recent command into `rsp`;
    /// resolves with the payload length.
    pub async fn receive<S: Stream>(
        &mut self,
        stream: &mut S,
        rsp: &mut [u8],
    ) -> Result<usize, Error> {
        let mut offset = 0;
        let mut expected: u8 = 0;
        loop {
            let mut header = [0u8; 4];
            stream.read_exact(&mut header).await?;
            let control = header[1];
            if header[0] != MARKER
                || control & DIRECTION == 0
                || control & RESERVED == 0
                || control & SEQUENCE_MASK != expected & SEQUENCE_MASK
                || header[2] != self.last
            {
                return Err(Error::Protocol);
            }
            let length = header[3] as usize;
            if length == 0 || length > MAX_FRAGMENT {
                return Err(Error::Protocol);
            }
            if offset + length > rsp.len() {
                // over-long frame
                return Err(Error::Protocol);
            }
            stream.read_exact(&mut rsp[offset..offset + length]).await?;
            offset += length;
            if control & CONTINUATION == 0 {
                return Ok(offset);
            }
            expected = expected.wrapping_add(1);
        }
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/ble.rs"]
mod tests;

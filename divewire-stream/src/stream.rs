use crate::error::Error;
use core::future::Future;

/// Timeout mode for blocking reads
///
/// The timeout is owned by the transport: a bounded read that sees no
/// data within its deadline resolves with [`Error::Timeout`], and the
/// protocol engines above decide whether that is retryable.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Timeout {
    /// Block until data arrives, however long that takes.
    Blocking,
    /// Never block; a read with no data ready returns zero bytes.
    NonBlocking,
    /// Block for at most this many milliseconds.
    Bounded(u32),
}

/// Parity of a serial line
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Parity {
    /// No parity bit
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Number of stop bits on a serial line
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum StopBits {
    /// One stop bit
    One,
    /// One and a half stop bits
    OneAndAHalf,
    /// Two stop bits
    Two,
}

/// Flow control discipline of a serial line
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum FlowControl {
    /// No flow control
    None,
    /// RTS/CTS hardware flow control
    Hardware,
    /// XON/XOFF software flow control
    Software,
}

/// Serial line settings applied by a family at open time
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct LineConfig {
    /// Baud rate in bits per second
    pub baud: u32,
    /// Data bits per character, usually 8
    pub data_bits: u8,
    /// Parity discipline
    pub parity: Parity,
    /// Stop bits per character
    pub stop_bits: StopBits,
    /// Flow control discipline
    pub flow: FlowControl,
}

bitflags::bitflags! {
    /// Which half of the channel a purge discards
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct Direction: u8 {
        /// Discard bytes received but not yet read
        const INPUT = 0x01;
        /// Discard bytes written but not yet transmitted
        const OUTPUT = 0x02;
        /// Both directions
        const ALL = 0x03;
    }
}

bitflags::bitflags! {
    /// Modem status lines reported by [`Stream::get_lines`]
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct Lines: u8 {
        /// Clear To Send
        const CTS = 0x01;
        /// Data Set Ready
        const DSR = 0x02;
        /// Carrier Detect
        const CD = 0x04;
        /// Ring Indicator
        const RI = 0x08;
    }
}

/// Out-of-band `ioctl` request codes
///
/// BLE transports expose a few queries that have no byte-stream
/// representation; families issue them through [`Stream::ioctl`].
pub mod ioctl {
    /// Read the advertised Bluetooth device name into the buffer.
    pub const BLE_NAME: u32 = 0x4201;
    /// Read the access code the transport has stored for this device.
    pub const BLE_ACCESS_CODE_READ: u32 = 0x4202;
    /// Store the access code in the buffer for future sessions.
    pub const BLE_ACCESS_CODE_WRITE: u32 = 0x4203;
    /// Read the pairing PIN code into the buffer.
    pub const BLE_PIN: u32 = 0x4204;
}

/// An abstract byte-oriented duplex channel to one dive computer
///
/// Implementations are transport drivers (serial, USB-HID, BLE GATT,
/// IrDA) supplied by the caller, or the [`Hdlc`](crate::Hdlc) /
/// [`Slip`](crate::Slip) decorators wrapping another stream.
///
/// Everything that can touch the wire is an async method; nothing here
/// spawns or yields except by awaiting the transport. Operations a
/// transport cannot provide default to [`Error::Unsupported`], so a
/// BLE stream need not invent modem lines and a serial port need not
/// invent an `ioctl` channel.
pub trait Stream {
    /// Apply serial line settings.
    fn configure(
        &mut self,
        _config: &LineConfig,
    ) -> impl Future<Output = Result<(), Error>> {
        futures::future::ready(Err(Error::Unsupported))
    }

    /// Set the timeout mode governing subsequent reads.
    fn set_timeout(&mut self, timeout: Timeout) -> Result<(), Error>;

    /// Set the DTR line.
    fn set_dtr(
        &mut self,
        _level: bool,
    ) -> impl Future<Output = Result<(), Error>> {
        futures::future::ready(Err(Error::Unsupported))
    }

    /// Set the RTS line.
    fn set_rts(
        &mut self,
        _level: bool,
    ) -> impl Future<Output = Result<(), Error>> {
        futures::future::ready(Err(Error::Unsupported))
    }

    /// Assert or release a break condition.
    fn set_break(
        &mut self,
        _level: bool,
    ) -> impl Future<Output = Result<(), Error>> {
        futures::future::ready(Err(Error::Unsupported))
    }

    /// Read the modem status lines.
    fn get_lines(&mut self) -> Result<Lines, Error> {
        Err(Error::Unsupported)
    }

    /// Read up to `data.len()` bytes; resolves with the number
    /// actually read, or [`Error::Timeout`] if the deadline set by
    /// [`set_timeout`](Stream::set_timeout) passed with nothing
    /// received at all.
    fn read(
        &mut self,
        data: &mut [u8],
    ) -> impl Future<Output = Result<usize, Error>>;

    /// Write up to `data.len()` bytes; resolves with the number
    /// actually accepted.
    fn write(
        &mut self,
        data: &[u8],
    ) -> impl Future<Output = Result<usize, Error>>;

    /// Wait until everything written has left the transport.
    fn flush(&mut self) -> impl Future<Output = Result<(), Error>> {
        futures::future::ready(Ok(()))
    }

    /// Discard unread and/or untransmitted bytes.
    fn purge(
        &mut self,
        _direction: Direction,
    ) -> impl Future<Output = Result<(), Error>> {
        futures::future::ready(Ok(()))
    }

    /// Suspend the session for `ms` milliseconds. Protocol timings
    /// (wake-up settles, half-duplex turnarounds) go through here so
    /// transports can implement them with whatever clock they own.
    fn sleep(&mut self, ms: u32) -> impl Future<Output = ()>;

    /// Wait up to `ms` milliseconds for at least one byte to become
    /// readable.
    fn wait_ready(
        &mut self,
        _ms: u32,
    ) -> impl Future<Output = Result<(), Error>> {
        futures::future::ready(Err(Error::Unsupported))
    }

    /// Number of bytes that can be read without blocking.
    fn available(&mut self) -> Result<usize, Error> {
        Err(Error::Unsupported)
    }

    /// Issue an out-of-band request (see [`ioctl`]); resolves with the
    /// number of bytes produced into `data`.
    fn ioctl(
        &mut self,
        _request: u32,
        _data: &mut [u8],
    ) -> impl Future<Output = Result<usize, Error>> {
        futures::future::ready(Err(Error::Unsupported))
    }

    /// Read exactly `data.len()` bytes or fail.
    ///
    /// A short read that then times out surfaces as the transport's
    /// timeout error; a read that returns zero bytes without an error
    /// is treated as a timeout too, so non-blocking transports cannot
    /// spin here.
    fn read_exact(
        &mut self,
        data: &mut [u8],
    ) -> impl Future<Output = Result<(), Error>>
    where
        Self: Sized,
    {
        async move {
            let mut offset = 0;
            while offset < data.len() {
                let n = self.read(&mut data[offset..]).await?;
                if n == 0 {
                    return Err(Error::Timeout);
                }
                offset += n;
            }
            Ok(())
        }
    }

    /// Write all of `data` or fail.
    fn write_all(
        &mut self,
        data: &[u8],
    ) -> impl Future<Output = Result<(), Error>>
    where
        Self: Sized,
    {
        async move {
            let mut offset = 0;
            while offset < data.len() {
                let n = self.write(&data[offset..]).await?;
                if n == 0 {
                    return Err(Error::Io);
                }
                offset += n;
            }
            Ok(())
        }
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/stream.rs"]
mod tests;

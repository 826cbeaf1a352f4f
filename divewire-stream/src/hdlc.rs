use crate::error::Error;
use crate::stream::{Direction, LineConfig, Lines, Stream, Timeout};
use alloc::vec;
use alloc::vec::Vec;

/// Frame delimiter
const END: u8 = 0x7E;
/// Escape introducer
const ESC: u8 = 0x7D;
/// XORed onto an escaped byte
const XOR: u8 = 0x20;

/// Default largest decoded frame, in bytes
pub const DEFAULT_FRAME_SIZE: usize = 1024;

const INPUT_BUFFER_SIZE: usize = 256;

/// HDLC-style byte-stuffing decorator
///
/// Wraps a base [`Stream`] and presents the same contract, but with
/// each `write` emitting one `0x7E`-delimited frame (occurrences of
/// `0x7E`/`0x7D` in the payload escaped as `0x7D, byte ^ 0x20`) and
/// each `read` yielding bytes of one decoded frame.
///
/// On read, bytes are discarded until an opening delimiter, the frame
/// body is collected with the inverse transform applied, and the frame
/// ends at the closing delimiter. An escape introducer followed by
/// another escape or a delimiter is a protocol error. An empty frame
/// yields a zero-byte read.
///
/// All buffers are allocated at construction and never resized; the
/// input buffer exists only to batch reads from the base stream.
pub struct Hdlc<S: Stream> {
    inner: S,
    inbuf: Vec<u8>,
    inpos: usize,
    inlen: usize,
    frame: Vec<u8>,
    framepos: usize,
    framelen: usize,
    outbuf: Vec<u8>,
}

impl<S: Stream> Hdlc<S> {
    /// Wrap `inner`, accepting frames up to [`DEFAULT_FRAME_SIZE`].
    pub fn new(inner: S) -> Self {
        Self::with_frame_size(inner, DEFAULT_FRAME_SIZE)
    }

    /// Wrap `inner`, accepting decoded frames up to `frame_size` bytes.
    pub fn with_frame_size(inner: S, frame_size: usize) -> Self {
        Self {
            inner,
            inbuf: vec![0; INPUT_BUFFER_SIZE],
            inpos: 0,
            inlen: 0,
            frame: vec![0; frame_size],
            framepos: 0,
            framelen: 0,
            outbuf: vec![0; 2 * frame_size + 2],
        }
    }

    async fn next_byte(&mut self) -> Result<u8, Error> {
        if self.inpos == self.inlen {
            let n = self.inner.read(&mut self.inbuf).await?;
            if n == 0 {
                return Err(Error::Timeout);
            }
            self.inpos = 0;
            self.inlen = n;
        }
        let b = self.inbuf[self.inpos];
        self.inpos += 1;
        Ok(b)
    }

    fn push_frame_byte(&mut self, b: u8) -> Result<(), Error> {
        if self.framelen == self.frame.len() {
            return Err(Error::Protocol);
        }
        self.frame[self.framelen] = b;
        self.framelen += 1;
        Ok(())
    }

    async fn decode_frame(&mut self) -> Result<(), Error> {
        self.framepos = 0;
        self.framelen = 0;
        loop {
            if self.next_byte().await? == END {
                break;
            }
        }
        loop {
            match self.next_byte().await? {
                END => return Ok(()),
                ESC => {
                    let b = self.next_byte().await?;
                    if b == ESC || b == END {
                        return Err(Error::Protocol);
                    }
                    self.push_frame_byte(b ^ XOR)?;
                }
                b => self.push_frame_byte(b)?,
            }
        }
    }
}

impl<S: Stream> Stream for Hdlc<S> {
    fn configure(
        &mut self,
        config: &LineConfig,
    ) -> impl core::future::Future<Output = Result<(), Error>> {
        self.inner.configure(config)
    }

    fn set_timeout(&mut self, timeout: Timeout) -> Result<(), Error> {
        self.inner.set_timeout(timeout)
    }

    fn set_dtr(
        &mut self,
        level: bool,
    ) -> impl core::future::Future<Output = Result<(), Error>> {
        self.inner.set_dtr(level)
    }

    fn set_rts(
        &mut self,
        level: bool,
    ) -> impl core::future::Future<Output = Result<(), Error>> {
        self.inner.set_rts(level)
    }

    fn set_break(
        &mut self,
        level: bool,
    ) -> impl core::future::Future<Output = Result<(), Error>> {
        self.inner.set_break(level)
    }

    fn get_lines(&mut self) -> Result<Lines, Error> {
        self.inner.get_lines()
    }

    async fn read(&mut self, data: &mut [u8]) -> Result<usize, Error> {
        if self.framepos == self.framelen {
            self.decode_frame().await?;
        }
        let n = data.len().min(self.framelen - self.framepos);
        data[..n].copy_from_slice(&self.frame[self.framepos..self.framepos + n]);
        self.framepos += n;
        Ok(n)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        if data.len() > self.frame.len() {
            return Err(Error::InvalidArgs);
        }
        let mut n = 0;
        self.outbuf[n] = END;
        n += 1;
        for &b in data {
            if b == END || b == ESC {
                self.outbuf[n] = ESC;
                self.outbuf[n + 1] = b ^ XOR;
                n += 2;
            } else {
                self.outbuf[n] = b;
                n += 1;
            }
        }
        self.outbuf[n] = END;
        n += 1;
        let (inner, outbuf) = (&mut self.inner, &self.outbuf);
        inner.write_all(&outbuf[..n]).await?;
        Ok(data.len())
    }

    fn flush(
        &mut self,
    ) -> impl core::future::Future<Output = Result<(), Error>> {
        self.inner.flush()
    }

    async fn purge(&mut self, direction: Direction) -> Result<(), Error> {
        if direction.contains(Direction::INPUT) {
            self.inpos = 0;
            self.inlen = 0;
            self.framepos = 0;
            self.framelen = 0;
        }
        self.inner.purge(direction).await
    }

    fn sleep(&mut self, ms: u32) -> impl core::future::Future<Output = ()> {
        self.inner.sleep(ms)
    }

    fn wait_ready(
        &mut self,
        ms: u32,
    ) -> impl core::future::Future<Output = Result<(), Error>> {
        self.inner.wait_ready(ms)
    }

    fn available(&mut self) -> Result<usize, Error> {
        if self.framepos < self.framelen {
            Ok(self.framelen - self.framepos)
        } else {
            self.inner.available()
        }
    }

    fn ioctl(
        &mut self,
        request: u32,
        data: &mut [u8],
    ) -> impl core::future::Future<Output = Result<usize, Error>> {
        self.inner.ioctl(request, data)
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/hdlc.rs"]
mod tests;

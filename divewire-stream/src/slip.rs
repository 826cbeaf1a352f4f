use crate::error::Error;
use crate::stream::{Direction, LineConfig, Lines, Stream, Timeout};
use alloc::vec;
use alloc::vec::Vec;

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Default largest decoded frame, in bytes
pub const DEFAULT_FRAME_SIZE: usize = 1024;

const INPUT_BUFFER_SIZE: usize = 256;

/// SLIP byte-stuffing decorator
///
/// Same role as [`Hdlc`](crate::Hdlc) with the classical SLIP codes:
/// frames delimited by `0xC0`, payload occurrences of the delimiter
/// and the `0xDB` escape replaced by `0xDB 0xDC` and `0xDB 0xDD`.
/// Empty frames are silently dropped, the usual line-noise filter, so
/// back-to-back or shared delimiters are harmless.
pub struct Slip<S: Stream> {
    inner: S,
    inbuf: Vec<u8>,
    inpos: usize,
    inlen: usize,
    frame: Vec<u8>,
    framepos: usize,
    framelen: usize,
    outbuf: Vec<u8>,
}

impl<S: Stream> Slip<S> {
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
            match self.next_byte().await? {
                END => {
                    if self.framelen > 0 {
                        return Ok(());
                    }
                    // empty frame: keep scanning
                }
                ESC => match self.next_byte().await? {
                    ESC_END => self.push_frame_byte(END)?,
                    ESC_ESC => self.push_frame_byte(ESC)?,
                    _ => return Err(Error::Protocol),
                },
                b => self.push_frame_byte(b)?,
            }
        }
    }
}

impl<S: Stream> Stream for Slip<S> {
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
            match b {
                END => {
                    self.outbuf[n] = ESC;
                    self.outbuf[n + 1] = ESC_END;
                    n += 2;
                }
                ESC => {
                    self.outbuf[n] = ESC;
                    self.outbuf[n + 1] = ESC_ESC;
                    n += 2;
                }
                b => {
                    self.outbuf[n] = b;
                    n += 1;
                }
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
#[path = "tests/slip.rs"]
mod tests;

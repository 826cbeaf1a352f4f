use crate::error::Error;
use crate::stream::{
    ioctl, Direction, LineConfig, Lines, Stream, Timeout,
};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

/// A waker that does nothing, for polling mock-backed futures
///
/// Every future in these test suites is ready as soon as its mock is,
/// so a poll loop with a no-op waker runs it to completion.
pub struct NoOpWaker;

impl Wake for NoOpWaker {
    fn wake(self: Arc<Self>) {}
}

/// Poll `f` to completion with a no-op waker.
///
/// Panics if the future is still pending after an unreasonable number
/// of polls, which in a scripted test means a mock deadlock.
pub fn run<F: Future>(f: F) -> F::Output {
    let waker = Waker::from(Arc::new(NoOpWaker));
    let mut context = Context::from_waker(&waker);
    let mut f = pin!(f);
    for _ in 0..100_000 {
        if let Poll::Ready(result) = f.as_mut().poll(&mut context) {
            return result;
        }
    }
    panic!("scripted future never completed");
}

/// One step of a [`ScriptedStream`] script
pub enum Step {
    /// The code under test must write exactly these bytes next.
    Expect(Vec<u8>),
    /// These bytes are available to be read next.
    Supply(Vec<u8>),
    /// The next read or write fails once with this error.
    Fail(Error),
}

/// A step-scripted [`Stream`] for byte-exact protocol tests
///
/// The script is an ordered list of [`Step`]s. Writes are checked
/// byte-for-byte against the front `Expect` step (a write may span
/// several steps, and several writes may consume one step, so echo
/// protocols that write one byte at a time script naturally). Reads
/// drain the front `Supply` step; a read with no supplied data times
/// out, like a silent device. Any out-of-order operation panics, which
/// in a test is the right kind of loud.
///
/// Sleeps, purges and line-control changes are recorded for
/// assertion. BLE out-of-band queries are served from the `ble_name`
/// and `access_code` fields.
pub struct ScriptedStream {
    script: VecDeque<Step>,
    /// Every `sleep` duration requested, in order.
    pub sleeps: Vec<u32>,
    /// Every purge direction requested, in order.
    pub purges: Vec<Direction>,
    /// Every DTR level set, in order.
    pub dtr: Vec<bool>,
    /// Every RTS level set, in order.
    pub rts: Vec<bool>,
    /// The last line configuration applied.
    pub config: Option<LineConfig>,
    /// The last timeout mode applied.
    pub timeout: Option<Timeout>,
    /// Served for [`ioctl::BLE_NAME`] queries.
    pub ble_name: Option<Vec<u8>>,
    /// Backing store for the access-code ioctls.
    pub access_code: Option<Vec<u8>>,
}

impl Default for ScriptedStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedStream {
    /// An empty script; reads time out, writes panic.
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            sleeps: Vec::new(),
            purges: Vec::new(),
            dtr: Vec::new(),
            rts: Vec::new(),
            config: None,
            timeout: None,
            ble_name: None,
            access_code: None,
        }
    }

    /// Append an [`Step::Expect`] step.
    pub fn expect(mut self, data: &[u8]) -> Self {
        self.script.push_back(Step::Expect(data.to_vec()));
        self
    }

    /// Append a [`Step::Supply`] step.
    pub fn supply(mut self, data: &[u8]) -> Self {
        self.script.push_back(Step::Supply(data.to_vec()));
        self
    }

    /// Append a [`Step::Fail`] step.
    pub fn fail(mut self, error: Error) -> Self {
        self.script.push_back(Step::Fail(error));
        self
    }

    /// True once every scripted step has been consumed.
    pub fn finished(&self) -> bool {
        self.script.is_empty()
    }
}

impl Stream for ScriptedStream {
    async fn configure(&mut self, config: &LineConfig) -> Result<(), Error> {
        self.config = Some(*config);
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Timeout) -> Result<(), Error> {
        self.timeout = Some(timeout);
        Ok(())
    }

    async fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
        self.dtr.push(level);
        Ok(())
    }

    async fn set_rts(&mut self, level: bool) -> Result<(), Error> {
        self.rts.push(level);
        Ok(())
    }

    async fn set_break(&mut self, _level: bool) -> Result<(), Error> {
        Ok(())
    }

    fn get_lines(&mut self) -> Result<Lines, Error> {
        Ok(Lines::empty())
    }

    async fn read(&mut self, data: &mut [u8]) -> Result<usize, Error> {
        match self.script.front_mut() {
            Some(Step::Supply(bytes)) => {
                let n = data.len().min(bytes.len());
                for (slot, b) in data[..n].iter_mut().zip(bytes.drain(..n)) {
                    *slot = b;
                }
                if bytes.is_empty() {
                    self.script.pop_front();
                }
                Ok(n)
            }
            Some(Step::Fail(e)) => {
                let e = *e;
                self.script.pop_front();
                Err(e)
            }
            Some(Step::Expect(_)) => {
                panic!("read issued while the script expected a write")
            }
            None => Err(Error::Timeout),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        match self.script.front_mut() {
            Some(Step::Expect(bytes)) => {
                let n = data.len().min(bytes.len());
                assert_eq!(
                    &data[..n],
                    &bytes[..n],
                    "write does not match script"
                );
                bytes.drain(..n);
                if bytes.is_empty() {
                    self.script.pop_front();
                }
                Ok(n)
            }
            Some(Step::Fail(e)) => {
                let e = *e;
                self.script.pop_front();
                Err(e)
            }
            Some(Step::Supply(_)) => {
                panic!("write {data:02x?} issued while read data was pending")
            }
            None => panic!("unexpected write {data:02x?}"),
        }
    }

    async fn purge(&mut self, direction: Direction) -> Result<(), Error> {
        self.purges.push(direction);
        Ok(())
    }

    async fn sleep(&mut self, ms: u32) {
        self.sleeps.push(ms);
    }

    async fn wait_ready(&mut self, _ms: u32) -> Result<(), Error> {
        Ok(())
    }

    fn available(&mut self) -> Result<usize, Error> {
        match self.script.front() {
            Some(Step::Supply(bytes)) => Ok(bytes.len()),
            _ => Ok(0),
        }
    }

    async fn ioctl(
        &mut self,
        request: u32,
        data: &mut [u8],
    ) -> Result<usize, Error> {
        match request {
            ioctl::BLE_NAME => {
                let name =
                    self.ble_name.as_ref().ok_or(Error::Unsupported)?;
                let n = data.len().min(name.len());
                data[..n].copy_from_slice(&name[..n]);
                Ok(n)
            }
            ioctl::BLE_ACCESS_CODE_READ => match &self.access_code {
                Some(code) => {
                    let n = data.len().min(code.len());
                    data[..n].copy_from_slice(&code[..n]);
                    Ok(n)
                }
                None => Ok(0),
            },
            ioctl::BLE_ACCESS_CODE_WRITE => {
                self.access_code = Some(data.to_vec());
                Ok(0)
            }
            _ => Err(Error::Unsupported),
        }
    }
}

use core::future::Future;
use core::sync::atomic::{AtomicBool, Ordering};
use divewire_stream::Error;

/// Co-operative cancellation flag for one session
///
/// Settable from any thread; observed by the session's own thread at
/// the top of every transfer and every ring-stream iteration. Once
/// observed, the in-progress operation returns [`Error::Cancelled`]
/// without issuing further bytes. Bytes already in flight may still
/// arrive but are not processed.
#[derive(Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    /// A fresh, un-cancelled flag.
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Request cancellation. May be called from any thread.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Has cancellation been requested?
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Re-arm the flag for another download on the same session.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// How often, and how patiently, a failed packet is retried
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 2..=4 for most families.
    pub retries: u32,
    /// Sleep between attempts, before the link recovers itself.
    pub backoff_ms: u32,
}

/// Adaptive inter-packet delay
///
/// Some devices drop bytes when the host transmits too soon after the
/// previous exchange. The delay starts at the family's configured
/// inter-packet gap and grows by one step on every protocol failure,
/// up to a cap, pacing all subsequent transmissions.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct AdaptiveDelay {
    delay: u32,
    step: u32,
    cap: u32,
}

impl AdaptiveDelay {
    /// A delay that starts at `initial` and grows by `step` per
    /// protocol failure, saturating at `cap`.
    pub fn new(initial: u32, step: u32, cap: u32) -> Self {
        Self {
            delay: initial.min(cap),
            step,
            cap,
        }
    }

    /// A fixed delay that never adapts. Zero disables pacing.
    pub fn fixed(ms: u32) -> Self {
        Self {
            delay: ms,
            step: 0,
            cap: ms,
        }
    }

    /// The delay currently paced before each transmission, in ms.
    pub fn current(&self) -> u32 {
        self.delay
    }

    /// Grow the delay after a protocol failure.
    pub fn bump(&mut self) {
        self.delay = self.delay.saturating_add(self.step).min(self.cap);
    }
}

/// One family's packet codec over its transport
///
/// `packet` is a single attempt: encode the command, put it on the
/// wire, read back one response, enforcing every framing invariant the
/// family prescribes (echoes, ACK/NAK, headers, lengths, checksums,
/// trailers). It does not retry; [`transfer`] owns that.
pub trait Link {
    /// One encode/send/receive/decode attempt. Resolves with the
    /// number of payload bytes written into `rsp`.
    fn packet(
        &mut self,
        cmd: &[u8],
        rsp: &mut [u8],
    ) -> impl Future<Output = Result<usize, Error>>;

    /// Suspend for `ms` milliseconds, typically via the transport.
    fn sleep(&mut self, ms: u32) -> impl Future<Output = ()>;

    /// Put the link back into a known state between retries; most
    /// families purge their input here.
    fn recover(&mut self) -> impl Future<Output = Result<(), Error>> {
        futures::future::ready(Ok(()))
    }
}

/// Execute one command with the shared retry semantics.
///
/// Cancellation is checked before any bytes are issued, for each
/// attempt. [`Error::Timeout`] and [`Error::Protocol`] are retried up
/// to `policy.retries` times, sleeping `policy.backoff_ms` and letting
/// the link recover in between; every other error returns immediately.
/// The adaptive delay paces each transmission and is bumped on each
/// protocol failure, whether or not a retry remains; a timeout is
/// silence, not crowding, and leaves the delay alone.
pub async fn transfer<L: Link>(
    link: &mut L,
    cancel: &CancelFlag,
    policy: &RetryPolicy,
    delay: &mut AdaptiveDelay,
    cmd: &[u8],
    rsp: &mut [u8],
) -> Result<usize, Error> {
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if delay.current() > 0 {
            let pace = delay.current();
            link.sleep(pace).await;
        }
        match link.packet(cmd, rsp).await {
            Ok(n) => return Ok(n),
            Err(e @ (Error::Timeout | Error::Protocol)) => {
                if e == Error::Protocol {
                    delay.bump();
                }
                if attempt >= policy.retries {
                    return Err(e);
                }
                attempt += 1;
                if policy.backoff_ms > 0 {
                    link.sleep(policy.backoff_ms).await;
                }
                link.recover().await?;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/transfer.rs"]
mod tests;

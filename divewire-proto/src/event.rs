/// Identity of the device a session is talking to
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Family-scoped model code.
    pub model: u32,
    /// Firmware version, encoded as the family encodes it.
    pub firmware: u32,
    /// Decoded serial number.
    pub serial: u32,
}

/// A paired host/device clock sample
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Clock {
    /// Host tick value supplied by the caller.
    pub system: u64,
    /// Device tick value read from the device.
    pub device: u32,
}

/// The sink a download session reports into
///
/// Every method has a default no-op so callers implement only what
/// they care about. Dives arrive through [`on_dive`](Events::on_dive)
/// newest first; returning `false` stops the walk cleanly, keeping
/// everything already delivered.
pub trait Events {
    /// The raw version record, before any model matching.
    fn on_vendor(&mut self, _data: &[u8]) {}

    /// Model, firmware and serial, once identification completes.
    fn on_devinfo(&mut self, _info: &DeviceInfo) {}

    /// Byte-level download progress. `current` is monotone
    /// non-decreasing; `maximum` may grow as planning refines.
    fn on_progress(&mut self, _current: u32, _maximum: u32) {}

    /// The session is stalled waiting for a device that announces
    /// itself unsolicited (cradle families).
    fn on_waiting(&mut self) {}

    /// A host/device clock pair, for families exposing device time.
    fn on_clock(&mut self, _clock: &Clock) {}

    /// One complete dive record and its fingerprint slice. Return
    /// `false` to stop the walk.
    fn on_dive(&mut self, _record: &[u8], _fingerprint: &[u8]) -> bool {
        true
    }
}

/// Byte-progress bookkeeping with the monotonicity the sink contract
/// promises
///
/// `current` only ever advances; `maximum` only ever grows. The
/// extraction passes start with what they know (the logbook size) and
/// extend the maximum once the sizing pass has counted profile bytes.
pub struct Progress {
    current: u32,
    maximum: u32,
}

impl Progress {
    /// Start at zero of `maximum` bytes.
    pub fn new(maximum: u32) -> Self {
        Self {
            current: 0,
            maximum,
        }
    }

    /// Report the current state to the sink.
    pub fn report<E: Events>(&self, events: &mut E) {
        events.on_progress(self.current, self.maximum);
    }

    /// Account `bytes` more work done and report.
    pub fn advance<E: Events>(&mut self, bytes: u32, events: &mut E) {
        self.current = self.current.saturating_add(bytes);
        self.report(events);
    }

    /// Plan `bytes` more work ahead and report.
    pub fn extend<E: Events>(&mut self, bytes: u32, events: &mut E) {
        self.maximum = self.maximum.saturating_add(bytes);
        self.report(events);
    }
}

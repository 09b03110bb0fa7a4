//! Skew-tolerant "common" time
//!
//! Lease timestamps are compared across processes that do not share a clock.
//! Each process adjusts its local clock by its best estimate of the offset to
//! a shared reference clock before reading or writing a timestamp.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

/// Source of local wall-clock time
pub trait Clock: Send + Sync {
    /// Current local time
    fn now(&self) -> DateTime<Utc>;
}

/// The process wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Best-effort estimate of how far the local clock runs ahead of the
/// shared reference clock
pub trait OffsetSource: Send + Sync {
    /// `local - reference`, or `None` when no estimate is available yet
    fn offset_from_reference(&self) -> Option<TimeDelta>;
}

/// An offset source that never has an estimate
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOffset;

impl OffsetSource for NoOffset {
    fn offset_from_reference(&self) -> Option<TimeDelta> {
        None
    }
}

/// A statically configured offset
#[derive(Debug, Clone, Copy)]
pub struct FixedOffset(pub TimeDelta);

impl OffsetSource for FixedOffset {
    fn offset_from_reference(&self) -> Option<TimeDelta> {
        Some(self.0)
    }
}

/// Local clock corrected toward the reference clock
#[derive(Clone)]
pub struct CommonClock {
    clock: Arc<dyn Clock>,
    offset: Arc<dyn OffsetSource>,
}

impl std::fmt::Debug for CommonClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommonClock")
            .field("offset", &self.offset.offset_from_reference())
            .finish_non_exhaustive()
    }
}

impl CommonClock {
    /// Combine a local clock with an offset estimate
    pub fn new(clock: Arc<dyn Clock>, offset: Arc<dyn OffsetSource>) -> Self {
        Self { clock, offset }
    }

    /// System clock with no offset estimate
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(NoOffset))
    }

    /// Current time according to our estimate of the reference clock
    ///
    /// Falls back to local time when no offset is known, which means lease
    /// expiry is only as accurate as the skew between the participants.
    pub fn now(&self) -> DateTime<Utc> {
        let local = self.clock.now();
        match self.offset.offset_from_reference() {
            Some(offset) => local - offset,
            None => {
                debug!("No offset, cannot use common time; falling back to local time");
                local
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use chrono::{DateTime, TimeDelta, Utc};

    use super::Clock;

    /// A clock that only moves when told to
    #[derive(Debug)]
    pub(crate) struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub(crate) fn new(at: DateTime<Utc>) -> Self {
            Self(Mutex::new(at))
        }

        pub(crate) fn advance(&self, by: TimeDelta) {
            let mut now = self.0.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }
}

//! Wall Clock
//!
//! Single source of "now" for token expiry and quota refill.
//! Production code uses `SystemClock`; tests drive `ManualClock` forward explicitly.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Time source shared by the signer, ledgers and rate limiter.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real UTC wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock.
///
/// Only moves when told to, so expiry and refill boundaries can be hit exactly.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Clock starting at a Unix timestamp in seconds.
    pub fn from_unix_secs(secs: i64) -> Self {
        Self::new(DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }

    /// Advance by a delta. Negative deltas are ignored.
    pub fn advance(&self, delta: Duration) {
        if delta <= Duration::zero() {
            return;
        }
        let mut current = self.current.lock();
        *current += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

//! Wall-clock access.
//!
//! Cron evaluation, dedup expiry and watermark timestamps all need calendar
//! time, so the clock hands out `DateTime<Utc>` rather than a monotonic
//! instant.
//!
//! ```ignore
//! use maint_std::time::{GetNow, MockClock};
//! use std::time::Duration;
//!
//! let clock = MockClock::new();
//! let t0 = clock.now();
//! clock.advance(Duration::from_secs(30));
//! assert_eq!((clock.now() - t0).num_seconds(), 30);
//! ```

mod mock;

#[cfg(any(test, feature = "test-support"))]
pub use mock::MockClock;

use chrono::{DateTime, Utc};

pub trait GetNow {
    fn now(&self) -> DateTime<Utc>;
}

/// Zero-sized type; delegates to `chrono::Utc::now`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl GetNow for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

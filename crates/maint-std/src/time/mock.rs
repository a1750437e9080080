#[cfg(any(test, feature = "test-support"))]
use std::sync::{Arc, Mutex};
#[cfg(any(test, feature = "test-support"))]
use std::time::Duration;

#[cfg(any(test, feature = "test-support"))]
use chrono::{DateTime, TimeZone, Utc};

#[cfg(any(test, feature = "test-support"))]
use super::GetNow;

/// Time only moves when you call [`advance`](MockClock::advance) or
/// [`set`](MockClock::set). Clones share the same time.
#[cfg(any(test, feature = "test-support"))]
#[derive(Clone)]
pub struct MockClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

#[cfg(any(test, feature = "test-support"))]
impl MockClock {
    /// Starts at 2024-01-01T00:00:00Z.
    pub fn new() -> Self {
        Self::at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock().unwrap();
        *current += chrono::Duration::from_std(by).unwrap();
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.current.lock().unwrap() = to;
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-support"))]
impl GetNow for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap()
    }
}

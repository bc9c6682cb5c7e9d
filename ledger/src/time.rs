//! Clock used for every timestamp the ledger writes or compares.
//!
//! With the `mock-time` feature the clock only moves when a test tells it to,
//! which makes subscription expiry deterministic.

use jiff::{Timestamp, civil::Date, tz::TimeZone};
#[cfg(feature = "mock-time")]
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug)]
pub struct TimeSource {
    #[cfg(feature = "mock-time")]
    time: Arc<Mutex<Timestamp>>,
}

impl TimeSource {
    #[allow(clippy::new_without_default)]
    #[cfg(not(feature = "mock-time"))]
    pub fn new() -> Self {
        Self {}
    }

    #[cfg(feature = "mock-time")]
    pub fn new(initial_time: Timestamp) -> Self {
        Self {
            time: Arc::new(Mutex::new(initial_time)),
        }
    }

    #[cfg(not(feature = "mock-time"))]
    pub fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    #[cfg(feature = "mock-time")]
    pub fn now(&self) -> Timestamp {
        *self.time.lock().unwrap()
    }

    /// The current UTC calendar date. Daily statistics are bucketed in UTC.
    pub fn today_utc(&self) -> Date {
        self.now().to_zoned(TimeZone::UTC).date()
    }

    /// Move the mocked clock forward, e.g. past a subscription's expiry.
    #[cfg(feature = "mock-time")]
    pub fn advance(&self, duration: jiff::SignedDuration) {
        *self.time.lock().unwrap() += duration;
    }

    /// Jump the mocked clock to an exact instant, such as `expires_at`.
    #[cfg(feature = "mock-time")]
    pub fn set(&self, time: Timestamp) {
        *self.time.lock().unwrap() = time;
    }
}

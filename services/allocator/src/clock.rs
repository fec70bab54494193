//! Time source for the engine.
//!
//! Engine operations never call `Utc::now()` directly; they ask the clock in
//! their context, so hold expiry and renewal windows can be driven by tests.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.lock() = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.lock();
        *now += by;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        // A poisoned clock still holds a valid timestamp.
        self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

/// `at + by`, saturating at the last representable instant.
pub fn later(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - by`, saturating at the first representable instant.
pub fn earlier(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(by).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_on_request() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::hours(47));
        assert_eq!(clock.now(), start + Duration::hours(47));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn offsets_saturate_instead_of_overflowing() {
        let now = Utc::now();
        let far = Duration::days(1_000_000_000);
        assert_eq!(later(now, far), DateTime::<Utc>::MAX_UTC);
        assert_eq!(earlier(now, far), DateTime::<Utc>::MIN_UTC);
        assert_eq!(later(now, Duration::hours(2)), now + Duration::hours(2));
        assert_eq!(earlier(now, Duration::hours(2)), now - Duration::hours(2));
    }
}

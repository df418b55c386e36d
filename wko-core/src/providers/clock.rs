//! Clock provider for time abstraction.
//!
//! The engine suspends fibers through [`Clock::sleep`] and steps stamp
//! deadlines with [`Clock::now`], so tests can swap in a [`MockClock`] that
//! fast-forwards instead of waiting.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Provider trait for time operations.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for the specified duration without holding a worker thread.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Check if this is a mock clock.
    fn is_mock(&self) -> bool {
        false
    }
}

/// Real clock backed by the system time and tokio timers.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Mock clock for deterministic tests.
///
/// Time only moves when a fiber sleeps or a test calls [`advance`](MockClock::advance).
/// A sleep advances the clock by its full duration and yields once, so
/// backoff schedules run instantly while remaining observable through
/// [`sleeps`](MockClock::sleeps).
pub struct MockClock {
    millis: AtomicI64,
    sleeps: Mutex<Vec<Duration>>,
}

impl MockClock {
    /// Mock clock starting at the UNIX epoch.
    pub fn new() -> Self {
        Self {
            millis: AtomicI64::new(0),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Mock clock fixed at an RFC 3339 instant. Falls back to the epoch if
    /// the string does not parse.
    pub fn fixed(rfc3339: &str) -> Self {
        let millis = DateTime::parse_from_rfc3339(rfc3339)
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0);
        Self {
            millis: AtomicI64::new(millis),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Move time forward.
    pub fn advance(&self, duration: Duration) {
        self.millis
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    /// Total time slept.
    pub fn total_slept(&self) -> Duration {
        self.sleeps.lock().iter().sum()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
            .single()
            .unwrap_or_default()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }

    fn is_mock(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_parses_rfc3339() {
        let clock = MockClock::fixed("2024-01-15T10:30:00Z");
        assert_eq!(clock.now().to_rfc3339(), "2024-01-15T10:30:00+00:00");
        assert!(clock.is_mock());
    }

    #[tokio::test]
    async fn sleep_advances_and_records() {
        let clock = MockClock::new();
        clock.sleep(Duration::from_secs(2)).await;
        clock.sleep(Duration::from_millis(500)).await;

        assert_eq!(clock.now().timestamp_millis(), 2_500);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(2), Duration::from_millis(500)]
        );
        assert_eq!(clock.total_slept(), Duration::from_millis(2_500));
    }

    #[test]
    fn advance_moves_time() {
        let clock = MockClock::new();
        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.now().timestamp(), 60);
        assert!(clock.sleeps().is_empty());
    }
}

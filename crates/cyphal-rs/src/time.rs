use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// A signed offset between two instants, microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration {
    micros: i64,
}

impl Duration {
    pub const ZERO: Duration = Duration { micros: 0 };
    pub const MAX: Duration = Duration { micros: i64::MAX };

    pub const fn from_micros(micros: i64) -> Self {
        Duration { micros }
    }

    pub const fn from_millis(millis: i64) -> Self {
        Duration { micros: millis * 1_000 }
    }

    pub const fn from_secs(secs: i64) -> Self {
        Duration { micros: secs * 1_000_000 }
    }

    pub const fn as_micros(self) -> i64 {
        self.micros
    }

    pub const fn is_negative(self) -> bool {
        self.micros < 0
    }

    pub fn max(self, other: Duration) -> Duration {
        if self.micros >= other.micros {
            self
        } else {
            other
        }
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.micros)
    }
}

impl Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration { micros: self.micros.saturating_add(rhs.micros) }
    }
}

/// A monotonic instant. The epoch is arbitrary but fixed for the lifetime
/// of the process; only differences between instants are meaningful.
///
/// [`TimePoint::MIN`] is a sentinel that compares earlier than any real
/// instant a clock can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimePoint {
    micros: i64,
}

impl TimePoint {
    /// Earlier than any instant a monotonic clock will ever report.
    pub const MIN: TimePoint = TimePoint { micros: i64::MIN };

    pub const fn from_micros(micros: i64) -> Self {
        TimePoint { micros }
    }

    pub const fn as_micros(self) -> i64 {
        self.micros
    }

    /// Checked addition; `None` on overflow.
    pub fn checked_add(self, d: Duration) -> Option<TimePoint> {
        self.micros.checked_add(d.as_micros()).map(|micros| TimePoint { micros })
    }

    /// Saturating addition, pinned to the representable range.
    pub fn saturating_add(self, d: Duration) -> TimePoint {
        TimePoint { micros: self.micros.saturating_add(d.as_micros()) }
    }
}

impl fmt::Display for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t+{}us", self.micros)
    }
}

impl Add<Duration> for TimePoint {
    type Output = TimePoint;
    fn add(self, rhs: Duration) -> TimePoint {
        self.saturating_add(rhs)
    }
}

impl AddAssign<Duration> for TimePoint {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub for TimePoint {
    type Output = Duration;
    fn sub(self, rhs: TimePoint) -> Duration {
        Duration::from_micros(self.micros.saturating_sub(rhs.micros))
    }
}

/// Source of monotonic time for the executor.
///
/// The stack never reads wall-clock time; embedders provide whatever
/// monotonic counter the platform has. Tests inject a manually advanced
/// clock.
pub trait Clock {
    fn now(&self) -> TimePoint;
}

/// Monotonic clock backed by `std::time::Instant`.
#[cfg(feature = "std")]
pub struct SystemClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl SystemClock {
    pub fn new() -> Self {
        SystemClock { origin: std::time::Instant::now() }
    }
}

#[cfg(feature = "std")]
impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for SystemClock {
    fn now(&self) -> TimePoint {
        let elapsed = self.origin.elapsed();
        TimePoint::from_micros(elapsed.as_micros() as i64)
    }
}

/// A manually advanced clock for simulations and tests.
///
/// Cloning yields a handle to the same underlying instant.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: alloc::rc::Rc<core::cell::Cell<TimePoint>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, t: TimePoint) {
        self.now.set(t);
    }

    pub fn advance(&self, d: Duration) {
        self.now.set(self.now.get() + d);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimePoint {
        self.now.get()
    }
}

// --- Unit Tests ---

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_sentinel_is_earliest() {
        assert!(TimePoint::MIN < TimePoint::from_micros(i64::MIN + 1));
        assert!(TimePoint::MIN < TimePoint::default());
    }

    #[test]
    fn test_checked_arithmetic() {
        let t = TimePoint::from_micros(i64::MAX - 1);
        assert_eq!(t.checked_add(Duration::from_micros(2)), None);
        assert_eq!(t.saturating_add(Duration::from_micros(2)), TimePoint::from_micros(i64::MAX));

        let a = TimePoint::from_micros(500);
        let b = TimePoint::from_micros(200);
        assert_eq!(a - b, Duration::from_micros(300));
        assert!((b - a).is_negative());
    }

    #[test]
    fn test_duration_conversions() {
        assert_eq!(Duration::from_millis(2).as_micros(), 2_000);
        assert_eq!(Duration::from_secs(1).as_micros(), 1_000_000);
    }
}

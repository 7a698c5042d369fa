use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Point in time, in nanoseconds. Physical instants count from the UNIX epoch.
pub type Instant = i64;
/// Signed span of time, in nanoseconds.
pub type Interval = i64;

/// Largest representable instant.
pub const FOREVER: Instant = i64::MAX;

/// Logical tag: a time value plus a microstep that orders events sharing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub time: Instant,
    pub microstep: u32,
}

impl Tag {
    pub const fn new(time: Instant, microstep: u32) -> Self {
        Self { time, microstep }
    }

    /// Tag reached by delaying `self` by `interval`.
    ///
    /// A positive interval lands on `(time + interval, 0)`. Zero or negative
    /// intervals land one microstep after `self`, the earliest point that is
    /// still strictly in the future.
    pub fn delay(self, interval: Interval) -> Tag {
        if interval > 0 {
            Tag::new(self.time.saturating_add(interval), 0)
        } else {
            self.next_microstep()
        }
    }

    pub fn next_microstep(self) -> Tag {
        match self.microstep.checked_add(1) {
            Some(microstep) => Tag::new(self.time, microstep),
            None => Tag::new(self.time.saturating_add(1), 0),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.time, self.microstep)
    }
}

/// Reads the local wall clock as nanoseconds since the UNIX epoch.
pub fn physical_now() -> Instant {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_to_interval)
        .unwrap_or_default()
}

/// Converts a `Duration` into an `Interval`, saturating at `FOREVER`.
pub fn duration_to_interval(duration: Duration) -> Interval {
    i64::try_from(duration.as_nanos()).unwrap_or(FOREVER)
}

#[cfg(test)]
mod tests {
    use super::{duration_to_interval, physical_now, Tag, FOREVER};
    use std::time::Duration;

    #[test]
    fn positive_delay_resets_microstep() {
        let tag = Tag::new(1_000, 7);
        assert_eq!(tag.delay(500), Tag::new(1_500, 0));
    }

    #[test]
    fn zero_and_negative_delay_advance_one_microstep() {
        let tag = Tag::new(1_000, 7);
        assert_eq!(tag.delay(0), Tag::new(1_000, 8));
        assert_eq!(tag.delay(-42), Tag::new(1_000, 8));
    }

    #[test]
    fn microstep_overflow_rolls_into_time() {
        let tag = Tag::new(10, u32::MAX);
        assert_eq!(tag.next_microstep(), Tag::new(11, 0));
    }

    #[test]
    fn tags_order_by_time_then_microstep() {
        assert!(Tag::new(1, 5) < Tag::new(2, 0));
        assert!(Tag::new(2, 0) < Tag::new(2, 1));
    }

    #[test]
    fn duration_conversion_saturates() {
        assert_eq!(duration_to_interval(Duration::from_millis(3)), 3_000_000);
        assert_eq!(duration_to_interval(Duration::MAX), FOREVER);
    }

    #[test]
    fn physical_clock_is_after_epoch() {
        assert!(physical_now() > 0);
    }
}

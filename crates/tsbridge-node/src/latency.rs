use std::fmt;

use tsbridge_core::Interval;

/// Running apparent-latency statistics (arrival time minus embedded timestamp).
///
/// Publisher and subscriber clocks are taken as comparable; no skew
/// correction is applied, so samples may be negative when they are not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyTracker {
    count: u64,
    sum: i128,
    max: Interval,
}

/// Summary reported at subscriber shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyReport {
    pub count: u64,
    pub max: Interval,
    pub average: Interval,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, latency: Interval) {
        if self.count == 0 || latency > self.max {
            self.max = latency;
        }
        self.count += 1;
        self.sum += i128::from(latency);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> i128 {
        self.sum
    }

    pub fn max(&self) -> Option<Interval> {
        (self.count > 0).then_some(self.max)
    }

    /// `None` until the first sample: no samples is not zero latency.
    pub fn report(&self) -> Option<LatencyReport> {
        if self.count == 0 {
            return None;
        }
        let average = self.sum / i128::from(self.count);
        Some(LatencyReport {
            count: self.count,
            max: self.max,
            average: Interval::try_from(average).unwrap_or(Interval::MAX),
        })
    }
}

impl fmt::Display for LatencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} samples, max {} ns, average {} ns",
            self.count, self.max, self.average
        )
    }
}

//! Distinctive ring detection.
//!
//! Ring cycles are measured between consecutive ring-begin events. The first
//! three measurements are compared against the configured table; the first
//! entry that matches wins, even when a later entry would match as well.

use tokio::time::Instant;

use crate::config::DistinctiveRing;

/// Number of ring cycles measured
pub const MEASURED_CYCLES: usize = 3;

/// Allowed deviation from a configured duration, in percent
const TOLERANCE_PERCENT: u32 = 10;

/// Collects ring-cycle durations on a trunk-facing line
#[derive(Debug, Clone, Default)]
pub struct CadenceTracker {
    last_begin: Option<Instant>,
    measured: Vec<u32>,
}

impl CadenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a ring-begin at `now`; returns true once enough cycles are measured
    pub fn ring_begin(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_begin {
            if self.measured.len() < MEASURED_CYCLES {
                self.measured.push(now.duration_since(last).as_millis() as u32);
            }
        }
        self.last_begin = Some(now);
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.measured.len() >= MEASURED_CYCLES
    }

    pub fn measured(&self) -> &[u32] {
        &self.measured
    }

    pub fn reset(&mut self) {
        self.last_begin = None;
        self.measured.clear();
    }
}

fn within(expected: u32, actual: u32) -> bool {
    let slack = expected * TOLERANCE_PERCENT / 100;
    actual + slack >= expected && actual <= expected + slack
}

/// Find the first table entry matching the measured cadence
pub fn match_cadence<'a>(table: &'a [DistinctiveRing], measured: &[u32]) -> Option<&'a DistinctiveRing> {
    table.iter().find(|entry| {
        entry.cadence.iter().enumerate().all(|(i, expected)| {
            if *expected == 0 {
                return true;
            }
            measured.get(i).is_some_and(|actual| within(*expected, *actual))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ring(cadence: [u32; 3], context: &str) -> DistinctiveRing {
        DistinctiveRing {
            cadence,
            context: context.to_string(),
        }
    }

    #[test]
    fn test_first_match_wins() {
        let table = vec![ring([2000, 0, 0], "sales"), ring([2000, 4000, 0], "support")];
        let matched = match_cadence(&table, &[2050, 4010, 6000]).unwrap();
        assert_eq!(matched.context, "sales");
    }

    #[test]
    fn test_no_match_outside_tolerance() {
        let table = vec![ring([2000, 4000, 0], "support")];
        assert!(match_cadence(&table, &[2000, 5000, 0]).is_none());
        assert!(match_cadence(&table, &[2000]).is_none());
    }

    #[test]
    fn test_tracker_measures_cycles() {
        let start = Instant::now();
        let mut tracker = CadenceTracker::new();
        assert!(!tracker.ring_begin(start));
        assert!(!tracker.ring_begin(start + Duration::from_millis(1000)));
        assert!(!tracker.ring_begin(start + Duration::from_millis(3000)));
        assert!(tracker.ring_begin(start + Duration::from_millis(6000)));
        assert_eq!(tracker.measured(), &[1000, 2000, 3000]);
        tracker.reset();
        assert!(tracker.measured().is_empty());
    }
}

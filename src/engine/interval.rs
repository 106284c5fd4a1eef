//! Shard intervals
//!
//! A shard is identified by a half-open interval `[lower, upper)` over the
//! sharding value. The provider maps values to intervals, names intervals
//! for use as file names, and parses names back to canonical intervals.

use std::sync::Arc;

use crate::error::{Result, XFlatError};

/// Half-open interval `[lower, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    pub lower: i64,
    pub upper: i64,
}

impl Interval {
    pub fn contains(&self, value: i64) -> bool {
        self.lower <= value && value < self.upper
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.lower, self.upper)
    }
}

/// Maps sharding values to intervals and serialises interval names.
pub trait IntervalProvider: Send + Sync {
    /// The interval containing `value`.
    fn interval_for(&self, value: i64) -> Interval;

    /// The interval `factor` widths away from `current`.
    fn next_interval(&self, current: &Interval, factor: i64) -> Interval;

    /// Canonical file-stem name of an interval.
    fn name(&self, interval: &Interval) -> String;

    /// Parse a name produced by [`IntervalProvider::name`] back to the
    /// canonical interval. `None` when the name is not one of ours.
    fn parse_name(&self, name: &str) -> Option<Interval>;

    /// Convert a raw sharding value (row id or selected property text).
    fn convert(&self, raw: &str) -> Result<i64> {
        raw.trim()
            .parse::<i64>()
            .map_err(|_| XFlatError::Conversion(format!("not an integer shard value: {raw:?}")))
    }
}

/// Fixed-width intervals offset by a base: `[base + k*width, base +
/// (k+1)*width)` for integer `k`.
#[derive(Debug, Clone)]
pub struct FixedWidthIntervalProvider {
    width: i64,
    base: i64,
}

impl FixedWidthIntervalProvider {
    pub fn new(width: i64, base: i64) -> Arc<Self> {
        assert!(width > 0, "interval width must be positive");
        Arc::new(Self { width, base })
    }

    pub fn width(&self) -> i64 {
        self.width
    }
}

impl IntervalProvider for FixedWidthIntervalProvider {
    fn interval_for(&self, value: i64) -> Interval {
        let offset = (value - self.base).rem_euclid(self.width);
        let lower = value - offset;
        Interval {
            lower,
            upper: lower + self.width,
        }
    }

    fn next_interval(&self, current: &Interval, factor: i64) -> Interval {
        self.interval_for(current.lower + factor * self.width)
    }

    fn name(&self, interval: &Interval) -> String {
        interval.lower.to_string()
    }

    fn parse_name(&self, name: &str) -> Option<Interval> {
        let value = name.parse::<i64>().ok()?;
        Some(self.interval_for(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_contain_their_values() {
        let provider = FixedWidthIntervalProvider::new(100, 0);
        for value in [5, 105, -95, 205, 0, -100, 99, -1] {
            let interval = provider.interval_for(value);
            assert!(interval.contains(value), "{value} not in {interval}");
            assert_eq!(interval.upper - interval.lower, 100);
        }
    }

    #[test]
    fn interval_bounds_match_fixed_grid() {
        let provider = FixedWidthIntervalProvider::new(100, 0);
        assert_eq!(provider.interval_for(5), Interval { lower: 0, upper: 100 });
        assert_eq!(
            provider.interval_for(105),
            Interval {
                lower: 100,
                upper: 200
            }
        );
        assert_eq!(
            provider.interval_for(-95),
            Interval {
                lower: -100,
                upper: 0
            }
        );
        assert_eq!(
            provider.interval_for(-100),
            Interval {
                lower: -100,
                upper: 0
            }
        );
    }

    #[test]
    fn base_offsets_the_grid() {
        let provider = FixedWidthIntervalProvider::new(10, 3);
        assert_eq!(provider.interval_for(3), Interval { lower: 3, upper: 13 });
        assert_eq!(provider.interval_for(12), Interval { lower: 3, upper: 13 });
        assert_eq!(provider.interval_for(2), Interval { lower: -7, upper: 3 });
    }

    #[test]
    fn names_round_trip_including_negatives() {
        let provider = FixedWidthIntervalProvider::new(100, 0);
        for value in [5, 105, -95, 205, -100] {
            let interval = provider.interval_for(value);
            let name = provider.name(&interval);
            assert_eq!(provider.parse_name(&name), Some(interval));
        }
        assert_eq!(provider.name(&provider.interval_for(-95)), "-100");
        assert!(provider.parse_name("metadata").is_none());
    }

    #[test]
    fn next_interval_steps_by_width() {
        let provider = FixedWidthIntervalProvider::new(100, 0);
        let current = provider.interval_for(5);
        assert_eq!(
            provider.next_interval(&current, 2),
            Interval {
                lower: 200,
                upper: 300
            }
        );
        assert_eq!(
            provider.next_interval(&current, -1),
            Interval {
                lower: -100,
                upper: 0
            }
        );
    }

    #[test]
    fn convert_rejects_non_numeric_values() {
        let provider = FixedWidthIntervalProvider::new(100, 0);
        assert_eq!(provider.convert("42").unwrap(), 42);
        assert!(provider.convert("forty-two").is_err());
    }
}

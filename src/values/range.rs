//! Range values over numbers and time.
//!
//! Ranges are half-open `[start, end)` unless the bounds string says
//! otherwise; `None` endpoints are unbounded. Time ranges additionally
//! render the analytic engine's interval literal (`start/end`).

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Bound openness, rendered as the two-character string `"[)"`, `"()"`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Bounds {
    pub start_closed: bool,
    pub end_closed: bool,
}

impl Default for Bounds {
    fn default() -> Self {
        Bounds {
            start_closed: true,
            end_closed: false,
        }
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            if self.start_closed { '[' } else { '(' },
            if self.end_closed { ']' } else { ')' }
        )
    }
}

impl TryFrom<String> for Bounds {
    type Error = Error;
    fn try_from(s: String) -> Result<Bounds> {
        let start_closed = match s.chars().next() {
            Some('[') => true,
            Some('(') => false,
            _ => return Err(Error::construction(format!("invalid bounds '{}'", s))),
        };
        let end_closed = match s.chars().nth(1) {
            Some(']') => true,
            Some(')') => false,
            _ => return Err(Error::construction(format!("invalid bounds '{}'", s))),
        };
        Ok(Bounds {
            start_closed,
            end_closed,
        })
    }
}

impl From<Bounds> for String {
    fn from(b: Bounds) -> String {
        b.to_string()
    }
}

macro_rules! range_impl {
    ($name:ident, $point:ty) => {
        #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            pub start: Option<$point>,
            pub end: Option<$point>,
            #[serde(default)]
            pub bounds: Bounds,
        }

        impl $name {
            pub fn new(start: $point, end: $point) -> $name {
                $name {
                    start: Some(start),
                    end: Some(end),
                    bounds: Bounds::default(),
                }
            }

            pub fn contains(&self, p: $point) -> bool {
                let after_start = match self.start {
                    None => true,
                    Some(s) => {
                        if self.bounds.start_closed {
                            p >= s
                        } else {
                            p > s
                        }
                    }
                };
                let before_end = match self.end {
                    None => true,
                    Some(e) => {
                        if self.bounds.end_closed {
                            p <= e
                        } else {
                            p < e
                        }
                    }
                };
                after_start && before_end
            }

            /// Ranges intersect when neither ends strictly before the other
            /// starts (half-open adjacency does not intersect).
            pub fn intersects(&self, other: &$name) -> bool {
                let ends_before = |a: &$name, b: &$name| match (a.end, b.start) {
                    (Some(e), Some(s)) => {
                        e < s || (e == s && !(a.bounds.end_closed && b.bounds.start_closed))
                    }
                    _ => false,
                };
                !ends_before(self, other) && !ends_before(other, self)
            }

            pub fn intersect(&self, other: &$name) -> Option<$name> {
                if !self.intersects(other) {
                    return None;
                }
                let (start, start_closed) = pick_max(
                    self.start,
                    self.bounds.start_closed,
                    other.start,
                    other.bounds.start_closed,
                );
                let (end, end_closed) = pick_min(
                    self.end,
                    self.bounds.end_closed,
                    other.end,
                    other.bounds.end_closed,
                );
                Some($name {
                    start,
                    end,
                    bounds: Bounds {
                        start_closed,
                        end_closed,
                    },
                })
            }

            /// Union of overlapping or adjacent ranges; `None` when disjoint.
            pub fn union(&self, other: &$name) -> Option<$name> {
                let adjacent = matches!(
                    (self.end, other.start),
                    (Some(e), Some(s)) if e == s
                ) || matches!(
                    (other.end, self.start),
                    (Some(e), Some(s)) if e == s
                );
                if !self.intersects(other) && !adjacent {
                    return None;
                }
                let (start, start_closed) = pick_min(
                    self.start,
                    self.bounds.start_closed,
                    other.start,
                    other.bounds.start_closed,
                );
                let (end, end_closed) = pick_max(
                    self.end,
                    self.bounds.end_closed,
                    other.end,
                    other.bounds.end_closed,
                );
                Some($name {
                    start,
                    end,
                    bounds: Bounds {
                        start_closed,
                        end_closed,
                    },
                })
            }
        }
    };
}

// Endpoint selection helpers; `None` means unbounded and always wins for
// min / loses for max accordingly.
fn pick_min<T: PartialOrd + Copy>(
    a: Option<T>,
    a_closed: bool,
    b: Option<T>,
    b_closed: bool,
) -> (Option<T>, bool) {
    match (a, b) {
        (None, _) | (_, None) => (None, true),
        (Some(x), Some(y)) => {
            if x < y {
                (Some(x), a_closed)
            } else if y < x {
                (Some(y), b_closed)
            } else {
                (Some(x), a_closed || b_closed)
            }
        }
    }
}

fn pick_max<T: PartialOrd + Copy>(
    a: Option<T>,
    a_closed: bool,
    b: Option<T>,
    b_closed: bool,
) -> (Option<T>, bool) {
    match (a, b) {
        (None, _) | (_, None) => (None, true),
        (Some(x), Some(y)) => {
            if x > y {
                (Some(x), a_closed)
            } else if y > x {
                (Some(y), b_closed)
            } else {
                (Some(x), a_closed || b_closed)
            }
        }
    }
}

range_impl!(NumberRange, f64);
range_impl!(TimeRange, DateTime<Utc>);

impl NumberRange {
    /// True when the range is exactly one `size`-wide bucket starting on a
    /// multiple of `size` (plus `offset`).
    pub fn aligns_to_bucket(&self, size: f64, offset: f64) -> bool {
        match (self.start, self.end) {
            (Some(s), Some(e)) => {
                (e - s - size).abs() < f64::EPSILON && ((s - offset) % size).abs() < f64::EPSILON
            }
            _ => false,
        }
    }
}

impl TimeRange {
    /// Render the analytic engine's interval literal, `start/end` in
    /// ISO-8601 instants. Unbounded ends fall back to the eternity interval.
    pub fn to_interval(&self) -> String {
        let fmt = |t: DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Millis, true);
        let start = self
            .start
            .map(fmt)
            .unwrap_or_else(|| "-146136543-09-08T08:23:32.096Z".to_string());
        let end = self
            .end
            .map(fmt)
            .unwrap_or_else(|| "146140482-04-24T15:36:27.903Z".to_string());
        format!("{}/{}", start, end)
    }

    pub fn duration_millis(&self) -> Option<i64> {
        match (self.start, self.end) {
            (Some(s), Some(e)) => Some(e.timestamp_millis() - s.timestamp_millis()),
            _ => None,
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }

    /// Shift both endpoints forward by `millis`.
    pub fn shift_millis(&self, millis: i64) -> TimeRange {
        let shift = |t: DateTime<Utc>| t + chrono::Duration::milliseconds(millis);
        TimeRange {
            start: self.start.map(shift),
            end: self.end.map(shift),
            bounds: self.bounds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_contains_half_open() {
        let r = NumberRange::new(1.0, 5.0);
        assert!(r.contains(1.0));
        assert!(r.contains(4.9));
        assert!(!r.contains(5.0));
        assert!(!r.contains(0.9));
    }

    #[test]
    fn test_union_intersect() {
        let a = NumberRange::new(1.0, 5.0);
        let b = NumberRange::new(3.0, 8.0);
        assert_eq!(a.union(&b), Some(NumberRange::new(1.0, 8.0)));
        assert_eq!(a.intersect(&b), Some(NumberRange::new(3.0, 5.0)));

        let c = NumberRange::new(6.0, 7.0);
        assert_eq!(a.union(&c), None);
        assert_eq!(a.intersect(&c), None);

        // Adjacent half-open ranges union but do not intersect.
        let d = NumberRange::new(5.0, 6.0);
        assert_eq!(a.union(&d), Some(NumberRange::new(1.0, 6.0)));
        assert_eq!(a.intersect(&d), None);
    }

    #[test]
    fn test_time_interval_literal() {
        let r = TimeRange::new(t("2015-03-12T00:00:00Z"), t("2015-03-19T00:00:00Z"));
        assert_eq!(
            r.to_interval(),
            "2015-03-12T00:00:00.000Z/2015-03-19T00:00:00.000Z"
        );
        assert_eq!(r.duration_millis(), Some(7 * 24 * 3600 * 1000));
    }

    #[test]
    fn test_bucket_alignment() {
        assert!(NumberRange::new(10.0, 15.0).aligns_to_bucket(5.0, 0.0));
        assert!(!NumberRange::new(10.0, 16.0).aligns_to_bucket(5.0, 0.0));
        assert!(!NumberRange::new(11.0, 16.0).aligns_to_bucket(5.0, 0.0));
        assert!(NumberRange::new(11.0, 16.0).aligns_to_bucket(5.0, 1.0));
    }

    #[test]
    fn test_bounds_round_trip() {
        for s in ["[)", "[]", "()", "(]"] {
            let b = Bounds::try_from(s.to_string()).unwrap();
            assert_eq!(b.to_string(), s);
        }
    }
}

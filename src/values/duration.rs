//! ISO-8601 calendar periods used by time bucketing and shifting.
//!
//! All arithmetic is UTC. Second/minute/hour/day/week spans are fixed-length
//! and floor by integer arithmetic on the epoch; month and year spans are
//! calendar-aware.

use std::fmt;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MS_SECOND: i64 = 1_000;
const MS_MINUTE: i64 = 60 * MS_SECOND;
const MS_HOUR: i64 = 60 * MS_MINUTE;
const MS_DAY: i64 = 24 * MS_HOUR;
const MS_WEEK: i64 = 7 * MS_DAY;

/// A calendar period: `P1D`, `PT1H`, `P2W`, `P1M`, `P1Y`, `PT30S`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Duration {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl Duration {
    pub fn parse(s: &str) -> Result<Duration> {
        let bytes = s.as_bytes();
        if bytes.first() != Some(&b'P') {
            return Err(Error::construction(format!("invalid duration '{}'", s)));
        }
        let mut d = Duration {
            years: 0,
            months: 0,
            weeks: 0,
            days: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        };
        let mut time_part = false;
        let mut num = String::new();
        let mut saw_any = false;
        for &b in &bytes[1..] {
            match b {
                b'T' => time_part = true,
                b'0'..=b'9' => num.push(b as char),
                _ => {
                    let n: u32 = num
                        .parse()
                        .map_err(|_| Error::construction(format!("invalid duration '{}'", s)))?;
                    num.clear();
                    saw_any = true;
                    match (b, time_part) {
                        (b'Y', false) => d.years = n,
                        (b'M', false) => d.months = n,
                        (b'W', false) => d.weeks = n,
                        (b'D', false) => d.days = n,
                        (b'H', true) => d.hours = n,
                        (b'M', true) => d.minutes = n,
                        (b'S', true) => d.seconds = n,
                        _ => {
                            return Err(Error::construction(format!("invalid duration '{}'", s)))
                        }
                    }
                }
            }
        }
        if !saw_any || !num.is_empty() {
            return Err(Error::construction(format!("invalid duration '{}'", s)));
        }
        Ok(d)
    }

    /// Fixed-length spans have an exact millisecond width; months and years
    /// do not.
    pub fn is_exact(&self) -> bool {
        self.years == 0 && self.months == 0
    }

    /// Millisecond width of an exact span.
    pub fn exact_millis(&self) -> Option<i64> {
        if !self.is_exact() {
            return None;
        }
        Some(
            self.weeks as i64 * MS_WEEK
                + self.days as i64 * MS_DAY
                + self.hours as i64 * MS_HOUR
                + self.minutes as i64 * MS_MINUTE
                + self.seconds as i64 * MS_SECOND,
        )
    }

    /// True when the span is a single unit (`P1D`, `PT1H`), the only shapes
    /// bucketing accepts.
    pub fn is_single_unit(&self) -> bool {
        let parts = [
            self.years,
            self.months,
            self.weeks,
            self.days,
            self.hours,
            self.minutes,
            self.seconds,
        ];
        parts.iter().filter(|&&p| p > 0).count() == 1
    }

    /// Floor `t` to the start of the period containing it.
    pub fn floor(&self, t: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if !self.is_single_unit() {
            return Err(Error::construction(format!(
                "can not floor on a complex duration '{}'",
                self
            )));
        }
        if self.years > 0 {
            let year = t.year() - t.year().rem_euclid(self.years as i32);
            return Ok(Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap());
        }
        if self.months > 0 {
            let month0 = t.month0() - t.month0() % self.months;
            return Ok(Utc.with_ymd_and_hms(t.year(), month0 + 1, 1, 0, 0, 0).unwrap());
        }
        let span = self.exact_millis().unwrap();
        let ms = t.timestamp_millis();
        // Weeks anchor on Monday 1970-01-05 rather than the epoch Thursday.
        let anchor = if self.weeks > 0 { 4 * MS_DAY } else { 0 };
        let floored = (ms - anchor).div_euclid(span) * span + anchor;
        Ok(Utc.timestamp_millis_opt(floored).unwrap())
    }

    /// Shift `t` forward by `step` periods (negative steps shift back).
    pub fn shift(&self, t: DateTime<Utc>, step: i32) -> DateTime<Utc> {
        let months = (self.years as i32 * 12 + self.months as i32) * step;
        let mut out = add_months(t, months);
        if let Some(ms) = self.exact_millis() {
            out += ChronoDuration::milliseconds(ms * step as i64);
        } else {
            // Mixed calendar + fixed parts: apply the fixed remainder.
            let fixed = Duration {
                years: 0,
                months: 0,
                ..*self
            };
            out += ChronoDuration::milliseconds(fixed.exact_millis().unwrap() * step as i64);
        }
        out
    }
}

fn add_months(t: DateTime<Utc>, months: i32) -> DateTime<Utc> {
    if months == 0 {
        return t;
    }
    let total = t.year() * 12 + t.month0() as i32 + months;
    let (year, month0) = (total.div_euclid(12), total.rem_euclid(12) as u32);
    let day = t.day().min(days_in_month(year, month0 + 1));
    Utc.with_ymd_and_hms(year, month0 + 1, day, t.hour(), t.minute(), t.second())
        .unwrap()
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 {
                29
            } else {
                28
            }
        }
        _ => unreachable!(),
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P")?;
        if self.years > 0 {
            write!(f, "{}Y", self.years)?;
        }
        if self.months > 0 {
            write!(f, "{}M", self.months)?;
        }
        if self.weeks > 0 {
            write!(f, "{}W", self.weeks)?;
        }
        if self.days > 0 {
            write!(f, "{}D", self.days)?;
        }
        if self.hours > 0 || self.minutes > 0 || self.seconds > 0 {
            write!(f, "T")?;
            if self.hours > 0 {
                write!(f, "{}H", self.hours)?;
            }
            if self.minutes > 0 {
                write!(f, "{}M", self.minutes)?;
            }
            if self.seconds > 0 {
                write!(f, "{}S", self.seconds)?;
            }
        }
        Ok(())
    }
}

impl TryFrom<String> for Duration {
    type Error = Error;
    fn try_from(s: String) -> Result<Duration> {
        Duration::parse(&s)
    }
}

impl From<Duration> for String {
    fn from(d: Duration) -> String {
        d.to_string()
    }
}

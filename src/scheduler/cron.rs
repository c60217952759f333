//! Five-field cron expressions: `minute hour day-of-month month day-of-week`.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CronError(String);

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

// give up searching after this many years without a match (e.g. "0 0 30 2 *")
const SEARCH_YEARS: i32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    /// Field started with `*`; relevant for the day-of-month/day-of-week rule
    star: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }

    fn parse(
        raw: &str,
        label: &str,
        min: u32,
        max: u32,
        names: &[&str],
        name_base: u32,
    ) -> Result<Self, CronError> {
        let mut bits = 0u64;
        for item in raw.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| CronError(format!("{}: invalid step [{}]", label, step)))?;
                    if step == 0 {
                        return Err(CronError(format!("{}: step must be > 0", label)));
                    }
                    (range, Some(step))
                }
                None => (item, None),
            };
            let (lo, hi) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                (
                    value(a, label, names, name_base)?,
                    value(b, label, names, name_base)?,
                )
            } else {
                let v = value(range, label, names, name_base)?;
                // "a/n" runs from a to the end of the range
                (v, if step.is_some() { max } else { v })
            };
            if lo < min || hi > max || lo > hi {
                return Err(CronError(format!(
                    "{}: [{}] outside {}-{}",
                    label, item, min, max
                )));
            }
            let step = step.unwrap_or(1);
            let mut v = lo;
            while v <= hi {
                bits |= 1u64 << v;
                v += step;
            }
        }
        Ok(Self {
            bits,
            star: raw.starts_with('*'),
        })
    }
}

fn value(raw: &str, label: &str, names: &[&str], name_base: u32) -> Result<u32, CronError> {
    if let Ok(v) = raw.parse::<u32>() {
        return Ok(v);
    }
    let lower = raw.to_ascii_lowercase();
    names
        .iter()
        .position(|n| *n == lower)
        .map(|i| i as u32 + name_base)
        .ok_or_else(|| CronError(format!("{}: invalid value [{}]", label, raw)))
}

/// A parsed cron schedule with minute resolution, evaluated in UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError(format!(
                "expected 5 fields, got {} in [{}]",
                parts.len(),
                expression
            )));
        }
        let mut day_of_week = Field::parse(parts[4], "day-of-week", 0, 7, DAY_NAMES, 0)?;
        if day_of_week.contains(7) {
            day_of_week.bits = (day_of_week.bits & !(1u64 << 7)) | 1;
        }
        Ok(Self {
            expression: parts.join(" "),
            minute: Field::parse(parts[0], "minute", 0, 59, &[], 0)?,
            hour: Field::parse(parts[1], "hour", 0, 23, &[], 0)?,
            day_of_month: Field::parse(parts[2], "day-of-month", 1, 31, &[], 0)?,
            month: Field::parse(parts[3], "month", 1, 12, MONTH_NAMES, 1)?,
            day_of_week,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.contains(date.day());
        let dow = self
            .day_of_week
            .contains(date.weekday().num_days_from_sunday());
        if self.day_of_month.star || self.day_of_week.star {
            dom && dow
        } else {
            dom || dow
        }
    }

    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.month.contains(t.month())
            && self.day_matches(t.date_naive())
            && self.hour.contains(t.hour())
            && self.minute.contains(t.minute())
    }

    /// First fire time strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = t.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = start.year() + SEARCH_YEARS;
        let mut t = start;
        while t.year() <= limit {
            if !self.month.contains(t.month()) {
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.from_utc_datetime(&NaiveDate::from_ymd_opt(y, m, 1)?.and_hms_opt(0, 0, 0)?);
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                let next = t.date_naive().succ_opt()?;
                t = Utc.from_utc_datetime(&next.and_hms_opt(0, 0, 0)?);
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minute.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

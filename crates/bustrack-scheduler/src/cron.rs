//! Cron expression parser.
//! Format: "MIN HOUR DOM MON DOW" (5-field, no seconds), evaluated in UTC.
//! Per field: *, N, A-B, */S, A-B/S, N/S and comma lists.
//! Month names JAN..DEC, weekday names SUN..SAT, and 7 = Sunday.
//! Example: "0 8 * * MON-FRI" = weekdays at 8:00
//!
//! No cron crate dependency.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use thiserror::Error;

/// How far ahead to search before declaring an expression dead (e.g. `0 0 30 2 *`).
const HORIZON_DAYS: i64 = 366 * 5;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("'{0}' never fires")]
    NeverFires(String),
}

impl From<CronParseError> for bustrack_core::BusTrackError {
    fn from(e: CronParseError) -> Self {
        bustrack_core::BusTrackError::Cron(e.to_string())
    }
}

struct FieldDef {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value of the first entry in `names`.
    names_base: u32,
}

const MINUTE: FieldDef = FieldDef { name: "minute", min: 0, max: 59, names: &[], names_base: 0 };
const HOUR: FieldDef = FieldDef { name: "hour", min: 0, max: 23, names: &[], names_base: 0 };
const DAY_OF_MONTH: FieldDef = FieldDef { name: "day-of-month", min: 1, max: 31, names: &[], names_base: 0 };
const MONTH: FieldDef = FieldDef { name: "month", min: 1, max: 12, names: &MONTH_NAMES, names_base: 1 };
const DAY_OF_WEEK: FieldDef = FieldDef { name: "day-of-week", min: 0, max: 7, names: &DAY_NAMES, names_base: 0 };

/// A parsed 5-field expression. Each field is a bitset of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    /// Whether DOM / DOW started with `*`. When both are restricted a day
    /// matches if either field matches.
    dom_any: bool,
    dow_any: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronParseError::FieldCount(parts.len()));
        }

        let mut days_of_week = parse_field(&DAY_OF_WEEK, parts[4])?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            expression: parts.join(" "),
            minutes: parse_field(&MINUTE, parts[0])?,
            hours: parse_field(&HOUR, parts[1])?,
            days_of_month: parse_field(&DAY_OF_MONTH, parts[2])?,
            months: parse_field(&MONTH, parts[3])?,
            days_of_week,
            dom_any: parts[2].starts_with('*'),
            dow_any: parts[4].starts_with('*'),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Earliest minute strictly after `after` matching every field.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronParseError> {
        let never = || CronParseError::NeverFires(self.expression.clone());
        let limit = after + Duration::days(HORIZON_DAYS);

        let mut t = from_timestamp(floor_to(after.timestamp(), 60) + 60).ok_or_else(never)?;
        while t <= limit {
            if !has(self.months, t.month()) {
                t = start_of_next_month(t).ok_or_else(never)?;
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = start_of_next_day(t).ok_or_else(never)?;
                continue;
            }
            if !has(self.hours, t.hour()) {
                t = from_timestamp(floor_to(t.timestamp(), 3600) + 3600).ok_or_else(never)?;
                continue;
            }
            if !has(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Ok(t);
        }
        Err(never())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = has(self.days_of_month, date.day());
        let dow = has(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_any || self.dow_any {
            dom && dow
        } else {
            dom || dow
        }
    }
}

/// Parse `expression` and compute its next fire time strictly after `after`.
pub fn next_run_from_cron(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronParseError> {
    CronSchedule::parse(expression)?.next_after(after)
}

fn parse_field(def: &FieldDef, raw: &str) -> Result<u64, CronParseError> {
    let invalid = |reason: String| CronParseError::InvalidField {
        field: def.name,
        value: raw.to_string(),
        reason,
    };

    let mut bits = 0u64;
    for part in raw.split(',') {
        if part.is_empty() {
            return Err(invalid("empty list element".into()));
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(format!("bad step '{step}'")))?;
                if step == 0 {
                    return Err(invalid("step must be at least 1".into()));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (def.min, def.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (value(def, a).map_err(&invalid)?, value(def, b).map_err(&invalid)?)
        } else {
            let v = value(def, range).map_err(&invalid)?;
            // "N/S" means N through the end of the range.
            (v, if step.is_some() { def.max } else { v })
        };
        if lo > hi {
            return Err(invalid(format!("range {lo}-{hi} is reversed")));
        }

        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            bits |= 1 << v;
        }
    }
    Ok(bits)
}

fn value(def: &FieldDef, token: &str) -> Result<u32, String> {
    let v = match token.parse::<u32>() {
        Ok(v) => v,
        Err(_) => def
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(token))
            .map(|i| i as u32 + def.names_base)
            .ok_or_else(|| format!("'{token}' is not a number"))?,
    };
    if v < def.min || v > def.max {
        return Err(format!("{v} is outside {}-{}", def.min, def.max));
    }
    Ok(v)
}

fn has(bits: u64, v: u32) -> bool {
    bits & (1 << v) != 0
}

fn floor_to(secs: i64, unit: i64) -> i64 {
    secs - secs.rem_euclid(unit)
}

fn from_timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

fn start_of_next_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc())
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Some(NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?.and_utc())
}

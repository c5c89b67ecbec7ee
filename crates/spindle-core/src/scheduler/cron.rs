//! Cron expressions.
//!
//! Supported forms:
//! - five fields: `minute hour day-of-month month day-of-week`, each a list of
//!   `*`, `n`, `a-b` with an optional `/step` (month and weekday names allowed)
//! - descriptors: `@yearly` `@annually` `@monthly` `@weekly` `@daily` `@midnight` `@hourly`
//! - `@every <duration>`, e.g. `@every 1h30m`
//! - an optional `CRON_TZ=` / `TZ=` prefix with `UTC` or a fixed `±HH:MM` offset
//!
//! When both day fields are restricted a day matching either one fires (classic cron).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Timelike, Utc};

use crate::domain::add_duration;
use crate::error::{Result, SpindleError};

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAYS: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

// Upper bound on the search for the next match; expressions such as `0 0 30 2 *` never match.
const SEARCH_YEARS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bounds {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    names_from: u32,
}

const MINUTE: Bounds = Bounds { name: "minute", min: 0, max: 59, names: &[], names_from: 0 };
const HOUR: Bounds = Bounds { name: "hour", min: 0, max: 23, names: &[], names_from: 0 };
const DAY_OF_MONTH: Bounds = Bounds { name: "day-of-month", min: 1, max: 31, names: &[], names_from: 0 };
const MONTH: Bounds = Bounds { name: "month", min: 1, max: 12, names: &MONTHS, names_from: 1 };
// 7 is accepted as an alias for Sunday
const DAY_OF_WEEK: Bounds = Bounds { name: "day-of-week", min: 0, max: 7, names: &WEEKDAYS, names_from: 0 };

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fields {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_any: bool,
    dow_any: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Fields(Fields),
    Every(Duration),
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    source: String,
    offset: FixedOffset,
    kind: Kind,
}

impl CronSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = |reason: String| SpindleError::InvalidCronSpec {
            spec: spec.to_string(),
            reason,
        };

        let mut rest = spec.trim();
        let mut offset = utc();
        if let Some(tz) = rest.strip_prefix("CRON_TZ=").or_else(|| rest.strip_prefix("TZ=")) {
            let (zone, expr) = tz
                .split_once(char::is_whitespace)
                .ok_or_else(|| invalid("missing expression after time zone".into()))?;
            offset = parse_offset(zone).map_err(invalid)?;
            rest = expr.trim();
        }

        let kind = if let Some(every) = rest.strip_prefix("@every") {
            Kind::Every(parse_every(every.trim()).map_err(invalid)?)
        } else if rest.starts_with('@') {
            let fields = match rest {
                "@yearly" | "@annually" => "0 0 1 1 *",
                "@monthly" => "0 0 1 * *",
                "@weekly" => "0 0 * * 0",
                "@daily" | "@midnight" => "0 0 * * *",
                "@hourly" => "0 * * * *",
                other => return Err(invalid(format!("unknown descriptor {other}"))),
            };
            Kind::Fields(parse_fields(fields).map_err(invalid)?)
        } else {
            Kind::Fields(parse_fields(rest).map_err(invalid)?)
        };

        Ok(Self {
            source: spec.trim().to_string(),
            offset,
            kind,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// The interval of an `@every` expression.
    pub fn interval(&self) -> Option<Duration> {
        match self.kind {
            Kind::Every(every) => Some(every),
            Kind::Fields(_) => None,
        }
    }

    /// First activation strictly after `after`, or `None` if the expression never fires.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            Kind::Every(every) => Some(add_duration(after, *every)),
            Kind::Fields(fields) => {
                let local = after.with_timezone(&self.offset).naive_local();
                let next = fields.next_after(local)?;
                self.offset
                    .from_local_datetime(&next)
                    .single()
                    .map(|at| at.with_timezone(&Utc))
            }
        }
    }
}

impl FromStr for CronSpec {
    type Err = SpindleError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Fields {
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = has(self.days_of_month, date.day());
        let dow = has(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_any || self.dow_any {
            dom && dow
        } else {
            dom || dow
        }
    }

    fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let limit = after.year() + SEARCH_YEARS;
        let mut t = after.with_second(0)?.with_nanosecond(0)? + chrono::Duration::minutes(1);

        while t.year() <= limit {
            if !has(self.months, t.month()) {
                t = first_of_next_month(t.date())?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !has(self.hours, t.hour()) {
                t = t.with_minute(0)? + chrono::Duration::hours(1);
                continue;
            }
            if !has(self.minutes, t.minute()) {
                t += chrono::Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

fn has(set: u64, value: u32) -> bool {
    set & (1 << value) != 0
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

fn parse_offset(zone: &str) -> std::result::Result<FixedOffset, String> {
    if matches!(zone, "UTC" | "Etc/UTC" | "Z") {
        return Ok(utc());
    }
    let (sign, rest) = match zone.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err(format!("unsupported time zone {zone:?}, expected UTC or ±HH:MM")),
    };
    let (hours, minutes) = rest
        .split_once(':')
        .ok_or_else(|| format!("invalid offset {zone:?}"))?;
    let hours: i32 = hours.parse().map_err(|_| format!("invalid offset {zone:?}"))?;
    let minutes: i32 = minutes.parse().map_err(|_| format!("invalid offset {zone:?}"))?;
    if hours > 23 || minutes > 59 {
        return Err(format!("invalid offset {zone:?}"));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(|| format!("invalid offset {zone:?}"))
}

/// `1h30m`, `45s`, `500ms`.
fn parse_every(value: &str) -> std::result::Result<Duration, String> {
    if value.is_empty() {
        return Err("@every needs a duration".into());
    }
    let mut total = Duration::ZERO;
    let mut rest = value;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("invalid duration {value:?}"));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid duration {value:?}"))?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "h" => Duration::from_secs(amount.saturating_mul(3600)),
            "m" => Duration::from_secs(amount.saturating_mul(60)),
            "s" => Duration::from_secs(amount),
            "ms" => Duration::from_millis(amount),
            other => return Err(format!("unknown unit {other:?} in {value:?}")),
        };
        total = total.saturating_add(unit);
        rest = &rest[unit_len..];
    }
    if total.is_zero() {
        return Err("@every duration must be positive".into());
    }
    Ok(total)
}

fn parse_fields(expr: &str) -> std::result::Result<Fields, String> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    let [minute, hour, dom, month, dow] = parts.as_slice() else {
        return Err(format!("expected 5 fields, found {}", parts.len()));
    };

    let mut days_of_week = parse_field(dow, DAY_OF_WEEK)?;
    if has(days_of_week, 7) {
        days_of_week = (days_of_week & !(1 << 7)) | 1;
    }

    Ok(Fields {
        minutes: parse_field(minute, MINUTE)?,
        hours: parse_field(hour, HOUR)?,
        days_of_month: parse_field(dom, DAY_OF_MONTH)?,
        months: parse_field(month, MONTH)?,
        days_of_week,
        dom_any: is_any(dom),
        dow_any: is_any(dow),
    })
}

fn is_any(field: &str) -> bool {
    field.starts_with('*') || field.starts_with('?')
}

fn parse_field(field: &str, bounds: Bounds) -> std::result::Result<u64, String> {
    let mut set = 0u64;
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step in {} field {item:?}", bounds.name))?;
                if step == 0 {
                    return Err(format!("zero step in {} field {item:?}", bounds.name));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" || range == "?" {
            (bounds.min, bounds.max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_value(lo, bounds)?, parse_value(hi, bounds)?)
        } else {
            let value = parse_value(range, bounds)?;
            // `n/step` runs from n to the end of the range
            (value, if step.is_some() { bounds.max } else { value })
        };
        if start > end {
            return Err(format!("inverted range in {} field {item:?}", bounds.name));
        }

        let step = step.unwrap_or(1) as usize;
        for value in (start..=end).step_by(step) {
            set |= 1 << value;
        }
    }
    Ok(set)
}

fn parse_value(value: &str, bounds: Bounds) -> std::result::Result<u32, String> {
    let lower = value.to_ascii_lowercase();
    let parsed = match bounds.names.iter().position(|&name| name == lower) {
        Some(index) => index as u32 + bounds.names_from,
        None => value
            .parse()
            .map_err(|_| format!("invalid {} value {value:?}", bounds.name))?,
    };
    if parsed < bounds.min || parsed > bounds.max {
        return Err(format!(
            "{} value {parsed} out of range {}-{}",
            bounds.name, bounds.min, bounds.max
        ));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[rstest]
    #[case("* * * * *", "2024-01-01T00:00:30Z", "2024-01-01T00:01:00Z")]
    #[case("*/15 * * * *", "2024-01-01T00:01:00Z", "2024-01-01T00:15:00Z")]
    #[case("30 9 * * mon-fri", "2024-01-06T10:00:00Z", "2024-01-08T09:30:00Z")]
    #[case("0 0 1 jan *", "2024-03-01T00:00:00Z", "2025-01-01T00:00:00Z")]
    #[case("0 12 29 2 *", "2024-03-01T00:00:00Z", "2028-02-29T12:00:00Z")]
    #[case("5,10 8-9 * * *", "2024-01-01T08:10:00Z", "2024-01-01T09:05:00Z")]
    #[case("0 0 * * 7", "2024-01-01T00:00:00Z", "2024-01-07T00:00:00Z")]
    #[case("@hourly", "2024-01-01T10:59:59Z", "2024-01-01T11:00:00Z")]
    #[case("@daily", "2024-01-01T10:00:00Z", "2024-01-02T00:00:00Z")]
    #[case("@weekly", "2024-01-01T10:00:00Z", "2024-01-07T00:00:00Z")]
    #[case("@monthly", "2024-01-31T10:00:00Z", "2024-02-01T00:00:00Z")]
    #[case("@yearly", "2024-06-01T00:00:00Z", "2025-01-01T00:00:00Z")]
    fn next_activation(#[case] spec: &str, #[case] after: &str, #[case] expected: &str) {
        let spec = CronSpec::parse(spec).unwrap();
        assert_eq!(spec.next_after(at(after)), Some(at(expected)));
    }

    #[test]
    fn restricted_day_fields_are_ored() {
        // the 13th, or any Friday
        let spec = CronSpec::parse("0 0 13 * fri").unwrap();
        // 2024-01-05 is a Friday
        assert_eq!(
            spec.next_after(at("2024-01-01T00:00:00Z")),
            Some(at("2024-01-05T00:00:00Z"))
        );
        assert_eq!(
            spec.next_after(at("2024-01-12T00:00:00Z")),
            Some(at("2024-01-13T00:00:00Z"))
        );
    }

    #[test]
    fn every_adds_its_interval() {
        let spec = CronSpec::parse("@every 1h30m").unwrap();
        assert_eq!(spec.interval(), Some(Duration::from_secs(5400)));
        assert_eq!(
            spec.next_after(at("2024-01-01T00:00:00Z")),
            Some(at("2024-01-01T01:30:00Z"))
        );
    }

    #[test]
    fn fixed_offset_prefix_shifts_activation() {
        let spec = CronSpec::parse("CRON_TZ=+09:00 0 9 * * *").unwrap();
        assert_eq!(
            spec.next_after(at("2024-01-01T01:00:00Z")),
            Some(at("2024-01-02T00:00:00Z"))
        );
        let spec = CronSpec::parse("TZ=UTC 0 9 * * *").unwrap();
        assert_eq!(spec.offset(), utc());
    }

    #[test]
    fn impossible_date_never_fires() {
        let spec = CronSpec::parse("0 0 30 2 *").unwrap();
        assert_eq!(spec.next_after(at("2024-01-01T00:00:00Z")), None);
    }

    #[rstest]
    #[case("")]
    #[case("* * * *")]
    #[case("60 * * * *")]
    #[case("* 24 * * *")]
    #[case("*/0 * * * *")]
    #[case("5-1 * * * *")]
    #[case("* * * foo *")]
    #[case("@fortnightly")]
    #[case("@every")]
    #[case("@every 10x")]
    #[case("@every 0s")]
    #[case("CRON_TZ=Asia/Tokyo * * * * *")]
    #[case("TZ=+09:00")]
    fn rejects_malformed_expressions(#[case] spec: &str) {
        let err = CronSpec::parse(spec).unwrap_err();
        assert!(matches!(err, SpindleError::InvalidCronSpec { .. }), "{spec:?}: {err}");
    }
}

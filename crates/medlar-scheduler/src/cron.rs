//! Five-field cron expressions: `minute hour day-of-month month day-of-week`.
//!
//! Supported operators: `*`, `,`, `-`, `/`. Named aliases (`@daily`, …) are
//! rejected. A timestamp matches when every field matches. `next_execution`
//! walks field-by-field from coarse to fine, so it is deterministic across
//! runs and never scans minute-by-minute through whole years.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use medlar_core::error::{MedlarError, Result};

/// Search horizon in days. Expressions with no match inside it (e.g. Feb 30)
/// are unsatisfiable.
const HORIZON_DAYS: i64 = 366 * 5;

/// A parsed cron expression — one membership set per field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: [bool; 60],
    hours: [bool; 24],
    /// 1-based, index 0 unused.
    days_of_month: [bool; 32],
    /// 1-based, index 0 unused.
    months: [bool; 13],
    /// 0 = Sunday.
    days_of_week: [bool; 7],
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const FIELDS: [FieldSpec; 5] = [
    FieldSpec { name: "minute", min: 0, max: 59 },
    FieldSpec { name: "hour", min: 0, max: 23 },
    FieldSpec { name: "day-of-month", min: 1, max: 31 },
    FieldSpec { name: "month", min: 1, max: 12 },
    FieldSpec { name: "day-of-week", min: 0, max: 6 },
];

impl CronExpr {
    /// Parse a five-field expression. Range and value validation follows the
    /// classic bounds: 0–59, 0–23, 1–31, 1–12, 0–6.
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        if trimmed.starts_with('@') {
            return Err(MedlarError::Cron(format!(
                "named aliases are not supported: {trimmed}"
            )));
        }
        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(MedlarError::Cron(format!(
                "expected 5 fields, got {}: {trimmed}",
                parts.len()
            )));
        }

        let mut sets: Vec<Vec<u32>> = Vec::with_capacity(5);
        for (part, spec) in parts.iter().zip(FIELDS.iter()) {
            sets.push(parse_field(part, spec)?);
        }

        let mut expr = CronExpr {
            minutes: [false; 60],
            hours: [false; 24],
            days_of_month: [false; 32],
            months: [false; 13],
            days_of_week: [false; 7],
        };
        for &v in &sets[0] {
            expr.minutes[v as usize] = true;
        }
        for &v in &sets[1] {
            expr.hours[v as usize] = true;
        }
        for &v in &sets[2] {
            expr.days_of_month[v as usize] = true;
        }
        for &v in &sets[3] {
            expr.months[v as usize] = true;
        }
        for &v in &sets[4] {
            expr.days_of_week[v as usize] = true;
        }
        Ok(expr)
    }

    fn matches_date(&self, date: NaiveDate) -> bool {
        self.months[date.month() as usize]
            && self.days_of_month[date.day() as usize]
            && self.days_of_week[date.weekday().num_days_from_sunday() as usize]
    }

    /// Does this local timestamp match every field?
    pub fn matches(&self, dt: NaiveDateTime) -> bool {
        self.matches_date(dt.date())
            && self.hours[dt.hour() as usize]
            && self.minutes[dt.minute() as usize]
    }

    /// Smallest instant strictly after `from` matching the expression,
    /// evaluated in `tz`. Returns None when unsatisfiable within the horizon.
    pub fn next_execution(&self, from: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = from.with_timezone(&tz).naive_local();
        // Strictly after, at minute granularity.
        let mut candidate = truncate_minute(local) + Duration::minutes(1);
        let deadline = local + Duration::days(HORIZON_DAYS);

        while candidate <= deadline {
            if !self.matches_date(candidate.date()) {
                // Jump to the next day at 00:00.
                candidate = candidate
                    .date()
                    .succ_opt()?
                    .and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours[candidate.hour() as usize] {
                candidate = truncate_hour(candidate) + Duration::hours(1);
                continue;
            }
            if !self.minutes[candidate.minute() as usize] {
                candidate += Duration::minutes(1);
                continue;
            }
            // Resolve the local time back to UTC. Ambiguous times (DST fold)
            // take the earliest instant; nonexistent times (DST gap) skip on.
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                chrono::LocalResult::Ambiguous(earliest, _) => {
                    return Some(earliest.with_timezone(&Utc))
                }
                chrono::LocalResult::None => {
                    candidate += Duration::minutes(1);
                }
            }
        }
        None
    }
}

fn truncate_minute(dt: NaiveDateTime) -> NaiveDateTime {
    dt.date()
        .and_hms_opt(dt.hour(), dt.minute(), 0)
        .unwrap_or(dt)
}

fn truncate_hour(dt: NaiveDateTime) -> NaiveDateTime {
    dt.date().and_hms_opt(dt.hour(), 0, 0).unwrap_or(dt)
}

/// Expand one field (`*`, `*/s`, `a`, `a-b`, `a-b/s`, `a/s`, comma lists)
/// into its member values.
fn parse_field(field: &str, spec: &FieldSpec) -> Result<Vec<u32>> {
    let mut values = Vec::new();
    for part in field.split(',') {
        if part.is_empty() {
            return Err(MedlarError::Cron(format!("empty {} entry", spec.name)));
        }
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| {
                    MedlarError::Cron(format!("invalid {} step: {s}", spec.name))
                })?;
                if step == 0 {
                    return Err(MedlarError::Cron(format!("{} step must be > 0", spec.name)));
                }
                (r, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            let start = parse_value(a, spec)?;
            let end = parse_value(b, spec)?;
            if start > end {
                return Err(MedlarError::Cron(format!(
                    "{} range reversed: {range}",
                    spec.name
                )));
            }
            (start, end)
        } else {
            let value = parse_value(range, spec)?;
            // `a/s` means a through max, stepped.
            if part.contains('/') {
                (value, spec.max)
            } else {
                (value, value)
            }
        };

        let mut v = start;
        while v <= end {
            values.push(v);
            v += step;
        }
    }
    values.sort_unstable();
    values.dedup();
    Ok(values)
}

fn parse_value(raw: &str, spec: &FieldSpec) -> Result<u32> {
    let value: u32 = raw
        .parse()
        .map_err(|_| MedlarError::Cron(format!("invalid {} value: {raw}", spec.name)))?;
    if value < spec.min || value > spec.max {
        return Err(MedlarError::Cron(format!(
            "{} value {value} out of range {}-{}",
            spec.name, spec.min, spec.max
        )));
    }
    Ok(value)
}

/// Convenience wrapper: parse and compute in one call.
pub fn next_execution(expression: &str, from: DateTime<Utc>, tz: Tz) -> Result<Option<DateTime<Utc>>> {
    let expr = CronExpr::parse(expression)?;
    Ok(expr.next_execution(from, tz))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
            .and_utc()
    }

    #[test]
    fn test_every_minute() {
        let from = utc(2026, 3, 1, 12, 30);
        let next = next_execution("* * * * *", from, Tz::UTC).unwrap().unwrap();
        assert_eq!(next, utc(2026, 3, 1, 12, 31));
    }

    #[test]
    fn test_strictly_after_exact_match() {
        // `from` itself matches the expression — next must still be later.
        let from = utc(2026, 3, 1, 12, 0);
        let next = next_execution("0 12 * * *", from, Tz::UTC).unwrap().unwrap();
        assert_eq!(next, utc(2026, 3, 2, 12, 0));
    }

    #[test]
    fn test_specific_minute_hour() {
        let from = utc(2026, 3, 1, 12, 30);
        let next = next_execution("15 9 * * *", from, Tz::UTC).unwrap().unwrap();
        assert_eq!(next, utc(2026, 3, 2, 9, 15));
    }

    #[test]
    fn test_step_and_list() {
        let from = utc(2026, 3, 1, 12, 1);
        let next = next_execution("*/15 * * * *", from, Tz::UTC).unwrap().unwrap();
        assert_eq!(next, utc(2026, 3, 1, 12, 15));

        let next = next_execution("5,35 * * * *", from, Tz::UTC).unwrap().unwrap();
        assert_eq!(next, utc(2026, 3, 1, 12, 5));

        let next = next_execution("10-20/5 * * * *", from, Tz::UTC).unwrap().unwrap();
        assert_eq!(next, utc(2026, 3, 1, 12, 10));
    }

    #[test]
    fn test_day_of_week() {
        // 2026-03-01 is a Sunday.
        let from = utc(2026, 3, 1, 0, 0);
        let next = next_execution("0 8 * * 1", from, Tz::UTC).unwrap().unwrap();
        assert_eq!(next, utc(2026, 3, 2, 8, 0)); // Monday

        let next = next_execution("0 8 * * 0", from, Tz::UTC).unwrap().unwrap();
        assert_eq!(next, utc(2026, 3, 1, 8, 0)); // same Sunday, later hour
    }

    #[test]
    fn test_month_rollover() {
        let from = utc(2026, 12, 31, 23, 59);
        let next = next_execution("0 0 1 1 *", from, Tz::UTC).unwrap().unwrap();
        assert_eq!(next, utc(2027, 1, 1, 0, 0));
    }

    #[test]
    fn test_unsatisfiable_returns_none() {
        let from = utc(2026, 1, 1, 0, 0);
        // February 30th never exists.
        let next = next_execution("0 0 30 2 *", from, Tz::UTC).unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn test_leap_day() {
        let from = utc(2026, 1, 1, 0, 0);
        let next = next_execution("0 0 29 2 *", from, Tz::UTC).unwrap().unwrap();
        assert_eq!(next, utc(2028, 2, 29, 0, 0));
    }

    #[test]
    fn test_monotonic_sequence() {
        let expr = CronExpr::parse("*/7 3,15 * * *").unwrap();
        let mut cursor = utc(2026, 6, 1, 0, 0);
        let mut previous = cursor;
        for _ in 0..50 {
            let next = expr.next_execution(cursor, Tz::UTC).unwrap();
            assert!(next > previous, "sequence must strictly increase");
            previous = next;
            cursor = next;
        }
    }

    #[test]
    fn test_deterministic() {
        let from = utc(2026, 6, 1, 10, 10);
        let a = next_execution("*/3 * * * 2", from, Tz::UTC).unwrap();
        let b = next_execution("*/3 * * * 2", from, Tz::UTC).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_timezone_evaluation() {
        // 08:00 in New York during DST is 12:00 UTC.
        let from = utc(2026, 7, 1, 0, 0);
        let next = next_execution("0 8 * * *", from, chrono_tz::America::New_York)
            .unwrap()
            .unwrap();
        assert_eq!(next, utc(2026, 7, 1, 12, 0));
    }

    #[test]
    fn test_rejects_aliases() {
        assert!(CronExpr::parse("@daily").is_err());
        assert!(CronExpr::parse("@hourly").is_err());
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert!(CronExpr::parse("* * * *").is_err()); // 4 fields
        assert!(CronExpr::parse("* * * * * *").is_err()); // 6 fields
        assert!(CronExpr::parse("60 * * * *").is_err()); // minute out of range
        assert!(CronExpr::parse("* 24 * * *").is_err()); // hour out of range
        assert!(CronExpr::parse("* * 0 * *").is_err()); // dom below 1
        assert!(CronExpr::parse("* * 32 * *").is_err()); // dom above 31
        assert!(CronExpr::parse("* * * 13 *").is_err()); // month above 12
        assert!(CronExpr::parse("* * * * 7").is_err()); // dow above 6
        assert!(CronExpr::parse("20-10 * * * *").is_err()); // reversed range
        assert!(CronExpr::parse("*/0 * * * *").is_err()); // zero step
        assert!(CronExpr::parse("a * * * *").is_err()); // not a number
    }

    #[test]
    fn test_matches() {
        let expr = CronExpr::parse("30 9 * * 1-5").unwrap();
        // 2026-03-02 is a Monday.
        let monday = NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        assert!(expr.matches(monday));
        assert!(!expr.matches(monday + Duration::minutes(1)));
        // 2026-03-01 is a Sunday.
        assert!(!expr.matches(monday - Duration::days(1)));
    }

    #[test]
    fn test_single_value_with_step_runs_to_max() {
        // `30/10` in the minute field = 30, 40, 50.
        let from = utc(2026, 3, 1, 12, 31);
        let next = next_execution("30/10 * * * *", from, Tz::UTC).unwrap().unwrap();
        assert_eq!(next, utc(2026, 3, 1, 12, 40));
    }
}

//! Quartz-style cron schedules: `sec min hour day-of-month month day-of-week
//! [year]`, evaluated in UTC.
//!
//! Supported per field: `*`, `?` (day fields only), single values, ranges
//! `a-b`, lists `a,b`, and steps `*/n`, `a/n`, `a-b/n`. Months accept
//! `JAN`..`DEC` and days of week `SUN`..`SAT` (`1` = Sunday). Exactly one of
//! day-of-month and day-of-week must be `?`.

use crate::error::{LifecycleError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

const MONTHS: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAYS: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

const MAX_YEAR: i32 = 2099;

#[derive(Debug, Clone, PartialEq, Eq)]
enum DayRule {
    /// `?`: this field does not restrict.
    Unspecified,
    Days(BTreeSet<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    seconds: BTreeSet<u32>,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: DayRule,
    months: BTreeSet<u32>,
    /// 1 = Sunday … 7 = Saturday.
    days_of_week: DayRule,
    years: Option<BTreeSet<u32>>,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const SECOND: FieldSpec = FieldSpec { name: "second", min: 0, max: 59, names: &[] };
const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[] };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: MONTHS };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 1, max: 7, names: WEEKDAYS };
const YEAR: FieldSpec = FieldSpec { name: "year", min: 1970, max: MAX_YEAR as u32, names: &[] };

impl FieldSpec {
    fn value(&self, raw: &str) -> std::result::Result<u32, String> {
        let upper = raw.to_ascii_uppercase();
        if let Some(pos) = self.names.iter().position(|n| *n == upper) {
            return Ok(self.min + pos as u32);
        }
        let v: u32 = raw
            .parse()
            .map_err(|_| format!("invalid {} value '{raw}'", self.name))?;
        if v < self.min || v > self.max {
            return Err(format!(
                "{} value {v} out of range {}-{}",
                self.name, self.min, self.max
            ));
        }
        Ok(v)
    }

    fn parse(&self, field: &str) -> std::result::Result<BTreeSet<u32>, String> {
        let mut out = BTreeSet::new();
        for part in field.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| format!("invalid {} step '{step}'", self.name))?;
                    if step == 0 {
                        return Err(format!("{} step must be positive", self.name));
                    }
                    (range, step)
                }
                None => (part, 1),
            };
            let (lo, hi) = if range == "*" {
                (self.min, self.max)
            } else if let Some((a, b)) = range.split_once('-') {
                (self.value(a)?, self.value(b)?)
            } else {
                let v = self.value(range)?;
                // `a/n` runs from a to the end of the field.
                (v, if part.contains('/') { self.max } else { v })
            };
            if lo > hi {
                return Err(format!("{} range {lo}-{hi} is empty", self.name));
            }
            out.extend((lo..=hi).step_by(step as usize));
        }
        Ok(out)
    }

    fn parse_day(&self, field: &str) -> std::result::Result<DayRule, String> {
        if field == "?" {
            return Ok(DayRule::Unspecified);
        }
        self.parse(field).map(DayRule::Days)
    }
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        Self::parse_fields(expression).map_err(|reason| LifecycleError::InvalidSchedule {
            schedule: expression.to_string(),
            reason,
        })
    }

    fn parse_fields(expression: &str) -> std::result::Result<Self, String> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 6 && fields.len() != 7 {
            return Err(format!(
                "expected 6 or 7 fields (sec min hour day-of-month month day-of-week [year]), got {}",
                fields.len()
            ));
        }
        for (i, field) in fields.iter().enumerate() {
            if *field == "?" && i != 3 && i != 5 {
                return Err("'?' is only allowed for day-of-month and day-of-week".to_string());
            }
        }
        let days_of_month = DAY_OF_MONTH.parse_day(fields[3])?;
        let days_of_week = DAY_OF_WEEK.parse_day(fields[5])?;
        match (&days_of_month, &days_of_week) {
            (DayRule::Days(_), DayRule::Days(_)) => {
                return Err(
                    "specifying both a day-of-month and a day-of-week is not supported; use '?' for one"
                        .to_string(),
                )
            }
            (DayRule::Unspecified, DayRule::Unspecified) => {
                return Err("'?' may be used for only one of day-of-month and day-of-week".to_string())
            }
            _ => {}
        }
        Ok(Self {
            expression: expression.to_string(),
            seconds: SECOND.parse(fields[0])?,
            minutes: MINUTE.parse(fields[1])?,
            hours: HOUR.parse(fields[2])?,
            days_of_month,
            months: MONTH.parse(fields[4])?,
            days_of_week,
            years: fields.get(6).map(|y| YEAR.parse(y)).transpose()?,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        match (&self.days_of_month, &self.days_of_week) {
            (DayRule::Days(days), _) => days.contains(&date.day()),
            (_, DayRule::Days(days)) => days.contains(&(date.weekday().num_days_from_sunday() + 1)),
            _ => true,
        }
    }

    fn year_matches(&self, year: i32) -> bool {
        self.years
            .as_ref()
            .map_or(true, |years| u32::try_from(year).is_ok_and(|y| years.contains(&y)))
    }

    /// First fire time strictly after `after`. `None` when the schedule never
    /// fires again.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.naive_utc().with_nanosecond(0)? + Duration::seconds(1);
        let mut t = start;
        loop {
            if t.year() > MAX_YEAR {
                return None;
            }
            if !self.year_matches(t.year()) {
                t = NaiveDate::from_ymd_opt(t.year() + 1, 1, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.months.contains(&t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(&t.hour()) {
                t = t.with_minute(0)?.with_second(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(&t.minute()) {
                t = t.with_second(0)? + Duration::minutes(1);
                continue;
            }
            if !self.seconds.contains(&t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(DateTime::from_naive_utc_and_offset(t, Utc));
        }
    }
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (y, m) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1)?.and_hms_opt(0, 0, 0)
}

impl FromStr for CronSchedule {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Next fire time after `last_fired`, or after `now` when the schedule has
/// never fired. The schedule is due when the result is `<= now`.
pub fn next_fire(
    schedule: &CronSchedule,
    last_fired: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule.next_after(last_fired.unwrap_or(now))
}

/// True when `schedule` has a fire time in `(last_fired, now]`.
pub fn is_due(schedule: &CronSchedule, last_fired: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    next_fire(schedule, last_fired, now).is_some_and(|t| t <= now)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

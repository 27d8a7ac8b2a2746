//! Time trigger and time guard specifications
//!
//! Grammar accepted by `@time_trigger` and `wait_until(time_trigger=...)`:
//!
//! - `startup`, `shutdown`
//! - `once(HH:MM[:SS])` every day, `once(YYYY/MM/DD HH:MM[:SS])` one time
//! - `period(START, INTERVAL)` with START as above and INTERVAL like `10s`,
//!   `5m`, `1.5h`, `2d` (bare numbers are seconds)
//! - `cron(MIN HOUR DOM MON DOW)` with `*`, `*/n`, `a-b`, `a-b/n` and lists
//!
//! `@time_active` takes `range(START, END)` and `not range(START, END)`.
//!
//! All wall-clock values are naive local times; callers convert.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::collections::BTreeSet;
use thiserror::Error;

/// Time spec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeSpecError {
    #[error("unrecognized time spec '{0}'")]
    Unrecognized(String),

    #[error("invalid time or date '{0}'")]
    InvalidTime(String),

    #[error("invalid period interval '{0}'")]
    InvalidInterval(String),

    #[error("invalid cron spec '{spec}': {reason}")]
    InvalidCron { spec: String, reason: String },
}

/// Result type for time spec parsing
pub type TimeSpecResult<T> = Result<T, TimeSpecError>;

/// When a time trigger fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeSpec {
    /// Host start (immediately if already started)
    Startup,
    /// Host shutdown
    Shutdown,
    /// Daily at a time, or once at a date and time
    Once(WallTime),
    /// Every `interval` starting from `start`
    Period { start: WallTime, interval: Duration },
    Cron(CronSpec),
}

/// A time of day, optionally pinned to a date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallTime {
    pub date: Option<NaiveDate>,
    pub time: NaiveTime,
}

impl TimeSpec {
    pub fn parse(spec: &str) -> TimeSpecResult<Self> {
        let spec = spec.trim();
        match spec {
            "startup" => return Ok(TimeSpec::Startup),
            "shutdown" => return Ok(TimeSpec::Shutdown),
            _ => {}
        }
        let (name, args) = call_form(spec)?;
        match name {
            "once" => Ok(TimeSpec::Once(WallTime::parse(args)?)),
            "period" => {
                let (start, interval) = args
                    .split_once(',')
                    .ok_or_else(|| TimeSpecError::Unrecognized(spec.to_string()))?;
                Ok(TimeSpec::Period {
                    start: WallTime::parse(start)?,
                    interval: parse_interval(interval)?,
                })
            }
            "cron" => Ok(TimeSpec::Cron(CronSpec::parse(args)?)),
            _ => Err(TimeSpecError::Unrecognized(spec.to_string())),
        }
    }

    /// Startup and shutdown fire on host signals rather than the clock
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, TimeSpec::Startup | TimeSpec::Shutdown)
    }

    /// The first fire time strictly after `after`, if any
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            TimeSpec::Startup | TimeSpec::Shutdown => None,
            TimeSpec::Once(WallTime {
                date: Some(date),
                time,
            }) => {
                let at = date.and_time(*time);
                (at > after).then_some(at)
            }
            TimeSpec::Once(WallTime { date: None, time }) => {
                let today = after.date().and_time(*time);
                if today > after {
                    Some(today)
                } else {
                    today.checked_add_signed(Duration::days(1))
                }
            }
            TimeSpec::Period { start, interval } => {
                let start = start.date.unwrap_or(after.date()).and_time(start.time);
                if start > after {
                    return Some(start);
                }
                let step = interval.num_milliseconds();
                if step <= 0 {
                    return None;
                }
                let elapsed = (after - start).num_milliseconds();
                let offset = (elapsed / step + 1).checked_mul(step)?;
                start.checked_add_signed(Duration::milliseconds(offset))
            }
            TimeSpec::Cron(cron) => cron.next_after(after),
        }
    }
}

impl WallTime {
    fn parse(text: &str) -> TimeSpecResult<Self> {
        let text = text.trim();
        let invalid = || TimeSpecError::InvalidTime(text.to_string());
        let (date, time) = match text.split_once(char::is_whitespace) {
            Some((date, time)) => (
                Some(NaiveDate::parse_from_str(date, "%Y/%m/%d").map_err(|_| invalid())?),
                time.trim(),
            ),
            None => (None, text),
        };
        let time = NaiveTime::parse_from_str(time, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M"))
            .map_err(|_| invalid())?;
        Ok(Self { date, time })
    }
}

/// Split `name(args)` into its parts
fn call_form(spec: &str) -> TimeSpecResult<(&str, &str)> {
    let unrecognized = || TimeSpecError::Unrecognized(spec.to_string());
    let open = spec.find('(').ok_or_else(unrecognized)?;
    let args = spec[open + 1..].strip_suffix(')').ok_or_else(unrecognized)?;
    Ok((spec[..open].trim(), args))
}

/// Longest period interval, ten years
const MAX_INTERVAL_MS: f64 = 3650.0 * 86_400_000.0;

fn parse_interval(text: &str) -> TimeSpecResult<Duration> {
    let text = text.trim();
    let invalid = || TimeSpecError::InvalidInterval(text.to_string());
    let (number, unit_ms) = match text.char_indices().last() {
        Some((i, 's')) => (&text[..i], 1_000.0),
        Some((i, 'm')) => (&text[..i], 60_000.0),
        Some((i, 'h')) => (&text[..i], 3_600_000.0),
        Some((i, 'd')) => (&text[..i], 86_400_000.0),
        Some(_) => (text, 1_000.0),
        None => return Err(invalid()),
    };
    let value: f64 = number.trim().parse().map_err(|_| invalid())?;
    let ms = value * unit_ms;
    if !ms.is_finite() || !(1.0..=MAX_INTERVAL_MS).contains(&ms) {
        return Err(invalid());
    }
    Ok(Duration::milliseconds(ms as i64))
}

/// A five-field cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    /// 0 = Sunday
    days_of_week: BTreeSet<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

/// How far ahead to search before concluding a cron spec never fires
const CRON_SEARCH_DAYS: i64 = 366 * 5;

impl CronSpec {
    pub fn parse(spec: &str) -> TimeSpecResult<Self> {
        let fields: Vec<&str> = spec.split_whitespace().collect();
        let invalid = |reason: String| TimeSpecError::InvalidCron {
            spec: spec.to_string(),
            reason,
        };
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(invalid(format!("expected 5 fields, got {}", fields.len())));
        };
        let mut days_of_week = parse_field(dow, 0, 7).map_err(invalid)?;
        if days_of_week.remove(&7) {
            days_of_week.insert(0);
        }
        Ok(Self {
            minutes: parse_field(minute, 0, 59).map_err(invalid)?,
            hours: parse_field(hour, 0, 23).map_err(invalid)?,
            days_of_month: parse_field(dom, 1, 31).map_err(invalid)?,
            months: parse_field(month, 1, 12).map_err(invalid)?,
            days_of_week,
            dom_restricted: *dom != "*",
            dow_restricted: *dow != "*",
        })
    }

    /// Whether a wall-clock minute matches
    pub fn matches(&self, at: NaiveDateTime) -> bool {
        self.day_matches(at.date())
            && self.hours.contains(&at.hour())
            && self.minutes.contains(&at.minute())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !self.months.contains(&date.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(&date.day());
        let dow = self
            .days_of_week
            .contains(&date.weekday().num_days_from_sunday());
        // Standard cron: when both day fields are restricted either may match
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            _ => dom && dow,
        }
    }

    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let start = after.date();
        for offset in 0..CRON_SEARCH_DAYS {
            let date = start.checked_add_signed(Duration::days(offset))?;
            if !self.day_matches(date) {
                continue;
            }
            for &hour in &self.hours {
                for &minute in &self.minutes {
                    let candidate = date.and_hms_opt(hour, minute, 0)?;
                    if candidate > after {
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<BTreeSet<u32>, String> {
    let mut values = BTreeSet::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (
                range,
                step.parse::<u32>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("bad step in '{part}'"))?,
            ),
            None => (part, 1),
        };
        let number = |s: &str| {
            s.parse::<u32>()
                .ok()
                .filter(|n| (min..=max).contains(n))
                .ok_or_else(|| format!("'{s}' out of range {min}-{max}"))
        };
        let (lo, hi) = match range {
            "*" => (min, max),
            r => match r.split_once('-') {
                Some((a, b)) => (number(a)?, number(b)?),
                // `5/15` means from 5 to the end in steps of 15
                None if part.contains('/') => (number(r)?, max),
                None => {
                    let n = number(r)?;
                    (n, n)
                }
            },
        };
        if lo > hi {
            return Err(format!("empty range '{part}'"));
        }
        values.extend((lo..=hi).step_by(step as usize));
    }
    Ok(values)
}

/// One `range(...)` or `not range(...)` entry of `@time_active`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveRange {
    pub negated: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ActiveRange {
    pub fn parse(spec: &str) -> TimeSpecResult<Self> {
        let spec = spec.trim();
        let (negated, rest) = match spec.strip_prefix("not ") {
            Some(rest) => (true, rest.trim()),
            None => (false, spec),
        };
        let (name, args) = call_form(rest)?;
        if name != "range" {
            return Err(TimeSpecError::Unrecognized(spec.to_string()));
        }
        let (start, end) = args
            .split_once(',')
            .ok_or_else(|| TimeSpecError::Unrecognized(spec.to_string()))?;
        Ok(Self {
            negated,
            start: WallTime::parse(start)?.time,
            end: WallTime::parse(end)?.time,
        })
    }

    /// Whether `t` falls inside the range; ranges may wrap midnight
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= t && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }
}

/// `@time_active` semantics: inside any positive range (if there are any)
/// and inside none of the negated ones
pub fn time_active(ranges: &[ActiveRange], at: NaiveTime) -> bool {
    let mut positives = ranges.iter().filter(|r| !r.negated).peekable();
    let in_positive = positives.peek().is_none() || positives.any(|r| r.contains(at));
    in_positive && !ranges.iter().any(|r| r.negated && r.contains(at))
}

/// The earliest next fire time over several specs
pub fn next_fire(specs: &[TimeSpec], after: NaiveDateTime) -> Option<NaiveDateTime> {
    specs.iter().filter_map(|s| s.next_after(after)).min()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn t(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M").unwrap()
    }

    #[test]
    fn test_lifecycle_specs() {
        assert_eq!(TimeSpec::parse("startup").unwrap(), TimeSpec::Startup);
        assert!(TimeSpec::parse(" shutdown ").unwrap().is_lifecycle());
        assert!(TimeSpec::Startup.next_after(at("2020-07-01 10:00:00")).is_none());
    }

    #[test]
    fn test_once_daily_and_dated() {
        let daily = TimeSpec::parse("once(11:00)").unwrap();
        assert_eq!(
            daily.next_after(at("2020-07-01 10:59:59")),
            Some(at("2020-07-01 11:00:00"))
        );
        assert_eq!(
            daily.next_after(at("2020-07-01 11:00:00")),
            Some(at("2020-07-02 11:00:00"))
        );

        let dated = TimeSpec::parse("once(2020/07/01 12:30:15)").unwrap();
        assert_eq!(
            dated.next_after(at("2020-07-01 10:00:00")),
            Some(at("2020-07-01 12:30:15"))
        );
        assert_eq!(dated.next_after(at("2020-07-02 00:00:00")), None);
    }

    #[test]
    fn test_period() {
        let spec = TimeSpec::parse("period(10:00, 15m)").unwrap();
        assert_eq!(
            spec.next_after(at("2020-07-01 09:00:00")),
            Some(at("2020-07-01 10:00:00"))
        );
        assert_eq!(
            spec.next_after(at("2020-07-01 10:00:00")),
            Some(at("2020-07-01 10:15:00"))
        );
        assert_eq!(
            spec.next_after(at("2020-07-01 10:20:00")),
            Some(at("2020-07-01 10:30:00"))
        );
        assert!(TimeSpec::parse("period(10:00, 0s)").is_err());
        assert!(TimeSpec::parse("period(10:00, fast)").is_err());
    }

    #[test]
    fn test_interval_bounds() {
        assert!(TimeSpec::parse("period(00:00, 3650d)").is_ok());
        for interval in ["1e12d", "3651d", "1e300", "inf", "-5m"] {
            assert!(
                matches!(
                    TimeSpec::parse(&format!("period(00:00, {interval})")),
                    Err(TimeSpecError::InvalidInterval(_))
                ),
                "{interval}"
            );
        }
    }

    #[test]
    fn test_next_after_at_end_of_calendar() {
        let last = NaiveDate::MAX.and_hms_opt(23, 59, 0).unwrap();
        for spec in ["once(12:00)", "period(00:00, 3650d)", "cron(0 0 * * *)"] {
            assert_eq!(TimeSpec::parse(spec).unwrap().next_after(last), None, "{spec}");
        }
    }

    #[test]
    fn test_cron() {
        let spec = TimeSpec::parse("cron(*/15 9-17 * * 1-5)").unwrap();
        // 2020-07-03 is a Friday
        assert_eq!(
            spec.next_after(at("2020-07-03 17:50:00")),
            Some(at("2020-07-06 09:00:00"))
        );
        assert_eq!(
            spec.next_after(at("2020-07-03 10:01:00")),
            Some(at("2020-07-03 10:15:00"))
        );

        let sunday = CronSpec::parse("0 0 * * 7").unwrap();
        assert!(sunday.matches(at("2020-07-05 00:00:00")));
    }

    #[test]
    fn test_cron_dom_or_dow() {
        // 1st of the month or any Monday
        let spec = CronSpec::parse("0 12 1 * 1").unwrap();
        assert_eq!(
            spec.next_after(at("2020-07-01 12:00:00")),
            Some(at("2020-07-06 12:00:00"))
        );
    }

    #[test]
    fn test_invalid_specs() {
        assert!(matches!(
            TimeSpec::parse("whenever"),
            Err(TimeSpecError::Unrecognized(_))
        ));
        assert!(matches!(
            TimeSpec::parse("once(25:00)"),
            Err(TimeSpecError::InvalidTime(_))
        ));
        assert!(matches!(
            TimeSpec::parse("cron(* * *)"),
            Err(TimeSpecError::InvalidCron { .. })
        ));
        assert!(TimeSpec::parse("cron(60 * * * *)").is_err());
        assert!(TimeSpec::parse("cron(5-1 * * * *)").is_err());
    }

    #[test]
    fn test_time_active_ranges() {
        let work = ActiveRange::parse("range(9:00, 17:00)").unwrap();
        let night = ActiveRange::parse("range(22:00, 6:00)").unwrap();
        let lunch = ActiveRange::parse("not range(12:00, 13:00)").unwrap();
        assert!(lunch.negated);
        assert!(night.contains(t("23:30")) && night.contains(t("05:00")));
        assert!(!night.contains(t("12:00")));

        let ranges = [work, lunch];
        assert!(time_active(&ranges, t("10:00")));
        assert!(!time_active(&ranges, t("12:30")));
        assert!(!time_active(&ranges, t("18:00")));
        assert!(time_active(&[lunch], t("18:00")));
        assert!(ActiveRange::parse("between(1:00, 2:00)").is_err());
    }

    #[test]
    fn test_next_fire_takes_earliest() {
        let specs = [
            TimeSpec::Startup,
            TimeSpec::parse("once(12:00)").unwrap(),
            TimeSpec::parse("once(11:30)").unwrap(),
        ];
        assert_eq!(
            next_fire(&specs, at("2020-07-01 11:00:00")),
            Some(at("2020-07-01 11:30:00"))
        );
    }
}

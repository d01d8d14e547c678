//! Expiration clock: turns timer expressions into concrete fire schedules.
//!
//! Accepted forms:
//! - bare integer: milliseconds (`"500"`)
//! - ISO-8601 duration: `PT1H`, `P1DT2H30M`, `PT1.5S`, `P2W`
//! - short duration: `1h`, `1d2h30m15s250ms`
//! - repeat: `R{n}/{start}/{end}`, `R{n}/{start}/{period}`, `R{n}/{period}/{end}`,
//!   `R{n}/{period}`, `R/{period}` (unbounded)
//! - instant: RFC 3339 (`2026-10-18T10:00:00Z`); a missing offset means UTC
//!
//! `#{name}` placeholders are replaced with instance variables first.

use crate::calendar::BusinessCalendar;
use crate::definition::{TimerDefinition, TimerKind};
use crate::error::{ProcessError, ProcessResult};
use crate::types::Value;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Repeat limit meaning "fire forever".
pub const UNBOUNDED: i32 = -1;

const MS_PER_SECOND: f64 = 1_000.0;
const MS_PER_MINUTE: f64 = 60.0 * MS_PER_SECOND;
const MS_PER_HOUR: f64 = 60.0 * MS_PER_MINUTE;
const MS_PER_DAY: f64 = 24.0 * MS_PER_HOUR;
const MS_PER_WEEK: f64 = 7.0 * MS_PER_DAY;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpirationTime {
    /// Fire once at `at`.
    Exact { at: DateTime<Utc> },
    /// Fire after `delay_ms`, then every `period_ms`. `repeat_limit` is the
    /// total number of fires; `UNBOUNDED` for no limit. Without a period the
    /// job fires once.
    Duration {
        delay_ms: u64,
        period_ms: Option<u64>,
        repeat_limit: i32,
    },
}

impl ExpirationTime {
    pub fn after_ms(delay_ms: u64) -> Self {
        Self::Duration {
            delay_ms,
            period_ms: None,
            repeat_limit: 1,
        }
    }

    pub fn repeating(delay_ms: u64, period_ms: u64, repeat_limit: i32) -> Self {
        Self::Duration {
            delay_ms,
            period_ms: Some(period_ms),
            repeat_limit,
        }
    }

    /// Delay before the first fire, measured from `now`. Past instants fire immediately.
    pub fn initial_delay(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Self::Exact { at } => Duration::from_millis(
                u64::try_from((*at - now).num_milliseconds()).unwrap_or(0),
            ),
            Self::Duration { delay_ms, .. } => Duration::from_millis(*delay_ms),
        }
    }

    /// Interval between fires, if the job repeats.
    pub fn period(&self) -> Option<Duration> {
        match self {
            Self::Duration {
                period_ms: Some(p),
                repeat_limit,
                ..
            } if *repeat_limit != 0 && *repeat_limit != 1 => Some(Duration::from_millis(*p)),
            _ => None,
        }
    }

    /// Total fires; `None` when unbounded.
    pub fn total_fires(&self) -> Option<u32> {
        match self {
            Self::Duration {
                period_ms: Some(_),
                repeat_limit,
                ..
            } if *repeat_limit < 0 => None,
            Self::Duration {
                period_ms: Some(_),
                repeat_limit,
                ..
            } => Some(u32::try_from(*repeat_limit).unwrap_or(1).max(1)),
            _ => Some(1),
        }
    }
}

// ── Parsing ──

/// Parse a duration into milliseconds.
pub fn parse_duration_ms(expression: &str) -> ProcessResult<u64> {
    let s = expression.trim();
    if s.is_empty() {
        return Err(ProcessError::invalid_timer(expression, "empty duration"));
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s
            .parse()
            .map_err(|e| ProcessError::invalid_timer(expression, format!("{e}")));
    }
    let ms = if s.starts_with('P') || s.starts_with('p') {
        parse_iso_duration(expression, &s[1..])?
    } else {
        parse_short_duration(expression, s)?
    };
    if !ms.is_finite() || ms < 0.0 {
        return Err(ProcessError::invalid_timer(expression, "duration out of range"));
    }
    Ok(ms.round() as u64)
}

/// Split `"12.5H3M"` into `[(12.5, 'H'), (3.0, 'M')]`.
fn components(expression: &str, body: &str) -> ProcessResult<Vec<(f64, String)>> {
    let mut out = Vec::new();
    let mut chars = body.chars().peekable();
    while chars.peek().is_some() {
        let mut number = String::new();
        while let Some(c) = chars
            .peek()
            .copied()
            .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        {
            number.push(if c == ',' { '.' } else { c });
            chars.next();
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_alphabetic()) {
            unit.push(c);
            chars.next();
        }
        if number.is_empty() || unit.is_empty() {
            return Err(ProcessError::invalid_timer(expression, "expected <number><unit>"));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| {
                ProcessError::invalid_timer(expression, format!("bad number '{number}'"))
            })?;
        out.push((value, unit));
    }
    Ok(out)
}

fn parse_iso_duration(expression: &str, body: &str) -> ProcessResult<f64> {
    let (date_part, time_part) = match body.find(['T', 't']) {
        Some(i) => (&body[..i], Some(&body[i + 1..])),
        None => (body, None),
    };
    if date_part.is_empty() && time_part.map_or(true, |t| t.is_empty()) {
        return Err(ProcessError::invalid_timer(expression, "empty ISO duration"));
    }
    let mut total = 0.0;
    for (value, unit) in components(expression, date_part)? {
        total += value
            * match unit.to_ascii_uppercase().as_str() {
                "W" => MS_PER_WEEK,
                "D" => MS_PER_DAY,
                "Y" | "M" => {
                    return Err(ProcessError::invalid_timer(
                        expression,
                        "years and months have no fixed length",
                    ))
                }
                other => {
                    return Err(ProcessError::invalid_timer(
                        expression,
                        format!("unknown date unit '{other}'"),
                    ))
                }
            };
    }
    if let Some(time_part) = time_part {
        for (value, unit) in components(expression, time_part)? {
            total += value
                * match unit.to_ascii_uppercase().as_str() {
                    "H" => MS_PER_HOUR,
                    "M" => MS_PER_MINUTE,
                    "S" => MS_PER_SECOND,
                    other => {
                        return Err(ProcessError::invalid_timer(
                            expression,
                            format!("unknown time unit '{other}'"),
                        ))
                    }
                };
        }
    }
    Ok(total)
}

fn parse_short_duration(expression: &str, body: &str) -> ProcessResult<f64> {
    let mut total = 0.0;
    for (value, unit) in components(expression, body)? {
        total += value
            * match unit.to_ascii_lowercase().as_str() {
                "d" => MS_PER_DAY,
                "h" => MS_PER_HOUR,
                "m" => MS_PER_MINUTE,
                "s" => MS_PER_SECOND,
                "ms" => 1.0,
                other => {
                    return Err(ProcessError::invalid_timer(
                        expression,
                        format!("unknown unit '{other}'"),
                    ))
                }
            };
    }
    Ok(total)
}

/// Parse an instant. Offsets are honoured; a bare local time is taken as UTC.
pub fn parse_date(expression: &str) -> ProcessResult<DateTime<Utc>> {
    let s = expression.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| ProcessError::invalid_timer(expression, format!("not a date: {e}")))
}

/// Parse a repeat expression into `(repeat_limit, delay_ms, period_ms)`.
///
/// Any two of start, end and period may be given; the third is derived.
/// Delays that are zero or already past fall back to `default_delay_ms`.
pub fn parse_repeatable(
    expression: &str,
    now: DateTime<Utc>,
    default_delay_ms: u64,
) -> ProcessResult<(i32, u64, u64)> {
    let parts: Vec<&str> = expression.trim().split('/').collect();
    let head = parts[0];
    if !(head.starts_with('R') || head.starts_with('r')) {
        return Err(ProcessError::invalid_timer(expression, "repeat must start with R"));
    }
    let repeat = match &head[1..] {
        "" => UNBOUNDED,
        n => n
            .parse::<i32>()
            .map_err(|_| {
                ProcessError::invalid_timer(expression, format!("bad repeat count '{n}'"))
            })?,
    };

    let ms_until = |at: DateTime<Utc>| (at - now).num_milliseconds();
    let clamp = |delay: i64| match u64::try_from(delay) {
        Ok(d) if d > 0 => d,
        _ => default_delay_ms,
    };

    match parts.as_slice() {
        [_, period] => Ok((repeat, default_delay_ms, parse_duration_ms(period)?)),
        [_, first, second] => {
            let first_date = parse_date(first).ok();
            let second_date = parse_date(second).ok();
            match (first_date, second_date) {
                (Some(start), Some(end)) => {
                    let period = (end - start).num_milliseconds();
                    if period <= 0 {
                        return Err(ProcessError::invalid_timer(
                            expression,
                            "end is not after start",
                        ));
                    }
                    Ok((repeat, clamp(ms_until(start)), period as u64))
                }
                (Some(start), None) => {
                    let period = parse_duration_ms(second)?;
                    Ok((repeat, clamp(ms_until(start)), period))
                }
                (None, Some(end)) => {
                    let period = parse_duration_ms(first)?;
                    let delay = ms_until(end) - i64::try_from(period).unwrap_or(i64::MAX);
                    Ok((repeat, clamp(delay), period))
                }
                (None, None) => Err(ProcessError::invalid_timer(
                    expression,
                    "expected a start or end instant beside the period",
                )),
            }
        }
        _ => Err(ProcessError::invalid_timer(expression, "expected R{n}/.../...")),
    }
}

/// Replace `#{name}` with the variable's value. Strings are inserted unquoted.
pub fn resolve_placeholders(
    expression: &str,
    variables: &BTreeMap<String, Value>,
) -> ProcessResult<String> {
    let mut out = String::with_capacity(expression.len());
    let mut rest = expression;
    while let Some(open) = rest.find("#{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find('}')
            .ok_or_else(|| ProcessError::invalid_timer(expression, "unclosed #{"))?;
        let name = after[..close].trim();
        let value = variables.get(name).filter(|v| !v.is_null()).ok_or_else(|| {
            ProcessError::invalid_timer(expression, format!("variable '{name}' is not set"))
        })?;
        match value {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

// ── Clock ──

/// Computes `ExpirationTime`s for timer definitions.
#[derive(Clone)]
pub struct ExpirationClock {
    calendar: Option<Arc<dyn BusinessCalendar>>,
    default_repeat_delay_ms: u64,
}

impl ExpirationClock {
    pub fn new(default_repeat_delay_ms: u64) -> Self {
        Self {
            calendar: None,
            default_repeat_delay_ms,
        }
    }

    pub fn with_calendar(mut self, calendar: Arc<dyn BusinessCalendar>) -> Self {
        self.calendar = Some(calendar);
        self
    }

    pub fn expiration_for(
        &self,
        timer: &TimerDefinition,
        variables: &BTreeMap<String, Value>,
        now: DateTime<Utc>,
    ) -> ProcessResult<ExpirationTime> {
        let expression = resolve_placeholders(&timer.expression, variables)?;
        match timer.kind {
            TimerKind::Date => Ok(ExpirationTime::Exact {
                at: parse_date(&expression)?,
            }),
            TimerKind::Duration => {
                let ms = parse_duration_ms(&expression)?;
                Ok(ExpirationTime::after_ms(self.business_adjusted(timer, now, ms)))
            }
            TimerKind::Cycle if expression.trim_start().starts_with(['R', 'r']) => {
                let (repeat, delay, period) =
                    parse_repeatable(&expression, now, self.default_repeat_delay_ms)?;
                Ok(ExpirationTime::repeating(
                    self.business_adjusted(timer, now, delay),
                    period,
                    repeat,
                ))
            }
            TimerKind::Cycle => {
                let period = parse_duration_ms(&expression)?;
                if period == 0 {
                    return Err(ProcessError::invalid_timer(&expression, "cycle period is zero"));
                }
                Ok(ExpirationTime::repeating(
                    self.business_adjusted(timer, now, period),
                    period,
                    UNBOUNDED,
                ))
            }
        }
    }

    fn business_adjusted(&self, timer: &TimerDefinition, now: DateTime<Utc>, ms: u64) -> u64 {
        match (&self.calendar, timer.business_calendar) {
            (Some(cal), true) => {
                let at = cal.calculate_business_time(now, ms);
                u64::try_from((at - now).num_milliseconds()).unwrap_or(0)
            }
            _ => ms,
        }
    }
}

impl Default for ExpirationClock {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::StandardBusinessCalendar;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use serde_json::json;

    #[test]
    fn test_short_and_iso_forms_agree() {
        assert_eq!(parse_duration_ms("1h").unwrap(), 3_600_000);
        assert_eq!(parse_duration_ms("PT1H").unwrap(), 3_600_000);
        assert_eq!(parse_duration_ms("500").unwrap(), 500);
        assert_eq!(parse_duration_ms("PT1.5S").unwrap(), 1_500);
        assert_eq!(parse_duration_ms("P1DT2H").unwrap(), 26 * 3_600_000);
        assert_eq!(parse_duration_ms("P2W").unwrap(), 14 * 86_400_000);
        assert_eq!(
            parse_duration_ms("1d2h30m15s250ms").unwrap(),
            86_400_000 + 2 * 3_600_000 + 30 * 60_000 + 15_000 + 250
        );
    }

    #[test]
    fn test_bad_durations() {
        for bad in ["", "P1Y", "P1M", "PT", "1x", "h", "PT1H3"] {
            assert!(
                matches!(parse_duration_ms(bad), Err(ProcessError::InvalidTimerExpression { .. })),
                "{bad} should fail"
            );
        }
    }

    #[test]
    fn test_repeat_start_end() {
        let now = Utc::now();
        let t1 = now + ChronoDuration::seconds(60);
        let t2 = t1 + ChronoDuration::seconds(60);
        let expr = format!("R5/{}/{}", t1.to_rfc3339(), t2.to_rfc3339());
        let (repeat, delay, period) = parse_repeatable(&expr, now, 1_000).unwrap();
        assert_eq!(repeat, 5);
        assert!((59_000..=60_000).contains(&delay), "delay was {delay}");
        assert_eq!(period, 60_000);
    }

    #[test]
    fn test_repeat_variants() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
        assert_eq!(
            parse_repeatable("R/PT10S", now, 1_000).unwrap(),
            (UNBOUNDED, 1_000, 10_000)
        );
        assert_eq!(parse_repeatable("R3/PT1M", now, 1_000).unwrap(), (3, 1_000, 60_000));
        assert_eq!(
            parse_repeatable("R2/2026-10-18T12:00:30Z/PT30S", now, 1_000).unwrap(),
            (2, 30_000, 30_000)
        );
        assert_eq!(
            parse_repeatable("R3/PT1M/2026-10-18T12:05:00Z", now, 1_000).unwrap(),
            (3, 240_000, 60_000)
        );
        // Start already passed: default delay.
        assert_eq!(
            parse_repeatable("R2/2026-10-18T11:00:00Z/PT30S", now, 1_000).unwrap(),
            (2, 1_000, 30_000)
        );
        assert!(parse_repeatable("PT1M", now, 1_000).is_err());
        assert!(parse_repeatable("R2/PT1M/PT2M", now, 1_000).is_err());
    }

    #[test]
    fn test_parse_date_forms() {
        let expected = Utc.with_ymd_and_hms(2026, 10, 18, 10, 0, 0).unwrap();
        assert_eq!(parse_date("2026-10-18T10:00:00Z").unwrap(), expected);
        assert_eq!(parse_date("2026-10-18T12:00:00+02:00").unwrap(), expected);
        assert_eq!(parse_date("2026-10-18T10:00:00").unwrap(), expected);
        assert!(parse_date("tomorrow").is_err());
    }

    #[test]
    fn test_placeholders() {
        let vars: BTreeMap<String, Value> =
            serde_json::from_value(json!({"wait": "PT5S", "n": 3})).unwrap();
        assert_eq!(resolve_placeholders("#{wait}", &vars).unwrap(), "PT5S");
        assert_eq!(resolve_placeholders("R#{n}/PT1S", &vars).unwrap(), "R3/PT1S");
        assert!(resolve_placeholders("#{missing}", &vars).is_err());
        assert!(resolve_placeholders("#{wait", &vars).is_err());
    }

    #[test]
    fn test_clock_expirations() {
        let clock = ExpirationClock::default();
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
        let vars = BTreeMap::new();

        let exp = clock
            .expiration_for(&TimerDefinition::duration("PT2S"), &vars, now)
            .unwrap();
        assert_eq!(exp, ExpirationTime::after_ms(2_000));
        assert_eq!(exp.total_fires(), Some(1));
        assert_eq!(exp.period(), None);

        let exp = clock
            .expiration_for(&TimerDefinition::cycle("PT1M"), &vars, now)
            .unwrap();
        assert_eq!(exp, ExpirationTime::repeating(60_000, 60_000, UNBOUNDED));
        assert_eq!(exp.total_fires(), None);

        let exp = clock
            .expiration_for(&TimerDefinition::date("2026-10-18T12:00:05Z"), &vars, now)
            .unwrap();
        assert_eq!(exp.initial_delay(now), Duration::from_secs(5));
    }

    #[test]
    fn test_business_calendar_adjusts_duration() {
        // 2026-10-16 16:00 is a Friday afternoon.
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 16, 0, 0).unwrap();
        let clock =
            ExpirationClock::default().with_calendar(Arc::new(StandardBusinessCalendar::default()));
        let vars = BTreeMap::new();

        let plain = clock
            .expiration_for(&TimerDefinition::duration("2h"), &vars, now)
            .unwrap();
        assert_eq!(plain.initial_delay(now), Duration::from_secs(7_200));

        let business = clock
            .expiration_for(&TimerDefinition::duration("2h").in_business_time(), &vars, now)
            .unwrap();
        // One hour on Friday, one on Monday morning.
        let expected = Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap() - now;
        assert_eq!(
            business.initial_delay(now),
            Duration::from_millis(expected.num_milliseconds() as u64)
        );
    }
}

//! Business calendar: shifts timer durations onto working time.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

pub trait BusinessCalendar: Send + Sync {
    /// Instant reached after `duration_ms` of working time counted from `from`.
    fn calculate_business_time(&self, from: DateTime<Utc>, duration_ms: u64) -> DateTime<Utc>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessCalendarConfig {
    pub start_hour: u32,
    pub end_hour: u32,
    pub weekend_days: Vec<Weekday>,
    pub holidays: Vec<NaiveDate>,
}

impl Default for BusinessCalendarConfig {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 17,
            weekend_days: vec![Weekday::Sat, Weekday::Sun],
            holidays: Vec::new(),
        }
    }
}

/// Working hours `[start_hour, end_hour)` in UTC, skipping weekend days and holidays.
#[derive(Clone, Debug)]
pub struct StandardBusinessCalendar {
    config: BusinessCalendarConfig,
}

impl StandardBusinessCalendar {
    pub fn new(config: BusinessCalendarConfig) -> Self {
        let mut config = config;
        if config.end_hour <= config.start_hour || config.end_hour > 24 {
            tracing::warn!(
                start_hour = config.start_hour,
                end_hour = config.end_hour,
                "Invalid business hours, falling back to 9-17"
            );
            config.start_hour = 9;
            config.end_hour = 17;
        }
        Self { config }
    }

    fn is_working_day(&self, date: NaiveDate) -> bool {
        !self.config.weekend_days.contains(&date.weekday()) && !self.config.holidays.contains(&date)
    }

    fn day_start(&self, date: NaiveDate) -> DateTime<Utc> {
        let naive = date
            .and_hms_opt(self.config.start_hour, 0, 0)
            .unwrap_or_else(|| date.and_time(chrono::NaiveTime::MIN));
        Utc.from_utc_datetime(&naive)
    }

    fn day_end(&self, date: NaiveDate) -> DateTime<Utc> {
        let hours = i64::from(self.config.end_hour - self.config.start_hour);
        self.day_start(date) + Duration::hours(hours)
    }

    /// Move `at` forward to the nearest instant inside working time.
    fn align(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let mut date = at.date_naive();
        let mut at = at;
        loop {
            if self.is_working_day(date) {
                if at.hour() < self.config.start_hour {
                    return self.day_start(date);
                }
                if at < self.day_end(date) {
                    return at;
                }
            }
            date = match date.succ_opt() {
                Some(d) => d,
                None => return at,
            };
            at = self.day_start(date);
        }
    }
}

impl Default for StandardBusinessCalendar {
    fn default() -> Self {
        Self::new(BusinessCalendarConfig::default())
    }
}

impl BusinessCalendar for StandardBusinessCalendar {
    fn calculate_business_time(&self, from: DateTime<Utc>, duration_ms: u64) -> DateTime<Utc> {
        let mut remaining = Duration::milliseconds(i64::try_from(duration_ms).unwrap_or(i64::MAX));
        let mut at = self.align(from);
        loop {
            let end = self.day_end(at.date_naive());
            let available = end - at;
            if remaining < available {
                return at + remaining;
            }
            remaining -= available;
            at = self.align(end);
            if remaining.is_zero() {
                return at;
            }
        }
    }
}

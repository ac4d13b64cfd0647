//! Business-day arithmetic.
//!
//! Saturdays and Sundays are never business days. An optional [`HolidaySet`]
//! removes additional dates. All functions are pure.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

/// Date format used for anchors, filters and holiday files.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CalendarError {
    #[error("Invalid date '{0}': expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("Invalid period '{0}': expected YYYY-MM")]
    InvalidPeriod(String),

    #[error("Date arithmetic out of range from {from} by {days} days")]
    OutOfRange { from: NaiveDate, days: i64 },

    #[error("Failed to read holiday file {path}: {reason}")]
    HolidayFile { path: String, reason: String },
}

/// A set of non-working dates on top of weekends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolidaySet(BTreeSet<NaiveDate>);

impl HolidaySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, date: NaiveDate) -> bool {
        self.0.insert(date)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.0.contains(&date)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Load a holiday list (`["2025-12-25", ...]`) from a JSON or YAML file.
    pub fn from_path(path: &Path) -> Result<Self, CalendarError> {
        let file_err = |reason: String| CalendarError::HolidayFile {
            path: path.display().to_string(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
        let dates: Vec<String> = if is_yaml_path(path) {
            serde_yaml::from_str(&raw).map_err(|e| file_err(e.to_string()))?
        } else {
            serde_json::from_str(&raw).map_err(|e| file_err(e.to_string()))?
        };
        dates
            .iter()
            .map(|d| parse_date(d))
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }
}

impl FromIterator<NaiveDate> for HolidaySet {
    fn from_iter<I: IntoIterator<Item = NaiveDate>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

pub(crate) fn is_yaml_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Business-day calendar.
#[derive(Debug, Clone, Default)]
pub struct Calendar {
    holidays: HolidaySet,
}

impl Calendar {
    pub fn new(holidays: HolidaySet) -> Self {
        Self { holidays }
    }

    /// Whether `date` is a working day (not a weekend, not a holiday).
    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(date)
    }

    /// Move forward `n` business days. `n <= 0` returns `date` unchanged.
    pub fn add_business_days(&self, date: NaiveDate, n: i64) -> Result<NaiveDate, CalendarError> {
        self.step_business_days(date, n, 1)
    }

    /// Move backward `n` business days. `n <= 0` returns `date` unchanged.
    pub fn subtract_business_days(
        &self,
        date: NaiveDate,
        n: i64,
    ) -> Result<NaiveDate, CalendarError> {
        self.step_business_days(date, n, -1)
    }

    fn step_business_days(
        &self,
        date: NaiveDate,
        n: i64,
        direction: i64,
    ) -> Result<NaiveDate, CalendarError> {
        if n <= 0 {
            return Ok(date);
        }
        let mut current = date;
        let mut remaining = n;
        while remaining > 0 {
            current = add_calendar_days(current, direction)?;
            if self.is_business_day(current) {
                remaining -= 1;
            }
        }
        Ok(current)
    }
}

/// Plain calendar-day offset (negative moves earlier).
pub fn add_calendar_days(date: NaiveDate, days: i64) -> Result<NaiveDate, CalendarError> {
    date.checked_add_signed(Duration::days(days))
        .ok_or(CalendarError::OutOfRange { from: date, days })
}

pub fn parse_date(value: &str) -> Result<NaiveDate, CalendarError> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
        .map_err(|_| CalendarError::InvalidDate(value.to_string()))
}

/// Last calendar day of the month named by a `YYYY-MM` period.
pub fn month_end_for_period(period: &str) -> Result<NaiveDate, CalendarError> {
    let invalid = || CalendarError::InvalidPeriod(period.to_string());
    let (year, month) = period.trim().split_once('-').ok_or_else(invalid)?;
    let year: i32 = year.parse().map_err(|_| invalid())?;
    let month: u32 = month.parse().map_err(|_| invalid())?;
    if !(1..=12).contains(&month) {
        return Err(invalid());
    }
    let first_of_next = if month == 12 {
        year.checked_add(1).and_then(|next| NaiveDate::from_ymd_opt(next, 1, 1))
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    first_of_next.and_then(|d| d.pred_opt()).ok_or_else(invalid)
}

//! School-year labels and annual dates.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CalendarError {
    #[error("invalid school year '{0}': expected YYYY/YY")]
    SchoolYear(String),

    #[error("invalid month-day '{0}': expected MM-DD")]
    MonthDay(String),
}

/// A school year, labelled by the calendar years it spans (`2025/26`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchoolYear {
    start: i32,
}

impl SchoolYear {
    pub const fn starting(start: i32) -> Self {
        Self { start }
    }

    pub const fn start_year(self) -> i32 {
        self.start
    }

    pub const fn next(self) -> Self {
        Self {
            start: self.start + 1,
        }
    }

    /// The school year in progress on `date`, given the day each year starts.
    pub fn containing(date: NaiveDate, cycle_start: MonthDay) -> Self {
        if date >= cycle_start.in_year(date.year()) {
            Self::starting(date.year())
        } else {
            Self::starting(date.year() - 1)
        }
    }

    /// First day of this school year.
    pub fn first_day(self, cycle_start: MonthDay) -> NaiveDate {
        cycle_start.in_year(self.start)
    }
}

impl std::fmt::Display for SchoolYear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:02}", self.start, (self.start + 1).rem_euclid(100))
    }
}

impl std::str::FromStr for SchoolYear {
    type Err = CalendarError;

    /// Accepts `2025/26` and `2025/2026`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CalendarError::SchoolYear(s.to_string());
        let (start, end) = s.trim().split_once('/').ok_or_else(invalid)?;
        if start.len() != 4 {
            return Err(invalid());
        }
        let start: i32 = start.parse().map_err(|_| invalid())?;
        let end_ok = match end.len() {
            2 => end.parse::<i32>().ok() == Some((start + 1).rem_euclid(100)),
            4 => end.parse::<i32>().ok() == Some(start + 1),
            _ => false,
        };
        if end_ok {
            Ok(Self::starting(start))
        } else {
            Err(invalid())
        }
    }
}

impl TryFrom<String> for SchoolYear {
    type Error = CalendarError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SchoolYear> for String {
    fn from(year: SchoolYear) -> Self {
        year.to_string()
    }
}

/// A day of the year without a year, e.g. `08-01`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthDay {
    month: u32,
    day: u32,
}

impl MonthDay {
    pub fn new(month: u32, day: u32) -> Result<Self, CalendarError> {
        // 2000 is a leap year, so 02-29 is accepted.
        NaiveDate::from_ymd_opt(2000, month, day)
            .map(|_| Self { month, day })
            .ok_or_else(|| CalendarError::MonthDay(format!("{month:02}-{day:02}")))
    }

    pub const fn month(self) -> u32 {
        self.month
    }

    pub const fn day(self) -> u32 {
        self.day
    }

    /// This month-day in `year`. `02-29` falls back to `02-28` outside leap years.
    pub fn in_year(self, year: i32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, self.month, self.day)
            .or_else(|| NaiveDate::from_ymd_opt(year, self.month, self.day - 1))
            .unwrap_or(NaiveDate::MIN)
    }
}

impl std::fmt::Display for MonthDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}-{:02}", self.month, self.day)
    }
}

impl std::str::FromStr for MonthDay {
    type Err = CalendarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CalendarError::MonthDay(s.to_string());
        let (month, day) = s.trim().split_once('-').ok_or_else(invalid)?;
        let month = month.parse().map_err(|_| invalid())?;
        let day = day.parse().map_err(|_| invalid())?;
        Self::new(month, day).map_err(|_| invalid())
    }
}

/// The stretch of days in which owners renew for the coming school year.
///
/// Runs from the open date up to, but not including, the first day of the
/// school year it renews for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalWindow {
    pub school_year: SchoolYear,
    pub opens: NaiveDate,
    pub closes: NaiveDate,
}

impl RenewalWindow {
    /// The next window to close after `today`, whether or not it is open yet.
    pub fn upcoming(today: NaiveDate, open_date: MonthDay, cycle_start: MonthDay) -> Self {
        let school_year = SchoolYear::containing(today, cycle_start).next();
        let closes = school_year.first_day(cycle_start);
        let mut opens = open_date.in_year(closes.year());
        if opens >= closes {
            opens = open_date.in_year(closes.year() - 1);
        }
        Self {
            school_year,
            opens,
            closes,
        }
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.opens <= day && day < self.closes
    }
}

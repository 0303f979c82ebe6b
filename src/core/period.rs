//! Calendar month arithmetic shared by the ledger, sequencer and trigger.

use crate::errors::{Error, Result};
use chrono::{Datelike, NaiveDate};
use std::fmt;

/// A calendar month. Ordering is chronological.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    /// Builds a period, rejecting months outside 1..=12.
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if (1..=12).contains(&month) && NaiveDate::from_ymd_opt(year, month, 1).is_some() {
            Ok(Self { year, month })
        } else {
            Err(Error::InvalidPeriod { year, month })
        }
    }

    /// Builds a period from stored `i32` columns.
    pub fn from_columns(year: i32, month: i32) -> Result<Self> {
        let month = u32::try_from(month).map_err(|_| Error::InvalidPeriod { year, month: 0 })?;
        Self::new(year, month)
    }

    /// The month containing `date`.
    #[must_use]
    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Year of the period
    #[must_use]
    pub const fn year(self) -> i32 {
        self.year
    }

    /// Month of the period, 1-12
    #[must_use]
    pub const fn month(self) -> u32 {
        self.month
    }

    /// Month as stored in `i32` columns
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn month_i32(self) -> i32 {
        self.month as i32
    }

    /// The month before, rolling over into the previous year after January.
    #[must_use]
    pub const fn previous(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// The month after, rolling over into the next year after December.
    #[must_use]
    pub const fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// First calendar day of the month.
    pub fn first_day(self) -> Result<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).ok_or(Error::InvalidPeriod {
            year: self.year,
            month: self.month,
        })
    }

    /// Number of days in the month.
    pub fn days_in_month(self) -> Result<u32> {
        let next = self.next().first_day()?;
        let days = next.signed_duration_since(self.first_day()?).num_days();
        u32::try_from(days).map_err(|_| Error::InvalidPeriod {
            year: self.year,
            month: self.month,
        })
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

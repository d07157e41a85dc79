//! Time granularity of the intervals drivers extract data in.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Width of one extraction interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Granularity {
    Day,
    Month,
    Year,
    /// A single unbounded interval.
    Forever,
}

impl Granularity {
    /// Start of the interval containing `t`. `None` for [`Granularity::Forever`].
    pub fn lower(self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let date = match self {
            Self::Day => t.date_naive(),
            Self::Month => NaiveDate::from_ymd_opt(t.year(), t.month(), 1)?,
            Self::Year => NaiveDate::from_ymd_opt(t.year(), 1, 1)?,
            Self::Forever => return None,
        };
        Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
    }

    /// Last nanosecond of the interval containing `t`. `None` for
    /// [`Granularity::Forever`].
    pub fn upper(self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = self.lower(t)?;
        let next = match self {
            Self::Day => start.checked_add_signed(Duration::days(1))?,
            Self::Month => {
                let (y, m) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).single()?
            }
            Self::Year => Utc.with_ymd_and_hms(start.year() + 1, 1, 1, 0, 0, 0).single()?,
            Self::Forever => return None,
        };
        next.checked_sub_signed(Duration::nanoseconds(1))
    }

    /// Interval key for `t`, e.g. `2024-03-07`, `2024-03`, `2024`.
    /// Empty for [`Granularity::Forever`].
    pub fn format(self, t: DateTime<Utc>) -> String {
        match self {
            Self::Day => t.format("%Y-%m-%d").to_string(),
            Self::Month => t.format("%Y-%m").to_string(),
            Self::Year => t.format("%Y").to_string(),
            Self::Forever => String::new(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "DAY",
            Self::Month => "MONTH",
            Self::Year => "YEAR",
            Self::Forever => "FOREVER",
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

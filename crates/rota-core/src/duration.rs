//! Rotation frequency and the policy mapping it to the next rotation date.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// How often a rotation hands over to the next owner.
///
/// Unrecognised labels (including the empty string) are read as
/// [`Frequency::Weekly`], both when parsing stored records and when
/// deserialising.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Frequency {
    Daily,
    #[default]
    Weekly,
    Biweekly,
    Monthly,
}

impl Frequency {
    /// Lenient parse: never fails, falls back to `Weekly`.
    pub fn from_label(label: &str) -> Self {
        label.parse().unwrap_or_else(|_| {
            if !label.is_empty() {
                tracing::warn!(label, "unknown rotation frequency, using weekly");
            }
            Frequency::Weekly
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Biweekly => "biweekly",
            Frequency::Monthly => "monthly",
        }
    }

    /// The instant one period after `last`.
    pub fn next_after(&self, last: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Frequency::Daily => last + Duration::days(1),
            Frequency::Weekly => last + Duration::days(7),
            Frequency::Biweekly => last + Duration::days(14),
            Frequency::Monthly => add_one_month(last),
        }
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "biweekly" => Ok(Frequency::Biweekly),
            "monthly" => Ok(Frequency::Monthly),
            other => Err(format!("unknown frequency: {other}")),
        }
    }
}

impl From<String> for Frequency {
    fn from(s: String) -> Self {
        Frequency::from_label(&s)
    }
}

/// Compute the next rotation date from the last one and a frequency label.
///
/// Total and deterministic: any label other than `daily`, `weekly`,
/// `biweekly` or `monthly` behaves like `weekly`.
pub fn next_rotation_date(last: DateTime<Utc>, frequency: &str) -> DateTime<Utc> {
    Frequency::from_label(frequency).next_after(last)
}

/// Calendar month addition that keeps the day-of-month and the time of day.
///
/// A day that does not exist in the target month overflows into the month
/// after it (Jan 31 -> Mar 3, or Mar 2 in a leap year). Existing
/// `next_rotation_date` values rely on this overflow rule.
fn add_one_month(last: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if last.month() == 12 {
        (last.year() + 1, 1)
    } else {
        (last.year(), last.month() + 1)
    };
    let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) else {
        // Only reachable at the edge of chrono's supported range.
        return last + Duration::days(30);
    };
    let date = first + Duration::days(i64::from(last.day()) - 1);
    Utc.from_utc_datetime(&date.and_time(last.time()))
}

//! Timestamp encoding shared by every table.
//!
//! Stored timestamps are fixed-width RFC 3339 in UTC with microsecond
//! precision (`2024-01-01T15:00:00.000000Z`) so that SQL string comparison
//! orders them chronologically.

use chrono::{DateTime, SecondsFormat, Utc};

pub fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn fixed_width_sorts_chronologically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 15, 0, 0).unwrap();
        let b = a + Duration::milliseconds(500);
        let (fa, fb) = (format_ts(a), format_ts(b));
        assert_eq!(fa, "2024-01-01T15:00:00.000000Z");
        assert_eq!(fa.len(), fb.len());
        assert!(fa < fb);
        assert_eq!(parse_ts(&fb).unwrap(), b);
    }
}

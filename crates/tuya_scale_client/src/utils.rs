//! Date helpers for measurement timestamps.

use chrono::{DateTime, Datelike, NaiveDate, Utc};

pub fn parse_birthdate(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

pub fn millis_to_utc(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// Whole years between `birthdate` and the UTC calendar date of `created_at_ms`.
///
/// Returns `None` for timestamps out of range or dated before the birthdate.
pub fn age_at(birthdate: NaiveDate, created_at_ms: i64) -> Option<u32> {
    let measured = millis_to_utc(created_at_ms)?.date_naive();
    let mut years = measured.year() - birthdate.year();
    if (measured.month(), measured.day()) < (birthdate.month(), birthdate.day()) {
        years -= 1;
    }
    u32::try_from(years).ok()
}

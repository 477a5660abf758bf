//! Timestamp parsing and small calendar helpers.
//!
//! Observation files repeat the same timestamp string once per site (and
//! often once per parameter occurrence code), so readers parse through a
//! [`DateCache`] that remembers every string it has already converted. The
//! cache is an ordinary value owned by whoever is reading; there is no
//! process-wide state.
use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::error::DateTimeError;

/// Format of AMET `dateon` values
pub const AMET_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Format of AQS `Date Local`/`Date GMT` values
pub const AQS_DATE_FORMAT: &str = "%Y-%m-%d";

/// Memoizing parser from timestamp strings to naive datetimes.
///
/// A format may describe either a full datetime or a bare date; bare dates
/// are placed at midnight.
#[derive(Debug, Clone)]
pub struct DateCache {
    format: String,
    cache: HashMap<String, NaiveDateTime>,
}

impl DateCache {
    pub fn new<S: Into<String>>(format: S) -> Self {
        Self {
            format: format.into(),
            cache: HashMap::new(),
        }
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    /// Number of distinct strings parsed so far.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn parse(&mut self, value: &str) -> Result<NaiveDateTime, DateTimeError> {
        let value = value.trim();
        if let Some(dt) = self.cache.get(value) {
            return Ok(*dt);
        }

        let dt = NaiveDateTime::parse_from_str(value, &self.format)
            .or_else(|_| {
                NaiveDate::parse_from_str(value, &self.format).map(|d| d.and_time(NaiveTime::MIN))
            })
            .map_err(|_| DateTimeError::unparseable(value, &self.format))?;
        self.cache.insert(value.to_string(), dt);
        Ok(dt)
    }
}

/// Convert a fractional hour offset into a [`Duration`], to the nearest second.
pub fn hours_to_duration(hours: f64) -> Result<Duration, DateTimeError> {
    if !hours.is_finite() {
        return Err(DateTimeError::InvalidOffset(hours));
    }
    let seconds = (hours * 3600.0).round();
    if seconds.abs() > (i64::MAX / 1000) as f64 {
        return Err(DateTimeError::InvalidOffset(hours));
    }
    Ok(Duration::seconds(seconds as i64))
}

/// Shift a local timestamp by its GMT offset (hours to add to reach GMT).
pub fn local_to_gmt(local: NaiveDateTime, gmt_offset: f64) -> Result<DateTime<Utc>, DateTimeError> {
    let gmt = local + hours_to_duration(gmt_offset)?;
    Ok(gmt.and_utc())
}

/// Truncate a UTC timestamp to midnight of its calendar date.
pub fn floor_to_midnight(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Convert an IOAPI-style YYYYDDD date and HHMMSS time into a UTC timestamp.
pub fn from_yyyyddd_hhmmss(yyyyddd: i32, hhmmss: i32) -> Result<DateTime<Utc>, DateTimeError> {
    let year = yyyyddd / 1000;
    let doy = (yyyyddd % 1000) as u32;
    let date = NaiveDate::from_yo_opt(year, doy).ok_or(DateTimeError::InvalidYearDay(year, doy))?;
    let offset = hhmmss_to_duration(hhmmss)?;
    Ok((date.and_time(NaiveTime::MIN) + offset).and_utc())
}

/// Convert an IOAPI-style HHMMSS value (which may exceed 24 hours for time steps) into a duration.
pub fn hhmmss_to_duration(hhmmss: i32) -> Result<Duration, DateTimeError> {
    if hhmmss < 0 {
        return Err(DateTimeError::InvalidHhmmss(hhmmss));
    }
    let hours = hhmmss / 10000;
    let minutes = (hhmmss / 100) % 100;
    let seconds = hhmmss % 100;
    if minutes >= 60 || seconds >= 60 {
        return Err(DateTimeError::InvalidHhmmss(hhmmss));
    }
    Ok(Duration::hours(hours as i64) + Duration::minutes(minutes as i64) + Duration::seconds(seconds as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_reuses_parsed_values() {
        let mut cache = DateCache::new(AMET_DATETIME_FORMAT);
        let a = cache.parse("2016-07-01 05:00:00").unwrap();
        let b = cache.parse("2016-07-01 05:00:00").unwrap();
        let c = cache.parse("2016-07-01 06:00:00").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_bare_date_is_midnight() {
        let mut cache = DateCache::new(AQS_DATE_FORMAT);
        let d = cache.parse("2016-07-01").unwrap();
        assert_eq!(
            d,
            NaiveDate::from_ymd_opt(2016, 7, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_bad_timestamp() {
        let mut cache = DateCache::new(AMET_DATETIME_FORMAT);
        let err = cache.parse("yesterday").unwrap_err();
        assert!(matches!(err, DateTimeError::Unparseable { .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_local_to_gmt() {
        let local = NaiveDate::from_ymd_opt(2016, 7, 1).unwrap().and_hms_opt(20, 0, 0).unwrap();
        let gmt = local_to_gmt(local, 5.0).unwrap();
        assert_eq!(gmt.date_naive(), NaiveDate::from_ymd_opt(2016, 7, 2).unwrap());
        assert_eq!(gmt.time(), NaiveTime::from_hms_opt(1, 0, 0).unwrap());
    }

    #[test]
    fn test_ioapi_dates() {
        let t = from_yyyyddd_hhmmss(2016183, 130000).unwrap();
        assert_eq!(t.date_naive(), NaiveDate::from_ymd_opt(2016, 7, 1).unwrap());
        assert_eq!(t.time(), NaiveTime::from_hms_opt(13, 0, 0).unwrap());
        assert_eq!(hhmmss_to_duration(240000).unwrap(), Duration::days(1));
        assert!(hhmmss_to_duration(10070).is_err());
        assert!(from_yyyyddd_hhmmss(2015366, 0).is_err());
    }
}

//! Common errors across the aqmoco crate

/// Errors related to working with datetimes
#[derive(Debug, thiserror::Error)]
pub enum DateTimeError {
    #[error("Could not parse '{value}' as a timestamp with format '{format}'")]
    Unparseable { value: String, format: String },
    #[error("Year {0}, day of year {1} is not a valid date")]
    InvalidYearDay(i32, u32),
    #[error("{0} is not a valid HHMMSS time of day")]
    InvalidHhmmss(i32),
    #[error("Time offset of {0} hours cannot be represented")]
    InvalidOffset(f64),
}

impl DateTimeError {
    pub fn unparseable<V: ToString, F: ToString>(value: V, format: F) -> Self {
        Self::Unparseable {
            value: value.to_string(),
            format: format.to_string(),
        }
    }
}

//! Parsing the model file format specifier given on the command line.
//!
//! The specifier is either a bare format name (`ioapi`, `latlon`, `auto` or
//! its alias `netcdf`) or a comma separated list of `key=value` options,
//! e.g. `format=ioapi,time_dim=TSTEP`.
use std::{str::FromStr, sync::OnceLock};

static OPTION_REGEX: OnceLock<regex::Regex> = OnceLock::new();

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModelFormatError {
    #[error("Unknown model file format '{0}' (expected ioapi, latlon, auto or netcdf)")]
    UnknownKind(String),
    #[error("Unknown model format option '{0}' (expected format or time_dim)")]
    UnknownKey(String),
    #[error("Could not parse '{0}' as a key=value model format option")]
    BadOption(String),
}

/// How the grid and time axis of a model file are described.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::EnumString, strum::Display)]
#[strum(ascii_case_insensitive, serialize_all = "lowercase")]
pub enum ModelFileKind {
    /// Decide from the file's attributes
    #[default]
    #[strum(to_string = "auto", serialize = "netcdf")]
    Auto,
    /// Models-3 IOAPI global attributes on a projected or lat/lon grid
    Ioapi,
    /// CF-style 1-D latitude and longitude coordinates
    #[strum(to_string = "latlon", serialize = "cf")]
    LatLon,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModelFormat {
    pub kind: ModelFileKind,
    /// Name of the time dimension, overriding the configured list of names
    pub time_dim: Option<String>,
}

impl FromStr for ModelFormat {
    type Err = ModelFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if !s.contains('=') {
            let kind = ModelFileKind::from_str(s).map_err(|_| ModelFormatError::UnknownKind(s.to_string()))?;
            return Ok(Self { kind, time_dim: None });
        }

        let mut fmt = Self::default();
        for opt in s.split(',').filter(|o| !o.trim().is_empty()) {
            let re = OPTION_REGEX.get_or_init(|| {
                regex::Regex::new(r"^\s*(?<key>[A-Za-z_]+)\s*=\s*(?<value>[^,=]*?)\s*$")
                    .expect("Could not compile model format option regex")
            });
            let caps = re
                .captures(opt)
                .ok_or_else(|| ModelFormatError::BadOption(opt.to_string()))?;
            let value = &caps["value"];
            match caps["key"].to_ascii_lowercase().as_str() {
                "format" => {
                    fmt.kind = ModelFileKind::from_str(value)
                        .map_err(|_| ModelFormatError::UnknownKind(value.to_string()))?;
                }
                "time_dim" => fmt.time_dim = Some(value.to_string()),
                key => return Err(ModelFormatError::UnknownKey(key.to_string())),
            }
        }
        Ok(fmt)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("ioapi", ModelFileKind::Ioapi, None)]
    #[case("IOAPI", ModelFileKind::Ioapi, None)]
    #[case("netcdf", ModelFileKind::Auto, None)]
    #[case("latlon", ModelFileKind::LatLon, None)]
    #[case("format=ioapi,time_dim=TSTEP", ModelFileKind::Ioapi, Some("TSTEP"))]
    #[case(" time_dim = Time ", ModelFileKind::Auto, Some("Time"))]
    fn test_parse(#[case] s: &str, #[case] kind: ModelFileKind, #[case] time_dim: Option<&str>) {
        let fmt = ModelFormat::from_str(s).unwrap();
        assert_eq!(fmt.kind, kind);
        assert_eq!(fmt.time_dim.as_deref(), time_dim);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(ModelFormat::from_str("grib"), Err(ModelFormatError::UnknownKind("grib".to_string())));
        assert_eq!(
            ModelFormat::from_str("format=ioapi,layers=1"),
            Err(ModelFormatError::UnknownKey("layers".to_string()))
        );
        assert!(matches!(ModelFormat::from_str("format=a=b"), Err(ModelFormatError::BadOption(_))));
    }
}

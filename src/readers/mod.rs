//! Readers that normalize agency observation files into [`ObservationSet`]s.
//!
//! The set of supported formats is closed: [`ObsFormat`] names each one and
//! [`ObsFormat::read`] dispatches to the matching reader. Every reader must
//! produce records with `lat` (degrees N), `lon` (degrees E), a GMT
//! timestamp, and a `site_id_poc` key; see [`crate::observations`].
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use error_stack::ResultExt;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::observations::ObservationSet;

pub mod amet;
pub mod aqs;

pub use amet::AmetReader;
pub use aqs::{AqsDailyReader, AqsHourlyReader};

pub type ObsReadResult<T> = error_stack::Result<T, ObsReadError>;

/// Errors that can occur while reading observation files.
#[derive(Debug, thiserror::Error)]
pub enum ObsReadError {
    #[error("Could not open {descr} at {}", .path.display())]
    CouldNotOpen { descr: String, path: PathBuf },

    #[error("Error reading CSV data: {0}")]
    Csv(String),

    #[error("Required column '{0}' is missing")]
    MissingColumn(String),

    #[error("Data line {line}: could not parse '{value}' in column '{column}'")]
    BadValue { line: usize, column: String, value: String },

    #[error("Site '{0}' is not listed in the site metadata")]
    UnknownSite(String),

    #[error("File has more than one Parameter Code ({}); not yet supported", .0.join(", "))]
    MultipleParameterCodes(Vec<String>),

    #[error("File has no data rows to determine the Parameter Code from")]
    NoParameterCode,

    #[error("A site metadata file is required for the {0} format")]
    SitesRequired(ObsFormat),

    #[error("Invalid timestamp on data line {0}")]
    BadTimestamp(usize),
}

impl ObsReadError {
    pub fn could_not_open<S: Into<String>, P: Into<PathBuf>>(descr: S, path: P) -> Self {
        Self::CouldNotOpen {
            descr: descr.into(),
            path: path.into(),
        }
    }

    pub fn csv<E: ToString>(err: E) -> Self {
        Self::Csv(err.to_string())
    }

    pub fn missing_column<S: Into<String>>(column: S) -> Self {
        Self::MissingColumn(column.into())
    }

    pub fn bad_value<C: Into<String>, V: Into<String>>(line: usize, column: C, value: V) -> Self {
        Self::BadValue {
            line,
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Supported observation input formats.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::EnumString, strum::Display,
)]
#[strum(ascii_case_insensitive)]
pub enum ObsFormat {
    /// AMET paired-style observation CSV plus a site metadata CSV
    #[strum(serialize = "AMET")]
    #[serde(rename = "AMET")]
    Amet,
    /// EPA AQS daily summary CSV
    #[strum(serialize = "AQS-daily", serialize = "AQSDAILY")]
    #[serde(rename = "AQS-daily", alias = "AQSDAILY")]
    AqsDaily,
    /// EPA AQS hourly CSV
    #[strum(serialize = "AQS-hourly", serialize = "AQSHOURLY")]
    #[serde(rename = "AQS-hourly", alias = "AQSHOURLY")]
    AqsHourly,
}

impl ObsFormat {
    /// Whether this format needs the separate site metadata file.
    pub fn needs_site_file(&self) -> bool {
        matches!(self, Self::Amet)
    }

    /// Read observations from `obs_path`, using `site_path` for formats that
    /// keep coordinates and GMT offsets in a separate file.
    pub fn read(&self, obs_path: &Path, site_path: Option<&Path>) -> ObsReadResult<ObservationSet> {
        match self {
            Self::Amet => {
                let site_path = site_path.ok_or(ObsReadError::SitesRequired(*self))?;
                AmetReader::new(obs_path, site_path).read_records()
            }
            Self::AqsDaily => AqsDailyReader::new(obs_path).read_records(),
            Self::AqsHourly => AqsHourlyReader::new(obs_path).read_records(),
        }
    }
}

/// Common interface of the observation readers.
pub trait ObservationReader {
    fn read_records(&self) -> ObsReadResult<ObservationSet>;
}

pub(crate) fn open_file(descr: &str, path: &Path) -> ObsReadResult<File> {
    File::open(path).change_context_lazy(|| ObsReadError::could_not_open(descr, path))
}

pub(crate) fn csv_reader<R: Read>(rdr: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(false)
        .from_reader(rdr)
}

/// Parse one CSV cell as a float. `Ok(None)` means the cell holds a
/// recognized missing marker, `Err(())` that it is not numeric at all.
pub(crate) fn parse_numeric_cell(cell: &str) -> Result<Option<f64>, ()> {
    let cell = cell.trim();
    if cell.is_empty() || cell.eq_ignore_ascii_case("na") || cell.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    cell.parse::<f64>().map(Some).map_err(|_| ())
}

/// Zero-pad a numeric agency code to a fixed width; non-numeric codes are
/// returned unchanged.
pub(crate) fn pad_code(code: &str, width: usize) -> String {
    let code = code.trim();
    match code.parse::<u32>() {
        Ok(n) => format!("{n:0width$}"),
        Err(_) => code.to_string(),
    }
}

/// Make a variable name from an AQS parameter name, e.g.
/// "PM2.5 - Local Conditions" becomes "PM25_LC".
pub(crate) fn aqs_parameter_varname(name: &str) -> String {
    name.trim()
        .replace(" - Local Conditions", "_LC")
        .replace(" - Standard Conditions", "_SC")
        .replace("2.5", "25")
        .split_whitespace()
        .join("_")
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_format_names() {
        assert_eq!(ObsFormat::from_str("AMET").unwrap(), ObsFormat::Amet);
        assert_eq!(ObsFormat::from_str("aqs-daily").unwrap(), ObsFormat::AqsDaily);
        assert_eq!(ObsFormat::from_str("AQSDAILY").unwrap(), ObsFormat::AqsDaily);
        assert_eq!(ObsFormat::from_str("AQS-hourly").unwrap(), ObsFormat::AqsHourly);
        assert!(ObsFormat::from_str("CASTNET").is_err());
        assert_eq!(ObsFormat::AqsDaily.to_string(), "AQS-daily");
    }

    #[test]
    fn test_amet_requires_sites() {
        let err = ObsFormat::Amet
            .read(Path::new("obs.csv"), None)
            .unwrap_err();
        assert!(matches!(err.current_context(), ObsReadError::SitesRequired(ObsFormat::Amet)));
    }

    #[test]
    fn test_parameter_varname() {
        assert_eq!(aqs_parameter_varname("PM2.5 - Local Conditions"), "PM25_LC");
        assert_eq!(aqs_parameter_varname("Ozone"), "Ozone");
        assert_eq!(aqs_parameter_varname("Nitrogen dioxide (NO2)"), "Nitrogen_dioxide_(NO2)");
    }

    #[test]
    fn test_pad_code() {
        assert_eq!(pad_code("6", 2), "06");
        assert_eq!(pad_code("37", 3), "037");
        assert_eq!(pad_code("CC", 2), "CC");
    }

    #[test]
    fn test_numeric_cells() {
        assert_eq!(parse_numeric_cell("1.5"), Ok(Some(1.5)));
        assert_eq!(parse_numeric_cell(""), Ok(None));
        assert_eq!(parse_numeric_cell("NaN"), Ok(None));
        assert_eq!(parse_numeric_cell("2016-07-01"), Err(()));
    }
}

//! Readers for EPA AQS pre-generated daily and hourly CSV files.
//!
//! Both formats identify a site by state, county and site number, which we
//! concatenate (zero padded to 2, 3 and 4 digits) into the site id. Only one
//! parameter may be present per file; the measurement is named after the
//! parameter's name (e.g. "PM2.5 - Local Conditions" becomes `PM25_LC`).
use std::collections::BTreeSet;
use std::io::Read;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use error_stack::ResultExt;
use indexmap::IndexMap;
use serde::Deserialize;

use super::{aqs_parameter_varname, csv_reader, open_file, pad_code, ObsReadError, ObsReadResult, ObservationReader};
use crate::dates::{DateCache, AQS_DATE_FORMAT};
use crate::observations::{ObservationRecord, ObservationSet};

const AQS_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M";
const DAILY_SAMPLE_DURATION: &str = "24 HOUR";
const NO_EVENT: &str = "None";

/// Site and parameter identification shared by the daily and hourly formats.
#[derive(Debug, Clone)]
struct AqsSiteFields {
    state_code: String,
    county_code: String,
    site_num: String,
    parameter_code: String,
    poc: String,
    latitude: f64,
    longitude: f64,
    parameter_name: String,
}

impl AqsSiteFields {
    fn site_id(&self) -> String {
        format!(
            "{}{}{}",
            pad_code(&self.state_code, 2),
            pad_code(&self.county_code, 3),
            pad_code(&self.site_num, 4)
        )
    }
}

// The csv crate cannot deserialize typed fields through `#[serde(flatten)]`,
// so each row type lists the site columns itself.
macro_rules! aqs_row {
    ($name:ident { $($(#[$attr:meta])* $field:ident: $ty:ty,)* }) => {
        #[derive(Debug, Clone, Deserialize)]
        struct $name {
            #[serde(rename = "State Code")]
            state_code: String,
            #[serde(rename = "County Code")]
            county_code: String,
            #[serde(rename = "Site Num")]
            site_num: String,
            #[serde(rename = "Parameter Code")]
            parameter_code: String,
            #[serde(rename = "POC")]
            poc: String,
            #[serde(rename = "Latitude")]
            latitude: f64,
            #[serde(rename = "Longitude")]
            longitude: f64,
            #[serde(rename = "Parameter Name")]
            parameter_name: String,
            $($(#[$attr])* $field: $ty,)*
        }

        impl $name {
            fn site(&self) -> AqsSiteFields {
                AqsSiteFields {
                    state_code: self.state_code.clone(),
                    county_code: self.county_code.clone(),
                    site_num: self.site_num.clone(),
                    parameter_code: self.parameter_code.clone(),
                    poc: self.poc.trim().to_string(),
                    latitude: self.latitude,
                    longitude: self.longitude,
                    parameter_name: self.parameter_name.clone(),
                }
            }
        }
    };
}

aqs_row!(AqsDailyRow {
    #[serde(rename = "Sample Duration")]
    sample_duration: String,
    #[serde(rename = "Date Local")]
    date_local: String,
    #[serde(rename = "Event Type")]
    event_type: String,
    #[serde(rename = "Arithmetic Mean")]
    arithmetic_mean: Option<f64>,
});

aqs_row!(AqsHourlyRow {
    #[serde(rename = "Date Local")]
    date_local: String,
    #[serde(rename = "Time Local")]
    time_local: String,
    #[serde(rename = "Date GMT")]
    date_gmt: String,
    #[serde(rename = "Time GMT")]
    time_gmt: String,
    #[serde(rename = "Sample Measurement")]
    sample_measurement: Option<f64>,
});

#[derive(Debug, Clone)]
pub struct AqsDailyReader {
    path: PathBuf,
}

impl AqsDailyReader {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl ObservationReader for AqsDailyReader {
    fn read_records(&self) -> ObsReadResult<ObservationSet> {
        let f = open_file("AQS daily file", &self.path)?;
        read_aqs_daily(f).attach_printable_lazy(|| format!("while reading {}", self.path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct AqsHourlyReader {
    path: PathBuf,
}

impl AqsHourlyReader {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl ObservationReader for AqsHourlyReader {
    fn read_records(&self) -> ObsReadResult<ObservationSet> {
        let f = open_file("AQS hourly file", &self.path)?;
        read_aqs_hourly(f).attach_printable_lazy(|| format!("while reading {}", self.path.display()))
    }
}

fn deserialize_rows<R: Read, T: for<'de> Deserialize<'de>>(rdr: R) -> ObsReadResult<Vec<T>> {
    let mut rdr = csv_reader(rdr);
    let mut rows = vec![];
    for (irow, row) in rdr.deserialize::<T>().enumerate() {
        let row = row
            .change_context_lazy(|| ObsReadError::csv("deserializing an AQS row"))
            .attach_printable_lazy(|| format!("data line {}", irow + 2))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Check that exactly one parameter is present and return the variable name for it.
fn single_parameter<I: Iterator<Item = AqsSiteFields>>(sites: I) -> ObsReadResult<String> {
    let mut params = BTreeSet::new();
    let mut names = IndexMap::new();
    for s in sites {
        params.insert(s.parameter_code.clone());
        // Keep the lexically largest name for each code.
        let entry = names.entry(s.parameter_code.clone()).or_insert_with(String::new);
        if s.parameter_name > *entry {
            *entry = s.parameter_name.clone();
        }
    }

    if params.len() > 1 {
        return Err(ObsReadError::MultipleParameterCodes(params.into_iter().collect()).into());
    }
    let code = params.into_iter().next().ok_or(ObsReadError::NoParameterCode)?;
    let name = aqs_parameter_varname(&names[&code]);
    log::info!("AQS parameter {code} -> {name}");
    Ok(name)
}

/// Read an AQS daily summary file, keeping only 24-hour samples without exceptional events.
pub fn read_aqs_daily<R: Read>(rdr: R) -> ObsReadResult<ObservationSet> {
    let rows: Vec<AqsDailyRow> = deserialize_rows(rdr)?;
    let varname = single_parameter(rows.iter().map(|r| r.site()))?;

    let mut dates = DateCache::new(AQS_DATE_FORMAT);
    let mut records = vec![];
    for (irow, row) in rows.into_iter().enumerate() {
        if row.sample_duration != DAILY_SAMPLE_DURATION || row.event_type != NO_EVENT {
            continue;
        }
        let line = irow + 2;
        let local = dates.parse(&row.date_local).change_context(ObsReadError::BadTimestamp(line))?;
        let mut values = IndexMap::new();
        values.insert(varname.clone(), row.arithmetic_mean.unwrap_or(f64::NAN));
        // Local and GMT days are treated as the same for daily data.
        let site = row.site();
        let rec = ObservationRecord::new(
            site.site_id(),
            site.poc,
            site.longitude,
            site.latitude,
            local,
            0.0,
            values,
        )
        .change_context(ObsReadError::BadTimestamp(line))?;
        records.push(rec);
    }

    log::info!("Read {} AQS daily observations", records.len());
    Ok(ObservationSet::new(records))
}

/// Read an AQS hourly file; the GMT offset of each record comes from its paired local and GMT times.
pub fn read_aqs_hourly<R: Read>(rdr: R) -> ObsReadResult<ObservationSet> {
    let rows: Vec<AqsHourlyRow> = deserialize_rows(rdr)?;
    let varname = single_parameter(rows.iter().map(|r| r.site()))?;

    let mut dates = DateCache::new(AQS_DATETIME_FORMAT);
    let mut records = Vec::with_capacity(rows.len());
    for (irow, row) in rows.into_iter().enumerate() {
        let line = irow + 2;
        let mut parse = |d: &str, t: &str| -> ObsReadResult<NaiveDateTime> {
            dates
                .parse(&format!("{} {}", d.trim(), t.trim()))
                .change_context(ObsReadError::BadTimestamp(line))
        };
        let local = parse(&row.date_local, &row.time_local)?;
        let gmt = parse(&row.date_gmt, &row.time_gmt)?;
        let offset_hours = (gmt - local).num_seconds() as f64 / 3600.0;

        let mut values = IndexMap::new();
        values.insert(varname.clone(), row.sample_measurement.unwrap_or(f64::NAN));
        let site = row.site();
        let rec = ObservationRecord::new(
            site.site_id(),
            site.poc,
            site.longitude,
            site.latitude,
            local,
            offset_hours,
            values,
        )
        .change_context(ObsReadError::BadTimestamp(line))?;
        records.push(rec);
    }

    log::info!("Read {} AQS hourly observations", records.len());
    Ok(ObservationSet::new(records))
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use chrono::Timelike;

    use super::*;

    const DAILY_HEADER: &str = "\"State Code\",\"County Code\",\"Site Num\",\"Parameter Code\",\"POC\",\"Latitude\",\"Longitude\",\"Datum\",\"Parameter Name\",\"Sample Duration\",\"Pollutant Standard\",\"Date Local\",\"Units of Measure\",\"Event Type\",\"Observation Count\",\"Observation Percent\",\"Arithmetic Mean\"";

    #[test]
    fn test_read_daily() {
        let data = format!(
            "{DAILY_HEADER}\n\
            \"06\",\"037\",\"1103\",\"88101\",1,34.06659,-118.22688,\"WGS84\",\"PM2.5 - Local Conditions\",\"24 HOUR\",\"PM25 24-hour 2012\",\"2016-07-01\",\"Micrograms/cubic meter (LC)\",\"None\",1,100.0,12.5\n\
            \"06\",\"037\",\"1103\",\"88101\",1,34.06659,-118.22688,\"WGS84\",\"PM2.5 - Local Conditions\",\"1 HOUR\",\"PM25 24-hour 2012\",\"2016-07-01\",\"Micrograms/cubic meter (LC)\",\"None\",24,100.0,11.0\n\
            \"6\",\"37\",\"1103\",\"88101\",3,34.06659,-118.22688,\"WGS84\",\"PM2.5 - Local Conditions\",\"24 HOUR\",\"PM25 24-hour 2012\",\"2016-07-02\",\"Micrograms/cubic meter (LC)\",\"Included\",1,100.0,30.0\n"
        );
        let set = read_aqs_daily(data.as_bytes()).unwrap();
        assert_eq!(set.len(), 1);
        let rec = &set.records()[0];
        assert_eq!(rec.site_id_poc, "060371103-1");
        assert_abs_diff_eq!(rec.value("PM25_LC").unwrap(), 12.5);
        assert_eq!(rec.gmt_time.naive_utc(), rec.local_time);
    }

    #[test]
    fn test_daily_multiple_parameters() {
        let data = format!(
            "{DAILY_HEADER}\n\
            \"06\",\"037\",\"1103\",\"88101\",1,34.0,-118.2,\"WGS84\",\"PM2.5 - Local Conditions\",\"24 HOUR\",\"x\",\"2016-07-01\",\"u\",\"None\",1,100.0,12.5\n\
            \"06\",\"037\",\"1103\",\"44201\",1,34.0,-118.2,\"WGS84\",\"Ozone\",\"24 HOUR\",\"x\",\"2016-07-01\",\"u\",\"None\",1,100.0,0.04\n"
        );
        let err = read_aqs_daily(data.as_bytes()).unwrap_err();
        match err.current_context() {
            ObsReadError::MultipleParameterCodes(codes) => assert_eq!(codes, &["44201", "88101"]),
            e => panic!("Expected MultipleParameterCodes, got {e:?}"),
        }
    }

    #[test]
    fn test_read_hourly() {
        let data = "\"State Code\",\"County Code\",\"Site Num\",\"Parameter Code\",\"POC\",\"Latitude\",\"Longitude\",\"Datum\",\"Parameter Name\",\"Date Local\",\"Time Local\",\"Date GMT\",\"Time GMT\",\"Sample Measurement\",\"Units of Measure\"\n\
            \"01\",\"003\",\"0010\",\"44201\",1,30.497478,-87.880258,\"NAD83\",\"Ozone\",\"2016-07-01\",\"22:00\",\"2016-07-02\",\"04:00\",0.031,\"Parts per million\"\n\
            \"01\",\"003\",\"0010\",\"44201\",1,30.497478,-87.880258,\"NAD83\",\"Ozone\",\"2016-07-01\",\"23:00\",\"2016-07-02\",\"05:00\",,\"Parts per million\"\n";
        let set = read_aqs_hourly(data.as_bytes()).unwrap();
        assert_eq!(set.len(), 2);
        let rec = &set.records()[0];
        assert_eq!(rec.site_id_poc, "010030010-1");
        assert_abs_diff_eq!(rec.gmt_offset, 6.0);
        assert_eq!(rec.gmt_time.hour(), 4);
        assert_abs_diff_eq!(rec.value("Ozone").unwrap(), 0.031);
        assert!(set.records()[1].value("Ozone").unwrap().is_nan());
    }
}

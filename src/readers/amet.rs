//! Reader for AMET-style observation files.
//!
//! AMET observations come as two CSV files: the observations themselves,
//! keyed by `site_id`, `POCode` and a local `dateon` timestamp, and a site
//! list giving each `stat_id` its `lon`, `lat` and `GMT_offset`. If the
//! observation file carries its own `lon`/`lat` columns, those take
//! precedence over the site list.
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use error_stack::ResultExt;
use indexmap::IndexMap;

use super::{csv_reader, open_file, parse_numeric_cell, ObsReadError, ObsReadResult, ObservationReader};
use crate::dates::{DateCache, AMET_DATETIME_FORMAT};
use crate::observations::{ObservationRecord, ObservationSet};

const SITE_ID_COL: &str = "site_id";
const POC_COL: &str = "POCode";
const DATE_COL: &str = "dateon";
const STAT_ID_COL: &str = "stat_id";
const GMT_OFFSET_COL: &str = "GMT_offset";
const LON_COL: &str = "lon";
const LAT_COL: &str = "lat";

/// Columns never treated as measurement values even if numeric
const NON_VALUE_COLS: [&str; 6] = [SITE_ID_COL, POC_COL, DATE_COL, GMT_OFFSET_COL, LON_COL, LAT_COL];

#[derive(Debug, Clone)]
pub struct AmetReader {
    obs_path: PathBuf,
    site_path: PathBuf,
}

impl AmetReader {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(obs_path: P, site_path: Q) -> Self {
        Self {
            obs_path: obs_path.into(),
            site_path: site_path.into(),
        }
    }

    pub fn obs_path(&self) -> &Path {
        &self.obs_path
    }
}

impl ObservationReader for AmetReader {
    fn read_records(&self) -> ObsReadResult<ObservationSet> {
        let obs = open_file("AMET observation file", &self.obs_path)?;
        let sites = open_file("AMET site file", &self.site_path)?;
        read_amet(obs, sites).attach_printable_lazy(|| {
            format!(
                "while reading AMET observations from {} with sites from {}",
                self.obs_path.display(),
                self.site_path.display()
            )
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct SiteMeta {
    lon: f64,
    lat: f64,
    gmt_offset: f64,
}

/// Read AMET observations and site metadata from any readers.
pub fn read_amet<R: Read, S: Read>(obs: R, sites: S) -> ObsReadResult<ObservationSet> {
    let site_meta = read_site_meta(sites)?;

    let mut rdr = csv_reader(obs);
    let headers = rdr.headers().change_context(ObsReadError::Csv("reading header".into()))?.clone();
    let col = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| error_stack::Report::new(ObsReadError::missing_column(name)))
    };
    let i_site = col(SITE_ID_COL)?;
    let i_poc = col(POC_COL)?;
    let i_date = col(DATE_COL)?;
    let i_lon = headers.iter().position(|h| h == LON_COL);
    let i_lat = headers.iter().position(|h| h == LAT_COL);

    let mut rows = vec![];
    for row in rdr.records() {
        rows.push(row.change_context_lazy(|| ObsReadError::csv("reading a data row"))?);
    }

    // A column is a measurement only if every non-empty cell in it is numeric.
    let value_cols: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| !NON_VALUE_COLS.contains(h))
        .filter(|(i, _)| rows.iter().all(|r| parse_numeric_cell(r.get(*i).unwrap_or("")).is_ok()))
        .map(|(i, h)| (i, h.to_string()))
        .collect();
    log::debug!(
        "AMET value columns: {}",
        value_cols.iter().map(|(_, n)| n.as_str()).collect::<Vec<_>>().join(", ")
    );

    let mut dates = DateCache::new(AMET_DATETIME_FORMAT);
    let mut records = Vec::with_capacity(rows.len());
    for (irow, row) in rows.iter().enumerate() {
        let line = irow + 2;
        let site_id = row.get(i_site).unwrap_or("").to_string();
        let poc = row.get(i_poc).unwrap_or("").to_string();
        let meta = site_meta
            .get(&site_id)
            .copied()
            .ok_or_else(|| ObsReadError::UnknownSite(site_id.clone()))
            .attach_printable_lazy(|| format!("on data line {line}"))?;

        let local = dates
            .parse(row.get(i_date).unwrap_or(""))
            .change_context(ObsReadError::BadTimestamp(line))?;

        let lon = match i_lon {
            Some(i) => parse_float(row.get(i), line, LON_COL)?,
            None => meta.lon,
        };
        let lat = match i_lat {
            Some(i) => parse_float(row.get(i), line, LAT_COL)?,
            None => meta.lat,
        };

        let mut values = IndexMap::with_capacity(value_cols.len());
        for (i, name) in value_cols.iter() {
            let v = parse_numeric_cell(row.get(*i).unwrap_or(""))
                .ok()
                .flatten()
                .unwrap_or(f64::NAN);
            values.insert(name.clone(), v);
        }

        let rec = ObservationRecord::new(site_id, poc, lon, lat, local, meta.gmt_offset, values)
            .change_context(ObsReadError::BadTimestamp(line))?;
        records.push(rec);
    }

    log::info!("Read {} AMET observations ({} distinct timestamps)", records.len(), dates.len());
    Ok(ObservationSet::new(records))
}

fn read_site_meta<S: Read>(sites: S) -> ObsReadResult<HashMap<String, SiteMeta>> {
    let mut rdr = csv_reader(sites);
    let headers = rdr.headers().change_context(ObsReadError::Csv("reading site header".into()))?.clone();
    let col = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| error_stack::Report::new(ObsReadError::missing_column(name)))
            .attach_printable("in the site metadata file")
    };
    let i_id = col(STAT_ID_COL)?;
    let i_off = col(GMT_OFFSET_COL)?;
    let i_lon = col(LON_COL)?;
    let i_lat = col(LAT_COL)?;

    let mut meta = HashMap::new();
    for (irow, row) in rdr.records().enumerate() {
        let row = row.change_context_lazy(|| ObsReadError::csv("reading a site row"))?;
        let line = irow + 2;
        let id = row.get(i_id).unwrap_or("").to_string();
        let site = SiteMeta {
            lon: parse_float(row.get(i_lon), line, LON_COL)?,
            lat: parse_float(row.get(i_lat), line, LAT_COL)?,
            gmt_offset: parse_float(row.get(i_off), line, GMT_OFFSET_COL)?,
        };
        meta.insert(id, site);
    }
    Ok(meta)
}

fn parse_float(cell: Option<&str>, line: usize, column: &str) -> ObsReadResult<f64> {
    let cell = cell.unwrap_or("");
    match parse_numeric_cell(cell) {
        Ok(Some(v)) => Ok(v),
        Ok(None) => Ok(f64::NAN),
        Err(_) => Err(ObsReadError::bad_value(line, column, cell).into()),
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use chrono::{NaiveDate, Timelike};

    use super::*;

    const SITES: &str = "stat_id,lon,lat,GMT_offset,state\n\
        AAA,-100.0,40.0,6,NE\n\
        BBB,-90.5,35.25,5,TN\n";

    #[test]
    fn test_read_amet() {
        let obs = "site_id,POCode,dateon,dateoff,O3,PM25\n\
            AAA,1,2016-07-01 00:00:00,2016-07-01 00:59:59,40.0,\n\
            BBB,2,2016-07-01 00:00:00,2016-07-01 00:59:59,35.5,7.5\n";
        let set = read_amet(obs.as_bytes(), SITES.as_bytes()).unwrap();
        assert_eq!(set.len(), 2);

        let a = &set.records()[0];
        assert_eq!(a.site_id_poc, "AAA-1");
        assert_abs_diff_eq!(a.lon, -100.0);
        assert_eq!(a.gmt_time.hour(), 6);
        assert_abs_diff_eq!(a.value("O3").unwrap(), 40.0);
        assert!(a.value("PM25").unwrap().is_nan());
        assert!(a.value("dateoff").is_none(), "non-numeric columns are not values");

        let b = &set.records()[1];
        assert_eq!(b.site_id_poc, "BBB-2");
        assert_abs_diff_eq!(b.lat, 35.25);
        assert_eq!(b.gmt_time.date_naive(), NaiveDate::from_ymd_opt(2016, 7, 1).unwrap());
    }

    #[test]
    fn test_obs_coordinates_take_precedence() {
        let obs = "site_id,POCode,dateon,lon,lat,O3\n\
            AAA,1,2016-07-01 00:00:00,-101.0,41.0,40.0\n";
        let set = read_amet(obs.as_bytes(), SITES.as_bytes()).unwrap();
        assert_abs_diff_eq!(set.records()[0].lon, -101.0);
        assert_abs_diff_eq!(set.records()[0].lat, 41.0);
        assert!(set.records()[0].value("lon").is_none());
    }

    #[test]
    fn test_unknown_site() {
        let obs = "site_id,POCode,dateon,O3\nZZZ,1,2016-07-01 00:00:00,40.0\n";
        let err = read_amet(obs.as_bytes(), SITES.as_bytes()).unwrap_err();
        assert!(matches!(err.current_context(), ObsReadError::UnknownSite(s) if s == "ZZZ"));
    }

    #[test]
    fn test_missing_column() {
        let obs = "site_id,dateon,O3\nAAA,2016-07-01 00:00:00,40.0\n";
        let err = read_amet(obs.as_bytes(), SITES.as_bytes()).unwrap_err();
        assert!(matches!(err.current_context(), ObsReadError::MissingColumn(c) if c == "POCode"));
    }
}

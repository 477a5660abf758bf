//! Shared fixtures for unit tests.
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use indexmap::IndexMap;
use ndarray::Array4;

use crate::datasets::{GriddedDataset, GriddedVariable, VariableMeta};
use crate::grid::{GridAddressing, LatLonGrid};
use crate::observations::{ObservationRecord, ObservationSet};
use crate::sites::{dedup_sites, SiteTable};

fn local_base() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2016, 7, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

/// A record `hour` hours after local midnight on 2016-07-01.
pub(crate) fn make_record(
    site: &str,
    poc: &str,
    lon: f64,
    lat: f64,
    hour: i64,
    gmt_offset: f64,
    values: &[(&str, f64)],
) -> ObservationRecord {
    let values: IndexMap<String, f64> = values.iter().map(|(k, v)| (k.to_string(), *v)).collect();
    ObservationRecord::new(site, poc, lon, lat, local_base() + Duration::hours(hour), gmt_offset, values).unwrap()
}

/// `n` hourly times starting 2016-07-01 00:00 UTC.
pub(crate) fn hourly_times(n: usize) -> Vec<DateTime<Utc>> {
    let t0 = Utc.with_ymd_and_hms(2016, 7, 1, 0, 0, 0).unwrap();
    (0..n).map(|i| t0 + Duration::hours(i as i64)).collect()
}

/// A 1 degree grid of 10 columns and 8 rows with its southwest corner at 100 W, 30 N.
pub(crate) fn small_latlon_grid() -> GridAddressing {
    LatLonGrid::from_bounds(-100.0, 30.0, 1.0, 1.0, 10, 8).unwrap().into()
}

/// An hourly model file on [`small_latlon_grid`] with two layers.
///
/// Variable `k` (in the order given) has the value
/// `1000 * (k + 1) + 10 * row + col + hour_of_day` in layer 0 and NaN in
/// layer 1, where the hour counts from `start_hour` after 2016-07-01 00:00.
pub(crate) fn gridded_dataset(start_hour: usize, ntimes: usize, vars: &[&str]) -> GriddedDataset {
    let grid = small_latlon_grid();
    let (nrows, ncols) = grid.shape();
    let times = hourly_times(start_hour + ntimes)[start_hour..].to_vec();
    let mut ds = GriddedDataset::new(grid, times);
    for (k, name) in vars.iter().enumerate() {
        let data = Array4::from_shape_fn((ntimes, 2, nrows, ncols), |(t, l, r, c)| {
            if l > 0 {
                f32::NAN
            } else {
                (1000 * (k + 1) + 10 * r + c + (start_hour + t) % 24) as f32
            }
        });
        let meta = VariableMeta::new("ppb", name, &format!("model {name}"));
        ds.add_variable(name, GriddedVariable { data, meta }).unwrap();
    }
    ds
}

/// Hourly O3 for two days at two sites inside [`small_latlon_grid`] and one outside it.
///
/// Site A reads 30 ppb every hour, site B 40 ppb. Site C is at 10 E, 10 N.
pub(crate) fn observation_set() -> ObservationSet {
    let mut records = vec![];
    for h in 0..48 {
        records.push(make_record("A", "1", -99.5, 30.5, h, 0.0, &[("O3", 30.0)]));
        records.push(make_record("B", "1", -95.5, 35.5, h, 0.0, &[("O3", 40.0)]));
        records.push(make_record("C", "1", 10.0, 10.0, h, 0.0, &[("O3", 50.0)]));
    }
    records.into_iter().collect()
}

/// Sites A (row 0, column 0) and B (row 5, column 4) located on [`small_latlon_grid`].
pub(crate) fn site_table() -> SiteTable {
    let records = vec![
        make_record("A", "1", -99.5, 30.5, 0, 0.0, &[("O3", 30.0)]),
        make_record("B", "1", -95.5, 35.5, 0, 0.0, &[("O3", 40.0)]),
    ];
    let coords: Vec<_> = records.iter().map(|r| (r.lon, r.lat)).collect();
    let cells = small_latlon_grid().locate_all(&coords);
    dedup_sites(&records, &cells).unwrap()
}

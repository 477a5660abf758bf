//! Collapsing observation records onto unique (site, grid cell) keys.
//!
//! Every in-domain record contributes to the row for its
//! `(site_id_poc, i, j)` key; the row's coordinates are the mean of all
//! contributing records. This is lossy: if distinct instruments report
//! slightly different positions inside one cell, the positions are blended
//! and the spread is not retained (it is only logged at DEBUG).
use indexmap::IndexMap;

use crate::grid::GridCellAssignment;
use crate::observations::ObservationRecord;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SiteError {
    #[error("Got {records} observation records but {cells} grid cell assignments")]
    LengthMismatch { records: usize, cells: usize },
}

/// One distinct `(site_id_poc, i, j)` combination with averaged coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct UniqueSiteCell {
    pub site_id_poc: String,
    pub i: usize,
    pub j: usize,
    pub lon: f64,
    pub lat: f64,
    pub x: f64,
    pub y: f64,
    /// Number of observation records that were averaged into this row
    pub n_records: usize,
}

/// The ordered set of sites that model data is extracted for.
///
/// Order is the order in which keys first appear in the observation input.
/// It is stable for identical inputs, but callers should not rely on it
/// being sorted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteTable {
    cells: Vec<UniqueSiteCell>,
}

impl SiteTable {
    pub fn new(cells: Vec<UniqueSiteCell>) -> Self {
        Self { cells }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[UniqueSiteCell] {
        &self.cells
    }

    pub fn iter(&self) -> std::slice::Iter<'_, UniqueSiteCell> {
        self.cells.iter()
    }

    /// `(j, i)` pairs, i.e. (row, column), in site order.
    pub fn row_col_indices(&self) -> Vec<(usize, usize)> {
        self.cells.iter().map(|c| (c.j, c.i)).collect()
    }

    pub fn site_ids(&self) -> Vec<&str> {
        self.cells.iter().map(|c| c.site_id_poc.as_str()).collect()
    }
}

#[derive(Debug, Default)]
struct CellAccumulator {
    lon: f64,
    lat: f64,
    x: f64,
    y: f64,
    lon_range: (f64, f64),
    lat_range: (f64, f64),
    n: usize,
}

impl CellAccumulator {
    fn add(&mut self, rec: &ObservationRecord, cell: &GridCellAssignment) {
        if self.n == 0 {
            self.lon_range = (rec.lon, rec.lon);
            self.lat_range = (rec.lat, rec.lat);
        } else {
            self.lon_range = (self.lon_range.0.min(rec.lon), self.lon_range.1.max(rec.lon));
            self.lat_range = (self.lat_range.0.min(rec.lat), self.lat_range.1.max(rec.lat));
        }
        self.lon += rec.lon;
        self.lat += rec.lat;
        self.x += cell.x;
        self.y += cell.y;
        self.n += 1;
    }
}

/// Build the site table from observation records and their grid cells.
///
/// `records` and `cells` must be parallel. Out-of-domain records are
/// skipped.
pub fn dedup_sites(records: &[ObservationRecord], cells: &[GridCellAssignment]) -> Result<SiteTable, SiteError> {
    if records.len() != cells.len() {
        return Err(SiteError::LengthMismatch { records: records.len(), cells: cells.len() });
    }

    let mut groups: IndexMap<(&str, usize, usize), CellAccumulator> = IndexMap::new();
    for (rec, cell) in records.iter().zip(cells.iter()) {
        let Some((i, j)) = cell.cell() else {
            continue;
        };
        groups
            .entry((rec.site_id_poc.as_str(), i, j))
            .or_default()
            .add(rec, cell);
    }

    let cells: Vec<UniqueSiteCell> = groups
        .into_iter()
        .map(|((site, i, j), acc)| {
            let n = acc.n as f64;
            if acc.lon_range.0 != acc.lon_range.1 || acc.lat_range.0 != acc.lat_range.1 {
                log::debug!(
                    "Site {site} in cell ({i}, {j}) has varying coordinates (lon {:?}, lat {:?}); using the mean",
                    acc.lon_range,
                    acc.lat_range
                );
            }
            UniqueSiteCell {
                site_id_poc: site.to_string(),
                i,
                j,
                lon: acc.lon / n,
                lat: acc.lat / n,
                x: acc.x / n,
                y: acc.y / n,
                n_records: acc.n,
            }
        })
        .collect();

    log::info!("{} unique site/cell combinations from {} observation records", cells.len(), records.len());
    Ok(SiteTable::new(cells))
}

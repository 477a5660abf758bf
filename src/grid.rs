//! Locating observation sites on a model grid.
//!
//! Two addressing modes are supported:
//!
//! 1. [`ProjectedGrid`]: project (lon, lat) to planar meters with a map
//!    projection, subtract the grid origin, and floor-divide by the cell
//!    size. This is how IOAPI (CMAQ, CAMx) grids are addressed.
//! 2. [`LatLonGrid`]: look up (lon, lat) directly against the cell bounds of
//!    a geographic grid, masking anything outside those bounds.
//!
//! In both modes a point exactly on a cell boundary belongs to the cell
//! whose lower edge it sits on (floor semantics), and points outside the
//! grid are flagged out of domain rather than treated as errors.
use crate::projection::{Projection, ProjectionError};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum GridError {
    #[error("Grid cell size must be positive, got {0} x {1}")]
    NonPositiveCell(f64, f64),
    #[error("Grid must have at least one row and column, got {nrows} rows and {ncols} columns")]
    EmptyGrid { nrows: usize, ncols: usize },
    #[error("The {0} coordinate must have at least two values to infer cell bounds")]
    TooFewCoordinates(&'static str),
    #[error("The {0} coordinate is not strictly monotonic")]
    NonMonotonic(&'static str),
    #[error("Invalid projection: {0}")]
    Projection(#[from] ProjectionError),
}

/// The grid cell an observation falls in.
///
/// For projected grids `x` and `y` are meters from the grid origin (the
/// lower left corner); for lat/lon grids they are the (possibly wrapped)
/// longitude and latitude. `i` is the column and `j` the row index; both are
/// meaningful only when `in_domain` is `true`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridCellAssignment {
    pub x: f64,
    pub y: f64,
    pub i: i64,
    pub j: i64,
    pub in_domain: bool,
}

impl GridCellAssignment {
    fn masked(x: f64, y: f64) -> Self {
        Self { x, y, i: -1, j: -1, in_domain: false }
    }

    /// `(i, j)` as array indices, or `None` for out-of-domain points.
    pub fn cell(&self) -> Option<(usize, usize)> {
        if self.in_domain {
            Some((self.i as usize, self.j as usize))
        } else {
            None
        }
    }
}

/// A regular grid in a projected coordinate system.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedGrid {
    projection: Projection,
    xorig: f64,
    yorig: f64,
    xcell: f64,
    ycell: f64,
    ncols: usize,
    nrows: usize,
}

impl ProjectedGrid {
    /// `xorig`/`yorig` are the projected coordinates of the grid's lower
    /// left corner, `xcell`/`ycell` the cell size, all in meters.
    pub fn new(
        projection: Projection,
        xorig: f64,
        yorig: f64,
        xcell: f64,
        ycell: f64,
        ncols: usize,
        nrows: usize,
    ) -> Result<Self, GridError> {
        if !(xcell > 0.0 && ycell > 0.0) {
            return Err(GridError::NonPositiveCell(xcell, ycell));
        }
        if ncols == 0 || nrows == 0 {
            return Err(GridError::EmptyGrid { nrows, ncols });
        }
        Ok(Self { projection, xorig, yorig, xcell, ycell, ncols, nrows })
    }

    pub fn cell_size(&self) -> (f64, f64) {
        (self.xcell, self.ycell)
    }

    pub fn locate(&self, lon: f64, lat: f64) -> GridCellAssignment {
        let Some((px, py)) = self.projection.forward(lon, lat) else {
            return GridCellAssignment::masked(f64::NAN, f64::NAN);
        };
        let x = px - self.xorig;
        let y = py - self.yorig;
        let fi = (x / self.xcell).floor();
        let fj = (y / self.ycell).floor();
        if !fi.is_finite() || !fj.is_finite() {
            return GridCellAssignment::masked(x, y);
        }

        let i = fi as i64;
        let j = fj as i64;
        let in_domain = i >= 0 && j >= 0 && (i as usize) < self.ncols && (j as usize) < self.nrows;
        GridCellAssignment { x, y, i, j, in_domain }
    }
}

/// A geographic grid addressed directly by cell bounds.
///
/// Bounds are stored ascending; if the latitude coordinate of the source
/// data runs north to south, row indices are flipped to match it.
#[derive(Debug, Clone, PartialEq)]
pub struct LatLonGrid {
    lon_edges: Vec<f64>,
    lat_edges: Vec<f64>,
    lat_descending: bool,
    lon_descending: bool,
}

impl LatLonGrid {
    /// Build from 1-D cell-center coordinates, placing cell bounds halfway
    /// between adjacent centers.
    pub fn from_centers(lon: &[f64], lat: &[f64]) -> Result<Self, GridError> {
        let (lon_edges, lon_descending) = edges_from_centers(lon, "longitude")?;
        let (lat_edges, lat_descending) = edges_from_centers(lat, "latitude")?;
        Ok(Self { lon_edges, lat_edges, lat_descending, lon_descending })
    }

    /// Build a regular grid from its south-west corner and cell size in degrees.
    pub fn from_bounds(west: f64, south: f64, dlon: f64, dlat: f64, ncols: usize, nrows: usize) -> Result<Self, GridError> {
        if !(dlon > 0.0 && dlat > 0.0) {
            return Err(GridError::NonPositiveCell(dlon, dlat));
        }
        if ncols == 0 || nrows == 0 {
            return Err(GridError::EmptyGrid { nrows, ncols });
        }
        let lon_edges = (0..=ncols).map(|k| west + dlon * k as f64).collect();
        let lat_edges = (0..=nrows).map(|k| south + dlat * k as f64).collect();
        Ok(Self { lon_edges, lat_edges, lat_descending: false, lon_descending: false })
    }

    pub fn ncols(&self) -> usize {
        self.lon_edges.len() - 1
    }

    pub fn nrows(&self) -> usize {
        self.lat_edges.len() - 1
    }

    pub fn locate(&self, lon: f64, lat: f64) -> GridCellAssignment {
        let lon = self.wrap_lon(lon);
        let i = find_cell(&self.lon_edges, lon).map(|i| if self.lon_descending { self.ncols() - 1 - i } else { i });
        let j = find_cell(&self.lat_edges, lat).map(|j| if self.lat_descending { self.nrows() - 1 - j } else { j });
        match (i, j) {
            (Some(i), Some(j)) => GridCellAssignment { x: lon, y: lat, i: i as i64, j: j as i64, in_domain: true },
            _ => GridCellAssignment::masked(lon, lat),
        }
    }

    /// Shift a longitude by a full turn if that brings it inside the grid's span.
    fn wrap_lon(&self, lon: f64) -> f64 {
        let west = self.lon_edges[0];
        let east = self.lon_edges[self.lon_edges.len() - 1];
        if lon < west && lon + 360.0 < east {
            lon + 360.0
        } else if lon >= east && lon - 360.0 >= west {
            lon - 360.0
        } else {
            lon
        }
    }
}

fn edges_from_centers(centers: &[f64], axis: &'static str) -> Result<(Vec<f64>, bool), GridError> {
    if centers.len() < 2 {
        return Err(GridError::TooFewCoordinates(axis));
    }
    let descending = centers[1] < centers[0];
    let asc: Vec<f64> = if descending {
        centers.iter().rev().copied().collect()
    } else {
        centers.to_vec()
    };
    if asc.windows(2).any(|w| !(w[1] > w[0])) {
        return Err(GridError::NonMonotonic(axis));
    }

    let n = asc.len();
    let mut edges = Vec::with_capacity(n + 1);
    edges.push(asc[0] - (asc[1] - asc[0]) / 2.0);
    for w in asc.windows(2) {
        edges.push((w[0] + w[1]) / 2.0);
    }
    edges.push(asc[n - 1] + (asc[n - 1] - asc[n - 2]) / 2.0);
    Ok((edges, descending))
}

/// Index of the cell in ascending `edges` containing `v`, with each cell
/// closed on its lower edge. `None` if `v` is outside the edges or NaN.
fn find_cell(edges: &[f64], v: f64) -> Option<usize> {
    let first = edges[0];
    let last = edges[edges.len() - 1];
    if !(v >= first && v < last) {
        return None;
    }
    Some(edges.partition_point(|e| *e <= v) - 1)
}

/// How a model grid maps geographic coordinates to cell indices.
#[derive(Debug, Clone, PartialEq)]
pub enum GridAddressing {
    Projected(ProjectedGrid),
    LatLon(LatLonGrid),
}

impl GridAddressing {
    /// `(nrows, ncols)`
    pub fn shape(&self) -> (usize, usize) {
        match self {
            GridAddressing::Projected(g) => (g.nrows, g.ncols),
            GridAddressing::LatLon(g) => (g.nrows(), g.ncols()),
        }
    }

    pub fn locate(&self, lon: f64, lat: f64) -> GridCellAssignment {
        match self {
            GridAddressing::Projected(g) => g.locate(lon, lat),
            GridAddressing::LatLon(g) => g.locate(lon, lat),
        }
    }

    /// Locate every `(lon, lat)` pair, preserving input order.
    pub fn locate_all(&self, coords: &[(f64, f64)]) -> Vec<GridCellAssignment> {
        let cells: Vec<_> = coords.iter().map(|(lon, lat)| self.locate(*lon, *lat)).collect();
        let n_out = cells.iter().filter(|c| !c.in_domain).count();
        if n_out > 0 {
            log::info!("{n_out} of {} observation locations fall outside the model domain", cells.len());
        }
        cells
    }
}

impl From<ProjectedGrid> for GridAddressing {
    fn from(value: ProjectedGrid) -> Self {
        Self::Projected(value)
    }
}

impl From<LatLonGrid> for GridAddressing {
    fn from(value: LatLonGrid) -> Self {
        Self::LatLon(value)
    }
}

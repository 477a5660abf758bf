//! In-memory datasets on either side of the extraction step.
//!
//! [`ModelSource`] is the contract a gridded model file must satisfy:
//! expose its grid, its time axis, and a gather-by-cell slice of one
//! variable. [`GriddedDataset`] is an in-memory implementation of it, and
//! [`SiteDataset`] is the site-indexed result of gathering, which is what
//! gets aggregated and written out.
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use ndarray::{Array3, Array4, Axis};

use crate::grid::GridAddressing;

/// Width in bytes of the site identifier stored in outputs
pub const SITE_KEY_LEN: usize = 16;
/// Width of the `long_name` attribute on output variables
pub const LONG_NAME_LEN: usize = 16;
/// Width of the `var_desc` attribute on output variables
pub const VAR_DESC_LEN: usize = 80;

pub type DatasetResult<T> = error_stack::Result<T, DatasetError>;

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("Variable '{0}' is not present")]
    MissingVariable(String),
    #[error("Variable '{name}' has shape {got:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Cell (row {row}, col {col}) is outside a {nrows} x {ncols} grid")]
    CellOutOfBounds {
        row: usize,
        col: usize,
        nrows: usize,
        ncols: usize,
    },
    #[error("Datasets to stack have different {0}")]
    IncompatibleStack(&'static str),
    #[error("No datasets were given to stack")]
    NothingToStack,
    #[error("Error reading model data: {0}")]
    Read(String),
}

impl DatasetError {
    pub fn shape_mismatch<S: Into<String>>(name: S, expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            name: name.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    pub fn read<E: ToString>(err: E) -> Self {
        Self::Read(err.to_string())
    }
}

/// A site identifier as a fixed-width, NUL-padded byte string.
///
/// Identifiers longer than [`SITE_KEY_LEN`] bytes are truncated.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteKey([u8; SITE_KEY_LEN]);

impl SiteKey {
    pub fn encode(id: &str) -> Self {
        let mut bytes = [0u8; SITE_KEY_LEN];
        let src = id.as_bytes();
        if src.len() > SITE_KEY_LEN {
            log::warn!("Site id '{id}' is longer than {SITE_KEY_LEN} bytes and will be truncated");
        }
        let n = src.len().min(SITE_KEY_LEN);
        bytes[..n].copy_from_slice(&src[..n]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SITE_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SITE_KEY_LEN] {
        &self.0
    }

    /// The identifier with trailing NUL (and blank) padding removed.
    pub fn decode(&self) -> String {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(SITE_KEY_LEN);
        String::from_utf8_lossy(&self.0[..end]).trim_end().to_string()
    }
}

impl std::fmt::Debug for SiteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SiteKey({:?})", self.decode())
    }
}

impl std::fmt::Display for SiteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.decode())
    }
}

/// Left-justify `s` in a field exactly `width` characters wide.
pub fn pad_label(s: &str, width: usize) -> String {
    let s: String = s.chars().take(width).collect();
    format!("{s:<width$}")
}

/// Descriptive attributes carried by each variable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VariableMeta {
    pub units: String,
    /// Always [`LONG_NAME_LEN`] characters
    pub long_name: String,
    /// Always [`VAR_DESC_LEN`] characters
    pub var_desc: String,
}

impl VariableMeta {
    /// Metadata labelled with the variable's own name.
    pub fn named(name: &str, units: &str) -> Self {
        Self::new(units, name, name)
    }

    pub fn new(units: &str, long_name: &str, var_desc: &str) -> Self {
        Self {
            units: units.to_string(),
            long_name: pad_label(long_name, LONG_NAME_LEN),
            var_desc: pad_label(var_desc, VAR_DESC_LEN),
        }
    }
}

/// The model grid contract.
///
/// Implementations must be shareable across threads so that variables can be
/// extracted in parallel; file-backed sources should open their file inside
/// [`ModelSource::gather`] rather than hold a handle.
pub trait ModelSource: Sync {
    /// Human readable identification, used in log messages and errors.
    fn description(&self) -> String;

    fn grid(&self) -> &GridAddressing;

    fn times(&self) -> &[DateTime<Utc>];

    /// Name of the time dimension
    fn time_dim(&self) -> &str;

    /// Names of the (row, column) dimensions, e.g. `("ROW", "COL")` or `("lat", "lon")`
    fn spatial_dims(&self) -> (&str, &str);

    /// Data variables available, excluding coordinate and time-flag variables.
    fn variable_names(&self) -> Vec<String>;

    fn has_variable(&self, name: &str) -> bool {
        self.variable_names().iter().any(|v| v == name)
    }

    /// Read one variable at the given `(row, col)` cells, producing a
    /// `(time, layer, site)` array with sites in the order of `cells`.
    fn gather(&self, name: &str, cells: &[(usize, usize)]) -> DatasetResult<SiteVariable>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct GriddedVariable {
    /// Dimensions (time, layer, row, col)
    pub data: Array4<f32>,
    pub meta: VariableMeta,
}

/// A whole model field held in memory.
#[derive(Debug, Clone)]
pub struct GriddedDataset {
    grid: GridAddressing,
    times: Vec<DateTime<Utc>>,
    time_dim: String,
    spatial_dims: (String, String),
    variables: IndexMap<String, GriddedVariable>,
}

impl GriddedDataset {
    pub fn new(grid: GridAddressing, times: Vec<DateTime<Utc>>) -> Self {
        Self {
            grid,
            times,
            time_dim: "TSTEP".to_string(),
            spatial_dims: ("ROW".to_string(), "COL".to_string()),
            variables: IndexMap::new(),
        }
    }

    pub fn with_dim_names(mut self, time: &str, row: &str, col: &str) -> Self {
        self.time_dim = time.to_string();
        self.spatial_dims = (row.to_string(), col.to_string());
        self
    }

    /// Add a variable, which must cover this dataset's times and grid.
    pub fn add_variable(&mut self, name: &str, var: GriddedVariable) -> DatasetResult<()> {
        let (nrows, ncols) = self.grid.shape();
        let shape = var.data.shape();
        let expected = [self.times.len(), shape[1], nrows, ncols];
        if shape != expected {
            return Err(DatasetError::shape_mismatch(name, &expected, shape).into());
        }
        self.variables.insert(name.to_string(), var);
        Ok(())
    }

    pub fn variable(&self, name: &str) -> Option<&GriddedVariable> {
        self.variables.get(name)
    }
}

impl ModelSource for GriddedDataset {
    fn description(&self) -> String {
        format!("in-memory dataset with {} variables", self.variables.len())
    }

    fn grid(&self) -> &GridAddressing {
        &self.grid
    }

    fn times(&self) -> &[DateTime<Utc>] {
        &self.times
    }

    fn time_dim(&self) -> &str {
        &self.time_dim
    }

    fn spatial_dims(&self) -> (&str, &str) {
        (&self.spatial_dims.0, &self.spatial_dims.1)
    }

    fn variable_names(&self) -> Vec<String> {
        self.variables.keys().cloned().collect()
    }

    fn gather(&self, name: &str, cells: &[(usize, usize)]) -> DatasetResult<SiteVariable> {
        let var = self
            .variables
            .get(name)
            .ok_or_else(|| DatasetError::MissingVariable(name.to_string()))?;
        gather_cells(&var.data, cells).map(|data| SiteVariable::new(data, var.meta.clone()))
    }
}

/// Fancy-index a (time, layer, row, col) array at `(row, col)` pairs,
/// replacing the two spatial axes with one site axis.
pub fn gather_cells(data: &Array4<f32>, cells: &[(usize, usize)]) -> DatasetResult<Array3<f32>> {
    let (nt, nl, nrows, ncols) = data.dim();
    if let Some(&(row, col)) = cells.iter().find(|(r, c)| *r >= nrows || *c >= ncols) {
        return Err(DatasetError::CellOutOfBounds { row, col, nrows, ncols }.into());
    }
    Ok(Array3::from_shape_fn((nt, nl, cells.len()), |(t, l, s)| {
        let (row, col) = cells[s];
        data[[t, l, row, col]]
    }))
}

/// One variable sampled at sites.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteVariable {
    /// Dimensions (time, layer, site)
    pub data: Array3<f32>,
    /// `true` where a value is missing; `None` if nothing is
    pub mask: Option<Array3<bool>>,
    pub meta: VariableMeta,
}

impl SiteVariable {
    pub fn new(data: Array3<f32>, meta: VariableMeta) -> Self {
        Self { data, mask: None, meta }
    }

    /// Mask every non-finite value.
    pub fn mask_non_finite(&mut self) {
        let mask = self.data.mapv(|v| !v.is_finite());
        self.mask = if mask.iter().any(|m| *m) { Some(mask) } else { None };
    }

    pub fn is_missing(&self, t: usize, l: usize, s: usize) -> bool {
        self.mask.as_ref().map(|m| m[[t, l, s]]).unwrap_or(false)
    }
}

/// Model or observation values indexed by (time, layer, site).
#[derive(Debug, Clone, PartialEq)]
pub struct SiteDataset {
    times: Vec<DateTime<Utc>>,
    /// Spacing between time steps, `None` if unknown or irregular
    time_step: Option<Duration>,
    site_keys: Vec<SiteKey>,
    longitude: Vec<f32>,
    latitude: Vec<f32>,
    variables: IndexMap<String, SiteVariable>,
}

impl SiteDataset {
    pub fn new(times: Vec<DateTime<Utc>>, site_keys: Vec<SiteKey>, longitude: Vec<f32>, latitude: Vec<f32>) -> Self {
        let time_step = infer_time_step(&times);
        Self {
            times,
            time_step,
            site_keys,
            longitude,
            latitude,
            variables: IndexMap::new(),
        }
    }

    pub fn times(&self) -> &[DateTime<Utc>] {
        &self.times
    }

    pub fn time_step(&self) -> Option<Duration> {
        self.time_step
    }

    pub fn n_times(&self) -> usize {
        self.times.len()
    }

    pub fn n_sites(&self) -> usize {
        self.site_keys.len()
    }

    pub fn site_keys(&self) -> &[SiteKey] {
        &self.site_keys
    }

    pub fn longitude(&self) -> &[f32] {
        &self.longitude
    }

    pub fn latitude(&self) -> &[f32] {
        &self.latitude
    }

    pub fn variables(&self) -> &IndexMap<String, SiteVariable> {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&SiteVariable> {
        self.variables.get(name)
    }

    pub fn variable_mut(&mut self, name: &str) -> Option<&mut SiteVariable> {
        self.variables.get_mut(name)
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(|k| k.as_str())
    }

    /// Add or replace a variable. Its time and site axes must match this dataset's.
    pub fn insert_variable(&mut self, name: &str, var: SiteVariable) -> DatasetResult<()> {
        let shape = var.data.shape();
        if shape[0] != self.n_times() || shape[2] != self.n_sites() {
            let expected = [self.n_times(), shape[1], self.n_sites()];
            return Err(DatasetError::shape_mismatch(name, &expected, shape).into());
        }
        self.variables.insert(name.to_string(), var);
        Ok(())
    }

    /// A dataset with the same sites and times and no variables.
    pub fn empty_like(&self) -> Self {
        Self {
            times: self.times.clone(),
            time_step: self.time_step,
            site_keys: self.site_keys.clone(),
            longitude: self.longitude.clone(),
            latitude: self.latitude.clone(),
            variables: IndexMap::new(),
        }
    }

    /// Replace the time axis and every variable, keeping the site axis.
    pub(crate) fn with_new_times(
        &self,
        times: Vec<DateTime<Utc>>,
        time_step: Option<Duration>,
        variables: IndexMap<String, SiteVariable>,
    ) -> Self {
        Self {
            times,
            time_step,
            site_keys: self.site_keys.clone(),
            longitude: self.longitude.clone(),
            latitude: self.latitude.clone(),
            variables,
        }
    }

    /// Concatenate datasets along the time axis, in the order given.
    ///
    /// All parts must have the same sites and variables. No sorting or gap
    /// checking is done on the combined times.
    pub fn stack_time(parts: Vec<SiteDataset>) -> DatasetResult<SiteDataset> {
        let mut parts = parts.into_iter();
        let Some(mut first) = parts.next() else {
            return Err(DatasetError::NothingToStack.into());
        };

        for part in parts {
            if part.site_keys != first.site_keys {
                return Err(DatasetError::IncompatibleStack("sites").into());
            }
            if part.variables.len() != first.variables.len()
                || !part.variables.keys().all(|k| first.variables.contains_key(k))
            {
                return Err(DatasetError::IncompatibleStack("variables").into());
            }

            for (name, var) in first.variables.iter_mut() {
                let other = &part.variables[name];
                let combined = ndarray::concatenate(Axis(0), &[var.data.view(), other.data.view()])
                    .map_err(|_| DatasetError::IncompatibleStack("layer counts"))?;
                let mask = match (&var.mask, &other.mask) {
                    (None, None) => None,
                    (a, b) => {
                        let a = a.clone().unwrap_or_else(|| Array3::from_elem(var.data.dim(), false));
                        let b = b.clone().unwrap_or_else(|| Array3::from_elem(other.data.dim(), false));
                        Some(
                            ndarray::concatenate(Axis(0), &[a.view(), b.view()])
                                .map_err(|_| DatasetError::IncompatibleStack("layer counts"))?,
                        )
                    }
                };
                var.data = combined;
                var.mask = mask;
            }
            first.times.extend(part.times);
        }

        first.time_step = infer_time_step(&first.times);
        Ok(first)
    }
}

/// The common spacing of `times`, if there are at least two and all gaps are equal.
fn infer_time_step(times: &[DateTime<Utc>]) -> Option<Duration> {
    if times.len() < 2 {
        return None;
    }
    let step = times[1] - times[0];
    if times.windows(2).all(|w| w[1] - w[0] == step) {
        Some(step)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array;

    use super::*;
    use crate::test_utils::{hourly_times, small_latlon_grid};

    #[test]
    fn test_site_key() {
        let k = SiteKey::encode("060371103-1");
        assert_eq!(k.as_bytes()[11], 0);
        assert_eq!(k.decode(), "060371103-1");
        let long = SiteKey::encode("0123456789abcdefXYZ");
        assert_eq!(long.decode(), "0123456789abcdef");
        assert_eq!(format!("{k}"), "060371103-1");
    }

    #[test]
    fn test_labels_fixed_width() {
        let meta = VariableMeta::named("O3", "ppb");
        assert_eq!(meta.long_name.len(), LONG_NAME_LEN);
        assert_eq!(meta.var_desc.len(), VAR_DESC_LEN);
        assert!(meta.long_name.starts_with("O3 "));
        assert_eq!(pad_label("a_very_long_variable_name", 16), "a_very_long_vari");
    }

    #[test]
    fn test_gather_order() {
        let grid = small_latlon_grid();
        let times = hourly_times(2);
        let (nrows, ncols) = grid.shape();
        let data = Array::from_shape_fn((2, 1, nrows, ncols), |(t, _, r, c)| (100 * t + 10 * r + c) as f32);
        let mut ds = GriddedDataset::new(grid, times);
        ds.add_variable("O3", GriddedVariable { data, meta: VariableMeta::named("O3", "ppb") }).unwrap();

        let v = ds.gather("O3", &[(2, 3), (0, 1), (2, 3)]).unwrap();
        assert_eq!(v.data.dim(), (2, 1, 3));
        assert_eq!(v.data[[0, 0, 0]], 23.0);
        assert_eq!(v.data[[0, 0, 1]], 1.0);
        assert_eq!(v.data[[1, 0, 2]], 123.0);

        let err = ds.gather("O3", &[(nrows, 0)]).unwrap_err();
        assert!(matches!(err.current_context(), DatasetError::CellOutOfBounds { .. }));
        let err = ds.gather("NO2", &[(0, 0)]).unwrap_err();
        assert!(matches!(err.current_context(), DatasetError::MissingVariable(_)));
    }

    #[test]
    fn test_add_variable_shape_check() {
        let grid = small_latlon_grid();
        let mut ds = GriddedDataset::new(grid, hourly_times(3));
        let data = Array4::zeros((2, 1, 1, 1));
        let err = ds
            .add_variable("O3", GriddedVariable { data, meta: VariableMeta::default() })
            .unwrap_err();
        assert!(matches!(err.current_context(), DatasetError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_stack_time() {
        let keys = vec![SiteKey::encode("A"), SiteKey::encode("B")];
        let make = |start: usize, n: usize| {
            let times = hourly_times(start + n)[start..].to_vec();
            let mut ds = SiteDataset::new(times, keys.clone(), vec![0.0; 2], vec![0.0; 2]);
            let data = Array3::from_shape_fn((n, 1, 2), |(t, _, s)| ((start + t) * 10 + s) as f32);
            ds.insert_variable("O3", SiteVariable::new(data, VariableMeta::named("O3", "ppb")))
                .unwrap();
            ds
        };

        let stacked = SiteDataset::stack_time(vec![make(0, 3), make(3, 2)]).unwrap();
        assert_eq!(stacked.n_times(), 5);
        assert_eq!(stacked.time_step(), Some(Duration::hours(1)));
        let o3 = &stacked.variable("O3").unwrap().data;
        assert_eq!(o3[[4, 0, 1]], 41.0);
        assert_eq!(o3[[2, 0, 0]], 20.0);
    }

    #[test]
    fn test_stack_rejects_different_sites() {
        let a = SiteDataset::new(hourly_times(1), vec![SiteKey::encode("A")], vec![0.0], vec![0.0]);
        let b = SiteDataset::new(hourly_times(1), vec![SiteKey::encode("B")], vec![0.0], vec![0.0]);
        let err = SiteDataset::stack_time(vec![a, b]).unwrap_err();
        assert!(matches!(err.current_context(), DatasetError::IncompatibleStack("sites")));
    }

    #[test]
    fn test_mask_non_finite() {
        let data = Array3::from_shape_vec((1, 1, 3), vec![1.0, f32::NAN, f32::INFINITY]).unwrap();
        let mut v = SiteVariable::new(data, VariableMeta::default());
        v.mask_non_finite();
        assert!(!v.is_missing(0, 0, 0));
        assert!(v.is_missing(0, 0, 1));
        assert!(v.is_missing(0, 0, 2));
    }
}

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use error_stack::ResultExt;
use indexmap::IndexMap;
use ndarray::{ArrayD, Axis, Ix3, Ix4, IxDyn};
use netcdf::Extents;

use crate::dates::{from_yyyyddd_hhmmss, hhmmss_to_duration};
use crate::datasets::{gather_cells, DatasetError, DatasetResult, ModelSource, SiteVariable, VariableMeta};
use crate::grid::{GridAddressing, LatLonGrid, ProjectedGrid};
use crate::model_format::{ModelFileKind, ModelFormat};
use crate::projection::{Projection, ProjectionError, EARTH_RADIUS_M};

use super::{numeric_attr, string_attr, NcIoError, NcResult};

static CF_TIME_UNITS_REGEX: OnceLock<regex::Regex> = OnceLock::new();

const IOAPI_TIME_FLAG: &str = "TFLAG";
const LAT_NAMES: [&str; 2] = ["lat", "latitude"];
const LON_NAMES: [&str; 2] = ["lon", "longitude"];

/// A model output file on disk.
///
/// Only the grid, times and variable metadata are read when the file is
/// opened. Each call to [`ModelSource::gather`] reopens the file and reads
/// one variable, so a single `NcModelFile` can be shared between threads.
#[derive(Debug, Clone)]
pub struct NcModelFile {
    path: PathBuf,
    kind: ModelFileKind,
    grid: GridAddressing,
    times: Vec<DateTime<Utc>>,
    time_dim: String,
    spatial_dims: (String, String),
    variables: IndexMap<String, VariableMeta>,
}

impl NcModelFile {
    /// Open `path` and read its grid, times and variable list.
    ///
    /// `time_dim_names` are tried in order unless `format` names the time
    /// dimension itself.
    pub fn open(path: &Path, format: &ModelFormat, time_dim_names: &[String]) -> NcResult<Self> {
        let file = netcdf::open(path).change_context_lazy(|| NcIoError::Open(path.to_path_buf()))?;

        let kind = match format.kind {
            ModelFileKind::Auto if file.attribute("GDTYP").is_some() => ModelFileKind::Ioapi,
            ModelFileKind::Auto => ModelFileKind::LatLon,
            k => k,
        };

        let time_dim = find_time_dim(&file, format.time_dim.as_deref(), time_dim_names)
            .attach_printable_lazy(|| format!("in {}", path.display()))?;

        let (grid, times, spatial_dims) = match kind {
            ModelFileKind::Ioapi => {
                let grid = ioapi_grid(&file).attach_printable_lazy(|| format!("in {}", path.display()))?;
                let times = ioapi_times(&file, &time_dim).attach_printable_lazy(|| format!("in {}", path.display()))?;
                (grid, times, ("ROW".to_string(), "COL".to_string()))
            }
            ModelFileKind::LatLon | ModelFileKind::Auto => {
                let (grid, dims) = latlon_grid(&file).attach_printable_lazy(|| format!("in {}", path.display()))?;
                let times = cf_times(&file, &time_dim).attach_printable_lazy(|| format!("in {}", path.display()))?;
                (grid, times, dims)
            }
        };

        let variables = data_variables(&file, &time_dim, &spatial_dims);
        log::debug!(
            "Opened {} as {kind} model file: {} times, grid shape {:?}, {} data variables",
            path.display(),
            times.len(),
            grid.shape(),
            variables.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            kind,
            grid,
            times,
            time_dim,
            spatial_dims,
            variables,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ModelFileKind {
        self.kind
    }

    pub fn variable_meta(&self, name: &str) -> Option<&VariableMeta> {
        self.variables.get(name)
    }

    /// Read a variable as (time, layer, row, col), with fill values as NaN.
    fn read_variable(&self, name: &str) -> DatasetResult<ndarray::Array4<f32>> {
        let file = netcdf::open(&self.path)
            .change_context_lazy(|| DatasetError::read(format!("could not open {}", self.path.display())))?;
        let var = file
            .variable(name)
            .ok_or_else(|| DatasetError::MissingVariable(name.to_string()))?;

        let dim_names: Vec<String> = var.dimensions().iter().map(|d| d.name()).collect();
        let find = |dim: &str| dim_names.iter().position(|d| d == dim);
        let (Some(it), Some(ir), Some(ic)) = (find(&self.time_dim), find(&self.spatial_dims.0), find(&self.spatial_dims.1))
        else {
            return Err(DatasetError::read(format!("'{name}' does not have the time and grid dimensions")).into());
        };

        let mut data: ArrayD<f32> = var
            .get::<f32, _>(Extents::All)
            .change_context_lazy(|| DatasetError::read(format!("could not read '{name}'")))?;

        let fill = numeric_attr(var.attribute("_FillValue").map(|a| a.value()), "_FillValue")
            .or_else(|_| numeric_attr(var.attribute("missing_value").map(|a| a.value()), "missing_value"))
            .ok();
        if let Some(fill) = fill {
            let fill = fill as f32;
            data.mapv_inplace(|v| if v == fill { f32::NAN } else { v });
        }

        let data = match dim_names.len() {
            3 => data
                .permuted_axes(IxDyn(&[it, ir, ic]))
                .into_dimensionality::<Ix3>()
                .change_context_lazy(|| DatasetError::read(format!("'{name}' has unexpected dimensions")))?
                .insert_axis(Axis(1)),
            4 => {
                let il = (0..4)
                    .find(|i| ![it, ir, ic].contains(i))
                    .ok_or_else(|| DatasetError::read(format!("'{name}' has repeated dimensions")))?;
                data.permuted_axes(IxDyn(&[it, il, ir, ic]))
                    .into_dimensionality::<Ix4>()
                    .change_context_lazy(|| DatasetError::read(format!("'{name}' has unexpected dimensions")))?
            }
            n => return Err(DatasetError::read(format!("'{name}' has {n} dimensions, expected 3 or 4")).into()),
        };
        Ok(data)
    }
}

impl ModelSource for NcModelFile {
    fn description(&self) -> String {
        self.path.display().to_string()
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

    fn has_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    fn gather(&self, name: &str, cells: &[(usize, usize)]) -> DatasetResult<SiteVariable> {
        let meta = self
            .variables
            .get(name)
            .ok_or_else(|| DatasetError::MissingVariable(name.to_string()))?;
        let data = self.read_variable(name)?;
        let gathered = gather_cells(&data, cells).attach_printable_lazy(|| format!("in {}", self.path.display()))?;
        let mut var = SiteVariable::new(gathered, meta.clone());
        var.mask_non_finite();
        Ok(var)
    }
}

fn find_time_dim(file: &netcdf::File, requested: Option<&str>, known: &[String]) -> NcResult<String> {
    if let Some(name) = requested {
        return file
            .dimension(name)
            .map(|_| name.to_string())
            .ok_or_else(|| NcIoError::MissingDimension(name.to_string()).into());
    }

    if let Some(name) = known.iter().find(|n| file.dimension(n).is_some()) {
        return Ok(name.clone());
    }

    let leading = file
        .variables()
        .find(|v| v.dimensions().len() >= 3)
        .and_then(|v| v.dimensions().first().map(|d| d.name()))
        .ok_or_else(|| NcIoError::MissingDimension(known.join(" or ")))?;
    log::warn!(
        "None of the time dimension names {} are in the file, using '{leading}'",
        known.join(", ")
    );
    Ok(leading)
}

fn global_attr(file: &netcdf::File, name: &str) -> NcResult<f64> {
    numeric_attr(file.attribute(name).map(|a| a.value()), name)
}

fn global_usize(file: &netcdf::File, name: &str) -> NcResult<usize> {
    let v = global_attr(file, name)?;
    if v < 0.0 {
        return Err(NcIoError::BadAttribute(name.to_string())).attach_printable_lazy(|| format!("{name} = {v}"));
    }
    Ok(v as usize)
}

fn ioapi_grid(file: &netcdf::File) -> NcResult<GridAddressing> {
    let gdtyp = global_attr(file, "GDTYP")? as i32;
    let ncols = global_usize(file, "NCOLS")?;
    let nrows = global_usize(file, "NROWS")?;
    let xorig = global_attr(file, "XORIG")?;
    let yorig = global_attr(file, "YORIG")?;
    let xcell = global_attr(file, "XCELL")?;
    let ycell = global_attr(file, "YCELL")?;

    if gdtyp == 1 {
        let grid = LatLonGrid::from_bounds(xorig, yorig, xcell, ycell, ncols, nrows).change_context(NcIoError::Grid)?;
        return Ok(grid.into());
    }

    let p_alp = global_attr(file, "P_ALP")?;
    let p_bet = global_attr(file, "P_BET")?;
    let p_gam = global_attr(file, "P_GAM")?;
    let xcent = global_attr(file, "XCENT")?;
    let ycent = global_attr(file, "YCENT")?;

    let projection = match gdtyp {
        2 => Projection::lambert_conformal(p_alp, p_bet, ycent, xcent, EARTH_RADIUS_M),
        6 => Projection::polar_stereographic(p_alp, p_bet, p_gam, EARTH_RADIUS_M),
        7 => Projection::mercator(p_alp, p_gam, EARTH_RADIUS_M),
        other => return Err(NcIoError::UnsupportedGrid(other).into()),
    }
    .change_context(NcIoError::Grid)?;

    // XORIG/YORIG are relative to (XCENT, YCENT)
    let (cx, cy) = projection
        .forward(xcent, ycent)
        .ok_or_else(|| ProjectionError::OutOfRange { name: "YCENT", value: ycent })
        .change_context(NcIoError::Grid)?;
    let grid = ProjectedGrid::new(projection, xorig + cx, yorig + cy, xcell, ycell, ncols, nrows)
        .change_context(NcIoError::Grid)?;
    Ok(grid.into())
}

fn ioapi_times(file: &netcdf::File, time_dim: &str) -> NcResult<Vec<DateTime<Utc>>> {
    let ntimes = file
        .dimension(time_dim)
        .ok_or_else(|| NcIoError::MissingDimension(time_dim.to_string()))?
        .len();
    let sdate = global_attr(file, "SDATE")? as i32;
    let stime = global_attr(file, "STIME")? as i32;
    let tstep = global_attr(file, "TSTEP")? as i32;

    let start = from_yyyyddd_hhmmss(sdate, stime).change_context(NcIoError::Time)?;
    let step = hhmmss_to_duration(tstep).change_context(NcIoError::Time)?;
    if step.is_zero() && ntimes > 1 {
        return Err(NcIoError::Time).attach_printable("TSTEP is 0 but the file has more than one time");
    }
    Ok((0..ntimes).map(|i| start + step * i as i32).collect())
}

fn latlon_grid(file: &netcdf::File) -> NcResult<(GridAddressing, (String, String))> {
    let find_coord = |names: &[&str]| names.iter().find_map(|n| file.variable(n));
    let lat = find_coord(&LAT_NAMES).ok_or_else(|| NcIoError::MissingVariable(LAT_NAMES.join(" or ")))?;
    let lon = find_coord(&LON_NAMES).ok_or_else(|| NcIoError::MissingVariable(LON_NAMES.join(" or ")))?;

    let dim_of = |v: &netcdf::Variable| -> NcResult<String> {
        match v.dimensions() {
            [d] => Ok(d.name()),
            _ => Err(NcIoError::read(format!("coordinate '{}'", v.name())))
                .attach_printable("latitude and longitude must be 1-D"),
        }
    };
    let dims = (dim_of(&lat)?, dim_of(&lon)?);

    let lats = lat
        .get_values::<f64, _>(Extents::All)
        .change_context_lazy(|| NcIoError::read(lat.name()))?;
    let lons = lon
        .get_values::<f64, _>(Extents::All)
        .change_context_lazy(|| NcIoError::read(lon.name()))?;
    let grid = LatLonGrid::from_centers(&lons, &lats).change_context(NcIoError::Grid)?;
    Ok((grid.into(), dims))
}

fn cf_times(file: &netcdf::File, time_dim: &str) -> NcResult<Vec<DateTime<Utc>>> {
    let var = file
        .variable(time_dim)
        .or_else(|| file.variable("time"))
        .ok_or_else(|| NcIoError::MissingVariable(time_dim.to_string()))?;
    let units = string_attr(var.attribute("units").map(|a| a.value()))
        .ok_or_else(|| NcIoError::MissingAttribute(format!("{}:units", var.name())))?;
    let (seconds_per_unit, reference) = parse_cf_time_units(&units)
        .ok_or(NcIoError::Time)
        .attach_printable_lazy(|| format!("could not interpret time units '{units}'"))?;

    let values = var
        .get_values::<f64, _>(Extents::All)
        .change_context_lazy(|| NcIoError::read(var.name()))?;
    Ok(values
        .into_iter()
        .map(|v| reference + Duration::milliseconds((v * seconds_per_unit * 1000.0).round() as i64))
        .collect())
}

/// Split CF time units such as "hours since 2016-07-01 00:00:00" into
/// seconds per unit and the reference time.
pub(crate) fn parse_cf_time_units(units: &str) -> Option<(f64, DateTime<Utc>)> {
    let re = CF_TIME_UNITS_REGEX.get_or_init(|| {
        regex::Regex::new(r"^\s*(?<unit>\w+)\s+since\s+(?<reference>.+?)\s*$")
            .expect("Could not compile CF time units regex")
    });
    let caps = re.captures(units)?;
    let seconds_per_unit = match caps["unit"].to_ascii_lowercase().as_str() {
        "seconds" | "second" | "secs" | "sec" | "s" => 1.0,
        "minutes" | "minute" | "mins" | "min" => 60.0,
        "hours" | "hour" | "hrs" | "hr" | "h" => 3600.0,
        "days" | "day" | "d" => 86400.0,
        _ => return None,
    };

    let reference = caps["reference"]
        .trim_end_matches("UTC")
        .trim_end_matches('Z')
        .trim();
    let reference = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(reference, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(reference, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(chrono::NaiveTime::MIN))
        })?;
    Some((seconds_per_unit, reference.and_utc()))
}

/// Variables on the time and both spatial dimensions, with at most one more (vertical) dimension.
fn data_variables(file: &netcdf::File, time_dim: &str, spatial_dims: &(String, String)) -> IndexMap<String, VariableMeta> {
    file.variables()
        .filter(|v| v.name() != IOAPI_TIME_FLAG)
        .filter(|v| {
            let dims: Vec<String> = v.dimensions().iter().map(|d| d.name()).collect();
            (dims.len() == 3 || dims.len() == 4)
                && dims.iter().any(|d| d == time_dim)
                && dims.contains(&spatial_dims.0)
                && dims.contains(&spatial_dims.1)
        })
        .map(|v| {
            let name = v.name();
            let units = string_attr(v.attribute("units").map(|a| a.value())).unwrap_or_default();
            let long_name = string_attr(v.attribute("long_name").map(|a| a.value())).unwrap_or_else(|| name.clone());
            let var_desc = string_attr(v.attribute("var_desc").map(|a| a.value())).unwrap_or_default();
            (name, VariableMeta::new(&units, &long_name, &var_desc))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;

    use super::*;

    fn temp_nc(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("aqmoco-{}-{name}.nc", std::process::id()))
    }

    fn write_ioapi_latlon(path: &Path) {
        let mut file = netcdf::create(path).unwrap();
        file.add_dimension("TSTEP", 3).unwrap();
        file.add_dimension("LAY", 1).unwrap();
        file.add_dimension("ROW", 4).unwrap();
        file.add_dimension("COL", 5).unwrap();
        for (name, value) in [("GDTYP", 1), ("NCOLS", 5), ("NROWS", 4), ("SDATE", 2016183), ("STIME", 0), ("TSTEP", 10000)] {
            file.add_attribute(name, value).unwrap();
        }
        for (name, value) in [("XORIG", -100.0), ("YORIG", 30.0), ("XCELL", 0.5), ("YCELL", 0.5)] {
            file.add_attribute(name, value).unwrap();
        }

        let mut tflag = file.add_variable::<i32>("TFLAG", &["TSTEP", "LAY"]).unwrap();
        tflag.put_values(&[0, 0, 0], Extents::All).unwrap();

        let data: Vec<f32> = (0..60).map(|v| v as f32).collect();
        let mut o3 = file.add_variable::<f32>("O3", &["TSTEP", "LAY", "ROW", "COL"]).unwrap();
        o3.put_attribute("units", "ppbV").unwrap();
        o3.put_attribute("long_name", "O3              ").unwrap();
        o3.put_attribute("var_desc", "ozone").unwrap();
        o3.put_values(&data, Extents::All).unwrap();
    }

    #[test]
    fn test_open_ioapi() {
        let path = temp_nc("ioapi");
        write_ioapi_latlon(&path);
        let f = NcModelFile::open(&path, &ModelFormat::default(), &["TSTEP".to_string()]).unwrap();
        assert_eq!(f.kind(), ModelFileKind::Ioapi);
        assert_eq!(f.variable_names(), vec!["O3"]);
        assert_eq!(f.grid().shape(), (4, 5));
        assert_eq!(f.times()[0], Utc.with_ymd_and_hms(2016, 7, 1, 0, 0, 0).unwrap());
        assert_eq!(f.times()[2], Utc.with_ymd_and_hms(2016, 7, 1, 2, 0, 0).unwrap());
        assert_eq!(f.variable_meta("O3").unwrap().units, "ppbV");

        // Row 1, column 2 of time 2: 2 * 20 + 1 * 5 + 2
        let v = f.gather("O3", &[(1, 2), (0, 0)]).unwrap();
        assert_eq!(v.data.dim(), (3, 1, 2));
        assert_abs_diff_eq!(v.data[[2, 0, 0]], 47.0);
        assert_abs_diff_eq!(v.data[[0, 0, 1]], 0.0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_open_cf_latlon() {
        let path = temp_nc("cf");
        {
            let mut file = netcdf::create(&path).unwrap();
            file.add_dimension("time", 2).unwrap();
            file.add_dimension("lat", 2).unwrap();
            file.add_dimension("lon", 3).unwrap();
            let mut time = file.add_variable::<f64>("time", &["time"]).unwrap();
            time.put_attribute("units", "hours since 2016-07-01 00:00:00").unwrap();
            time.put_values(&[0.0, 6.0], Extents::All).unwrap();
            let mut lat = file.add_variable::<f64>("lat", &["lat"]).unwrap();
            lat.put_values(&[30.0, 31.0], Extents::All).unwrap();
            let mut lon = file.add_variable::<f64>("lon", &["lon"]).unwrap();
            lon.put_values(&[-100.0, -99.0, -98.0], Extents::All).unwrap();
            let mut pm = file.add_variable::<f32>("PM25", &["time", "lat", "lon"]).unwrap();
            pm.set_fill_value(-999.0f32).unwrap();
            pm.put_values(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, -999.0, 12.0], Extents::All)
                .unwrap();
        }

        let names = vec!["TSTEP".to_string(), "time".to_string()];
        let f = NcModelFile::open(&path, &ModelFormat::default(), &names).unwrap();
        assert_eq!(f.kind(), ModelFileKind::LatLon);
        assert_eq!(f.time_dim(), "time");
        assert_eq!(f.spatial_dims(), ("lat", "lon"));
        assert_eq!(f.times()[1], Utc.with_ymd_and_hms(2016, 7, 1, 6, 0, 0).unwrap());

        let cell = f.grid().locate(-98.9, 31.2);
        assert_eq!(cell.cell(), Some((1, 1)));
        let v = f.gather("PM25", &[(1, 1)]).unwrap();
        assert_eq!(v.data.dim(), (2, 1, 1));
        assert_abs_diff_eq!(v.data[[0, 0, 0]], 5.0);
        assert!(v.is_missing(1, 0, 0));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_cf_time_units() {
        let (s, t) = parse_cf_time_units("days since 2016-07-01").unwrap();
        assert_eq!(s, 86400.0);
        assert_eq!(t, Utc.with_ymd_and_hms(2016, 7, 1, 0, 0, 0).unwrap());
        let (s, t) = parse_cf_time_units("seconds since 1970-01-01T00:00:00Z").unwrap();
        assert_eq!(s, 1.0);
        assert_eq!(t.timestamp(), 0);
        assert!(parse_cf_time_units("fortnights since 2016-07-01").is_none());
        assert!(parse_cf_time_units("hours").is_none());
    }
}

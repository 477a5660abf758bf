//! Forward map projections for regional air quality model grids, built on
//! `proj4rs`. Only the geographic → planar direction is needed to place
//! observation sites on a grid.
use std::fmt::Debug;
use std::sync::Arc;

use proj4rs::Proj;

/// Earth radius assumed by CMAQ/IOAPI grids, in meters.
pub const EARTH_RADIUS_M: f64 = 6_370_000.0;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProjectionError {
    #[error("Standard parallels {0} and {1} do not define a valid Lambert conformal cone")]
    BadCone(f64, f64),
    #[error("Projection parameter {name} = {value} is out of range")]
    OutOfRange { name: &'static str, value: f64 },
    #[error("Could not build projection from '{definition}': {reason}")]
    Definition { definition: String, reason: String },
}

/// A spherical map projection that converts (lon, lat) in degrees to (x, y) in meters.
///
/// Geographic input is taken on the same sphere as the projection, so no
/// datum shift is applied between the two.
#[derive(Clone)]
pub struct Projection {
    definition: String,
    geographic: Arc<Proj>,
    planar: Arc<Proj>,
}

impl Projection {
    /// Lambert conformal conic with standard parallels `lat1` and `lat2`,
    /// centered on (`lon0`, `lat0`), which maps to (0, 0). Angles in degrees.
    pub fn lambert_conformal(lat1: f64, lat2: f64, lat0: f64, lon0: f64, radius: f64) -> Result<Self, ProjectionError> {
        if !(lat1.is_finite() && lat2.is_finite()) || (lat1 + lat2).abs() < 1e-10 {
            return Err(ProjectionError::BadCone(lat1, lat2));
        }
        check_latitude("lat0", lat0, false)?;
        let params = format!("+proj=lcc +lat_1={lat1} +lat_2={lat2} +lat_0={lat0} +lon_0={lon0}");
        Self::from_parameters(&params, radius)
    }

    /// Normal-aspect Mercator with true scale at `lat_ts`.
    pub fn mercator(lat_ts: f64, lon0: f64, radius: f64) -> Result<Self, ProjectionError> {
        check_latitude("lat_ts", lat_ts, false)?;
        Self::from_parameters(&format!("+proj=merc +lat_ts={lat_ts} +lon_0={lon0}"), radius)
    }

    /// Polar stereographic about the north (`pole > 0`) or south (`pole < 0`) pole.
    pub fn polar_stereographic(pole: f64, lat_ts: f64, lon0: f64, radius: f64) -> Result<Self, ProjectionError> {
        if pole == 0.0 || !pole.is_finite() {
            return Err(ProjectionError::OutOfRange { name: "pole", value: pole });
        }
        check_latitude("lat_ts", lat_ts, true)?;
        let lat0 = 90.0 * pole.signum();
        Self::from_parameters(&format!("+proj=stere +lat_0={lat0} +lat_ts={lat_ts} +lon_0={lon0}"), radius)
    }

    fn from_parameters(params: &str, radius: f64) -> Result<Self, ProjectionError> {
        if !(radius > 0.0) {
            return Err(ProjectionError::OutOfRange { name: "radius", value: radius });
        }
        let sphere = format!("+a={radius} +b={radius}");
        let definition = format!("{params} {sphere} +x_0=0 +y_0=0 +units=m");
        let planar = build_proj(&definition)?;
        let geographic = build_proj(&format!("+proj=longlat {sphere}"))?;
        Ok(Self { definition, geographic: Arc::new(geographic), planar: Arc::new(planar) })
    }

    /// The PROJ string this projection was built from.
    pub fn definition(&self) -> &str {
        &self.definition
    }

    /// Project a (lon, lat) point. `None` if the point cannot be projected,
    /// e.g. the opposite pole of a polar stereographic grid.
    pub fn forward(&self, lon: f64, lat: f64) -> Option<(f64, f64)> {
        if !lon.is_finite() || !lat.is_finite() {
            return None;
        }
        let mut coord = (lon.to_radians(), lat.to_radians(), 0f64);
        proj4rs::transform::transform(&self.geographic, &self.planar, &mut coord).ok()?;
        if coord.0.is_finite() && coord.1.is_finite() {
            Some((coord.0, coord.1))
        } else {
            None
        }
    }
}

impl Debug for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Projection").field(&self.definition).finish()
    }
}

impl PartialEq for Projection {
    fn eq(&self, other: &Self) -> bool {
        self.definition == other.definition
    }
}

fn build_proj(definition: &str) -> Result<Proj, ProjectionError> {
    Proj::from_proj_string(definition).map_err(|e| ProjectionError::Definition {
        definition: definition.to_string(),
        reason: e.to_string(),
    })
}

fn check_latitude(name: &'static str, value: f64, allow_pole: bool) -> Result<(), ProjectionError> {
    let ok = if allow_pole { value.abs() <= 90.0 } else { value.abs() < 90.0 };
    if ok {
        Ok(())
    } else {
        Err(ProjectionError::OutOfRange { name, value })
    }
}

use std::path::Path;

use error_stack::ResultExt;
use ndarray::Zip;
use netcdf::Extents;

use crate::datasets::{SiteDataset, SiteVariable, SITE_KEY_LEN};

use super::{NcChar, NcIoError, NcResult};

pub const TIME_DIM: &str = "TSTEP";
pub const LAYER_DIM: &str = "LAY";
pub const SITE_DIM: &str = "site_id";
pub const KEY_LEN_DIM: &str = "str16";
/// Written in place of masked values
pub const FILL_VALUE: f32 = -9.999e36;

/// Write a site dataset to a new netCDF file at `path`, replacing any existing file.
pub fn write_site_dataset(path: &Path, ds: &SiteDataset) -> NcResult<()> {
    let nlay = ds.variables().values().map(|v| v.data.dim().1).max().unwrap_or(1);
    if let Some((name, _)) = ds.variables().iter().find(|(_, v)| v.data.dim().1 != nlay) {
        return Err(NcIoError::write(format!("variable '{name}'")))
            .attach_printable(format!("all variables must have {nlay} layers"));
    }

    let mut file = netcdf::create(path).change_context_lazy(|| NcIoError::Create(path.to_path_buf()))?;
    for (dim, len) in [
        (TIME_DIM, ds.n_times()),
        (LAYER_DIM, nlay),
        (SITE_DIM, ds.n_sites()),
        (KEY_LEN_DIM, SITE_KEY_LEN),
    ] {
        file.add_dimension(dim, len)
            .change_context_lazy(|| NcIoError::write(format!("dimension '{dim}'")))?;
    }
    file.add_attribute("history", format!("created by aqmoco {}", env!("CARGO_PKG_VERSION")))
        .change_context_lazy(|| NcIoError::write("global attributes"))?;

    write_times(&mut file, ds)?;
    write_sites(&mut file, ds)?;
    for (name, var) in ds.variables() {
        write_variable(&mut file, name, var)?;
    }
    log::debug!("Wrote {} variables to {}", ds.variables().len(), path.display());
    Ok(())
}

fn write_times(file: &mut netcdf::FileMut, ds: &SiteDataset) -> NcResult<()> {
    let timestamps: Vec<i64> = ds.times().iter().map(|t| t.timestamp()).collect();
    let mut var = file
        .add_variable::<i64>("time", &[TIME_DIM])
        .change_context_lazy(|| NcIoError::write("time"))?;
    var.put_values(&timestamps, Extents::All)
        .change_context_lazy(|| NcIoError::write("time"))?;
    for (attr, value) in [("units", "seconds since 1970-01-01 00:00:00"), ("calendar", "gregorian")] {
        var.put_attribute(attr, value)
            .change_context_lazy(|| NcIoError::write("time attributes"))?;
    }
    Ok(())
}

fn write_sites(file: &mut netcdf::FileMut, ds: &SiteDataset) -> NcResult<()> {
    let chars: Vec<NcChar> = ds
        .site_keys()
        .iter()
        .flat_map(|k| k.as_bytes().iter().map(|b| NcChar(*b)))
        .collect();
    let mut var = file
        .add_variable::<NcChar>("site_key", &[SITE_DIM, KEY_LEN_DIM])
        .change_context_lazy(|| NcIoError::write("site_key"))?;
    var.put_values(&chars, Extents::All)
        .change_context_lazy(|| NcIoError::write("site_key"))?;
    var.put_attribute("long_name", "site_id-POC")
        .change_context_lazy(|| NcIoError::write("site_key attributes"))?;

    for (name, values, units) in [
        ("longitude", ds.longitude(), "degrees_east"),
        ("latitude", ds.latitude(), "degrees_north"),
    ] {
        let mut var = file
            .add_variable::<f32>(name, &[SITE_DIM])
            .change_context_lazy(|| NcIoError::write(name))?;
        var.put_values(values, Extents::All)
            .change_context_lazy(|| NcIoError::write(name))?;
        var.put_attribute("units", units)
            .change_context_lazy(|| NcIoError::write(format!("{name} attributes")))?;
    }
    Ok(())
}

fn write_variable(file: &mut netcdf::FileMut, name: &str, var: &SiteVariable) -> NcResult<()> {
    let mut values = var.data.clone();
    match &var.mask {
        Some(mask) => Zip::from(&mut values).and(mask).for_each(|v, m| {
            if *m || !v.is_finite() {
                *v = FILL_VALUE;
            }
        }),
        None => values.mapv_inplace(|v| if v.is_finite() { v } else { FILL_VALUE }),
    }

    let mut nc_var = file
        .add_variable::<f32>(name, &[TIME_DIM, LAYER_DIM, SITE_DIM])
        .change_context_lazy(|| NcIoError::write(name))?;
    nc_var
        .set_fill_value(FILL_VALUE)
        .change_context_lazy(|| NcIoError::write(format!("{name} fill value")))?;
    for (attr, value) in [
        ("units", &var.meta.units),
        ("long_name", &var.meta.long_name),
        ("var_desc", &var.meta.var_desc),
    ] {
        nc_var
            .put_attribute(attr, value.as_str())
            .change_context_lazy(|| NcIoError::write(format!("{name} attributes")))?;
    }

    let values = values.as_standard_layout();
    let slice = values
        .as_slice()
        .ok_or_else(|| NcIoError::write(name))
        .attach_printable("could not convert values to a contiguous slice")?;
    nc_var
        .put_values(slice, Extents::All)
        .change_context_lazy(|| NcIoError::write(name))?;
    Ok(())
}

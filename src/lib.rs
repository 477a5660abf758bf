pub mod error;
pub mod logging;
pub mod dates;
pub mod observations;
pub mod readers;
pub mod projection;
pub mod grid;
pub mod sites;
pub mod datasets;
pub mod expr;
pub mod extraction;
pub mod aggregation;
pub mod reconcile;
pub mod assembly;
pub mod config;
pub mod model_format;
pub mod pipeline;
#[cfg(feature = "netcdf")]
pub mod nc_io;

#[cfg(test)]
pub(crate) mod test_utils;

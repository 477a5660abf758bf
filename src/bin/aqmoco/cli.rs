//! Command line interface definitions
use std::path::PathBuf;

use aqmoco::aggregation::{DayBoundary, HourFunc};
use aqmoco::config::ConfigOverrides;
use aqmoco::model_format::ModelFormat;
use aqmoco::readers::ObsFormat;
use aqmoco::reconcile::OutputFreq;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

use crate::error::CliError;

/// Pair air quality model output with surface observations.
///
/// Model values are extracted at every observation site inside the model
/// domain, optionally transformed with an expression and reduced to daily
/// values. The observations are laid out on the same sites and times and
/// both are written as netCDF files.
#[derive(Debug, Parser)]
#[command(version)]
pub(crate) struct Cli {
    /// Site metadata CSV (only read for AMET observations)
    pub(crate) sitecsv: PathBuf,

    /// Observation CSV
    pub(crate) obscsv: PathBuf,

    /// One or more model files (glob patterns allowed, expanded in sorted
    /// order), followed by the observation output path and the model
    /// output path.
    #[arg(num_args = 3.., required = true, value_name = "MODEL... OBSOUT MODOUT")]
    pub(crate) files: Vec<String>,

    /// How to reduce hourly model values to daily ones: max, mean, mda8 or epamda8
    #[arg(long)]
    pub(crate) hour_func: Option<HourFunc>,

    /// Output frequency: hourly (H) or daily (d)
    #[arg(long)]
    pub(crate) freq: Option<OutputFreq>,

    /// Only extract these model variables (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub(crate) variables: Option<Vec<String>>,

    /// Model file format: ioapi, latlon or auto, or key=value options
    /// such as "format=ioapi,time_dim=TSTEP"
    #[arg(long, default_value = "auto")]
    pub(crate) mod_format: ModelFormat,

    /// Observation file format: AMET, AQS-daily or AQS-hourly
    #[arg(long, default_value = "AMET")]
    pub(crate) obs_format: ObsFormat,

    /// Expression applied to the extracted model variables, either a file
    /// or the expression itself. May be repeated; the pieces are joined
    /// with newlines.
    #[arg(long)]
    pub(crate) modexpr: Vec<String>,

    /// Expression applied to the reconciled observations, in the same
    /// form as --modexpr.
    #[arg(long)]
    pub(crate) obsexpr: Vec<String>,

    /// Which clock defines a calendar day when model times cannot be split
    /// evenly into days: "gmt" or an offset in hours east of GMT
    #[arg(long, allow_hyphen_values = true)]
    pub(crate) day_boundary: Option<DayBoundary>,

    /// Extract model variables in parallel
    #[arg(long)]
    pub(crate) parallel: bool,

    /// TOML configuration file; command line options take precedence over it
    #[arg(long)]
    pub(crate) config: Option<PathBuf>,

    /// Print the merged configuration as TOML and exit
    #[arg(long)]
    pub(crate) print_config: bool,

    /// Also write DEBUG-level log messages to this file
    #[arg(long)]
    pub(crate) log_file: Option<PathBuf>,

    #[command(flatten)]
    pub(crate) verbosity: Verbosity<InfoLevel>,
}

impl Cli {
    pub(crate) fn config_overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            hour_func: self.hour_func,
            freq: self.freq,
            variables: self.variables.clone(),
            day_boundary: self.day_boundary,
            parallel_variables: self.parallel.then_some(true),
        }
    }

    /// Split the trailing positional arguments into the expanded model
    /// files and the two output paths.
    pub(crate) fn model_and_output_paths(&self) -> Result<(Vec<PathBuf>, PathBuf, PathBuf), CliError> {
        let n = self.files.len();
        if n < 3 {
            return Err(CliError::usage("need at least one model file plus the two output paths"));
        }
        let obsout = PathBuf::from(&self.files[n - 2]);
        let modout = PathBuf::from(&self.files[n - 1]);

        let mut models = vec![];
        for pattern in &self.files[..n - 2] {
            let mut matches = glob::glob(pattern)
                .map_err(|e| CliError::usage(format!("bad model file pattern '{pattern}': {e}")))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| CliError::usage(format!("error expanding '{pattern}': {e}")))?;
            if matches.is_empty() {
                return Err(CliError::usage(format!("no model files match '{pattern}'")));
            }
            matches.sort();
            models.extend(matches);
        }
        Ok((models, obsout, modout))
    }
}

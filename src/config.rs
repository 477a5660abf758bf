//! Run configuration.
//!
//! Settings are layered, later sources overriding earlier ones:
//!
//! 1. built-in defaults,
//! 2. an optional TOML file,
//! 3. environment variables prefixed with `AQMOCO_` (e.g. `AQMOCO_FREQ=H`),
//! 4. command line options.
//!
//! An example TOML file:
//!
//! ```toml
//! hour_func = "epamda8"
//! freq = "daily"
//! variables = ["O3"]
//! # Group days by US Eastern standard time instead of GMT
//! day_boundary = -5
//! parallel_variables = true
//! ```
use std::path::{Path, PathBuf};

use error_stack::ResultExt;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::aggregation::{DayBoundary, HourFunc};
use crate::reconcile::OutputFreq;

pub const ENV_PREFIX: &str = "AQMOCO_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file {} does not exist", .0.display())]
    MissingFile(PathBuf),
    #[error("Invalid configuration")]
    Invalid,
    #[error("Could not write the configuration as TOML")]
    Serialize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How hourly values are reduced to daily ones
    pub hour_func: HourFunc,
    /// Output time resolution
    pub freq: OutputFreq,
    /// If given, only these model variables are extracted
    pub variables: Option<Vec<String>>,
    /// Which clock defines a calendar day when grouping irregular samples
    pub day_boundary: DayBoundary,
    /// Extract model variables on multiple threads
    pub parallel_variables: bool,
    /// Recognized names of the time dimension in model files, in order of preference
    pub time_dim_names: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            hour_func: HourFunc::default(),
            freq: OutputFreq::default(),
            variables: None,
            day_boundary: DayBoundary::default(),
            parallel_variables: false,
            time_dim_names: ["TSTEP", "time", "Time", "t"].into_iter().map(String::from).collect(),
        }
    }
}

/// Settings given explicitly (e.g. on the command line); unset fields leave
/// lower layers in effect.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hour_func: Option<HourFunc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq: Option<OutputFreq>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_boundary: Option<DayBoundary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_variables: Option<bool>,
}

impl PipelineConfig {
    pub fn load(file: Option<&Path>, overrides: &ConfigOverrides) -> error_stack::Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));
        if let Some(path) = file {
            if !path.exists() {
                return Err(ConfigError::MissingFile(path.to_path_buf()).into());
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .merge(Serialized::defaults(overrides));

        let config: PipelineConfig = figment
            .extract()
            .change_context(ConfigError::Invalid)
            .attach_printable_lazy(|| match file {
                Some(p) => format!("while merging defaults, {}, environment and command line", p.display()),
                None => "while merging defaults, environment and command line".to_string(),
            })?;
        log::debug!("Loaded configuration: {config:?}");
        Ok(config)
    }

    pub fn to_toml_string(&self) -> error_stack::Result<String, ConfigError> {
        toml::to_string_pretty(self).change_context(ConfigError::Serialize)
    }
}

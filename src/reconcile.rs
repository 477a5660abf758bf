//! Placing sparse observations onto a dense site × time grid.
//!
//! The reconciled frame has one row for every observation site (including
//! sites that fell outside the model domain) at every timestamp of the
//! output window, so a site with no observations in the window still gets a
//! full run of missing rows. Only in-domain records supply values, so a
//! site outside the model domain is missing throughout.
use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use error_stack::ResultExt;
use indexmap::IndexMap;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::dates::floor_to_midnight;
use crate::expr::{ExprError, ExprProgram, Namespace, Value};
use crate::observations::ObservationSet;

pub type ReconcileResult<T> = error_stack::Result<T, ReconcileError>;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Output window ends ({end}) before it starts ({start})")]
    InvertedWindow { start: DateTime<Utc>, end: DateTime<Utc> },
    #[error("Could not evaluate the observation expression")]
    Expression,
    #[error("Got {flags} value flags for {records} observation records")]
    FlagLengthMismatch { flags: usize, records: usize },
}

/// Output time resolution.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::EnumString, strum::Display,
)]
#[strum(ascii_case_insensitive)]
pub enum OutputFreq {
    #[strum(to_string = "hourly", serialize = "H")]
    #[serde(rename = "hourly", alias = "H", alias = "h")]
    Hourly,
    #[default]
    #[strum(to_string = "daily", serialize = "d")]
    #[serde(rename = "daily", alias = "d", alias = "D")]
    Daily,
}

impl OutputFreq {
    pub fn step(&self) -> Duration {
        match self {
            OutputFreq::Hourly => Duration::hours(1),
            OutputFreq::Daily => Duration::days(1),
        }
    }

    /// Every timestamp from `start` to `end` inclusive at this frequency.
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let step = self.step();
        let mut times = vec![];
        let mut t = start;
        while t <= end {
            times.push(t);
            t += step;
        }
        times
    }
}

/// Observation values on a complete (site, time) index.
///
/// Rows are ordered by site, then time, so the rows for site `s` are
/// `s * n_times .. (s + 1) * n_times`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledObservationFrame {
    sites: Vec<String>,
    times: Vec<DateTime<Utc>>,
    columns: IndexMap<String, Vec<f64>>,
}

impl ReconciledObservationFrame {
    pub fn sites(&self) -> &[String] {
        &self.sites
    }

    pub fn times(&self) -> &[DateTime<Utc>] {
        &self.times
    }

    pub fn n_rows(&self) -> usize {
        self.sites.len() * self.times.len()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|k| k.as_str())
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(|c| c.as_slice())
    }

    /// The time series of column `name` at `site`.
    pub fn site_series(&self, site: &str, name: &str) -> Option<&[f64]> {
        let s = self.sites.iter().position(|x| x == site)?;
        let nt = self.times.len();
        self.column(name).map(|c| &c[s * nt..(s + 1) * nt])
    }

    /// Evaluate `expr` with every column as a variable and store the
    /// variables it assigns as columns.
    pub fn apply_expression(&mut self, expr: &ExprProgram) -> Result<(), ExprError> {
        if expr.is_empty() {
            return Ok(());
        }

        let mut ns: Namespace = self
            .columns
            .iter()
            .map(|(k, v)| (k.clone(), Value::Array(Array1::from_vec(v.clone()).into_dyn())))
            .collect();
        expr.eval(&mut ns)?;

        let nrows = self.n_rows();
        for name in expr.assigned_names() {
            // Assigned names are always in the namespace after a successful eval
            if let Some(value) = ns.swap_remove(&name) {
                let values = value.into_array(&[nrows])?;
                self.columns.insert(name, values.into_raw_vec());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct MeanAcc {
    sum: f64,
    n: usize,
}

/// Build the complete site × time frame for the window `[start, end]`.
///
/// Every site and every value name in `observations` gets rows and a
/// column, in order of first appearance. If `use_values` is given, only
/// records flagged `true` in it (normally the ones inside the model domain)
/// supply values. For daily output both ends of the window are first
/// truncated to midnight. Records that fall outside the window or between
/// output timestamps are dropped. If several records land on the same row,
/// their finite values are averaged.
pub fn reconcile(
    observations: &ObservationSet,
    use_values: Option<&[bool]>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    freq: OutputFreq,
) -> ReconcileResult<ReconciledObservationFrame> {
    let (start, end) = match freq {
        OutputFreq::Daily => (floor_to_midnight(start), floor_to_midnight(end)),
        OutputFreq::Hourly => (start, end),
    };
    if end < start {
        return Err(ReconcileError::InvertedWindow { start, end }.into());
    }
    if let Some(flags) = use_values {
        if flags.len() != observations.len() {
            return Err(ReconcileError::FlagLengthMismatch { flags: flags.len(), records: observations.len() }.into());
        }
    }

    let sites: Vec<String> = observations.unique_site_keys().into_iter().collect();
    let value_names = observations.value_names();
    let times = freq.range(start, end);
    let nt = times.len();
    let nrows = sites.len() * nt;
    let step = freq.step().num_seconds();

    let site_index: HashMap<&str, usize> = sites.iter().enumerate().map(|(i, s)| (s.as_str(), i)).collect();
    let mut acc: IndexMap<&str, Vec<MeanAcc>> =
        value_names.iter().map(|n| (n.as_str(), vec![MeanAcc::default(); nrows])).collect();
    let mut hits = vec![0usize; nrows];
    let mut n_off_grid = 0;

    let records = observations
        .iter()
        .enumerate()
        .filter(|(i, _)| use_values.map(|m| m[*i]).unwrap_or(true))
        .map(|(_, r)| r)
        .filter(|r| r.gmt_time >= start && r.gmt_time <= end);
    for rec in records {
        let offset = (rec.gmt_time - start).num_seconds();
        if offset % step != 0 {
            n_off_grid += 1;
            continue;
        }
        // Every record's site is on the roster
        let Some(&is) = site_index.get(rec.site_id_poc.as_str()) else {
            continue;
        };
        let row = is * nt + (offset / step) as usize;
        hits[row] += 1;
        for (name, v) in rec.values.iter() {
            if let Some(col) = acc.get_mut(name.as_str()) {
                if v.is_finite() {
                    col[row].sum += v;
                    col[row].n += 1;
                }
            }
        }
    }

    let n_dup = hits.iter().filter(|h| **h > 1).count();
    if n_dup > 0 {
        log::warn!("{n_dup} site/time combinations had more than one observation; those values were averaged");
    }
    if n_off_grid > 0 {
        log::info!("{n_off_grid} observations in the output window do not fall on a {freq} timestamp and were dropped");
    }

    let columns = acc
        .into_iter()
        .map(|(name, col)| {
            let values = col
                .into_iter()
                .map(|a| if a.n == 0 { f64::NAN } else { a.sum / a.n as f64 })
                .collect();
            (name.to_string(), values)
        })
        .collect();

    log::debug!("Reconciled frame: {} sites x {} times", sites.len(), nt);
    Ok(ReconciledObservationFrame { sites, times, columns })
}

/// [`reconcile`] followed by the observation expression.
pub fn reconcile_with_expression(
    observations: &ObservationSet,
    use_values: Option<&[bool]>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    freq: OutputFreq,
    obs_expr: &ExprProgram,
) -> ReconcileResult<ReconciledObservationFrame> {
    let mut frame = reconcile(observations, use_values, start, end, freq)?;
    frame
        .apply_expression(obs_expr)
        .change_context(ReconcileError::Expression)?;
    Ok(frame)
}

//! Collapsing hourly site series into daily values.
//!
//! Three reductions are available: a plain n-step reduction (`nstepf`), a
//! per-calendar-date reduction for series whose samples per day are not a
//! whole number, and the maximum daily 8-hour average (`mda8`).
use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use indexmap::IndexMap;
use itertools::Itertools;
use ndarray::{Array3, ArrayView1};
use num_traits::Float;
use serde::{Deserialize, Serialize};

use crate::dates::hours_to_duration;
use crate::datasets::{SiteDataset, SiteVariable};

/// Length of the MDA8 averaging window, in hours
pub const MDA8_WINDOW: usize = 8;
/// Minimum number of valid hours for an 8-hour average to count
pub const MDA8_MIN_VALID: usize = 6;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AggregationError {
    #[error("Series of length {len} is not a multiple of the {n}-step window")]
    NotMultiple { len: usize, n: usize },
    #[error("Aggregation window must be at least one step")]
    ZeroWindow,
    #[error("Cannot aggregate a dataset with no time steps")]
    NoTimes,
    #[error("MDA8 needs at least one complete day of hourly data, got {0} steps")]
    TooShortForMda8(usize),
    #[error("MDA8 needs hourly input, but the time step is {}", .0.map(|d| format!("{} s", d.num_seconds())).unwrap_or_else(|| "irregular".to_string()))]
    NotHourly(Option<Duration>),
    #[error("Invalid day boundary: {0}")]
    BadDayBoundary(String),
}

/// Reduction applied within each aggregation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggOp {
    Mean,
    Max,
}

impl AggOp {
    /// Reduce `values`. Any NaN in the input makes the result NaN, as does an empty input.
    pub fn apply<F: Float>(&self, values: &[F]) -> F {
        if values.is_empty() || values.iter().any(|v| v.is_nan()) {
            return F::nan();
        }
        match self {
            AggOp::Mean => {
                let sum = values.iter().fold(F::zero(), |acc, v| acc + *v);
                sum / F::from(values.len()).unwrap_or_else(F::nan)
            }
            AggOp::Max => values.iter().copied().fold(F::neg_infinity(), F::max),
        }
    }
}

/// Which 8-hour windows count toward the daily maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mda8Mode {
    /// All 24 windows starting in the day
    AllHours,
    /// Only the 17 windows starting between 7 AM and 11 PM (EPA ozone standard)
    Epa,
}

impl Mda8Mode {
    /// Hour of the day the first counted window starts at.
    pub fn first_hour(&self) -> usize {
        match self {
            Mda8Mode::AllHours => 0,
            Mda8Mode::Epa => 7,
        }
    }

    /// Number of windows counted each day.
    pub fn hours(&self) -> usize {
        match self {
            Mda8Mode::AllHours => 24,
            Mda8Mode::Epa => 17,
        }
    }
}

/// Named time aggregation functions selectable by the user.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::EnumString, strum::Display,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum HourFunc {
    Max,
    #[default]
    Mean,
    Mda8,
    EpaMda8,
}

/// Which clock defines the calendar date of a timestamp when grouping by day.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "DayBoundaryRepr", into = "DayBoundaryRepr")]
pub enum DayBoundary {
    /// Days run from 00:00 to 24:00 GMT
    #[default]
    Gmt,
    /// Days run midnight to midnight in a fixed offset from GMT, in hours
    /// (e.g. -5 for US Eastern standard time)
    Offset(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum DayBoundaryRepr {
    Hours(f64),
    Name(String),
}

impl TryFrom<DayBoundaryRepr> for DayBoundary {
    type Error = AggregationError;

    fn try_from(value: DayBoundaryRepr) -> Result<Self, Self::Error> {
        match value {
            DayBoundaryRepr::Hours(h) => DayBoundary::from_hours(h),
            DayBoundaryRepr::Name(s) => s.parse(),
        }
    }
}

impl From<DayBoundary> for DayBoundaryRepr {
    fn from(value: DayBoundary) -> Self {
        match value {
            DayBoundary::Gmt => DayBoundaryRepr::Name("gmt".to_string()),
            DayBoundary::Offset(h) => DayBoundaryRepr::Hours(h),
        }
    }
}

impl FromStr for DayBoundary {
    type Err = AggregationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("gmt") || s.eq_ignore_ascii_case("utc") {
            return Ok(Self::Gmt);
        }
        let hours: f64 = s.parse().map_err(|_| AggregationError::BadDayBoundary(s.to_string()))?;
        Self::from_hours(hours)
    }
}

impl DayBoundary {
    fn from_hours(hours: f64) -> Result<Self, AggregationError> {
        if !hours.is_finite() || hours.abs() > 24.0 {
            return Err(AggregationError::BadDayBoundary(hours.to_string()));
        }
        if hours == 0.0 {
            Ok(Self::Gmt)
        } else {
            Ok(Self::Offset(hours))
        }
    }

    fn offset(&self) -> Duration {
        match self {
            DayBoundary::Gmt => Duration::zero(),
            // Validated to be within one day on construction
            DayBoundary::Offset(h) => hours_to_duration(*h).unwrap_or_else(|_| Duration::zero()),
        }
    }

    /// The calendar date `t` falls on.
    pub fn date_of(&self, t: DateTime<Utc>) -> NaiveDate {
        (t + self.offset()).date_naive()
    }

    /// The GMT instant at which `date` starts.
    pub fn day_start(&self, date: NaiveDate) -> DateTime<Utc> {
        date.and_time(NaiveTime::MIN).and_utc() - self.offset()
    }
}

/// Reduce each block of `n` consecutive values with `op`.
///
/// The series length must be an exact multiple of `n`.
pub fn nstepf<F: Float>(series: &[F], n: usize, op: AggOp) -> Result<Vec<F>, AggregationError> {
    if n == 0 {
        return Err(AggregationError::ZeroWindow);
    }
    if series.len() % n != 0 {
        return Err(AggregationError::NotMultiple { len: series.len(), n });
    }
    Ok(series.chunks_exact(n).map(|c| op.apply(c)).collect())
}

/// Maximum daily 8-hour average of an hourly series starting at hour 0 of a day.
///
/// Each 8-hour average is the mean of the valid (non-NaN) hours among the
/// starting hour and the following seven. Windows running past the end of
/// the series, and averages with fewer than [`MDA8_MIN_VALID`] valid hours,
/// do not count. The daily value is the
/// maximum of the counted averages starting in that day (NaN if none
/// count). Only whole days are returned: a trailing partial day is dropped.
pub fn mda8<F: Float>(series: &[F], mode: Mda8Mode) -> Vec<F> {
    let avg8 = rolling_mean8(series);
    let ndays = series.len() / 24;
    (0..ndays)
        .map(|d| {
            let start = 24 * d + mode.first_hour();
            avg8[start..start + mode.hours()]
                .iter()
                .copied()
                .filter(|v| !v.is_nan())
                .reduce(F::max)
                .unwrap_or_else(F::nan)
        })
        .collect()
}

/// 8-hour forward averages, one per starting hour.
fn rolling_mean8<F: Float>(series: &[F]) -> Vec<F> {
    (0..series.len())
        .map(|k| {
            let end = k + MDA8_WINDOW;
            if end > series.len() {
                return F::nan();
            }
            let (sum, count) = series[k..end]
                .iter()
                .filter(|v| !v.is_nan())
                .fold((F::zero(), 0usize), |(s, c), v| (s + *v, c + 1));
            if count < MDA8_MIN_VALID {
                F::nan()
            } else {
                sum / F::from(count).unwrap_or_else(F::nan)
            }
        })
        .collect()
}

/// Reduce values that share a calendar date, in date order.
pub fn calendar_day_reduce<F: Float>(
    series: &[F],
    times: &[DateTime<Utc>],
    boundary: DayBoundary,
    op: AggOp,
) -> Vec<(NaiveDate, F)> {
    let mut buckets: BTreeMap<NaiveDate, Vec<F>> = BTreeMap::new();
    for (v, t) in series.iter().zip(times.iter()) {
        buckets.entry(boundary.date_of(*t)).or_default().push(*v);
    }
    buckets.into_iter().map(|(date, vals)| (date, op.apply(&vals))).collect()
}

/// How a particular daily aggregation was carried out.
#[derive(Debug, Clone, PartialEq)]
enum DailyPlan {
    NStep { n: usize, op: AggOp, dates: Vec<NaiveDate> },
    Calendar { op: AggOp, dates: Vec<NaiveDate> },
    Mda8 { mode: Mda8Mode, dates: Vec<NaiveDate> },
}

impl DailyPlan {
    fn dates(&self) -> &[NaiveDate] {
        match self {
            DailyPlan::NStep { dates, .. } | DailyPlan::Calendar { dates, .. } | DailyPlan::Mda8 { dates, .. } => dates,
        }
    }
}

fn plan_daily(
    times: &[DateTime<Utc>],
    time_step: Option<Duration>,
    func: HourFunc,
    boundary: DayBoundary,
) -> Result<DailyPlan, AggregationError> {
    if times.is_empty() {
        return Err(AggregationError::NoTimes);
    }

    let op = match func {
        HourFunc::Max => AggOp::Max,
        HourFunc::Mean => AggOp::Mean,
        HourFunc::Mda8 | HourFunc::EpaMda8 => {
            if times.len() > 1 && time_step != Some(Duration::hours(1)) {
                return Err(AggregationError::NotHourly(time_step));
            }
            let ndays = times.len() / 24;
            if ndays == 0 {
                return Err(AggregationError::TooShortForMda8(times.len()));
            }
            if boundary.day_start(boundary.date_of(times[0])) != times[0] {
                log::warn!(
                    "MDA8 days run from the first model time ({}), which is not the start of a day; \
                     each day is labeled with the date its first hour falls on",
                    times[0]
                );
            }
            let mode = if func == HourFunc::Mda8 { Mda8Mode::AllHours } else { Mda8Mode::Epa };
            let dates = (0..ndays).map(|d| boundary.date_of(times[24 * d])).collect();
            return Ok(DailyPlan::Mda8 { mode, dates });
        }
    };

    // Runs of consecutive times that share a date
    let runs: Vec<(NaiveDate, usize)> = times
        .iter()
        .chunk_by(|t| boundary.date_of(**t))
        .into_iter()
        .map(|(date, group)| (date, group.count()))
        .collect();
    let n = runs[0].1;
    let dates_increase = runs.windows(2).all(|w| w[0].0 < w[1].0);
    if dates_increase && runs.iter().all(|(_, count)| *count == n) {
        log::debug!("{n} time steps per day, reducing in fixed blocks");
        let dates = runs.into_iter().map(|(date, _)| date).collect();
        Ok(DailyPlan::NStep { n, op, dates })
    } else {
        let mut dates: Vec<NaiveDate> = runs.into_iter().map(|(date, _)| date).collect();
        dates.sort();
        dates.dedup();
        log::info!(
            "{} time steps over {} dates do not split into equal whole days, grouping by calendar date",
            times.len(),
            dates.len()
        );
        Ok(DailyPlan::Calendar { op, dates })
    }
}

/// Aggregate every variable of a site dataset from its native time step to daily values.
///
/// Output times are the start of each day under `boundary`. Mean and max
/// reduce fixed blocks when every day holds the same number of consecutive
/// steps, and group by calendar date otherwise. Masked input values are
/// treated as NaN. Output values that come out non-finite are masked.
pub fn to_daily(ds: &SiteDataset, func: HourFunc, boundary: DayBoundary) -> Result<SiteDataset, AggregationError> {
    let plan = plan_daily(ds.times(), ds.time_step(), func, boundary)?;
    let times = ds.times();

    let out_times: Vec<DateTime<Utc>> = plan.dates().iter().map(|d| boundary.day_start(*d)).collect();

    let mut variables = IndexMap::new();
    for (name, var) in ds.variables() {
        let (_, nlay, nsite) = var.data.dim();
        let mut out = Array3::from_elem((out_times.len(), nlay, nsite), f32::NAN);
        for l in 0..nlay {
            for s in 0..nsite {
                let series = masked_series(var, l, s);
                let daily = reduce_series(&series, times, &plan, boundary)?;
                for (t, v) in daily.into_iter().enumerate() {
                    out[[t, l, s]] = v;
                }
            }
        }

        let mut new_var = SiteVariable::new(out, var.meta.clone());
        new_var.mask_non_finite();
        variables.insert(name.clone(), new_var);
    }

    Ok(ds.with_new_times(out_times, Some(Duration::hours(24)), variables))
}

fn masked_series(var: &SiteVariable, l: usize, s: usize) -> Vec<f32> {
    let column: ArrayView1<f32> = var.data.slice(ndarray::s![.., l, s]);
    column
        .iter()
        .enumerate()
        .map(|(t, v)| if var.is_missing(t, l, s) { f32::NAN } else { *v })
        .collect()
}

fn reduce_series<F: Float>(
    series: &[F],
    times: &[DateTime<Utc>],
    plan: &DailyPlan,
    boundary: DayBoundary,
) -> Result<Vec<F>, AggregationError> {
    match plan {
        DailyPlan::NStep { n, op, .. } => nstepf(series, *n, *op),
        DailyPlan::Calendar { op, .. } => Ok(calendar_day_reduce(series, times, boundary, *op)
            .into_iter()
            .map(|(_, v)| v)
            .collect()),
        DailyPlan::Mda8 { mode, .. } => Ok(mda8(series, *mode)),
    }
}

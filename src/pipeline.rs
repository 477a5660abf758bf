//! The full co-location run, from observation records and model files to
//! the paired model and observation outputs.
//!
//! The stages run in a fixed order:
//!
//! 1. locate every observation on the model grid,
//! 2. collapse records to unique site/cell rows,
//! 3. choose the model variables to read,
//! 4. extract them at every site from every model file,
//! 5. apply the model expression,
//! 6. aggregate to daily values (daily output only),
//! 7. reconcile the observations onto the model's time axis,
//! 8. assemble the observation output in the model output's shape.
use std::time::Instant;

use chrono::NaiveTime;
use error_stack::ResultExt;
use ndarray::{Array3, ArrayD, Ix3};

use crate::aggregation::to_daily;
use crate::assembly::{assemble_obs_output, TimeMatch};
use crate::config::PipelineConfig;
use crate::datasets::{ModelSource, SiteDataset, SiteVariable, VariableMeta};
use crate::expr::{ExprProgram, Namespace, Value};
use crate::extraction::{extract_all, select_variables, ExtractionError};
use crate::observations::ObservationSet;
use crate::reconcile::{reconcile_with_expression, OutputFreq, ReconciledObservationFrame};
use crate::sites::{dedup_sites, SiteTable};

pub type PipelineResult<T> = error_stack::Result<T, PipelineError>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Error matching observation sites to grid cells")]
    Sites,
    #[error("Error extracting model values at observation sites")]
    Extraction,
    #[error("Error evaluating the model expression")]
    ModelExpression,
    #[error("Error aggregating model values to daily")]
    Aggregation,
    #[error("The model output has no times")]
    NoModelTimes,
    #[error("Error reconciling observations with the model times")]
    Reconcile,
    #[error("Error building the observation output")]
    Assembly,
}

/// Everything a run produces.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Model values at each in-domain site, after the expression and any aggregation
    pub model: SiteDataset,
    /// Observations laid out exactly like `model`
    pub obs: SiteDataset,
    /// Observations for every site in the input, in-domain or not
    pub reconciled: ReconciledObservationFrame,
    pub site_table: SiteTable,
}

struct StageTimer {
    stage: &'static str,
    start: Instant,
}

impl StageTimer {
    fn start(stage: &'static str) -> Self {
        log::info!("Starting: {stage}");
        Self { stage, start: Instant::now() }
    }

    fn finish(self) {
        log::info!("Finished: {} in {:.2} s", self.stage, self.start.elapsed().as_secs_f64());
    }
}

/// Run every stage for one set of observations and model files.
///
/// `sources` must be in time order; the first one decides which variables
/// exist.
pub fn run_pipeline<S: ModelSource>(
    config: &PipelineConfig,
    observations: &ObservationSet,
    sources: &[S],
    mod_expr: &ExprProgram,
    obs_expr: &ExprProgram,
) -> PipelineResult<PipelineOutput> {
    let template = sources
        .first()
        .ok_or(ExtractionError::NoSources)
        .change_context(PipelineError::Extraction)?;

    let timer = StageTimer::start("locating sites on the model grid");
    let cells = template.grid().locate_all(&observations.coordinates());
    let site_table = dedup_sites(observations.records(), &cells).change_context(PipelineError::Sites)?;
    log::info!(
        "{} observation records map to {} unique site/cell combinations",
        observations.len(),
        site_table.len()
    );
    timer.finish();

    let timer = StageTimer::start("extracting model values");
    let selection = select_variables(template, mod_expr, config.variables.as_deref())
        .change_context(PipelineError::Extraction)?;
    let extracted = extract_all(sources, &site_table, &selection.used, config.parallel_variables)
        .change_context(PipelineError::Extraction)?;
    timer.finish();

    let model = if mod_expr.is_empty() {
        extracted
    } else {
        let timer = StageTimer::start("applying the model expression");
        let ds = apply_model_expression(&extracted, mod_expr, &selection.assigned)?;
        timer.finish();
        ds
    };

    let model = match config.freq {
        OutputFreq::Daily => {
            let timer = StageTimer::start("aggregating to daily values");
            let ds = to_daily(&model, config.hour_func, config.day_boundary)
                .change_context(PipelineError::Aggregation)?;
            timer.finish();
            ds
        }
        OutputFreq::Hourly => model,
    };

    let timer = StageTimer::start("reconciling observations");
    let (Some(&start), Some(&end)) = (model.times().first(), model.times().last()) else {
        return Err(PipelineError::NoModelTimes.into());
    };
    // Daily frame rows are GMT midnights labeling the model's dates
    let (start, end, time_match) = match config.freq {
        OutputFreq::Daily => {
            let boundary = config.day_boundary;
            let midnight = |t| boundary.date_of(t).and_time(NaiveTime::MIN).and_utc();
            (midnight(start), midnight(end), TimeMatch::Date(boundary))
        }
        OutputFreq::Hourly => (start, end, TimeMatch::Exact),
    };
    let in_domain: Vec<bool> = cells.iter().map(|c| c.in_domain).collect();
    let reconciled = reconcile_with_expression(observations, Some(&in_domain), start, end, config.freq, obs_expr)
        .change_context(PipelineError::Reconcile)?;
    timer.finish();

    let timer = StageTimer::start("assembling the observation output");
    let assigned: Vec<String> = model.variable_names().map(String::from).collect();
    let obs = assemble_obs_output(&model, &reconciled, &assigned, time_match).change_context(PipelineError::Assembly)?;
    timer.finish();

    Ok(PipelineOutput {
        model,
        obs,
        reconciled,
        site_table,
    })
}

/// Evaluate `mod_expr` over the extracted variables and keep only the `assigned` ones.
///
/// Masked values enter the expression as NaN. An assigned variable keeps
/// the metadata of the input variable with the same name, if there is one.
pub fn apply_model_expression(
    ds: &SiteDataset,
    mod_expr: &ExprProgram,
    assigned: &[String],
) -> PipelineResult<SiteDataset> {
    let mut ns = Namespace::new();
    let mut shape = None;
    for (name, var) in ds.variables() {
        let (nt, nl, nsite) = var.data.dim();
        let values = Array3::from_shape_fn((nt, nl, nsite), |(t, l, s)| {
            if var.is_missing(t, l, s) {
                f64::NAN
            } else {
                var.data[[t, l, s]] as f64
            }
        });
        shape.get_or_insert([nt, nl, nsite]);
        ns.insert(name.clone(), Value::Array(values.into_dyn()));
    }
    let shape = shape.unwrap_or([ds.n_times(), 1, ds.n_sites()]);

    mod_expr.eval(&mut ns).change_context(PipelineError::ModelExpression)?;

    let mut out = ds.empty_like();
    for name in assigned {
        let Some(value) = ns.swap_remove(name) else {
            continue;
        };
        let data: ArrayD<f64> = value
            .into_array(&shape)
            .change_context(PipelineError::ModelExpression)
            .attach_printable_lazy(|| format!("while converting expression output '{name}'"))?;
        let data = data
            .into_dimensionality::<Ix3>()
            .change_context(PipelineError::ModelExpression)?
            .mapv(|v| v as f32);
        let meta = ds
            .variable(name)
            .map(|v| v.meta.clone())
            .unwrap_or_else(|| VariableMeta::named(name, ""));
        let mut var = SiteVariable::new(data, meta);
        var.mask_non_finite();
        out.insert_variable(name, var).change_context(PipelineError::ModelExpression)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::aggregation::{DayBoundary, HourFunc};
    use crate::datasets::GriddedDataset;
    use crate::test_utils::{gridded_dataset, observation_set};

    fn two_files() -> Vec<GriddedDataset> {
        vec![gridded_dataset(0, 24, &["O3", "NO2"]), gridded_dataset(24, 24, &["O3", "NO2"])]
    }

    fn assert_same_values(a: &SiteDataset, b: &SiteDataset) {
        assert_eq!(a.times(), b.times());
        assert_eq!(a.site_keys(), b.site_keys());
        assert_eq!(a.variable_names().collect::<Vec<_>>(), b.variable_names().collect::<Vec<_>>());
        for (name, va) in a.variables() {
            let vb = b.variable(name).unwrap();
            assert_eq!(va.mask, vb.mask, "{name} masks differ");
            assert_eq!(va.meta, vb.meta);
            for (x, y) in va.data.iter().zip(vb.data.iter()) {
                assert!(x == y || (x.is_nan() && y.is_nan()), "{name}: {x} != {y}");
            }
        }
    }

    #[test]
    fn test_daily_end_to_end() {
        let config = PipelineConfig::default();
        let out = run_pipeline(
            &config,
            &observation_set(),
            &two_files(),
            &ExprProgram::default(),
            &ExprProgram::default(),
        )
        .unwrap();

        // C is outside the grid, so only A and B are extracted
        assert_eq!(out.site_table.len(), 2);
        assert_eq!(out.model.n_sites(), 2);
        assert_eq!(out.model.n_times(), 2);
        assert_eq!(out.obs.site_keys(), out.model.site_keys());
        assert_eq!(out.obs.times(), out.model.times());

        // ...but every site gets rows in the reconciled frame
        assert_eq!(out.reconciled.sites(), &["A-1", "B-1", "C-1"]);
        assert_eq!(out.reconciled.times().len(), 2);
        assert!(out.reconciled.site_series("C-1", "O3").unwrap().iter().all(|v| v.is_nan()));

        // A is at row 0, column 0; the daily mean of the hour-of-day offsets is 11.5
        let o3 = out.model.variable("O3").unwrap();
        assert_abs_diff_eq!(o3.data[[0, 0, 0]], 1011.5);
        assert_abs_diff_eq!(o3.data[[1, 0, 1]], 1011.5 + 54.0);
        assert!(o3.is_missing(0, 1, 0));

        let obs_o3 = out.obs.variable("O3").unwrap();
        assert_abs_diff_eq!(obs_o3.data[[0, 0, 0]], 30.0);
        assert_abs_diff_eq!(obs_o3.data[[1, 0, 1]], 40.0);
        assert!(out.obs.variable("NO2").unwrap().mask.as_ref().unwrap().iter().all(|m| *m));
    }

    #[test]
    fn test_hourly_with_expressions() {
        let config = PipelineConfig {
            freq: OutputFreq::Hourly,
            ..Default::default()
        };
        let mod_expr = ExprProgram::parse("O3 = O3 / 1000").unwrap();
        let obs_expr = ExprProgram::parse("O3 = O3 / 1000").unwrap();
        let out = run_pipeline(&config, &observation_set(), &two_files(), &mod_expr, &obs_expr).unwrap();

        assert_eq!(out.model.n_times(), 48);
        assert_eq!(out.model.variable_names().collect::<Vec<_>>(), vec!["O3"]);
        assert_eq!(out.model.variable("O3").unwrap().meta, VariableMeta::new("ppb", "O3", "model O3"));
        assert_abs_diff_eq!(out.model.variable("O3").unwrap().data[[5, 0, 0]], 1.005, epsilon = 1e-6);
        assert_abs_diff_eq!(out.obs.variable("O3").unwrap().data[[5, 0, 1]], 0.04, epsilon = 1e-6);
    }

    #[test]
    fn test_new_variable_from_expression() {
        let config = PipelineConfig {
            hour_func: HourFunc::Max,
            ..Default::default()
        };
        let mod_expr = ExprProgram::parse("OX = O3 + NO2").unwrap();
        let out = run_pipeline(&config, &observation_set(), &two_files(), &mod_expr, &ExprProgram::default()).unwrap();
        let ox = out.model.variable("OX").unwrap();
        // Both variables peak at hour 23
        assert_abs_diff_eq!(ox.data[[0, 0, 0]], 1023.0 + 2023.0);
        assert_eq!(ox.meta, VariableMeta::named("OX", ""));
        // Observations have no OX
        assert!(out.obs.variable("OX").unwrap().is_missing(0, 0, 0));
    }

    #[test]
    fn test_repeat_runs_match() {
        let config = PipelineConfig {
            hour_func: HourFunc::EpaMda8,
            ..Default::default()
        };
        let run = || {
            run_pipeline(
                &config,
                &observation_set(),
                &two_files(),
                &ExprProgram::default(),
                &ExprProgram::default(),
            )
            .unwrap()
        };
        let first = run();
        let second = run();
        assert_same_values(&first.model, &second.model);
        assert_same_values(&first.obs, &second.obs);
        assert_eq!(first.site_table, second.site_table);
    }

    #[test]
    fn test_daily_mda8_off_midnight() {
        let config = PipelineConfig {
            hour_func: HourFunc::Mda8,
            ..Default::default()
        };
        let files = vec![gridded_dataset(5, 48, &["O3"])];
        let out = run_pipeline(
            &config,
            &observation_set(),
            &files,
            &ExprProgram::default(),
            &ExprProgram::default(),
        )
        .unwrap();

        let t0 = Utc.with_ymd_and_hms(2016, 7, 1, 0, 0, 0).unwrap();
        assert_eq!(out.model.times(), &[t0, t0 + Duration::days(1)]);
        let obs_o3 = out.obs.variable("O3").unwrap();
        assert_abs_diff_eq!(obs_o3.data[[0, 0, 0]], 30.0);
        assert_abs_diff_eq!(obs_o3.data[[1, 0, 1]], 40.0);
    }

    #[test]
    fn test_daily_local_day_boundary() {
        let config = PipelineConfig {
            day_boundary: DayBoundary::Offset(-5.0),
            ..Default::default()
        };
        let out = run_pipeline(
            &config,
            &observation_set(),
            &two_files(),
            &ExprProgram::default(),
            &ExprProgram::default(),
        )
        .unwrap();

        // 00Z-04Z fall on 30 June local time, so there are three local dates
        let t0 = Utc.with_ymd_and_hms(2016, 6, 30, 5, 0, 0).unwrap();
        assert_eq!(out.model.times(), &[t0, t0 + Duration::days(1), t0 + Duration::days(2)]);
        let o3 = out.model.variable("O3").unwrap();
        assert_abs_diff_eq!(o3.data[[1, 0, 0]], 1011.5);

        // Observations are matched by date, not by the 05Z instant
        assert_eq!(out.reconciled.times()[0], Utc.with_ymd_and_hms(2016, 6, 30, 0, 0, 0).unwrap());
        let obs_o3 = out.obs.variable("O3").unwrap();
        assert!(obs_o3.is_missing(0, 0, 0));
        assert_abs_diff_eq!(obs_o3.data[[1, 0, 0]], 30.0);
        assert_abs_diff_eq!(obs_o3.data[[2, 0, 1]], 40.0);
    }

    #[test]
    fn test_no_sources() {
        let sources: Vec<GriddedDataset> = vec![];
        let err = run_pipeline(
            &PipelineConfig::default(),
            &observation_set(),
            &sources,
            &ExprProgram::default(),
            &ExprProgram::default(),
        )
        .unwrap_err();
        assert!(matches!(err.current_context(), PipelineError::Extraction));
    }
}

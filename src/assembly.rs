//! Building the observation-side output so it lines up with the model side.
use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use ndarray::Array3;

use crate::aggregation::DayBoundary;
use crate::datasets::{DatasetResult, SiteDataset, SiteVariable};
use crate::reconcile::ReconciledObservationFrame;

/// How a model output time finds its row in the observation frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeMatch {
    /// Same instant
    Exact,
    /// Same calendar date. Model times are dated with the given day
    /// boundary; frame rows are labeled by their GMT date.
    Date(DayBoundary),
}

impl TimeMatch {
    fn map_times(&self, model_times: &[DateTime<Utc>], frame_times: &[DateTime<Utc>]) -> Vec<Option<usize>> {
        match self {
            TimeMatch::Exact => {
                let index: HashMap<DateTime<Utc>, usize> =
                    frame_times.iter().enumerate().map(|(i, t)| (*t, i)).collect();
                model_times.iter().map(|t| index.get(t).copied()).collect()
            }
            TimeMatch::Date(boundary) => {
                let index: HashMap<NaiveDate, usize> =
                    frame_times.iter().enumerate().map(|(i, t)| (t.date_naive(), i)).collect();
                model_times.iter().map(|t| index.get(&boundary.date_of(*t)).copied()).collect()
            }
        }
    }
}

/// Fill a copy of the model output's structure with reconciled observations.
///
/// The result has the model output's sites (matched by decoded site key),
/// times, and variable metadata, with one variable per name in `assigned`.
/// Observation values go in the first layer; anything without an
/// observation, including every other layer, is masked, as is any
/// non-finite value. `time_match` says how model times pair with frame
/// times; daily output pairs them by date.
pub fn assemble_obs_output(
    model: &SiteDataset,
    frame: &ReconciledObservationFrame,
    assigned: &[String],
    time_match: TimeMatch,
) -> DatasetResult<SiteDataset> {
    let mut obs = model.empty_like();

    let frame_sites: HashMap<&str, usize> = frame.sites().iter().enumerate().map(|(i, s)| (s.as_str(), i)).collect();
    let time_map = time_match.map_times(model.times(), frame.times());
    let n_unmatched = time_map.iter().filter(|m| m.is_none()).count();
    if n_unmatched > 0 {
        log::warn!("{n_unmatched} model output times have no counterpart in the observation frame");
    }
    let nft = frame.times().len();

    for name in assigned {
        let Some(model_var) = model.variable(name) else {
            log::warn!("'{name}' is not in the model output, so it is not written to the observation output");
            continue;
        };

        let mut data = Array3::from_elem(model_var.data.dim(), f32::NAN);
        match frame.column(name) {
            None => log::warn!("Observations have no variable '{name}'; it will be all missing in the observation output"),
            Some(column) => {
                for (s, key) in model.site_keys().iter().enumerate() {
                    let Some(&fs) = frame_sites.get(key.decode().as_str()) else {
                        log::debug!("Site {key} has no observations");
                        continue;
                    };
                    for (t, ft) in time_map.iter().enumerate() {
                        if let Some(ft) = ft {
                            data[[t, 0, s]] = column[fs * nft + ft] as f32;
                        }
                    }
                }
            }
        }

        let mut var = SiteVariable::new(data, model_var.meta.clone());
        var.mask_non_finite();
        obs.insert_variable(name, var)?;
    }
    Ok(obs)
}

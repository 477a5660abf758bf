//! Sampling gridded model variables at observation sites.
//!
//! Variables are gathered one at a time so that only one full gridded field
//! needs to be held at once. With `parallel` set, variables are gathered
//! on the rayon thread pool instead, trading memory for speed.
use std::time::Instant;

use error_stack::ResultExt;
use indexmap::IndexSet;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::datasets::{ModelSource, SiteDataset, SiteKey, SiteVariable};
use crate::expr::ExprProgram;
use crate::sites::SiteTable;

pub type ExtractResult<T> = error_stack::Result<T, ExtractionError>;

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("No model files were given")]
    NoSources,
    #[error("Variable '{var}' is missing from {source_descr}")]
    MissingVariable { var: String, source_descr: String },
    #[error("Could not extract variable '{0}'")]
    Gather(String),
    #[error("Could not stack extracted model files along the time axis")]
    Stack,
    #[error("None of the variables to extract are present in {0}")]
    NoVariables(String),
}

impl ExtractionError {
    pub fn missing_variable<V: Into<String>, S: Into<String>>(var: V, source_descr: S) -> Self {
        Self::MissingVariable {
            var: var.into(),
            source_descr: source_descr.into(),
        }
    }
}

/// The variables to read from model files and the variables to write out.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSelection {
    pub used: Vec<String>,
    pub assigned: Vec<String>,
}

/// Decide which variables to extract, using the first model file as the template.
///
/// With an empty expression every variable in the template is used and
/// written unchanged. Otherwise the expression decides: names it reads are
/// used (if the template has them), names it assigns are written. A
/// `subset` hint further restricts the used set.
pub fn select_variables<S: ModelSource + ?Sized>(
    template: &S,
    mod_expr: &ExprProgram,
    subset: Option<&[String]>,
) -> ExtractResult<VariableSelection> {
    let available: IndexSet<String> = template.variable_names().into_iter().collect();

    let mut used: Vec<String> = if mod_expr.is_empty() {
        available.iter().cloned().collect()
    } else {
        mod_expr
            .used_names()
            .into_iter()
            .filter(|name| {
                let present = available.contains(name);
                if !present {
                    log::debug!("Expression input '{name}' is not in {}, not extracting it", template.description());
                }
                present
            })
            .collect()
    };

    if let Some(subset) = subset {
        for name in subset.iter().filter(|n| !used.contains(n)) {
            log::warn!("Requested variable '{name}' is not used, ignoring it");
        }
        used.retain(|v| subset.contains(v));
    }

    if used.is_empty() && mod_expr.is_empty() {
        return Err(ExtractionError::NoVariables(template.description()).into());
    }

    let assigned = if mod_expr.is_empty() {
        used.clone()
    } else {
        mod_expr.assigned_names().into_iter().collect()
    };

    log::info!("Extracting model variables: {}", used.join(", "));
    Ok(VariableSelection { used, assigned })
}

/// Gather `used` variables from one model file at every site in `sites`.
pub fn extract_file<S: ModelSource + ?Sized>(
    source: &S,
    sites: &SiteTable,
    used: &[String],
    parallel: bool,
) -> ExtractResult<SiteDataset> {
    for var in used {
        if !source.has_variable(var) {
            return Err(ExtractionError::missing_variable(var, source.description()).into());
        }
    }

    let cells = sites.row_col_indices();
    let gather_one = |name: &String| -> ExtractResult<(String, SiteVariable)> {
        let t0 = Instant::now();
        let var = source
            .gather(name, &cells)
            .change_context_lazy(|| ExtractionError::Gather(name.clone()))
            .attach_printable_lazy(|| format!("in {}", source.description()))?;
        log::debug!("{name} extracted in {:.3} s", t0.elapsed().as_secs_f64());
        Ok((name.clone(), var))
    };

    let gathered: Vec<(String, SiteVariable)> = if parallel {
        used.par_iter().map(gather_one).collect::<Result<_, _>>()?
    } else {
        used.iter().map(gather_one).collect::<Result<_, _>>()?
    };

    let mut ds = site_dataset_shell(source, sites);
    for (name, var) in gathered {
        ds.insert_variable(&name, var)
            .change_context_lazy(|| ExtractionError::Gather(name.clone()))?;
    }
    Ok(ds)
}

/// Extract every model file and concatenate the results along time, in file order.
pub fn extract_all<S: ModelSource>(
    sources: &[S],
    sites: &SiteTable,
    used: &[String],
    parallel: bool,
) -> ExtractResult<SiteDataset> {
    if sources.is_empty() {
        return Err(ExtractionError::NoSources.into());
    }

    let parts = sources
        .iter()
        .map(|src| extract_file(src, sites, used, parallel))
        .collect::<Result<Vec<_>, _>>()?;
    SiteDataset::stack_time(parts).change_context(ExtractionError::Stack)
}

/// An empty dataset with the source's time axis and the site metadata.
fn site_dataset_shell<S: ModelSource + ?Sized>(source: &S, sites: &SiteTable) -> SiteDataset {
    let keys = sites.iter().map(|c| SiteKey::encode(&c.site_id_poc)).collect();
    let lon = sites.iter().map(|c| c.lon as f32).collect();
    let lat = sites.iter().map(|c| c.lat as f32).collect();
    SiteDataset::new(source.times().to_vec(), keys, lon, lat)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::test_utils::{gridded_dataset, site_table};

    #[test]
    fn test_select_all_without_expression() {
        let src = gridded_dataset(0, 24, &["O3", "NO2"]);
        let sel = select_variables(&src, &ExprProgram::default(), None).unwrap();
        assert_eq!(sel.used, vec!["O3", "NO2"]);
        assert_eq!(sel.assigned, sel.used);
    }

    #[test]
    fn test_select_from_expression() {
        let src = gridded_dataset(0, 24, &["O3", "NO", "NO2"]);
        let expr = ExprProgram::parse("NOX = NO + NO2 + HONO\nO3 = O3").unwrap();
        let sel = select_variables(&src, &expr, None).unwrap();
        // HONO is not in the file, so it is dropped rather than an error
        assert_eq!(sel.used, vec!["NO", "NO2", "O3"]);
        assert_eq!(sel.assigned, vec!["NOX", "O3"]);
    }

    #[test]
    fn test_select_with_subset() {
        let src = gridded_dataset(0, 24, &["O3", "NO2"]);
        let subset = vec!["NO2".to_string(), "CO".to_string()];
        let sel = select_variables(&src, &ExprProgram::default(), Some(&subset)).unwrap();
        assert_eq!(sel.used, vec!["NO2"]);
        assert_eq!(sel.assigned, vec!["NO2"]);

        let subset = vec!["CO".to_string()];
        let err = select_variables(&src, &ExprProgram::default(), Some(&subset)).unwrap_err();
        assert!(matches!(err.current_context(), ExtractionError::NoVariables(_)));
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_extract_and_stack(#[case] parallel: bool) {
        let sources = vec![gridded_dataset(0, 24, &["O3", "NO2"]), gridded_dataset(24, 24, &["O3", "NO2"])];
        let sites = site_table();
        let used = vec!["O3".to_string(), "NO2".to_string()];
        let ds = extract_all(&sources, &sites, &used, parallel).unwrap();

        assert_eq!(ds.n_times(), 48);
        assert_eq!(ds.n_sites(), sites.len());
        assert_eq!(ds.variable_names().collect::<Vec<_>>(), vec!["O3", "NO2"]);
        assert_eq!(ds.site_keys()[0].decode(), sites.cells()[0].site_id_poc);
        assert_eq!(ds.longitude()[1], sites.cells()[1].lon as f32);

        // Second file continues the first in time
        assert_eq!(ds.times()[24] - ds.times()[23], chrono::Duration::hours(1));
        let (row, col) = sites.row_col_indices()[1];
        let direct = sources[1].variable("O3").unwrap().data[[0, 0, row, col]];
        assert_eq!(ds.variable("O3").unwrap().data[[24, 0, 1]], direct);
    }

    #[test]
    fn test_missing_in_later_file() {
        let sources = vec![gridded_dataset(0, 24, &["O3", "NO2"]), gridded_dataset(24, 24, &["O3"])];
        let used = vec!["O3".to_string(), "NO2".to_string()];
        let err = extract_all(&sources, &site_table(), &used, false).unwrap_err();
        assert!(matches!(err.current_context(), ExtractionError::MissingVariable { var, .. } if var == "NO2"));
    }

    #[test]
    fn test_no_sources() {
        let sources: Vec<crate::datasets::GriddedDataset> = vec![];
        let err = extract_all(&sources, &site_table(), &[], false).unwrap_err();
        assert!(matches!(err.current_context(), ExtractionError::NoSources));
    }
}

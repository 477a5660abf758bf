use std::{path::Path, process::ExitCode, time::Instant};

use aqmoco::config::PipelineConfig;
use aqmoco::expr::ExprProgram;
use aqmoco::logging::init_logging;
use aqmoco::nc_io::{write_site_dataset, NcModelFile};
use aqmoco::pipeline::run_pipeline;
use clap::Parser;
use error_stack::ResultExt;

use crate::cli::Cli;
use crate::error::CliError;

mod cli;
mod error;

fn main() -> ExitCode {
    let clargs = Cli::parse();
    if let Err(e) = init_logging(clargs.verbosity.log_level_filter(), clargs.log_file.as_deref()) {
        eprintln!("ERROR: could not set up logging:\n{e:?}");
        return ExitCode::FAILURE;
    }

    if let Err(e) = driver(clargs) {
        eprintln!("ERROR: aqmoco failed:\n{e:?}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn driver(clargs: Cli) -> error_stack::Result<(), CliError> {
    let config = PipelineConfig::load(clargs.config.as_deref(), &clargs.config_overrides())
        .change_context(CliError::Config)?;
    if clargs.print_config {
        let s = config.to_toml_string().change_context(CliError::Config)?;
        println!("{s}");
        return Ok(());
    }

    let mod_expr = load_expression(&clargs.modexpr, "model")?;
    let obs_expr = load_expression(&clargs.obsexpr, "observation")?;
    let (model_paths, obsout, modout) = clargs.model_and_output_paths()?;

    let t0 = Instant::now();
    let site_path = clargs.obs_format.needs_site_file().then_some(clargs.sitecsv.as_path());
    let observations = clargs
        .obs_format
        .read(&clargs.obscsv, site_path)
        .change_context_lazy(|| CliError::ReadObs(clargs.obscsv.clone()))?;
    log::info!(
        "Loaded {} {} observation records in {:.2} s",
        observations.len(),
        clargs.obs_format,
        t0.elapsed().as_secs_f64()
    );

    let sources = model_paths
        .iter()
        .map(|p| {
            NcModelFile::open(p, &clargs.mod_format, &config.time_dim_names)
                .change_context_lazy(|| CliError::OpenModel(p.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let output = run_pipeline(&config, &observations, &sources, &mod_expr, &obs_expr)
        .change_context(CliError::Pipeline)?;

    let t0 = Instant::now();
    write_site_dataset(&obsout, &output.obs).change_context_lazy(|| CliError::Write(obsout.clone()))?;
    write_site_dataset(&modout, &output.model).change_context_lazy(|| CliError::Write(modout.clone()))?;
    log::info!(
        "Wrote {} and {} in {:.2} s",
        obsout.display(),
        modout.display(),
        t0.elapsed().as_secs_f64()
    );
    Ok(())
}

/// Build one expression from command line pieces, each either a file or literal text.
fn load_expression(pieces: &[String], which: &'static str) -> error_stack::Result<ExprProgram, CliError> {
    let mut lines = vec![];
    for piece in pieces {
        let path = Path::new(piece);
        if path.is_file() {
            let text = std::fs::read_to_string(path).change_context_lazy(|| CliError::ExpressionFile(path.to_path_buf()))?;
            lines.push(text);
        } else {
            lines.push(piece.clone());
        }
    }
    let source = lines.join("\n");
    let program = ExprProgram::parse(&source)
        .change_context(CliError::Expression(which))
        .attach_printable_lazy(|| format!("expression was:\n{source}"))?;
    Ok(program)
}

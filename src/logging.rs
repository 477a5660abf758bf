use std::path::{Path, PathBuf};

use error_stack::ResultExt;
use log::LevelFilter;
use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        file::FileAppender,
    },
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
    Config,
};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Could not create log file {}", .0.display())]
    LogFile(PathBuf),
    #[error("Failed to configure logger")]
    Config,
    #[error("Failed to initialize logger")]
    Init,
}

/// Set up logging to stderr at `level` and, optionally, to `log_file`.
///
/// The log file always records DEBUG and above and is overwritten if it
/// already exists.
pub fn init_logging(level: LevelFilter, log_file: Option<&Path>) -> error_stack::Result<(), LoggingError> {
    let stderr = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{h({d(%Y-%m-%d %H:%M:%S)} [{l}] from line {L} in {M})} - {m}{n}",
        )))
        .target(Target::Stderr)
        .build();

    let mut builder = Config::builder().appender(
        Appender::builder()
            .filter(Box::new(ThresholdFilter::new(level)))
            .build("stderr", Box::new(stderr)),
    );
    let mut root = Root::builder().appender("stderr");

    if let Some(path) = log_file {
        let logfile = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(
                "{d(%Y-%m-%d %H:%M:%S)} [{l}] from line {L} in {M} - {m}{n}",
            )))
            .append(false)
            .build(path)
            .change_context_lazy(|| LoggingError::LogFile(path.to_path_buf()))?;
        builder = builder.appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(LevelFilter::Debug)))
                .build("logfile", Box::new(logfile)),
        );
        root = root.appender("logfile");
    }

    let root_level = match log_file {
        Some(_) => level.max(LevelFilter::Debug),
        None => level,
    };
    let config = builder
        .build(root.build(root_level))
        .change_context(LoggingError::Config)?;
    log4rs::init_config(config).change_context(LoggingError::Init)?;
    Ok(())
}

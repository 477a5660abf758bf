use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    #[error("Usage error: {0}")]
    Usage(String),
    #[error("Could not load the configuration")]
    Config,
    #[error("Could not read expression file {}", .0.display())]
    ExpressionFile(PathBuf),
    #[error("Invalid {0} expression")]
    Expression(&'static str),
    #[error("Could not read observations from {}", .0.display())]
    ReadObs(PathBuf),
    #[error("Could not open model file {}", .0.display())]
    OpenModel(PathBuf),
    #[error("Co-location failed")]
    Pipeline,
    #[error("Could not write {}", .0.display())]
    Write(PathBuf),
}

impl CliError {
    pub(crate) fn usage<S: ToString>(msg: S) -> Self {
        Self::Usage(msg.to_string())
    }
}

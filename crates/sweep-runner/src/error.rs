use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that end a whole sweep.
///
/// Per-instance problems never show up here: a solver failure is a
/// [`crate::RunOutcome`] and a runner malfunction is a [`RunnerError`] that
/// only drops its own instance.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("failed to persist {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize {what}: {message}")]
    Serialization { what: &'static str, message: String },
    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),
}

impl SweepError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn persist(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Persistence { path, source }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Something went wrong managing one instance's subprocess, as opposed to
/// the solver itself reporting failure.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to create scratch directory: {0}")]
    Scratch(#[source] io::Error),
    #[error("failed to open output capture: {0}")]
    Capture(#[source] io::Error),
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("failed waiting for solver process: {0}")]
    Wait(#[source] io::Error),
    #[error("solver exited 0 but wrote no result file at {}", path.display())]
    MissingResult { path: PathBuf },
    #[error("failed to read result file {}: {source}", path.display())]
    ReadResult {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no completed-task count in last line {line:?} of {}", path.display())]
    MalformedResult { path: PathBuf, line: String },
}

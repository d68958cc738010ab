/// Failure reported by a metrics backend while registering or publishing.
///
/// These are recoverable: callers log them and carry on with the metric
/// missing.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("metrics backend is closed")]
    Closed,
    #[error("metrics backend rejected {0}")]
    Rejected(String),
}

#[derive(thiserror::Error, Debug)]
pub enum InstrumentationError {
    /// A probe's target stage has the wrong shape, or a probe was bound twice.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl InstrumentationError {
    pub fn config(msg: impl Into<String>) -> Self {
        InstrumentationError::Configuration(msg.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, InstrumentationError::Configuration(_))
    }
}

/// Local hostname could not be determined.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unable to resolve local hostname")]
pub struct ResolutionError;

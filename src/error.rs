/// Failure taxonomy shared by the detector, capture and persistence seams.
///
/// Runtime threshold and grid changes are never rejected; `Config` is only
/// raised when a configuration file or environment value is unusable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecorderError {
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("scorer failed: {0}")]
    Scorer(String),

    #[error("capture failed: {0}")]
    Capture(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RecorderError {
    pub fn persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

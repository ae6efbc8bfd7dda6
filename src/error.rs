use thiserror::Error;

/// Failure reported by one of the external collaborators a stream talks to.
///
/// `Ok(vec![])` from a detector or recogniser means "nothing found"; an `Err` of this
/// type means the collaborator itself failed. Both are recoverable for the stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("detector failed: {0}")]
    Detector(String),
    #[error("text recognition failed: {0}")]
    Ocr(String),
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("downstream delivery failed: {0}")]
    Downstream(String),
}

impl PipelineError {
    pub fn detector(err: impl std::fmt::Display) -> Self {
        Self::Detector(err.to_string())
    }

    pub fn ocr(err: impl std::fmt::Display) -> Self {
        Self::Ocr(err.to_string())
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn downstream(err: impl std::fmt::Display) -> Self {
        Self::Downstream(err.to_string())
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

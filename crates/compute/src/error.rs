use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("training failed: {0}")]
    TrainingFailed(String),

    #[error("not enough training data: need {needed}, have {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("artifact codec error: {0}")]
    Artifact(String),
}

use dataset::DatasetError;
use thiserror::Error;
use train::error::TrainError;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to load frames.")]
    DatasetError(#[from] DatasetError),

    #[error(transparent)]
    Train(#[from] TrainError),

    #[error("Loss became non-finite in epoch {epoch}")]
    NonFiniteLoss { epoch: usize },

    #[error("Checkpoint failed: {0}")]
    Checkpoint(String),

    #[error("File IO error: {0}")]
    Io(#[from] std::io::Error),
}

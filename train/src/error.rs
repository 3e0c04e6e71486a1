use thiserror::Error;

use crate::reduce::ReduceError;

pub type Result<T> = std::result::Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Stage {stage}: prediction has {predicted} channels but the target has {target}")]
    ShapeMismatch {
        stage: usize,
        predicted: usize,
        target: usize,
    },

    #[error("Got {outputs} output stages but {targets} target stages")]
    StageCountMismatch { outputs: usize, targets: usize },

    #[error("Test batches must hold exactly one sample, got {0}")]
    BatchSize(usize),

    #[error("Batch is missing its ground truth image")]
    MissingGroundTruth,

    #[error("Data source yielded no batches")]
    EmptyDataSource,

    #[error("Loss bundle has no entries")]
    EmptyLossBundle,

    #[error("Another worker of the group failed")]
    PeerFailed,

    #[error("Metric reduction failed: {0}")]
    Reduce(#[from] ReduceError),

    #[error("Failed to read tensor data: {0}")]
    TensorData(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("File IO error: {0}")]
    Io(#[from] std::io::Error),
}

use std::path::PathBuf;
use thiserror::Error;

pub(crate) type Result<T> = std::result::Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("File IO error: {0}")]
    File(#[from] std::io::Error),

    #[error("Image error: {0}")]
    InvalidImage(#[from] image::ImageError),

    #[error("No image frames found in {0:?}")]
    NoFrames(PathBuf),

    #[error("Frame {index} is {found:?} but the first frame is {expected:?}")]
    SizeMismatch {
        index: usize,
        found: [u32; 2],
        expected: [u32; 2],
    },

    #[error("Got {found} frame indices for {expected} frames")]
    IndexCountMismatch { expected: usize, found: usize },
}

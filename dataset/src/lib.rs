use std::path::Path;
use std::sync::Arc;

use image::DynamicImage;

use crate::error::Result;
use crate::filesystem::Filesystem;
use crate::frame::FrameFile;

mod batch;
mod config;
mod error;
mod filesystem;
mod frame;
mod loader;

pub use batch::{DataSource, FrameBatch};
pub use config::LoadConfig;
pub use error::DatasetError;
pub use frame::{frame_to_tensor, prepare_frame};
pub use loader::FrameLoader;

/// The frames of one video, each tagged with a normalized time position.
#[derive(Clone)]
pub struct FrameDataset {
    frames: Arc<Vec<DynamicImage>>,
    frame_idx: Arc<Vec<f32>>,
}

impl FrameDataset {
    /// Loads every image file in `dir`, sorted by file name.
    pub async fn load(dir: &Path, config: &LoadConfig) -> Result<Self> {
        let fs = Filesystem::new(dir.to_path_buf());
        let files: Vec<FrameFile> = fs
            .image_files()
            .iter()
            .step_by(config.subsample_frames.unwrap_or(1).max(1))
            .take(config.max_frames.unwrap_or(usize::MAX))
            .map(|path| FrameFile::new(path))
            .collect();

        if files.is_empty() {
            return Err(DatasetError::NoFrames(fs.root().to_path_buf()));
        }

        log::info!("Loading {} frames from {:?}", files.len(), fs.root());
        let mut frames = Vec::with_capacity(files.len());
        for file in &files {
            frames.push(file.load(config).await?);
        }
        Self::from_images(frames, None)
    }

    /// Builds a dataset from decoded frames. Without explicit indices, frame `i`
    /// of `n` sits at `i / (n - 1)`.
    pub fn from_images(frames: Vec<DynamicImage>, frame_idx: Option<&[f32]>) -> Result<Self> {
        if let Some(first) = frames.first() {
            let expected = [first.width(), first.height()];
            for (index, frame) in frames.iter().enumerate() {
                let found = [frame.width(), frame.height()];
                if found != expected {
                    return Err(DatasetError::SizeMismatch {
                        index,
                        found,
                        expected,
                    });
                }
            }
        }

        let frame_idx = match frame_idx {
            Some(raw) if raw.len() != frames.len() => {
                return Err(DatasetError::IndexCountMismatch {
                    expected: frames.len(),
                    found: raw.len(),
                });
            }
            Some(raw) => normalize_indices(raw),
            None => uniform_indices(frames.len()),
        };

        Ok(Self {
            frames: Arc::new(frames),
            frame_idx: Arc::new(frame_idx),
        })
    }

    /// A dataset of `num_frames` evenly spaced positions without ground truth,
    /// for pure inference.
    pub fn indices_only(num_frames: usize) -> Self {
        Self {
            frames: Arc::new(Vec::new()),
            frame_idx: Arc::new(uniform_indices(num_frames)),
        }
    }

    pub fn len(&self) -> usize {
        self.frame_idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_idx.is_empty()
    }

    pub fn has_ground_truth(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn frame_index(&self, index: usize) -> f32 {
        self.frame_idx[index]
    }

    pub fn image(&self, index: usize) -> Option<&DynamicImage> {
        self.frames.get(index)
    }

    /// [width, height] shared by all frames.
    pub fn image_size(&self) -> Option<[u32; 2]> {
        self.frames.first().map(|f| [f.width(), f.height()])
    }
}

fn uniform_indices(num_frames: usize) -> Vec<f32> {
    if num_frames <= 1 {
        return vec![0.0; num_frames];
    }
    let last = (num_frames - 1) as f32;
    (0..num_frames).map(|i| i as f32 / last).collect()
}

// Min-max normalization so the first frame sits at 0 and the last at 1.
fn normalize_indices(raw: &[f32]) -> Vec<f32> {
    let min = raw.iter().copied().fold(f32::INFINITY, f32::min);
    let max = raw.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    if range > 0.0 {
        raw.iter().map(|x| (x - min) / range).collect()
    } else {
        vec![0.0; raw.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn frame(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([10, 20, 30])))
    }

    #[test]
    fn uniform_indices_span_unit_range() {
        assert_eq!(uniform_indices(5), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(uniform_indices(1), vec![0.0]);
        assert!(uniform_indices(0).is_empty());
    }

    #[test]
    fn explicit_indices_are_min_max_normalized() {
        let ds = FrameDataset::from_images(vec![frame(2, 2); 3], Some(&[10.0, 30.0, 20.0])).unwrap();
        assert_eq!(ds.frame_index(0), 0.0);
        assert_eq!(ds.frame_index(1), 1.0);
        assert_eq!(ds.frame_index(2), 0.5);
    }

    #[test]
    fn rejects_mismatched_index_count() {
        let err = FrameDataset::from_images(vec![frame(2, 2); 2], Some(&[0.0])).err();
        assert!(matches!(
            err,
            Some(DatasetError::IndexCountMismatch {
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn rejects_mixed_frame_sizes() {
        let err = FrameDataset::from_images(vec![frame(2, 2), frame(4, 2)], None).err();
        assert!(matches!(err, Some(DatasetError::SizeMismatch { index: 1, .. })));
    }

    #[tokio::test]
    async fn loads_frames_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            frame(6, 4)
                .save(dir.path().join(format!("frame_{i:03}.png")))
                .unwrap();
        }

        let config = LoadConfig::new().with_subsample_frames(Some(2));
        let ds = FrameDataset::load(dir.path(), &config).await.unwrap();

        assert_eq!(ds.len(), 2);
        assert!(ds.has_ground_truth());
        assert_eq!(ds.image_size(), Some([6, 4]));
        assert_eq!(ds.frame_index(1), 1.0);
    }

    #[tokio::test]
    async fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FrameDataset::load(dir.path(), &LoadConfig::new()).await.err();
        assert!(matches!(err, Some(DatasetError::NoFrames(_))));
    }
}

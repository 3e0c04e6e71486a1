use std::path::{Path, PathBuf};

use burn::prelude::{Backend, Tensor, TensorData};
use image::DynamicImage;
use image::imageops::FilterType;

use crate::config::LoadConfig;

#[derive(Clone, Debug)]
pub struct FrameFile {
    pub path: PathBuf,
}

impl FrameFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub async fn load(&self, config: &LoadConfig) -> image::ImageResult<DynamicImage> {
        let bytes = tokio::fs::read(&self.path).await?;
        let img = image::load_from_memory(&bytes)?;
        Ok(prepare_frame(img, config))
    }
}

/// Applies the configured resize and orientation to a decoded frame.
pub fn prepare_frame(img: DynamicImage, config: &LoadConfig) -> DynamicImage {
    let img = match config.image_size {
        Some([w, h]) if img.width() != w || img.height() != h => {
            img.resize_exact(w, h, FilterType::Triangle)
        }
        _ => img,
    };

    if config.force_landscape && img.height() > img.width() {
        // A transpose is a clockwise rotation followed by a horizontal flip.
        img.rotate90().fliph()
    } else {
        img
    }
}

// Converts a frame to a [C, H, W] tensor with values in [0, 1].
pub fn frame_to_tensor<B: Backend>(frame: &DynamicImage, device: &B::Device) -> Tensor<B, 3> {
    let (w, h) = (frame.width() as usize, frame.height() as usize);
    let data = TensorData::new(frame.to_rgb32f().into_vec(), [h, w, 3]);
    Tensor::<B, 3>::from_data(data, device).permute([2, 0, 1])
}

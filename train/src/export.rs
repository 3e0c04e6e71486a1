use std::path::Path;

use image::{DynamicImage, GrayImage, Rgb32FImage, Rgba32FImage};

use crate::error::{Result, TrainError};
use crate::report::ImageSnapshot;

/// File name of the `index`th test reconstruction.
pub fn frame_file_name(index: usize) -> String {
    format!("img_recon{index:03}.png")
}

/// File name of the reconstruction exported after evaluating `epoch`.
pub fn epoch_file_name(epoch: usize) -> String {
    format!("img_recon_e{epoch:03}.png")
}

/// Converts to an 8 bit image. Values are clamped to [0, 1].
pub fn snapshot_to_image(snapshot: &ImageSnapshot) -> Result<DynamicImage> {
    let ImageSnapshot {
        channels,
        height,
        width,
        data,
    } = snapshot;
    let plane = height * width;
    let (w, h) = (*width as u32, *height as u32);

    // [C, H, W] -> [H, W, C]
    let interleaved = |c: usize| -> Vec<f32> {
        (0..plane)
            .flat_map(|p| (0..c).map(move |ch| data[ch * plane + p].clamp(0.0, 1.0)))
            .collect()
    };

    let invalid = || TrainError::TensorData(format!("Can't build a {channels}x{height}x{width} image"));
    if data.len() != channels * plane {
        return Err(invalid());
    }

    let img = match *channels {
        1 => {
            let bytes = interleaved(1).into_iter().map(|v| (v * 255.0).round() as u8).collect();
            DynamicImage::from(GrayImage::from_raw(w, h, bytes).ok_or_else(invalid)?)
        }
        3 => DynamicImage::from(Rgb32FImage::from_raw(w, h, interleaved(3)).ok_or_else(invalid)?).to_rgb8().into(),
        4 => DynamicImage::from(Rgba32FImage::from_raw(w, h, interleaved(4)).ok_or_else(invalid)?).to_rgba8().into(),
        _ => return Err(invalid()),
    };
    Ok(img)
}

/// Writes a lossless PNG, creating parent directories as needed.
pub fn save_png(snapshot: &ImageSnapshot, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    log::debug!("Saving image to {path:?}");
    snapshot_to_image(snapshot)?.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}

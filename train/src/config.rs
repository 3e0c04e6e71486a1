use burn::prelude::Config;

use crate::loss::LossKind;
use crate::lr::LrConfig;

#[derive(Config, Debug)]
pub struct TrainConfig {
    /// Reconstruction loss applied to every output stage.
    #[config(default = "LossKind::L2")]
    pub loss: LossKind,

    /// Total number of epochs to train for.
    #[config(default = 150)]
    pub epochs: usize,

    /// Log a progress line every this many batches, and at the last batch.
    #[config(default = 50)]
    pub print_interval: usize,

    #[config(default = "LrConfig::new()")]
    pub lr: LrConfig,

    /// Peak pixel value. 1.0 for normalized images, 255.0 for bytes.
    #[config(default = 1.0)]
    pub psnr_peak: f64,

    /// PSNR reported for a perfect reconstruction. Also the upper bound of any score.
    #[config(default = 100.0)]
    pub psnr_sentinel: f64,

    /// Size of the Gaussian SSIM window. Even sizes are rounded up.
    #[config(default = 11)]
    pub ssim_window: usize,
}

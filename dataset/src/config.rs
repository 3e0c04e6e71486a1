use burn::prelude::Config;

#[derive(Config, Debug)]
pub struct LoadConfig {
    /// Resize every frame to this [width, height] before use.
    pub image_size: Option<[u32; 2]>,
    /// Transpose portrait frames so every frame tensor is landscape.
    #[config(default = true)]
    pub force_landscape: bool,
    /// Max nr. of frames to load, counted after sorting by file name.
    pub max_frames: Option<usize>,
    /// Load only every nth frame
    pub subsample_frames: Option<usize>,
}

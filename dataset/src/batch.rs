use burn::prelude::{Backend, Tensor};

/// One batch of frames as consumed by a reconstruction model.
#[derive(Clone, Debug)]
pub struct FrameBatch<B: Backend> {
    /// Normalized time position of every frame, shape [N].
    pub frame_index: Tensor<B, 1>,
    /// Ground truth frames, shape [N, C, H, W]. Absent for index-only datasets.
    pub image_gt: Option<Tensor<B, 4>>,
    /// Position of every frame in the dataset.
    pub indices: Vec<usize>,
}

impl<B: Backend> FrameBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.frame_index.dims()[0]
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            frame_index: self.frame_index.to_device(device),
            image_gt: self.image_gt.map(|img| img.to_device(device)),
            indices: self.indices,
        }
    }
}

/// A finite, restartable sequence of batches.
pub trait DataSource<B: Backend> {
    /// Number of batches a single pass yields.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured number of samples per batch. The last batch may be smaller.
    fn batch_size(&self) -> usize;

    /// Starts a pass over the data. The epoch seeds any shuffling, so the same
    /// epoch always yields the same order.
    fn batches(&self, epoch: usize) -> Box<dyn Iterator<Item = FrameBatch<B>> + '_>;
}

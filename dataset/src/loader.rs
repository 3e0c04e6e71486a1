use burn::prelude::{Backend, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::FrameDataset;
use crate::batch::{DataSource, FrameBatch};
use crate::frame::frame_to_tensor;

/// Batches a [`FrameDataset`] onto a device.
pub struct FrameLoader<B: Backend> {
    dataset: FrameDataset,
    batch_size: usize,
    shuffle_seed: Option<u64>,
    shard: Option<(usize, usize)>,
    device: B::Device,
}

impl<B: Backend> FrameLoader<B> {
    pub fn new(dataset: FrameDataset, batch_size: usize, device: &B::Device) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle_seed: None,
            shard: None,
            device: device.clone(),
        }
    }

    /// Shuffle the frame order every epoch, seeded by `seed + epoch`.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    /// Only yield the frames owned by `rank` out of `world_size` workers. All
    /// workers must use the same shuffle seed so the shards stay disjoint.
    pub fn with_shard(mut self, rank: usize, world_size: usize) -> Self {
        if world_size > 1 {
            self.shard = Some((rank, world_size));
        }
        self
    }

    pub fn dataset(&self) -> &FrameDataset {
        &self.dataset
    }

    fn order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        match self.shard {
            Some((rank, world_size)) => order
                .into_iter()
                .enumerate()
                .filter(|(i, _)| i % world_size == rank)
                .map(|(_, index)| index)
                .collect(),
            None => order,
        }
    }

    fn make_batch(&self, indices: &[usize]) -> FrameBatch<B> {
        let positions: Vec<f32> = indices
            .iter()
            .map(|&i| self.dataset.frame_index(i))
            .collect();
        let frame_index = Tensor::from_floats(positions.as_slice(), &self.device);

        let image_gt = if self.dataset.has_ground_truth() {
            let frames: Vec<Tensor<B, 4>> = indices
                .iter()
                .filter_map(|&i| self.dataset.image(i))
                .map(|img| frame_to_tensor::<B>(img, &self.device).unsqueeze())
                .collect();
            Some(Tensor::cat(frames, 0))
        } else {
            None
        };

        FrameBatch {
            frame_index,
            image_gt,
            indices: indices.to_vec(),
        }
    }
}

impl<B: Backend> DataSource<B> for FrameLoader<B> {
    fn len(&self) -> usize {
        self.order(0).len().div_ceil(self.batch_size)
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn batches(&self, epoch: usize) -> Box<dyn Iterator<Item = FrameBatch<B>> + '_> {
        let order = self.order(epoch);
        let chunks: Vec<Vec<usize>> = order
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        Box::new(chunks.into_iter().map(move |chunk| self.make_batch(&chunk)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::{DynamicImage, Rgb, RgbImage};

    type Backend = NdArray;

    fn dataset(frames: usize) -> FrameDataset {
        let images = (0..frames)
            .map(|i| DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 2, Rgb([i as u8; 3]))))
            .collect();
        FrameDataset::from_images(images, None).unwrap()
    }

    #[test]
    fn batches_cover_every_frame_once() {
        let loader = FrameLoader::<Backend>::new(dataset(5), 2, &Default::default());
        assert_eq!(loader.len(), 3);

        let batches: Vec<_> = loader.batches(0).collect();
        let sizes: Vec<_> = batches.iter().map(|b| b.batch_size()).collect();
        assert_eq!(sizes, [2, 2, 1]);
        assert_eq!(batches[0].image_gt.as_ref().unwrap().dims(), [2, 3, 2, 4]);

        let seen: Vec<_> = batches.iter().flat_map(|b| b.indices.clone()).collect();
        assert_eq!(seen, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn shuffle_is_deterministic_per_epoch() {
        let loader = FrameLoader::<Backend>::new(dataset(16), 16, &Default::default()).with_shuffle(7);
        let first: Vec<_> = loader.batches(3).flat_map(|b| b.indices).collect();
        let again: Vec<_> = loader.batches(3).flat_map(|b| b.indices).collect();
        assert_eq!(first, again);

        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn shards_are_disjoint() {
        let device = Default::default();
        let rank0 = FrameLoader::<Backend>::new(dataset(5), 1, &device).with_shard(0, 2);
        let rank1 = FrameLoader::<Backend>::new(dataset(5), 1, &device).with_shard(1, 2);

        let a: Vec<_> = rank0.batches(0).flat_map(|b| b.indices).collect();
        let b: Vec<_> = rank1.batches(0).flat_map(|b| b.indices).collect();
        assert_eq!(a, [0, 2, 4]);
        assert_eq!(b, [1, 3]);
    }

    #[test]
    fn index_only_batches_have_no_ground_truth() {
        let loader = FrameLoader::<Backend>::new(FrameDataset::indices_only(3), 1, &Default::default());
        let batch = loader.batches(0).last().unwrap();
        assert!(batch.image_gt.is_none());
        let index = batch.frame_index.into_data().to_vec::<f32>().unwrap();
        assert_eq!(index, vec![1.0]);
    }
}

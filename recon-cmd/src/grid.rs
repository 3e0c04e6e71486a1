use std::collections::BTreeMap;

use burn::module::Param;
use burn::prelude::{Backend, Config, Module, Tensor};
use burn::tensor::Distribution;
use burn::tensor::module::adaptive_avg_pool2d;
use dataset::FrameBatch;
use train::model::{ModelOutput, ReconstructionModel};

#[derive(Config, Debug)]
pub struct FrameGridConfig {
    /// Height of the finest output stage.
    pub height: usize,
    /// Width of the finest output stage.
    pub width: usize,

    /// Nr. of learned keyframes spread evenly over the video.
    #[config(default = 16)]
    pub keyframes: usize,

    #[config(default = 3)]
    pub channels: usize,

    /// Nr. of output stages, each half the resolution of the next.
    #[config(default = 2)]
    pub stages: usize,

    /// Weight of the difference between neighbouring keyframes. 0 disables the term.
    #[config(default = 0.0)]
    pub smoothness_weight: f32,
}

/// A video as a stack of keyframes, linearly blended between neighbours.
#[derive(Module, Debug)]
pub struct FrameGrid<B: Backend> {
    /// [K, C, H, W]
    keyframes: Param<Tensor<B, 4>>,
    stages: usize,
    smoothness_weight: f32,
}

impl FrameGridConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FrameGrid<B> {
        let shape = [self.keyframes.max(1), self.channels, self.height, self.width];
        FrameGrid {
            keyframes: Param::from_tensor(Tensor::random(shape, Distribution::Uniform(0.4, 0.6), device)),
            stages: self.stages.max(1),
            smoothness_weight: self.smoothness_weight,
        }
    }
}

impl<B: Backend> FrameGrid<B> {
    /// Triangular blend weights, [N, K]. Every row sums to one for indices in [0, 1].
    fn blend_weights(&self, frame_index: Tensor<B, 1>) -> Tensor<B, 2> {
        let [k, _, _, _] = self.keyframes.dims();
        let n = frame_index.dims()[0];
        if k == 1 {
            return Tensor::ones([n, 1], &frame_index.device());
        }
        let spacing = (k - 1) as f32;
        let positions = Tensor::<B, 1, burn::tensor::Int>::arange(0..k as i64, &frame_index.device())
            .float()
            .div_scalar(spacing)
            .reshape([1, k]);
        let distance = (frame_index.clamp(0.0, 1.0).reshape([n, 1]) - positions).abs() * spacing;
        (distance.neg() + 1.0).clamp_min(0.0)
    }

    /// Total squared difference between neighbouring keyframes.
    fn smooth_loss(&self) -> Tensor<B, 1> {
        let keyframes = self.keyframes.val();
        let [k, c, h, w] = keyframes.dims();
        let next = keyframes.clone().slice([1..k, 0..c, 0..h, 0..w]);
        let prev = keyframes.slice([0..k - 1, 0..c, 0..h, 0..w]);
        (next - prev).powi_scalar(2).mean() * self.smoothness_weight
    }

    /// Full resolution frames, [N, C, H, W].
    pub fn frames(&self, frame_index: Tensor<B, 1>) -> Tensor<B, 4> {
        let [k, c, h, w] = self.keyframes.dims();
        let n = frame_index.dims()[0];
        let weights = self.blend_weights(frame_index);
        weights
            .matmul(self.keyframes.val().reshape([k, c * h * w]))
            .reshape([n, c, h, w])
    }
}

impl<B: Backend> ReconstructionModel<B> for FrameGrid<B> {
    fn forward(&self, batch: &FrameBatch<B>) -> ModelOutput<B> {
        let full = self.frames(batch.frame_index.clone());
        let [_, _, h, w] = full.dims();

        // Coarsest first.
        let outputs: Vec<_> = (0..self.stages)
            .rev()
            .map(|level| {
                let factor = 1 << level;
                if factor == 1 {
                    full.clone()
                } else {
                    adaptive_avg_pool2d(full.clone(), [(h / factor).max(1), (w / factor).max(1)])
                }
            })
            .collect();

        let [k, _, _, _] = self.keyframes.dims();
        if self.smoothness_weight > 0.0 && k > 1 {
            ModelOutput::WithLosses {
                outputs,
                losses: BTreeMap::from([("smooth_loss".to_owned(), self.smooth_loss())]),
            }
        } else {
            ModelOutput::Plain(outputs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use train::pyramid::stage_sizes;

    type Backend = NdArray;

    fn batch(indices: &[f32]) -> FrameBatch<Backend> {
        FrameBatch {
            frame_index: Tensor::from_floats(indices, &Default::default()),
            image_gt: None,
            indices: (0..indices.len()).collect(),
        }
    }

    fn values<const D: usize>(t: Tensor<Backend, D>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn stages_halve_resolution() {
        let grid = FrameGridConfig::new(8, 12).with_stages(3).init::<Backend>(&Default::default());
        let outputs = grid.forward(&batch(&[0.0, 0.5])).into_outputs();
        assert_eq!(stage_sizes(&outputs), [[2, 3], [4, 6], [8, 12]]);
        assert_eq!(outputs[2].dims(), [2, 3, 8, 12]);
    }

    #[test]
    fn weights_are_a_partition_of_unity() {
        let grid = FrameGridConfig::new(2, 2).with_keyframes(5).init::<Backend>(&Default::default());
        let weights = grid.blend_weights(batch(&[0.0, 0.1, 0.5, 0.99, 1.0]).frame_index);
        for row in values(weights.sum_dim(1)) {
            assert!((row - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn keyframe_positions_reproduce_keyframes() {
        let grid = FrameGridConfig::new(2, 3).with_keyframes(3).init::<Backend>(&Default::default());
        let keyframes = values(grid.keyframes.val());
        let frames = values(grid.frames(batch(&[0.0, 0.5, 1.0]).frame_index));
        for (a, b) in keyframes.iter().zip(&frames) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn smoothness_adds_an_auxiliary_loss() {
        let device = Default::default();
        let plain = FrameGridConfig::new(4, 4).init::<Backend>(&device);
        assert!(matches!(plain.forward(&batch(&[0.2])), ModelOutput::Plain(_)));

        let smooth = FrameGridConfig::new(4, 4)
            .with_smoothness_weight(0.5)
            .init::<Backend>(&device);
        let (_, losses) = smooth.forward(&batch(&[0.2])).into_parts();
        assert!(values(losses["smooth_loss"].clone())[0] > 0.0);
    }
}

//! Helpers for multi-stage output pyramids: ordered `[N, C, H, W]` tensors, one
//! per model stage, coarsest first.

use burn::prelude::{Backend, Tensor};
use burn::tensor::module::adaptive_avg_pool2d;

use crate::error::{Result, TrainError};

/// Area-downsamples the ground truth to the spatial size of every output stage.
pub fn target_pyramid<B: Backend>(outputs: &[Tensor<B, 4>], gt: &Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
    let [_, _, gt_h, gt_w] = gt.dims();
    outputs
        .iter()
        .map(|output| {
            let [_, _, h, w] = output.dims();
            if [h, w] == [gt_h, gt_w] {
                gt.clone()
            } else {
                adaptive_avg_pool2d(gt.clone(), [h, w])
            }
        })
        .collect()
}

/// Spatial [height, width] of every stage.
pub fn stage_sizes<B: Backend>(outputs: &[Tensor<B, 4>]) -> Vec<[usize; 2]> {
    outputs
        .iter()
        .map(|output| {
            let [_, _, h, w] = output.dims();
            [h, w]
        })
        .collect()
}

pub(crate) fn check_pyramids<B: Backend>(outputs: &[Tensor<B, 4>], targets: &[Tensor<B, 4>]) -> Result<()> {
    if outputs.len() != targets.len() {
        return Err(TrainError::StageCountMismatch {
            outputs: outputs.len(),
            targets: targets.len(),
        });
    }
    for (stage, (output, target)) in outputs.iter().zip(targets).enumerate() {
        let predicted = output.dims()[1];
        let target = target.dims()[1];
        if predicted != target {
            return Err(TrainError::ShapeMismatch {
                stage,
                predicted,
                target,
            });
        }
    }
    Ok(())
}

/// The first sample of a batch as a [C, H, W] image.
pub(crate) fn first_sample<B: Backend>(batch: Tensor<B, 4>) -> Tensor<B, 3> {
    let [_, c, h, w] = batch.dims();
    batch.slice([0..1, 0..c, 0..h, 0..w]).reshape([c, h, w])
}

pub(crate) fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| TrainError::TensorData(format!("{e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type Backend = NdArray;

    #[test]
    fn targets_match_stage_sizes() {
        let device = Default::default();
        let gt = Tensor::<Backend, 4>::ones([2, 3, 8, 12], &device);
        let outputs = vec![
            Tensor::<Backend, 4>::zeros([2, 3, 4, 6], &device),
            Tensor::<Backend, 4>::zeros([2, 3, 8, 12], &device),
        ];

        let targets = target_pyramid(&outputs, &gt);
        assert_eq!(stage_sizes(&targets), [[4, 6], [8, 12]]);
        assert!(check_pyramids(&outputs, &targets).is_ok());
    }

    #[test]
    fn area_downsampling_averages_blocks() {
        let device = Default::default();
        let gt = Tensor::<Backend, 1>::from_floats([1.0, 3.0, 5.0, 7.0].as_slice(), &device).reshape([1, 1, 2, 2]);
        let output = Tensor::<Backend, 4>::zeros([1, 1, 1, 1], &device);

        let target = target_pyramid(&[output], &gt).remove(0);
        assert_eq!(to_host(target).unwrap(), vec![4.0]);
    }

    #[test]
    fn channel_mismatch_is_reported_per_stage() {
        let device = Default::default();
        let outputs = vec![
            Tensor::<Backend, 4>::zeros([1, 3, 2, 2], &device),
            Tensor::<Backend, 4>::zeros([1, 1, 4, 4], &device),
        ];
        let targets = vec![
            Tensor::<Backend, 4>::zeros([1, 3, 2, 2], &device),
            Tensor::<Backend, 4>::zeros([1, 3, 4, 4], &device),
        ];

        let err = check_pyramids(&outputs, &targets).unwrap_err();
        assert!(matches!(
            err,
            TrainError::ShapeMismatch {
                stage: 1,
                predicted: 1,
                target: 3
            }
        ));
    }

    #[test]
    fn stage_count_mismatch() {
        let device = Default::default();
        let outputs = vec![Tensor::<Backend, 4>::zeros([1, 3, 2, 2], &device)];
        let err = check_pyramids(&outputs, &[]).unwrap_err();
        assert!(matches!(
            err,
            TrainError::StageCountMismatch {
                outputs: 1,
                targets: 0
            }
        ));
    }
}

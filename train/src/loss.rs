use std::collections::BTreeMap;

use burn::prelude::{Backend, Tensor};
use burn::tensor::ElementConversion;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};
use crate::pyramid::check_pyramids;
use crate::ssim::Ssim;

/// Per stage reconstruction loss. Fusions are weighted sums of L2, L1 and the
/// structural dissimilarity `1 - ssim`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum LossKind {
    L2,
    L1,
    Ssim,
    /// 0.3 L2 + 0.7 SSIM
    Fusion1,
    /// 0.3 L1 + 0.7 SSIM
    Fusion2,
    /// 0.5 L2 + 0.5 SSIM
    Fusion3,
    /// 0.5 L1 + 0.5 SSIM
    Fusion4,
    /// 0.7 L2 + 0.3 SSIM
    Fusion5,
    /// 0.7 L1 + 0.3 SSIM
    Fusion6,
    /// 0.7 L2 + 0.3 L1
    Fusion7,
    /// 0.5 L2 + 0.5 L1
    Fusion8,
}

impl LossKind {
    // Weights of the (l2, l1, ssim) terms.
    fn weights(self) -> (f32, f32, f32) {
        match self {
            LossKind::L2 => (1.0, 0.0, 0.0),
            LossKind::L1 => (0.0, 1.0, 0.0),
            LossKind::Ssim => (0.0, 0.0, 1.0),
            LossKind::Fusion1 => (0.3, 0.0, 0.7),
            LossKind::Fusion2 => (0.0, 0.3, 0.7),
            LossKind::Fusion3 => (0.5, 0.0, 0.5),
            LossKind::Fusion4 => (0.0, 0.5, 0.5),
            LossKind::Fusion5 => (0.7, 0.0, 0.3),
            LossKind::Fusion6 => (0.0, 0.7, 0.3),
            LossKind::Fusion7 => (0.7, 0.3, 0.0),
            LossKind::Fusion8 => (0.5, 0.5, 0.0),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LossTerm<B: Backend> {
    pub name: String,
    pub value: Tensor<B, 1>,
    /// Contributed by the model rather than computed against a target stage.
    pub auxiliary: bool,
}

/// Named scalar loss terms whose sum is the optimized loss.
#[derive(Clone, Debug)]
pub struct LossBundle<B: Backend> {
    terms: Vec<LossTerm<B>>,
}

impl<B: Backend> Default for LossBundle<B> {
    fn default() -> Self {
        Self { terms: Vec::new() }
    }
}

impl<B: Backend> LossBundle<B> {
    pub fn push(&mut self, name: impl Into<String>, value: Tensor<B, 1>, auxiliary: bool) {
        self.terms.push(LossTerm {
            name: name.into(),
            value,
            auxiliary,
        });
    }

    pub fn terms(&self) -> &[LossTerm<B>] {
        &self.terms
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Sum of all terms.
    pub fn total(&self) -> Result<Tensor<B, 1>> {
        let mut terms = self.terms.iter().map(|t| t.value.clone());
        let first = terms.next().ok_or(TrainError::EmptyLossBundle)?;
        Ok(terms.fold(first, |acc, v| acc + v))
    }

    /// Host values of the auxiliary terms.
    pub fn auxiliary_values(&self) -> BTreeMap<String, f64> {
        self.terms
            .iter()
            .filter(|t| t.auxiliary)
            .map(|t| (t.name.clone(), t.value.clone().into_scalar().elem::<f64>()))
            .collect()
    }
}

/// Builds the loss bundle of one batch.
#[derive(Clone, Debug)]
pub struct LossAssembler {
    kind: LossKind,
    ssim: Ssim,
}

impl LossAssembler {
    pub fn new(kind: LossKind, ssim_window: usize, data_range: f32) -> Self {
        Self {
            kind,
            ssim: Ssim::new(ssim_window, data_range),
        }
    }

    pub fn kind(&self) -> LossKind {
        self.kind
    }

    /// One `stage{i}_loss` term per stage followed by the model's auxiliary losses.
    pub fn assemble<B: Backend>(
        &self,
        outputs: &[Tensor<B, 4>],
        targets: &[Tensor<B, 4>],
        auxiliary: BTreeMap<String, Tensor<B, 1>>,
    ) -> Result<LossBundle<B>> {
        check_pyramids(outputs, targets)?;

        let mut bundle = LossBundle::default();
        for (stage, (output, target)) in outputs.iter().zip(targets).enumerate() {
            let loss = self.stage_loss(output.clone(), target.clone());
            bundle.push(format!("stage{stage}_loss"), loss, false);
        }
        for (name, value) in auxiliary {
            bundle.push(name, value, true);
        }

        if bundle.is_empty() {
            return Err(TrainError::EmptyLossBundle);
        }
        Ok(bundle)
    }

    fn stage_loss<B: Backend>(&self, pred: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
        let (w_l2, w_l1, w_ssim) = self.kind.weights();
        let diff = pred.clone() - target.clone();

        let mut loss = Tensor::zeros([1], &pred.device());
        if w_l2 > 0.0 {
            loss = loss + diff.clone().powi_scalar(2).mean() * w_l2;
        }
        if w_l1 > 0.0 {
            loss = loss + diff.abs().mean() * w_l1;
        }
        if w_ssim > 0.0 {
            let ssim = self.ssim.ssim(pred, target).mean();
            loss = loss + (ssim.neg() + 1.0) * w_ssim;
        }
        loss
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type Backend = NdArray;

    fn scalar(t: Tensor<Backend, 1>) -> f32 {
        t.into_scalar()
    }

    fn pair() -> (Tensor<Backend, 4>, Tensor<Backend, 4>) {
        let device = Default::default();
        (
            Tensor::full([1, 3, 4, 4], 0.75, &device),
            Tensor::full([1, 3, 4, 4], 0.25, &device),
        )
    }

    #[test]
    fn l2_and_l1_per_stage() {
        let (pred, target) = pair();
        let l2 = LossAssembler::new(LossKind::L2, 11, 1.0)
            .assemble(&[pred.clone()], &[target.clone()], BTreeMap::new())
            .unwrap();
        let l1 = LossAssembler::new(LossKind::L1, 11, 1.0)
            .assemble(&[pred], &[target], BTreeMap::new())
            .unwrap();

        assert_eq!(l2.terms()[0].name, "stage0_loss");
        assert!((scalar(l2.total().unwrap()) - 0.25).abs() < 1e-6);
        assert!((scalar(l1.total().unwrap()) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn fusions_weigh_their_terms() {
        let (pred, target) = pair();
        let total = |kind| {
            let bundle = LossAssembler::new(kind, 11, 1.0)
                .assemble(&[pred.clone()], &[target.clone()], BTreeMap::new())
                .unwrap();
            scalar(bundle.total().unwrap())
        };
        // L2 is 0.25 and L1 is 0.5 for this pair.
        assert!((total(LossKind::Fusion7) - 0.325).abs() < 1e-6);
        assert!((total(LossKind::Fusion8) - 0.375).abs() < 1e-6);
        for kind in [LossKind::Ssim, LossKind::Fusion1, LossKind::Fusion6] {
            let value = total(kind);
            assert!(value.is_finite() && value > 0.0, "{kind:?}: {value}");
        }
    }

    #[test]
    fn ssim_loss_is_zero_for_identical_images() {
        let (pred, _) = pair();
        let bundle = LossAssembler::new(LossKind::Ssim, 11, 1.0)
            .assemble(&[pred.clone()], &[pred], BTreeMap::new())
            .unwrap();
        assert!(scalar(bundle.total().unwrap()).abs() < 1e-6);
    }

    #[test]
    fn total_is_sum_of_entries() {
        let device = Default::default();
        let (pred, target) = pair();
        let outputs = vec![pred.clone(), pred];
        let targets = vec![target.clone(), target];

        for aux_count in 0..3 {
            let aux: BTreeMap<_, _> = (0..aux_count)
                .map(|i| {
                    (
                        format!("aux{i}_loss"),
                        Tensor::<Backend, 1>::from_floats([0.5 + i as f32].as_slice(), &device),
                    )
                })
                .collect();

            let bundle = LossAssembler::new(LossKind::Fusion8, 11, 1.0)
                .assemble(&outputs, &targets, aux)
                .unwrap();
            assert_eq!(bundle.len(), 2 + aux_count);
            assert_eq!(bundle.auxiliary_values().len(), aux_count);

            let sum: f32 = bundle.terms().iter().map(|t| scalar(t.value.clone())).sum();
            assert!((scalar(bundle.total().unwrap()) - sum).abs() < 1e-6);
        }
    }

    #[test]
    fn channel_mismatch_fails() {
        let device = Default::default();
        let pred = Tensor::<Backend, 4>::zeros([1, 1, 4, 4], &device);
        let target = Tensor::<Backend, 4>::zeros([1, 3, 4, 4], &device);
        let err = LossAssembler::new(LossKind::L2, 11, 1.0)
            .assemble(&[pred], &[target], BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, TrainError::ShapeMismatch { stage: 0, .. }));
    }

    #[test]
    fn empty_bundle_fails() {
        let err = LossAssembler::new(LossKind::L2, 11, 1.0)
            .assemble::<Backend>(&[], &[], BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, TrainError::EmptyLossBundle));
    }
}

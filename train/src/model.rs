use std::collections::BTreeMap;

use burn::prelude::{Backend, Tensor};
use dataset::FrameBatch;

/// What a forward pass produced: either only the output pyramid, or the pyramid
/// together with named auxiliary losses computed by the model itself.
#[derive(Clone, Debug)]
pub enum ModelOutput<B: Backend> {
    Plain(Vec<Tensor<B, 4>>),
    WithLosses {
        outputs: Vec<Tensor<B, 4>>,
        losses: BTreeMap<String, Tensor<B, 1>>,
    },
}

impl<B: Backend> ModelOutput<B> {
    pub fn into_parts(self) -> (Vec<Tensor<B, 4>>, BTreeMap<String, Tensor<B, 1>>) {
        match self {
            ModelOutput::Plain(outputs) => (outputs, BTreeMap::new()),
            ModelOutput::WithLosses { outputs, losses } => (outputs, losses),
        }
    }

    pub fn into_outputs(self) -> Vec<Tensor<B, 4>> {
        self.into_parts().0
    }
}

/// A model mapping a batch of frame indices to an output pyramid, coarsest stage first.
pub trait ReconstructionModel<B: Backend> {
    fn forward(&self, batch: &FrameBatch<B>) -> ModelOutput<B>;
}

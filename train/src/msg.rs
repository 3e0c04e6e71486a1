use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::metrics::MetricTable;
use crate::reduce::{DistributedReducer, ReduceError, StatsDict};
use crate::report::Reporter;

const PSNR: &str = "psnr";
const SIMILARITY: &str = "similarity";
const LR: &str = "lr";
const LOSS: &str = "loss";
const AUX_PREFIX: &str = "aux/";

/// Aggregated statistics of one train epoch or evaluation pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub psnr: MetricTable,
    pub similarity: MetricTable,
    /// Rate of the last optimizer step. None for evaluation.
    pub learning_rate: Option<f64>,
    /// Mean total loss. None for evaluation.
    pub loss: Option<f64>,
    pub aux_losses: BTreeMap<String, f64>,
    /// [height, width] of every stage.
    pub stage_sizes: Vec<[usize; 2]>,
}

impl EpochStats {
    pub fn to_dict(&self) -> StatsDict {
        let mut dict = StatsDict::new();
        dict.insert(PSNR.to_owned(), self.psnr.values().to_vec());
        dict.insert(SIMILARITY.to_owned(), self.similarity.values().to_vec());
        if let Some(lr) = self.learning_rate {
            dict.insert(LR.to_owned(), vec![lr]);
        }
        if let Some(loss) = self.loss {
            dict.insert(LOSS.to_owned(), vec![loss]);
        }
        for (name, value) in &self.aux_losses {
            dict.insert(format!("{AUX_PREFIX}{name}"), vec![*value]);
        }
        dict
    }

    pub fn from_dict(mut dict: StatsDict, stage_sizes: Vec<[usize; 2]>) -> Self {
        let mut scalar = |key: &str| dict.remove(key).and_then(|v| v.first().copied());
        let learning_rate = scalar(LR);
        let loss = scalar(LOSS);

        let psnr = MetricTable::new(dict.remove(PSNR).unwrap_or_default());
        let similarity = MetricTable::new(dict.remove(SIMILARITY).unwrap_or_default());
        let aux_losses = dict
            .into_iter()
            .filter_map(|(key, values)| {
                let name = key.strip_prefix(AUX_PREFIX)?.to_owned();
                Some((name, *values.first()?))
            })
            .collect();

        Self {
            psnr,
            similarity,
            learning_rate,
            loss,
            aux_losses,
            stage_sizes,
        }
    }

    /// Averages every statistic across the workers of the run.
    pub fn reduce(self, reducer: &DistributedReducer) -> std::result::Result<Self, ReduceError> {
        let reduced = reducer.reduce(self.to_dict())?;
        Ok(Self::from_dict(reduced, self.stage_sizes))
    }

    /// Publishes `{prefix}/PSNR_{h}X{w}` and `{prefix}/SSIM_{h}X{w}` per stage,
    /// then the learning rate, loss and auxiliary losses.
    pub fn publish(&self, reporter: &mut dyn Reporter, prefix: &str, step: usize) -> Result<()> {
        for (stage, [h, w]) in self.stage_sizes.iter().enumerate() {
            if let Some(psnr) = self.psnr.get(stage) {
                reporter.scalar(&format!("{prefix}/PSNR_{h}X{w}"), psnr, step)?;
            }
            if let Some(ssim) = self.similarity.get(stage) {
                reporter.scalar(&format!("{prefix}/SSIM_{h}X{w}"), ssim, step)?;
            }
        }
        if let Some(lr) = self.learning_rate {
            reporter.scalar(&format!("{prefix}/lr"), lr, step)?;
        }
        if let Some(loss) = self.loss {
            reporter.scalar(&format!("{prefix}/loss"), loss, step)?;
        }
        for (name, value) in &self.aux_losses {
            reporter.scalar(&format!("{prefix}/{name}"), *value, step)?;
        }
        Ok(())
    }
}

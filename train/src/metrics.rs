use burn::prelude::{Backend, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::TrainConfig;
use crate::error::Result;
use crate::pyramid::{check_pyramids, to_host};
use crate::ssim::Ssim;

/// One metric value per output stage, in stage order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricTable {
    values: Vec<f64>,
}

impl MetricTable {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn stages(&self) -> usize {
        self.values.len()
    }

    pub fn get(&self, stage: usize) -> Option<f64> {
        self.values.get(stage).copied()
    }

    /// Value of the highest resolution stage.
    pub fn finest(&self) -> Option<f64> {
        self.values.last().copied()
    }

    /// Stage-wise arithmetic mean, every table weighted equally.
    pub fn mean_of(tables: &[MetricTable]) -> Option<MetricTable> {
        let stages = tables.first()?.stages();
        let count = tables.len() as f64;
        let values = (0..stages)
            .map(|stage| {
                tables
                    .iter()
                    .map(|t| t.values.get(stage).copied().unwrap_or(0.0))
                    .sum::<f64>()
                    / count
            })
            .collect();
        Some(MetricTable { values })
    }

    /// Formats as `[a, b, ...]` rounded to `precision` decimals.
    pub fn display(&self, precision: usize) -> String {
        let values: Vec<String> = self
            .values
            .iter()
            .map(|v| format!("{v:.precision$}"))
            .collect();
        format!("[{}]", values.join(", "))
    }
}

/// Computes PSNR and structural similarity between output and target pyramids.
#[derive(Clone, Debug)]
pub struct MetricEngine {
    peak: f64,
    sentinel: f64,
    ssim: Ssim,
}

impl MetricEngine {
    pub fn new(config: &TrainConfig) -> Self {
        Self::with_params(config.psnr_peak, config.psnr_sentinel, config.ssim_window)
    }

    pub fn with_params(peak: f64, sentinel: f64, ssim_window: usize) -> Self {
        Self {
            peak,
            sentinel,
            ssim: Ssim::new(ssim_window, peak as f32),
        }
    }

    pub fn sentinel(&self) -> f64 {
        self.sentinel
    }

    /// PSNR of a mean squared error. Zero error, and anything scoring above the
    /// sentinel, reports the sentinel.
    pub fn psnr_from_mse(&self, mse: f64) -> f64 {
        if mse <= 0.0 {
            return self.sentinel;
        }
        let psnr = 10.0 * (self.peak * self.peak / mse).log10();
        if psnr > self.sentinel { self.sentinel } else { psnr }
    }

    /// PSNR of every sample, one table per sample.
    pub fn psnr_samples<B: Backend>(
        &self,
        outputs: &[Tensor<B, 4>],
        targets: &[Tensor<B, 4>],
    ) -> Result<Vec<MetricTable>> {
        let stages = per_stage(outputs, targets, |output, target| {
            let n = output.dims()[0];
            let mse = (output - target)
                .powi_scalar(2)
                .flatten::<2>(1, 3)
                .mean_dim(1)
                .reshape([n]);
            Ok(to_host(mse)?
                .into_iter()
                .map(|mse| self.psnr_from_mse(mse as f64))
                .collect())
        })?;
        Ok(transpose(stages))
    }

    /// Structural similarity of every sample in [0, 1], one table per sample.
    pub fn similarity_samples<B: Backend>(
        &self,
        outputs: &[Tensor<B, 4>],
        targets: &[Tensor<B, 4>],
    ) -> Result<Vec<MetricTable>> {
        let stages = per_stage(outputs, targets, |output, target| {
            let ssim = self.ssim.ssim_per_sample(output, target).clamp(0.0, 1.0);
            Ok(to_host(ssim)?.into_iter().map(f64::from).collect())
        })?;
        Ok(transpose(stages))
    }

    /// Batch mean PSNR per stage.
    pub fn psnr<B: Backend>(&self, outputs: &[Tensor<B, 4>], targets: &[Tensor<B, 4>]) -> Result<MetricTable> {
        Ok(MetricTable::mean_of(&self.psnr_samples(outputs, targets)?).unwrap_or_default())
    }

    /// Batch mean similarity per stage.
    pub fn similarity<B: Backend>(
        &self,
        outputs: &[Tensor<B, 4>],
        targets: &[Tensor<B, 4>],
    ) -> Result<MetricTable> {
        Ok(MetricTable::mean_of(&self.similarity_samples(outputs, targets)?).unwrap_or_default())
    }
}

fn per_stage<B: Backend>(
    outputs: &[Tensor<B, 4>],
    targets: &[Tensor<B, 4>],
    metric: impl Fn(Tensor<B, 4>, Tensor<B, 4>) -> Result<Vec<f64>>,
) -> Result<Vec<Vec<f64>>> {
    check_pyramids(outputs, targets)?;
    outputs
        .iter()
        .zip(targets)
        .map(|(output, target)| metric(output.clone(), target.clone()))
        .collect()
}

// [stage][sample] -> one table per sample.
fn transpose(stages: Vec<Vec<f64>>) -> Vec<MetricTable> {
    let samples = stages.first().map_or(0, Vec::len);
    (0..samples)
        .map(|i| MetricTable::new(stages.iter().map(|s| s[i]).collect()))
        .collect()
}

/// Running aggregation over an epoch.
///
/// Samples are averaged within a logging interval; the epoch value is the mean
/// of the interval means, each interval weighted equally regardless of how many
/// samples it saw.
#[derive(Clone, Debug, Default)]
pub struct IntervalAccumulator {
    pending: Vec<MetricTable>,
    intervals: Vec<MetricTable>,
}

impl IntervalAccumulator {
    pub fn extend(&mut self, samples: Vec<MetricTable>) {
        self.pending.extend(samples);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Closes the current interval and returns its mean.
    pub fn close_interval(&mut self) -> Option<MetricTable> {
        let mean = MetricTable::mean_of(&self.pending)?;
        self.pending.clear();
        self.intervals.push(mean.clone());
        Some(mean)
    }

    pub fn epoch_mean(&self) -> Option<MetricTable> {
        MetricTable::mean_of(&self.intervals)
    }
}

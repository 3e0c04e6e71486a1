use std::path::Path;
use std::time::Instant;

use burn::prelude::Backend;
use dataset::DataSource;
use serde::{Deserialize, Serialize};
use tracing::trace_span;

use crate::config::TrainConfig;
use crate::context::RunContext;
use crate::error::{Result, TrainError};
use crate::export::{frame_file_name, save_png};
use crate::metrics::MetricEngine;
use crate::model::ReconstructionModel;
use crate::progress::ProgressLine;
use crate::pyramid::{first_sample, target_pyramid};
use crate::report::{ImageSnapshot, Reporter};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    pub frames: usize,
    /// Mean finest-stage PSNR, when evaluating.
    pub psnr: Option<f64>,
    /// Mean finest-stage SSIM, when evaluating.
    pub similarity: Option<f64>,
    pub seconds: f64,
}

/// Reconstructs every frame of a source to disk, one frame at a time.
#[derive(Clone, Debug)]
pub struct TestRunner {
    metrics: MetricEngine,
    evaluate: bool,
}

impl TestRunner {
    /// With `evaluate` set, every frame is also scored against its ground truth.
    pub fn new(config: &TrainConfig, evaluate: bool) -> Self {
        Self {
            metrics: MetricEngine::new(config),
            evaluate,
        }
    }

    /// Writes `img_recon{i:03}.png` for every frame into `out_dir`.
    pub fn run<B, C, M, D>(
        &self,
        ctx: &RunContext<C>,
        model: &M,
        source: &D,
        out_dir: &Path,
        reporter: &mut dyn Reporter,
    ) -> Result<TestSummary>
    where
        B: Backend<Device = C::Device>,
        C: Backend,
        M: ReconstructionModel<B>,
        D: DataSource<B> + ?Sized,
    {
        if source.batch_size() != 1 {
            return Err(TrainError::BatchSize(source.batch_size()));
        }

        let start = Instant::now();
        let total = source.len();
        let mut psnr_values = Vec::new();
        let mut ssim_values = Vec::new();
        let mut progress = (!self.evaluate).then(|| ProgressLine::stderr("--> Finish:", total));
        let mut frames = 0;

        for (i, batch) in source.batches(0).enumerate() {
            if batch.batch_size() != 1 {
                return Err(TrainError::BatchSize(batch.batch_size()));
            }
            let batch = batch.to_device(&ctx.device);

            let outputs = trace_span!("Forward").in_scope(|| model.forward(&batch)).into_outputs();
            B::sync(&ctx.device);
            let finest = outputs.last().cloned().ok_or(TrainError::StageCountMismatch {
                outputs: 0,
                targets: 1,
            })?;

            let snapshot = ImageSnapshot::from_tensor(first_sample(finest.clone()))?;
            save_png(&snapshot, &out_dir.join(frame_file_name(i)))?;
            frames += 1;

            if self.evaluate {
                let gt = batch.image_gt.clone().ok_or(TrainError::MissingGroundTruth)?;
                let outputs = [finest];
                let targets = target_pyramid(&outputs, &gt);

                let psnr = self.metrics.psnr_samples(&outputs, &targets)?[0].finest().unwrap_or_default();
                let ssim = self.metrics.similarity_samples(&outputs, &targets)?[0]
                    .finest()
                    .unwrap_or_default();
                reporter.log(
                    log::Level::Info,
                    &format!("Frame #{}/{} PSNR: {psnr:.2}, SSIM: {ssim:.4}", i + 1, total),
                );
                psnr_values.push(psnr);
                ssim_values.push(ssim);
            } else if let Some(progress) = progress.as_mut() {
                progress.update(i + 1)?;
            }
        }

        if let Some(progress) = progress {
            progress.finish()?;
        }

        let mean = |values: &[f64]| (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64);
        let summary = TestSummary {
            frames,
            psnr: mean(&psnr_values),
            similarity: mean(&ssim_values),
            seconds: start.elapsed().as_secs_f64(),
        };

        if let (Some(psnr), Some(ssim)) = (summary.psnr, summary.similarity) {
            reporter.log(
                log::Level::Info,
                &format!("Mean PSNR: {psnr:.2}, Mean SSIM: {ssim:.4}"),
            );
        }
        reporter.log(
            log::Level::Info,
            &format!("-> total time on test: \t{:.2}", summary.seconds),
        );
        Ok(summary)
    }
}

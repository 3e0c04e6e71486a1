use std::path::{Path, PathBuf};

use burn::module::{AutodiffModule, Module};
use burn::optim::Optimizer;
use burn::prelude::Backend;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::AutodiffBackend;
use dataset::DataSource;
use serde::{Deserialize, Serialize};
use train::config::TrainConfig;
use train::context::RunContext;
use train::epoch::EpochRunner;
use train::model::ReconstructionModel;
use train::msg::EpochStats;
use train::report::Reporter;

use crate::config::PipelineConfig;
use crate::error::Result;

pub use crate::error::PipelineError;
pub use crate::event_log::{Event, EventReporter};

pub mod config;
mod error;
mod event_log;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub epochs_run: usize,
    pub last_train: Option<EpochStats>,
    pub last_eval: Option<EpochStats>,
    /// Best finest-stage evaluation PSNR and the (1 based) epoch it was reached in.
    pub best_eval: Option<(f64, usize)>,
    pub checkpoints: Vec<PathBuf>,
}

/// Trains for all configured epochs, evaluating and checkpointing along the way.
pub struct Pipeline {
    config: PipelineConfig,
    runner: EpochRunner,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, train_config: &TrainConfig) -> Self {
        Self {
            config,
            runner: EpochRunner::new(train_config),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn runner(&self) -> &EpochRunner {
        &self.runner
    }

    pub fn run<B, M, O, D, E>(
        &self,
        ctx: &mut RunContext<B>,
        mut model: M,
        optim: &mut O,
        train: &D,
        eval: Option<&E>,
        reporter: &mut dyn Reporter,
    ) -> Result<(M, RunSummary)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + ReconstructionModel<B>,
        M::InnerModule: ReconstructionModel<B::InnerBackend>,
        O: Optimizer<M, B>,
        D: DataSource<B> + ?Sized,
        E: DataSource<B::InnerBackend> + ?Sized,
    {
        let config = &self.config;
        let total_epochs = self.runner.config().epochs;
        let export_path = Path::new(&config.export_path);
        let export_dir = config.eval_save_to_disk.then_some(export_path);

        log::info!("Using seed {}", config.seed);
        <B as Backend>::seed(config.seed);

        let mut summary = RunSummary::default();

        log::info!("Start training loop.");
        for epoch in config.start_epoch..total_epochs {
            ctx.begin_epoch(epoch);

            let (new_model, stats) = self.runner.train_epoch(ctx, model, optim, train, reporter)?;
            model = new_model;
            summary.epochs_run += 1;

            if stats.loss.is_some_and(|loss| !loss.is_finite()) {
                return Err(PipelineError::NonFiniteLoss { epoch: epoch + 1 });
            }
            summary.last_train = Some(stats);

            // We just finished epoch 'epoch', count from 1 from here on.
            let epoch = epoch + 1;
            let is_last = epoch == total_epochs;

            let eval_due = epoch % config.eval_every.max(1) == 0 || is_last;
            if let Some(eval) = eval.filter(|_| eval_due) {
                log::info!("Running evaluation for epoch {epoch}");
                let stats = self.runner.evaluate(ctx, &model.valid(), eval, reporter, export_dir)?;
                let psnr = stats.psnr.finest().unwrap_or(f64::NAN);
                if summary.best_eval.is_none_or(|(best, _)| psnr > best) {
                    summary.best_eval = Some((psnr, epoch));
                }
                summary.last_eval = Some(stats);
            }

            let checkpoint_due = config.checkpoint_every > 0 && epoch % config.checkpoint_every == 0;
            if checkpoint_due || is_last {
                let path = export_path.join(config.checkpoint_file(epoch));
                let saved = if ctx.is_leader() {
                    save_checkpoint(&model, &path).map(|_| summary.checkpoints.push(path))
                } else {
                    Ok(())
                };
                ctx.settle(saved)?;
            }
        }

        if let Some((psnr, epoch)) = summary.best_eval {
            log::info!("Best eval PSNR {psnr:.2} in epoch {epoch}");
        }
        Ok((model, summary))
    }
}

/// Checkpoints keep full precision so a resumed run continues from the exact weights.
type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Saves the model weights. The recorder adds its own file extension.
pub fn save_checkpoint<B: Backend, M: Module<B>>(model: &M, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    log::info!("Saving checkpoint to {path:?}");
    model
        .clone()
        .save_file(path, &CheckpointRecorder::new())
        .map_err(|e| PipelineError::Checkpoint(format!("{e:?}")))
}

/// Loads weights saved by [`save_checkpoint`] into `model`.
pub fn load_checkpoint<B: Backend, M: Module<B>>(model: M, path: &Path, device: &B::Device) -> Result<M> {
    log::info!("Loading checkpoint from {path:?}");
    model
        .load_file(path, &CheckpointRecorder::new(), device)
        .map_err(|e| PipelineError::Checkpoint(format!("{e:?}")))
}

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::{Backend, Tensor};
use burn::tensor::ElementConversion;
use burn::tensor::backend::AutodiffBackend;
use dataset::{DataSource, FrameBatch};
use tracing::trace_span;

use crate::config::TrainConfig;
use crate::context::RunContext;
use crate::error::{Result, TrainError};
use crate::export::{epoch_file_name, save_png};
use crate::loss::LossAssembler;
use crate::metrics::{IntervalAccumulator, MetricEngine};
use crate::model::ReconstructionModel;
use crate::msg::EpochStats;
use crate::pyramid::{first_sample, stage_sizes, target_pyramid};
use crate::report::{ImageSnapshot, Reporter};

/// Runs single train epochs and evaluation passes.
#[derive(Clone, Debug)]
pub struct EpochRunner {
    config: TrainConfig,
    metrics: MetricEngine,
    losses: LossAssembler,
}

/// Metric bookkeeping shared by training and evaluation.
#[derive(Default)]
struct EpochMetrics {
    psnr: IntervalAccumulator,
    similarity: IntervalAccumulator,
    stage_sizes: Vec<[usize; 2]>,
}

impl EpochMetrics {
    fn record<B: Backend>(
        &mut self,
        engine: &MetricEngine,
        outputs: &[Tensor<B, 4>],
        targets: &[Tensor<B, 4>],
    ) -> Result<()> {
        self.psnr.extend(engine.psnr_samples(outputs, targets)?);
        self.similarity.extend(engine.similarity_samples(outputs, targets)?);
        self.stage_sizes = stage_sizes(outputs);
        Ok(())
    }

    /// Closes the interval and formats `PSNR: [..], SSIM: [..]`.
    fn close_interval(&mut self) -> String {
        let psnr = self.psnr.close_interval().unwrap_or_default();
        let similarity = self.similarity.close_interval().unwrap_or_default();
        format!("PSNR: {}, SSIM: {}", psnr.display(2), similarity.display(4))
    }

    fn into_stats(self, learning_rate: Option<f64>, loss: Option<f64>, aux_losses: BTreeMap<String, f64>) -> EpochStats {
        EpochStats {
            psnr: self.psnr.epoch_mean().unwrap_or_default(),
            similarity: self.similarity.epoch_mean().unwrap_or_default(),
            learning_rate,
            loss,
            aux_losses,
            stage_sizes: self.stage_sizes,
        }
    }
}

fn is_report_step(i: usize, steps: usize, print_interval: usize) -> bool {
    i % print_interval.max(1) == 0 || i + 1 == steps
}

/// Human readable lines go to the reporter on the leader and are dropped elsewhere.
fn say<C: Backend>(ctx: &RunContext<C>, reporter: &mut dyn Reporter, message: &str) {
    if ctx.is_leader() {
        reporter.log(log::Level::Info, &format!("{}{message}", ctx.log_prefix()));
    }
}

fn ground_truth<B: Backend>(batch: &FrameBatch<B>) -> Result<Tensor<B, 4>> {
    batch.image_gt.clone().ok_or(TrainError::MissingGroundTruth)
}

impl EpochRunner {
    pub fn new(config: &TrainConfig) -> Self {
        Self {
            config: config.clone(),
            metrics: MetricEngine::new(config),
            losses: LossAssembler::new(config.loss, config.ssim_window, config.psnr_peak as f32),
        }
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricEngine {
        &self.metrics
    }

    /// Trains `model` for one pass over `source`, at epoch `ctx.epoch`.
    ///
    /// Statistics are averaged over all workers before they are returned, so every
    /// worker must call this in lockstep. When one worker fails, every worker
    /// returns an error. A non-finite loss is reported in the returned stats
    /// rather than treated as an error.
    pub fn train_epoch<B, M, O, D>(
        &self,
        ctx: &mut RunContext<B>,
        model: M,
        optim: &mut O,
        source: &D,
        reporter: &mut dyn Reporter,
    ) -> Result<(M, EpochStats)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + ReconstructionModel<B>,
        O: Optimizer<M, B>,
        D: DataSource<B> + ?Sized,
    {
        let epoch = ctx.epoch;
        let epoch_start = Instant::now();

        let pass = self.train_steps(ctx, model, optim, source, reporter);
        let pass = ctx.settle(pass)?;

        if !pass.loss.is_finite() {
            log::warn!("{}Epoch {} loss is not finite: {}", ctx.log_prefix(), epoch + 1, pass.loss);
        }
        let stats = pass
            .metrics
            .into_stats(Some(pass.learning_rate), Some(pass.loss), pass.aux_losses)
            .reduce(&ctx.reducer())?;

        let published = if ctx.is_leader() {
            publish_train(&stats, pass.last_finest, reporter, epoch + 1)
        } else {
            Ok(())
        };
        ctx.settle(published)?;

        let current = epoch_start.elapsed().as_secs_f64();
        let average = ctx.elapsed().as_secs_f64() / (epoch + 1) as f64;
        say(
            ctx,
            reporter,
            &format!("-> time/epoch: \tCurrent:{current:.2} \tAverage:{average:.2}"),
        );

        Ok((pass.model, stats))
    }

    /// The optimizer steps of one epoch, on this worker only.
    fn train_steps<B, M, O, D>(
        &self,
        ctx: &mut RunContext<B>,
        mut model: M,
        optim: &mut O,
        source: &D,
        reporter: &mut dyn Reporter,
    ) -> Result<TrainPass<B, M>>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + ReconstructionModel<B>,
        O: Optimizer<M, B>,
        D: DataSource<B> + ?Sized,
    {
        let steps = source.len();
        if steps == 0 {
            return Err(TrainError::EmptyDataSource);
        }

        let epoch = ctx.epoch;
        let total_epochs = self.config.epochs;

        let mut metrics = EpochMetrics::default();
        let mut lr = 0.0;
        let mut loss_sum = 0.0;
        let mut aux_sum = BTreeMap::<String, f64>::new();
        let mut last_finest = None;
        let mut seen = 0;

        for (i, batch) in source.batches(epoch).enumerate() {
            let batch = batch.to_device(&ctx.device);
            let gt = ground_truth(&batch)?;

            let (outputs, aux) = trace_span!("Forward").in_scope(|| model.forward(&batch)).into_parts();
            let targets = target_pyramid(&outputs, &gt);

            let (total, aux_values) = {
                let _span = trace_span!("Calculate losses").entered();
                let bundle = self.losses.assemble(&outputs, &targets, aux)?;
                (bundle.total()?, bundle.auxiliary_values())
            };
            let loss_value = total.clone().into_scalar().elem::<f64>();

            lr = self.config.lr.learning_rate(epoch, total_epochs, i, steps);

            let grads = trace_span!("Backward pass").in_scope(|| total.backward());
            let grads = GradientsParams::from_grads(grads, &model);
            model = trace_span!("Optimizer step").in_scope(|| optim.step(lr, model, grads));
            ctx.global_step += 1;

            let outputs: Vec<_> = outputs.into_iter().map(|t| t.inner()).collect();
            let targets: Vec<_> = targets.into_iter().map(|t| t.inner()).collect();
            metrics.record(&self.metrics, &outputs, &targets)?;

            loss_sum += loss_value;
            for (name, value) in &aux_values {
                *aux_sum.entry(name.clone()).or_default() += value;
            }
            seen += 1;

            if is_report_step(i, steps, self.config.print_interval) {
                let mut line = format!(
                    "Epoch[{}/{}], Step [{}/{}], lr:{:.2e} {}",
                    epoch + 1,
                    total_epochs,
                    i + 1,
                    steps,
                    lr,
                    metrics.close_interval(),
                );
                for (name, value) in &aux_values {
                    line.push_str(&format!(", {name}: {value:.6}"));
                }
                say(ctx, reporter, &line);
            }

            last_finest = outputs.last().cloned().zip(targets.last().cloned());
        }

        if seen == 0 {
            return Err(TrainError::EmptyDataSource);
        }

        Ok(TrainPass {
            model,
            metrics,
            learning_rate: lr,
            loss: loss_sum / seen as f64,
            aux_losses: aux_sum
                .into_iter()
                .map(|(name, sum)| (name, sum / seen as f64))
                .collect(),
            last_finest,
        })
    }

    /// Measures `model` over one pass of `source` without updating it.
    ///
    /// `model` runs on `B`, usually the inner backend of the training context. When
    /// `export_dir` is set the leader writes the finest reconstruction of the first
    /// sample of the last batch there, after the statistics were reduced.
    pub fn evaluate<B, C, M, D>(
        &self,
        ctx: &RunContext<C>,
        model: &M,
        source: &D,
        reporter: &mut dyn Reporter,
        export_dir: Option<&Path>,
    ) -> Result<EpochStats>
    where
        B: Backend<Device = C::Device>,
        C: Backend,
        M: ReconstructionModel<B>,
        D: DataSource<B> + ?Sized,
    {
        let eval_start = Instant::now();

        let pass = self.eval_steps(ctx, model, source, reporter);
        let (metrics, last_output) = ctx.settle(pass)?;
        let stats = metrics.into_stats(None, None, BTreeMap::new()).reduce(&ctx.reducer())?;

        let published = if ctx.is_leader() {
            publish_eval(&stats, last_output, export_dir, reporter, ctx.epoch + 1)
        } else {
            Ok(())
        };
        ctx.settle(published)?;

        say(
            ctx,
            reporter,
            &format!(
                "-> total time on evaluate: \t{:.2}",
                eval_start.elapsed().as_secs_f64()
            ),
        );
        Ok(stats)
    }

    fn eval_steps<B, C, M, D>(
        &self,
        ctx: &RunContext<C>,
        model: &M,
        source: &D,
        reporter: &mut dyn Reporter,
    ) -> Result<(EpochMetrics, Option<Tensor<B, 4>>)>
    where
        B: Backend<Device = C::Device>,
        C: Backend,
        M: ReconstructionModel<B>,
        D: DataSource<B> + ?Sized,
    {
        let steps = source.len();
        if steps == 0 {
            return Err(TrainError::EmptyDataSource);
        }

        let mut metrics = EpochMetrics::default();
        let mut last_output = None;

        for (i, batch) in source.batches(ctx.epoch).enumerate() {
            let batch = batch.to_device(&ctx.device);
            let gt = ground_truth(&batch)?;

            let outputs = trace_span!("Forward").in_scope(|| model.forward(&batch)).into_outputs();
            B::sync(&ctx.device);
            let targets = target_pyramid(&outputs, &gt);
            metrics.record(&self.metrics, &outputs, &targets)?;

            if is_report_step(i, steps, self.config.print_interval) {
                let line = format!("Eval, Step [{}/{}], {}", i + 1, steps, metrics.close_interval());
                say(ctx, reporter, &line);
            }

            last_output = outputs.last().cloned();
        }

        if last_output.is_none() {
            return Err(TrainError::EmptyDataSource);
        }
        Ok((metrics, last_output))
    }
}

/// What one worker's train steps leave behind, before reduction.
struct TrainPass<B: AutodiffBackend, M> {
    model: M,
    metrics: EpochMetrics,
    learning_rate: f64,
    loss: f64,
    aux_losses: BTreeMap<String, f64>,
    /// Finest output and target of the last batch.
    last_finest: Option<(Tensor<B::InnerBackend, 4>, Tensor<B::InnerBackend, 4>)>,
}

fn publish_train<B: Backend>(
    stats: &EpochStats,
    last_finest: Option<(Tensor<B, 4>, Tensor<B, 4>)>,
    reporter: &mut dyn Reporter,
    step: usize,
) -> Result<()> {
    stats.publish(reporter, "Train", step)?;
    if let Some((output, target)) = last_finest {
        reporter.image("train/image_in", &ImageSnapshot::from_tensor(first_sample(output))?, step)?;
        reporter.image("train/image_gt", &ImageSnapshot::from_tensor(first_sample(target))?, step)?;
    }
    Ok(())
}

fn publish_eval<B: Backend>(
    stats: &EpochStats,
    last_output: Option<Tensor<B, 4>>,
    export_dir: Option<&Path>,
    reporter: &mut dyn Reporter,
    step: usize,
) -> Result<()> {
    stats.publish(reporter, "Eval", step)?;
    if let (Some(dir), Some(output)) = (export_dir, last_output) {
        save_png(&ImageSnapshot::from_tensor(first_sample(output))?, &dir.join(epoch_file_name(step)))?;
    }
    Ok(())
}

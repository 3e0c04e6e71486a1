use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use burn::backend::{Autodiff, NdArray, Wgpu};
use burn::module::AutodiffModule;
use burn::optim::AdamConfig;
use burn::prelude::{Backend, Config};
use burn::tensor::backend::AutodiffBackend;
use clap::{Args, Parser, Subcommand};
use dataset::{FrameDataset, FrameLoader, LoadConfig};
use pipeline::config::PipelineConfig;
use pipeline::{EventReporter, Pipeline, load_checkpoint, save_checkpoint};
use train::config::TrainConfig;
use train::context::RunContext;
use train::loss::LossKind;
use train::report::LogReporter;
use train::test_runner::TestRunner;

use crate::grid::{FrameGrid, FrameGridConfig};

mod grid;
mod logging;

const GRID_CONFIG: &str = "grid.json";
const TRAIN_CONFIG: &str = "train.json";
const FINAL_CHECKPOINT: &str = "model";

/// Train a frame reconstruction model on a folder of video frames, or reconstruct
/// frames from a trained one.
#[derive(Parser)]
struct Cli {
    /// Run on the CPU instead of the GPU.
    #[arg(long, global = true)]
    cpu: bool,

    /// Also write the log to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a model and periodically evaluate it.
    Train(TrainArgs),
    /// Reconstruct every frame with a trained model.
    Test(TestArgs),
}

#[derive(Args)]
struct FrameArgs {
    /// Directory containing the frames.
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Resize frames to this width and height.
    #[arg(long, num_args = 2, value_names = ["WIDTH", "HEIGHT"])]
    image_size: Option<Vec<u32>>,

    /// Max nr. of frames to load.
    #[arg(long)]
    max_frames: Option<usize>,
}

impl FrameArgs {
    fn load_config(&self) -> LoadConfig {
        LoadConfig::new()
            .with_image_size(self.image_size.as_deref().map(|s| [s[0], s[1]]))
            .with_max_frames(self.max_frames)
    }
}

#[derive(Args)]
struct TrainArgs {
    #[command(flatten)]
    frames: FrameArgs,

    /// Separate directory of frames to evaluate on. Defaults to the training frames.
    #[arg(long)]
    eval_data: Option<PathBuf>,

    /// Output directory for logs, checkpoints and images.
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Train config JSON. Flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long, value_enum, ignore_case = true)]
    loss: Option<LossKind>,

    #[arg(long)]
    print_interval: Option<usize>,

    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    #[arg(long, default_value_t = 1)]
    eval_every: usize,

    #[arg(long, default_value_t = 10)]
    checkpoint_every: usize,

    /// Save the reconstruction of every evaluation.
    #[arg(long)]
    save_images: bool,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 16)]
    keyframes: usize,

    #[arg(long, default_value_t = 2)]
    stages: usize,

    #[arg(long, default_value_t = 0.0)]
    smoothness_weight: f32,

    /// Checkpoint to continue from.
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Epoch to continue from.
    #[arg(long, default_value_t = 0)]
    start_epoch: usize,
}

#[derive(Args)]
struct TestArgs {
    #[command(flatten)]
    frames: FrameArgs,

    /// Output directory of the training run.
    #[arg(short, long)]
    model_dir: PathBuf,

    /// Checkpoint to load, relative to the model dir.
    #[arg(long, default_value = FINAL_CHECKPOINT)]
    checkpoint: String,

    /// Directory to write the reconstructed frames to.
    #[arg(short, long, default_value = "recon")]
    output: PathBuf,

    /// Without frames, reconstruct this many evenly spaced frames.
    #[arg(long)]
    num_frames: Option<usize>,

    /// Score every frame against its ground truth.
    #[arg(long)]
    eval: bool,
}

fn load_json<C: Config>(path: &Path) -> anyhow::Result<C> {
    C::load(path).map_err(|e| anyhow!("Failed to load {path:?}: {e:?}"))
}

async fn run_train<B: AutodiffBackend>(args: TrainArgs, device: B::Device) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => load_json::<TrainConfig>(path)?,
        None => TrainConfig::new(),
    };
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(lr) = args.lr {
        config.lr.base_lr = lr;
    }
    if let Some(loss) = args.loss {
        config.loss = loss;
    }
    if let Some(print_interval) = args.print_interval {
        config.print_interval = print_interval;
    }

    let data = args.frames.data.as_deref().context("Training needs --data")?;
    let load_config = args.frames.load_config();
    let dataset = FrameDataset::load(data, &load_config).await?;
    let eval_dataset = match &args.eval_data {
        Some(dir) => FrameDataset::load(dir, &load_config).await?,
        None => dataset.clone(),
    };
    let [width, height] = dataset.image_size().context("Dataset has no frames")?;

    let grid_config = FrameGridConfig::new(height as usize, width as usize)
        .with_keyframes(args.keyframes)
        .with_stages(args.stages)
        .with_smoothness_weight(args.smoothness_weight);

    std::fs::create_dir_all(&args.output)?;
    grid_config.save(args.output.join(GRID_CONFIG))?;
    config.save(args.output.join(TRAIN_CONFIG))?;

    let mut model = grid_config.init::<B>(&device);
    if let Some(path) = &args.resume {
        model = load_checkpoint(model, path, &device)?;
    }
    let mut optim = AdamConfig::new().init::<B, FrameGrid<B>>();

    let train_loader = FrameLoader::<B>::new(dataset, args.batch_size, &device).with_shuffle(args.seed);
    let eval_loader = FrameLoader::<B::InnerBackend>::new(eval_dataset, args.batch_size, &device);

    let pipeline_config = PipelineConfig::new()
        .with_seed(args.seed)
        .with_start_epoch(args.start_epoch)
        .with_eval_every(args.eval_every)
        .with_eval_save_to_disk(args.save_images)
        .with_checkpoint_every(args.checkpoint_every)
        .with_export_path(args.output.to_string_lossy().into_owned());

    let mut reporter = EventReporter::create(&args.output)?;
    let mut ctx = RunContext::<B>::new(device);

    let (model, summary) = Pipeline::new(pipeline_config, &config).run(
        &mut ctx,
        model,
        &mut optim,
        &train_loader,
        Some(&eval_loader),
        &mut reporter,
    )?;

    save_checkpoint(&model.valid(), &args.output.join(FINAL_CHECKPOINT))?;
    std::fs::write(
        args.output.join("summary.json"),
        serde_json::to_string_pretty(&summary)?,
    )?;
    log::info!("Finished {} epochs in {:.1}s", summary.epochs_run, ctx.elapsed().as_secs_f64());
    Ok(())
}

async fn run_test<B: Backend>(args: TestArgs, device: B::Device) -> anyhow::Result<()> {
    let grid_config = load_json::<FrameGridConfig>(&args.model_dir.join(GRID_CONFIG))?;
    let config = load_json::<TrainConfig>(&args.model_dir.join(TRAIN_CONFIG))?;

    let dataset = match (&args.frames.data, args.num_frames) {
        (Some(data), _) => FrameDataset::load(data, &args.frames.load_config()).await?,
        (None, Some(n)) => FrameDataset::indices_only(n),
        (None, None) => anyhow::bail!("Test needs either --data or --num-frames"),
    };

    let model = load_checkpoint(
        grid_config.init::<B>(&device),
        &args.model_dir.join(&args.checkpoint),
        &device,
    )?;
    let loader = FrameLoader::<B>::new(dataset, 1, &device);
    let ctx = RunContext::<B>::new(device);

    let summary = TestRunner::new(&config, args.eval).run(&ctx, &model, &loader, &args.output, &mut LogReporter)?;
    log::info!(
        "Wrote {} frames to {:?} in {:.1}s",
        summary.frames,
        args.output,
        summary.seconds
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_file.as_deref())?;

    match (cli.command, cli.cpu) {
        (Command::Train(args), false) => run_train::<Autodiff<Wgpu>>(args, Default::default()).await,
        (Command::Train(args), true) => run_train::<Autodiff<NdArray>>(args, Default::default()).await,
        (Command::Test(args), false) => run_test::<Wgpu>(args, Default::default()).await,
        (Command::Test(args), true) => run_test::<NdArray>(args, Default::default()).await,
    }
}

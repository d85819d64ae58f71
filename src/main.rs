use std::path::PathBuf;

use activity_finetune::{config::RunConfig, training::train};
use anyhow::{Context, Result};
use burn::backend::{wgpu::WgpuDevice, Autodiff, Wgpu};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

/// Fine-tune a frozen MobileNetV2 with a new head on the "cooking" and "drinking" images.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to input dataset
    #[arg(short, long)]
    data: PathBuf,

    /// Path to output serialized model
    #[arg(short, long)]
    model: PathBuf,

    /// Path to output label encoder
    #[arg(short, long = "label-bin", alias = "label_bin")]
    label_bin: PathBuf,

    /// Number of epochs to train the head for
    #[arg(short, long, default_value_t = 25)]
    epochs: usize,

    /// Path to output loss/accuracy plot
    #[arg(short, long, default_value = "plot.png")]
    plot: PathBuf,

    /// Images per batch
    #[arg(short, long, default_value_t = 32)]
    batch_size: usize,

    /// Seed for the split, shuffling and augmentation
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Pretrained backbone weights (half-precision named MessagePack record)
    #[arg(long)]
    backbone: Option<PathBuf>,

    /// Channel multiplier of the backbone
    #[arg(long, default_value_t = 1.0)]
    backbone_width: f64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_run_config(self) -> RunConfig {
        RunConfig {
            epoch_count: self.epochs,
            plot_output_path: self.plot,
            backbone_path: self.backbone,
            backbone_width: self.backbone_width,
            batch_size: self.batch_size,
            seed: self.seed,
            ..RunConfig::new(self.data, self.model, self.label_bin)
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt().with_env_filter(filter).with_target(false).compact().init();
}

fn main() -> Result<()> {
    type Backend = Wgpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let run = cli.into_run_config();
    if run.epoch_count == 0 {
        anyhow::bail!("--epochs must be at least 1");
    }

    let device = WgpuDevice::default();
    let outcome = train::<AutodiffBackend>(&run, device)
        .with_context(|| format!("training on {} failed", run.dataset_path.display()))?;

    println!("{}", outcome.report);

    Ok(())
}

//! CLI entry point for merge-lora-rs.

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use merge_lora_rs::config::RunSettings;
use merge_lora_rs::device::{select_device, DeviceChoice};
use merge_lora_rs::{Bundle, MergeConfig, Pipeline, Result};

#[derive(Parser)]
#[command(name = "merge-lora")]
#[command(about = "Merge a LoRA adapter into its base model and export a standalone bundle")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    merge: MergeArgs,
}

#[derive(Args)]
struct MergeArgs {
    /// YAML run file; flags given on the command line take precedence
    #[arg(long)]
    config: Option<String>,
    /// Path to the fine-tuned adapter [default: output/checkpoint-final]
    #[arg(long)]
    lora_model: Option<String>,
    /// Directory the merged model is saved under [default: models/]
    #[arg(long)]
    output_dir: Option<String>,
    /// Language written into the tokenizer config, or `unspecified` [default: Chinese]
    #[arg(long)]
    language: Option<String>,
    /// Task of the model: transcribe or translate [default: transcribe]
    #[arg(long)]
    task: Option<String>,
    /// Only use local files, never download
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    local_files_only: Option<bool>,
    /// Device to merge on: auto, cpu, cuda, cuda:N [default: auto]
    #[arg(long)]
    device: Option<String>,
}

impl From<MergeArgs> for RunSettings {
    fn from(args: MergeArgs) -> Self {
        Self {
            lora_model: args.lora_model,
            output_dir: args.output_dir,
            language: args.language,
            task: args.task,
            local_files_only: args.local_files_only,
            device: args.device,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Load an exported bundle on its own and summarize it
    Inspect {
        /// Bundle directory
        bundle: String,
        /// Device to load tensors on
        #[arg(long, default_value = "cpu")]
        device: String,
    },
}

fn run_merge(args: MergeArgs) -> Result<()> {
    let file = match args.config.as_deref() {
        Some(path) => {
            tracing::info!("Reading run file: {}", path);
            RunSettings::from_file(path)?
        }
        None => RunSettings::default(),
    };
    let config = MergeConfig::try_from(file.overlay(args.into()))?;
    config.print_arguments();

    let bundle = Pipeline::new(config).run()?;
    println!("✓ Merged model saved to: {}", bundle.display());
    Ok(())
}

fn run_inspect(bundle: &str, device: &str) -> Result<()> {
    let device = select_device(device.parse::<DeviceChoice>()?)?;
    let bundle = Bundle::load(bundle, &device)?;

    let parameters: usize = bundle.tensors.values().map(candle_core::Tensor::elem_count).sum();
    println!("✓ Bundle: {}", bundle.dir.display());
    println!("  Tensors: {} ({} parameters)", bundle.tensors.len(), parameters);
    println!(
        "  Model type: {}",
        bundle.files.model_type().as_deref().unwrap_or("unknown")
    );
    let vocabulary: Vec<&str> = bundle.artifacts.vocabulary.files().map(|(name, _)| name).collect();
    println!("  Vocabulary: {}", vocabulary.join(", "));
    println!(
        "  Features: {} mel bins @ {} Hz",
        bundle.artifacts.feature_config.feature_size, bundle.artifacts.feature_config.sampling_rate
    );
    println!(
        "  Language: {}",
        bundle.artifacts.task_config.language.as_deref().unwrap_or("unspecified")
    );
    println!(
        "  Task: {}",
        bundle
            .artifacts
            .task_config
            .task
            .map_or_else(|| "unspecified".to_string(), |task| task.to_string())
    );
    Ok(())
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Inspect { bundle, device }) => run_inspect(&bundle, &device),
        None => run_merge(cli.merge),
    }
}

//! Modista CLI: train, evaluate and prepare data for the fashion
//! instance-segmentation model.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

/// Modista: instance-segmentation training for fashion imagery
#[derive(Parser, Debug)]
#[command(name = "modista", version, about, long_about = None)]
struct Cli {
    /// Configuration file path (defaults to ./modista.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train the model, resuming from the run's checkpoint when asked
    Train(TrainArgs),
    /// Evaluate the run's checkpoint on the test split
    Evaluate(TrainArgs),
    /// Write the prepared train/test dataset files from the CSV manifest
    Prepare(DataArgs),
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default modista.toml in the current directory
    Init,
    /// Print the resolved configuration
    Show,
}

/// Dataset overrides shared by every data-reading command.
#[derive(clap::Args, Debug, Default, Clone)]
struct DataArgs {
    /// Dataset root; annotations are read from <root>/Data
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Images to use; `none` uses all of them
    #[arg(long, value_parser = parse_limit)]
    data_limit: Option<usize>,

    /// Side length images are resized to (multiple of 64)
    #[arg(long)]
    target_dim: Option<u32>,

    /// Worker threads loading batch items
    #[arg(long)]
    num_workers: Option<usize>,
}

/// Overrides for a training or evaluation run. Unset flags leave the
/// configured value alone.
#[derive(clap::Args, Debug, Default, Clone)]
struct TrainArgs {
    #[command(flatten)]
    data: DataArgs,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long)]
    weight_decay: Option<f64>,

    /// Minimum detection score kept at inference
    #[arg(long)]
    box_threshold: Option<f32>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    num_epochs: Option<usize>,

    #[arg(long)]
    model_file_suffix: Option<String>,

    #[arg(long, value_parser = parse_bool)]
    add_user_name_to_model_file: Option<bool>,

    /// Resume from the checkpoint; a missing checkpoint is an error
    #[arg(long, value_parser = parse_bool)]
    load_model: Option<bool>,

    /// Run the training loop (set to false to only load and exit)
    #[arg(long, value_parser = parse_bool)]
    train: Option<bool>,

    /// Read the prepared dataset file instead of decoding JPEGs
    #[arg(long, value_parser = parse_bool)]
    prepared_dataset: Option<bool>,

    #[arg(long, value_parser = parse_bool)]
    freeze_batch_norm_weights: Option<bool>,

    #[arg(long)]
    sched_factor: Option<f64>,

    #[arg(long)]
    sched_patience: Option<usize>,

    #[arg(long, value_parser = parse_bool)]
    sched_verbose: Option<bool>,

    #[arg(long)]
    sched_threshold: Option<f64>,

    #[arg(long)]
    sched_min_lr: Option<f64>,

    #[arg(long)]
    sched_eps: Option<f64>,

    #[arg(long)]
    gradient_accumulation_steps: Option<usize>,

    #[arg(long)]
    save_every: Option<usize>,

    #[arg(long)]
    eval_every: Option<usize>,

    /// Directory receiving Model/, Log/, Images/ and Args/
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Train on the CPU even when CUDA is available
    #[arg(long)]
    cpu: bool,
}

/// Accepts yes/no, true/false, t/f, y/n and 1/0 in any case.
fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "t" | "y" | "1" => Ok(true),
        "no" | "false" | "f" | "n" | "0" => Ok(false),
        other => Err(format!("boolean value expected, got '{other}'")),
    }
}

/// A positive image count, or `none`/`all` for no limit (stored as 0).
fn parse_limit(value: &str) -> Result<usize, String> {
    match value.to_ascii_lowercase().as_str() {
        "none" | "all" => Ok(0),
        other => other
            .parse()
            .map_err(|_| format!("image count or 'none' expected, got '{other}'")),
    }
}

fn main() -> anyhow::Result<ExitCode> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let options = commands::GlobalOptions {
        config: cli.config,
        verbose: cli.verbose,
        quiet: cli.quiet,
    };
    commands::handle_command(cli.command, &options)
}

use crate::{Commands, ConfigAction, DataArgs, TrainArgs};
use anyhow::Context;
use modista_core::config::DEFAULT_CONFIG_FILE;
use modista_core::persistence::atomic_write;
use modista_core::{RunPaths, TrainConfig, init_tracing, load_config};
use modista_ml::data::{prepared_file_name, write_prepared};
use modista_ml::{
    DenseConfig, DenseSegmenter, ManifestDataset, PreparedDataset, ProcessedData,
    SegmentationDataset, Trainer, process_data, seed_device, select_device,
};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

/// Flags accepted before or after any subcommand.
#[derive(Debug, Default)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub verbose: u8,
    pub quiet: bool,
}

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands, options: &GlobalOptions) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Train(args) => handle_train(&args, options),
        Commands::Evaluate(args) => handle_evaluate(&args, options),
        Commands::Prepare(args) => handle_prepare(&args, options),
        Commands::Config { action } => {
            let cwd = std::env::current_dir().context("cannot resolve current directory")?;
            handle_config(action, options.config.as_deref(), &cwd)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

impl DataArgs {
    fn apply(&self, overrides: &mut Value) -> anyhow::Result<()> {
        put(overrides, "data", "root", &self.data_root)?;
        put(overrides, "data", "data_limit", &self.data_limit)?;
        put(overrides, "data", "target_dim", &self.target_dim)?;
        put(overrides, "data", "num_workers", &self.num_workers)?;
        Ok(())
    }

    fn overrides(&self) -> anyhow::Result<Value> {
        let mut overrides = Value::Object(Default::default());
        self.apply(&mut overrides)?;
        Ok(overrides)
    }
}

impl TrainArgs {
    /// Nested JSON holding only the flags that were given.
    fn overrides(&self) -> anyhow::Result<Value> {
        let mut o = Value::Object(Default::default());
        self.data.apply(&mut o)?;
        put(&mut o, "data", "prepared_dataset", &self.prepared_dataset)?;
        put(&mut o, "model", "freeze_batch_norm", &self.freeze_batch_norm_weights)?;
        put(&mut o, "optimizer", "lr", &self.lr)?;
        put(&mut o, "optimizer", "weight_decay", &self.weight_decay)?;
        put(&mut o, "scheduler", "factor", &self.sched_factor)?;
        put(&mut o, "scheduler", "patience", &self.sched_patience)?;
        put(&mut o, "scheduler", "verbose", &self.sched_verbose)?;
        put(&mut o, "scheduler", "threshold", &self.sched_threshold)?;
        put(&mut o, "scheduler", "min_lr", &self.sched_min_lr)?;
        put(&mut o, "scheduler", "eps", &self.sched_eps)?;
        put(&mut o, "training", "box_threshold", &self.box_threshold)?;
        put(&mut o, "training", "batch_size", &self.batch_size)?;
        put(&mut o, "training", "num_epochs", &self.num_epochs)?;
        put(&mut o, "training", "load_model", &self.load_model)?;
        put(&mut o, "training", "train", &self.train)?;
        put(
            &mut o,
            "training",
            "gradient_accumulation_steps",
            &self.gradient_accumulation_steps,
        )?;
        put(&mut o, "training", "save_every", &self.save_every)?;
        put(&mut o, "training", "eval_every", &self.eval_every)?;
        put(&mut o, "training", "force_cpu", &self.cpu.then_some(true))?;
        put(&mut o, "output", "dir", &self.output_dir)?;
        put(&mut o, "output", "model_file_suffix", &self.model_file_suffix)?;
        put(
            &mut o,
            "output",
            "add_user_name_to_model_file",
            &self.add_user_name_to_model_file,
        )?;
        Ok(o)
    }
}

fn put<T: Serialize>(
    root: &mut Value,
    section: &str,
    key: &str,
    value: &Option<T>,
) -> anyhow::Result<()> {
    if let Some(v) = value {
        root[section][key] = serde_json::to_value(v)?;
    }
    Ok(())
}

fn resolve_config(options: &GlobalOptions, overrides: &Value) -> anyhow::Result<TrainConfig> {
    let config = load_config(options.config.as_deref(), Some(overrides))
        .context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn start_logging(
    options: &GlobalOptions,
    config: &TrainConfig,
) -> anyhow::Result<Option<WorkerGuard>> {
    let trace_dir = config.output.dir.join("Log");
    init_tracing(options.verbose, options.quiet, Some(&trace_dir))
        .context("failed to initialise logging")
}

fn load_annotations(config: &TrainConfig) -> anyhow::Result<ProcessedData> {
    let d = &config.data;
    process_data(
        &d.root,
        d.limit(),
        d.train_fraction,
        d.allowed_classes.as_deref(),
    )
    .with_context(|| format!("failed to read annotations under {}", d.root.display()))
}

type Splits = (Arc<dyn SegmentationDataset>, Arc<dyn SegmentationDataset>);

fn open_datasets(config: &TrainConfig, processed: &ProcessedData) -> anyhow::Result<Splits> {
    let d = &config.data;
    if d.prepared_dataset {
        let open = |test: bool| -> anyhow::Result<Arc<dyn SegmentationDataset>> {
            let path = d.prepared_dir().join(prepared_file_name(d.target_dim, test));
            let dataset = PreparedDataset::open(&path).with_context(|| {
                format!(
                    "cannot open prepared dataset {} (run `modista prepare` first)",
                    path.display()
                )
            })?;
            Ok(Arc::new(dataset))
        };
        Ok((open(false)?, open(true)?))
    } else {
        let train: Arc<dyn SegmentationDataset> =
            Arc::new(ManifestDataset::new(&d.root, &processed.train, d.target_dim));
        let test: Arc<dyn SegmentationDataset> =
            Arc::new(ManifestDataset::new(&d.root, &processed.test, d.target_dim));
        Ok((train, test))
    }
}

/// Everything up to a ready trainer: data, paths, device and model.
fn build_trainer(config: &TrainConfig) -> anyhow::Result<Trainer> {
    let processed = load_annotations(config)?;
    let paths = RunPaths::for_run(config, processed.num_classes);

    let yaml = config.to_yaml().context("cannot serialise configuration")?;
    atomic_write(&paths.args_file, yaml.as_bytes())
        .with_context(|| format!("cannot write {}", paths.args_file.display()))?;

    let device = select_device(config.training.force_cpu)?;
    seed_device(&device, config.training.seed);

    let (train, test) = open_datasets(config, &processed)?;
    tracing::info!(
        train = train.len(),
        test = test.len(),
        "Train images [{}] test images [{}]",
        train.len(),
        test.len()
    );

    let model = DenseSegmenter::new(
        DenseConfig {
            num_labels: processed.num_labels(),
            fpn_channels: config.model.fpn_channels,
            freeze_batch_norm: config.model.freeze_batch_norm,
        },
        &device,
    )?;
    if let Some(path) = &config.model.pretrained_backbone {
        let loaded = model
            .load_backbone(path)
            .with_context(|| format!("cannot load backbone weights {}", path.display()))?;
        tracing::info!(tensors = loaded, "loaded pretrained backbone");
    }

    let trainer = Trainer::new(
        config.clone(),
        Box::new(model),
        train,
        test,
        paths,
        processed.categories,
    )?;
    Ok(trainer)
}

fn handle_train(args: &TrainArgs, options: &GlobalOptions) -> anyhow::Result<ExitCode> {
    let config = resolve_config(options, &args.overrides()?)?;
    let _guard = start_logging(options, &config)?;
    let mut trainer = build_trainer(&config)?;

    let status = resume_status(&mut trainer, config.training.load_model)?;
    if status != ExitCode::SUCCESS {
        return Ok(status);
    }

    if config.training.train {
        let metrics = trainer.train()?;
        println!(
            "Trained {} epochs in {:.1}s, final loss {:.4}",
            metrics.epochs_completed,
            metrics.total_training_time_secs,
            metrics.loss_history.last().copied().unwrap_or(f64::NAN)
        );
        if let (Some(epoch), Some(loss)) = (metrics.best_epoch, metrics.best_loss) {
            println!("Best epoch {epoch} with loss {loss:.4}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Load the checkpoint when `load_model` is set. A requested checkpoint
/// that does not exist is a failure.
fn resume_status(trainer: &mut Trainer, load_model: bool) -> anyhow::Result<ExitCode> {
    if load_model && !trainer.load_checkpoint()? {
        tracing::error!(
            path = %trainer.model_file().display(),
            "requested checkpoint does not exist"
        );
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_evaluate(args: &TrainArgs, options: &GlobalOptions) -> anyhow::Result<ExitCode> {
    let config = resolve_config(options, &args.overrides()?)?;
    let _guard = start_logging(options, &config)?;
    let mut trainer = build_trainer(&config)?;

    if !trainer.load_checkpoint()? {
        tracing::error!(
            path = %trainer.model_file().display(),
            "nothing to evaluate, checkpoint does not exist"
        );
        return Ok(ExitCode::FAILURE);
    }
    let summary = trainer.evaluate_now()?;
    println!("{summary}");
    Ok(ExitCode::SUCCESS)
}

fn handle_prepare(args: &DataArgs, options: &GlobalOptions) -> anyhow::Result<ExitCode> {
    let config = resolve_config(options, &args.overrides()?)?;
    let _guard = start_logging(options, &config)?;
    let processed = load_annotations(&config)?;
    let d = &config.data;

    for (test, records) in [(false, &processed.train), (true, &processed.test)] {
        let dataset = ManifestDataset::new(&d.root, records, d.target_dim);
        let path = d.prepared_dir().join(prepared_file_name(d.target_dim, test));
        let report = write_prepared(&dataset, &path, d.max_segments)
            .with_context(|| format!("failed to write {}", path.display()))?;
        let stats = dataset.stats();
        println!(
            "Wrote {} ({} images, {} segments, {} truncated, {} skipped segments)",
            path.display(),
            report.images,
            report.segments,
            report.truncated_images,
            stats.skipped_segments
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_config(
    action: ConfigAction,
    config: Option<&Path>,
    workspace: &Path,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace.join(DEFAULT_CONFIG_FILE);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            let toml_str = toml::to_string_pretty(&TrainConfig::default())?;
            atomic_write(&config_path, toml_str.as_bytes())?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(config, None).context("failed to load config")?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{toml_str}");
            Ok(())
        }
    }
}

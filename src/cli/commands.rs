//! CLI command definitions for spineforge.
//!
//! One-shot entry points over the pipeline pieces: the full run, assembly
//! only, stage execution only, and the standalone remap / alternate-channel
//! utilities.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};

use crate::channels::{extract_alternate, ChannelSelection};
use crate::config::{default_variants, PipelineConfig, VariantSpec};
use crate::dataset::{AssembleOptions, Assembler};
use crate::remap::{remap_dir, LabelMap, UnmappedPolicy};
use crate::resources::{compute_budget, ResourceBudget, SystemProbe};
use crate::stages::StageExecutor;
use crate::trainer::NnUnetTrainer;
use crate::transforms::{NoopAugmenter, NoopTransforms, ProcessAugmenter, ProcessTransforms};

/// Spine segmentation training pipeline orchestrator.
#[derive(Parser)]
#[command(name = "spineforge")]
#[command(about = "Assemble spine segmentation datasets and drive nnU-Net training")]
#[command(version)]
#[command(
    long_about = "spineforge builds trainer-ready spine segmentation datasets from raw \
image/label collections and drives the nnU-Net stage sequence (fingerprint, plan, \
preprocess, train, export, evaluate, package) with idempotent resume.\n\nExample usage:\n  \
spineforge run --images ./raw/images --labels ./raw/labels --work-dir ./spineforge-data"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Assemble all dataset variants and run every training stage.
    Run(RunArgs),

    /// Assemble dataset variants without training.
    #[command(alias = "asm")]
    Assemble(AssembleArgs),

    /// Run the training stage sequence over already-assembled datasets.
    Train(TrainArgs),

    /// Apply a label map to every volume under a directory.
    Remap(RemapArgs),

    /// Extract an auxiliary channel from label volumes.
    #[command(name = "alt-channel")]
    AltChannel(AltChannelArgs),

    /// Print the computed resource budget for this host.
    Budget(BudgetArgs),
}

/// Options shared by the pipeline commands.
#[derive(Parser, Debug)]
pub struct CommonArgs {
    /// Working directory for the persisted state tree.
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// General worker count (clamped to the host budget).
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,

    /// Training/decompression worker count (clamped to the host budget).
    #[arg(long)]
    pub train_jobs: Option<usize>,

    /// Compute device override (cuda, gpu, cpu).
    #[arg(long)]
    pub device: Option<String>,

    /// Seed for the deterministic train/test shuffle.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Cross-validation fold to train.
    #[arg(short = 'f', long)]
    pub fold: Option<u8>,

    /// Training configuration (e.g. 3d_fullres).
    #[arg(short = 'c', long)]
    pub configuration: Option<String>,

    /// Skip augmentation even for augmented variants.
    #[arg(long)]
    pub skip_augmentation: bool,
}

/// Arguments for `spineforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Directory of raw image volumes.
    #[arg(short = 'i', long)]
    pub images: PathBuf,

    /// Directory of raw label volumes.
    #[arg(short = 's', long)]
    pub labels: PathBuf,

    /// Which step datasets to build: 1, 2 or all.
    #[arg(long, default_value = "all")]
    pub step: String,

    /// Use no-op transform/augmentation collaborators (volumes must already
    /// be normalized).
    #[arg(long)]
    pub no_collaborators: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// Arguments for `spineforge assemble`.
#[derive(Parser, Debug)]
pub struct AssembleArgs {
    /// Directory of raw image volumes.
    #[arg(short = 'i', long)]
    pub images: PathBuf,

    /// Directory of raw label volumes.
    #[arg(short = 's', long)]
    pub labels: PathBuf,

    /// Which step dataset to build: 1 or 2.
    #[arg(long, default_value = "1")]
    pub step: String,

    /// Build a derived variant instead of the base: aug, 2ch or full.
    #[arg(long)]
    pub derive: Option<String>,

    /// Dataset id for the derived variant.
    #[arg(long)]
    pub derive_id: Option<u16>,

    /// Use no-op transform/augmentation collaborators.
    #[arg(long)]
    pub no_collaborators: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// Arguments for `spineforge train`.
#[derive(Parser, Debug)]
pub struct TrainArgs {
    /// Which step datasets to train: 1, 2 or all.
    #[arg(long, default_value = "all")]
    pub step: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// Arguments for `spineforge remap`.
#[derive(Parser, Debug)]
pub struct RemapArgs {
    /// Source directory of label volumes.
    #[arg(short = 'i', long)]
    pub source: PathBuf,

    /// Destination directory.
    #[arg(short = 'o', long)]
    pub dest: PathBuf,

    /// Label map JSON file ({"<source>": <target>, ...}).
    #[arg(short = 'm', long)]
    pub map: PathBuf,

    /// Suffix appended to output stems.
    #[arg(long)]
    pub suffix: Option<String>,

    /// Policy for unmapped values: background or preserve.
    #[arg(long, default_value = "background")]
    pub unmapped: String,

    /// Recurse into subdirectories.
    #[arg(short = 'r', long)]
    pub recursive: bool,

    /// Worker count.
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,
}

/// Arguments for `spineforge alt-channel`.
#[derive(Parser, Debug)]
pub struct AltChannelArgs {
    /// Source directory of label volumes.
    #[arg(short = 'i', long)]
    pub labels: PathBuf,

    /// Destination directory.
    #[arg(short = 'o', long)]
    pub dest: PathBuf,

    /// Lowest instance value considered.
    #[arg(long)]
    pub range_min: i32,

    /// Highest instance value considered.
    #[arg(long)]
    pub range_max: i32,

    /// Comma-separated instance values to retain.
    #[arg(short = 'p', long)]
    pub priority: String,

    /// Suffix appended to output stems.
    #[arg(long, default_value = "_0001")]
    pub suffix: String,

    /// Recurse into subdirectories.
    #[arg(short = 'r', long)]
    pub recursive: bool,

    /// Worker count.
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,
}

/// Arguments for `spineforge budget`.
#[derive(Parser, Debug)]
pub struct BudgetArgs {
    /// Output as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses CLI arguments and runs the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Runs the selected command with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pipeline(args).await,
        Commands::Assemble(args) => run_assemble(args).await,
        Commands::Train(args) => run_train(args).await,
        Commands::Remap(args) => run_remap(args).await,
        Commands::AltChannel(args) => run_alt_channel(args).await,
        Commands::Budget(args) => run_budget(args),
    }
}

fn build_config(common: &CommonArgs) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(dir) = &common.work_dir {
        config = config.with_work_dir(dir);
    }
    if let Some(seed) = common.seed {
        config = config.with_seed(seed);
    }
    if common.jobs.is_some() {
        config = config.with_requested_jobs(common.jobs);
    }
    if common.train_jobs.is_some() {
        config = config.with_requested_train_jobs(common.train_jobs);
    }
    if let Some(device) = &common.device {
        let device = device.parse().map_err(anyhow::Error::msg)?;
        config = config.with_device_override(Some(device));
    }
    if let Some(fold) = common.fold {
        config = config.with_fold(fold);
    }
    if let Some(configuration) = &common.configuration {
        config = config.with_configuration(configuration.clone());
    }
    config = config.with_skip_augmentation(common.skip_augmentation);
    config.validate()?;
    Ok(config)
}

fn budget_for(config: &PipelineConfig) -> ResourceBudget {
    compute_budget(
        &SystemProbe,
        config.requested_jobs,
        config.requested_train_jobs,
        config.device_override,
    )
}

fn select_variants(step: &str) -> anyhow::Result<Vec<VariantSpec>> {
    match step {
        "all" => Ok(default_variants()),
        "1" => Ok(vec![VariantSpec::step1()]),
        "2" => Ok(vec![VariantSpec::step2()]),
        other => bail!("unknown step '{other}' (expected 1, 2 or all)"),
    }
}

fn build_assembler(
    config: &PipelineConfig,
    budget: ResourceBudget,
    no_collaborators: bool,
) -> Assembler {
    if no_collaborators {
        Assembler::new(
            config.layout(),
            budget,
            Arc::new(NoopTransforms),
            Arc::new(NoopAugmenter),
        )
    } else {
        Assembler::new(
            config.layout(),
            budget,
            Arc::new(ProcessTransforms),
            Arc::new(ProcessAugmenter),
        )
    }
}

fn build_executor(config: &PipelineConfig, budget: ResourceBudget) -> StageExecutor {
    let layout = config.layout();
    let trainer = Arc::new(NnUnetTrainer::new(
        layout.raw(),
        layout.preprocessed(),
        layout.results(),
    ));
    StageExecutor::new(config.clone(), budget, trainer)
}

async fn run_pipeline(args: RunArgs) -> anyhow::Result<()> {
    let config = build_config(&args.common)?;
    let budget = budget_for(&config);
    let variants = select_variants(&args.step)?;

    let assembler = build_assembler(&config, budget, args.no_collaborators);
    let mut datasets = Vec::new();
    for variant in &variants {
        let options = AssembleOptions::new(variant.clone(), &config);
        let assembled = assembler
            .assemble(&args.images, &args.labels, &options)
            .await
            .with_context(|| format!("assembling {}", variant.dataset))?;
        datasets.push(assembled.dataset);
    }

    let executor = build_executor(&config, budget);
    let reports = executor.run_all(&datasets).await?;
    for (dataset, report) in datasets.iter().zip(&reports) {
        info!(
            dataset = %dataset,
            executed = report.executed.len(),
            skipped = report.skipped.len(),
            "Pipeline finished"
        );
    }
    Ok(())
}

async fn run_assemble(args: AssembleArgs) -> anyhow::Result<()> {
    let config = build_config(&args.common)?;
    let budget = budget_for(&config);
    let mut variants = select_variants(&args.step)?;
    if variants.len() != 1 {
        bail!("assemble builds one step dataset at a time");
    }
    let mut variant = variants.remove(0);
    if let Some(kind) = &args.derive {
        let id = args
            .derive_id
            .context("--derive requires --derive-id for the new dataset")?;
        variant = match kind.as_str() {
            "aug" => VariantSpec::augmented_from(&variant, id),
            "2ch" => VariantSpec::two_channel_from(&variant, id),
            "full" => VariantSpec::full_from(&variant, id),
            other => bail!("unknown derivative '{other}' (expected aug, 2ch or full)"),
        };
    }

    let assembler = build_assembler(&config, budget, args.no_collaborators);
    let options = AssembleOptions::new(variant, &config);
    let assembled = assembler
        .assemble(&args.images, &args.labels, &options)
        .await?;
    info!(
        dataset = %assembled.dataset,
        training = assembled.num_training,
        test = assembled.num_test,
        "Assembly complete"
    );
    Ok(())
}

async fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let config = build_config(&args.common)?;
    let budget = budget_for(&config);
    let datasets: Vec<_> = select_variants(&args.step)?
        .into_iter()
        .map(|v| v.dataset)
        .collect();

    let executor = build_executor(&config, budget);
    for dataset in &datasets {
        let report = executor.run(dataset).await?;
        info!(
            dataset = %dataset,
            executed = ?report.executed,
            skipped = ?report.skipped,
            "Stage sequence finished"
        );
    }
    Ok(())
}

async fn run_remap(args: RemapArgs) -> anyhow::Result<()> {
    let policy = match args.unmapped.as_str() {
        "background" => UnmappedPolicy::Background(0),
        "preserve" => UnmappedPolicy::Preserve,
        other => bail!("unknown unmapped policy '{other}' (expected background or preserve)"),
    };
    let map = LabelMap::from_file(&args.map)?.with_unmapped_policy(policy);
    let budget = compute_budget(&SystemProbe, args.jobs, None, None);

    let report = remap_dir(
        &args.source,
        &args.dest,
        &map,
        args.suffix.as_deref(),
        args.recursive,
        budget.jobs,
    )
    .await?;
    info!(processed = report.processed, "Remap complete");
    if !report.is_clean() {
        for failure in &report.failures {
            warn!(path = %failure.path.display(), reason = %failure.message, "Volume failed");
        }
        bail!("{} volume(s) failed to remap", report.failures.len());
    }
    Ok(())
}

async fn run_alt_channel(args: AltChannelArgs) -> anyhow::Result<()> {
    let priority: Vec<i32> = args
        .priority
        .split(',')
        .map(|v| v.trim().parse::<i32>())
        .collect::<Result<_, _>>()
        .context("priority list must be comma-separated integers")?;
    let selection = ChannelSelection::new(args.range_min..=args.range_max, priority);
    let budget = compute_budget(&SystemProbe, args.jobs, None, None);

    let report = extract_alternate(
        &args.labels,
        &args.dest,
        &selection,
        &args.suffix,
        args.recursive,
        budget.jobs,
    )
    .await?;
    info!(processed = report.processed, "Channel extraction complete");
    if !report.is_clean() {
        bail!("{} volume(s) failed", report.failures.len());
    }
    Ok(())
}

fn run_budget(args: BudgetArgs) -> anyhow::Result<()> {
    let config = build_config(&args.common)?;
    let budget = budget_for(&config);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&budget)?);
    } else {
        println!("jobs:              {}", budget.jobs);
        println!("jobs for training: {}", budget.jobs_for_training);
        println!("device:            {}", budget.device);
    }
    Ok(())
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use tilestream::config::ExtractArgs;
use tilestream::core::record::container_name;
use tilestream::dataset::{split_container_by_roi, Annotations, BalanceStrategy, ClipStrategy, Dataset};
use tilestream::error::TileError;
use tilestream::manifest::Manifest;
use tilestream::roi::{rois_for_slide, RoiSet};
use tilestream::runner::{extract_one, run_extraction, Isolation, RunnerOptions};
use tilestream::sampler::{Augment, SamplerOptions, TileSampler};
use tilestream::split::{split, GreedySiteSolver, SiteSolver, SplitRequest, SplitStrategy};
use tilestream::ExtractOptions;

const SLIDE_EXTENSIONS: &[&str] =
    &["svs", "tif", "tiff", "ndpi", "vms", "vmu", "scn", "mrxs", "svslide", "bif", "png", "jpg", "jpeg"];

#[derive(Parser, Debug)]
#[command(name = "tilestream", version, about = "Whole-slide tile extraction and sampling")]
struct Cli {
    /// Log at info level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Rayon worker threads for tile processing
    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract tiles from slides into record containers
    Extract(ExtractCmd),
    /// Extract one slide and print its report as JSON (subprocess worker)
    #[command(hide = true)]
    ExtractSlide(ExtractSlideCmd),
    /// Update and print the record-count manifest of a container directory
    Manifest {
        dir: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Build container indices
    Index {
        dirs: Vec<PathBuf>,
        #[arg(long)]
        force: bool,
    },
    /// Split slides into training and validation sets
    Split(SplitCmd),
    /// Stream tiles and print per-slide draw counts
    Sample(SampleCmd),
    /// Rewrite a container into inside/outside ROI containers
    SplitRoi {
        #[arg(long)]
        container: PathBuf,
        #[arg(long)]
        roi_dir: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ExtractCmd {
    /// Slide files or directories to search
    #[arg(required = true)]
    slides: Vec<PathBuf>,

    /// Output directory for containers
    #[arg(long)]
    out: PathBuf,

    /// Concurrent slides
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Run each slide in a child process
    #[arg(long)]
    subprocess: bool,

    /// Skip slides whose container is already complete
    #[arg(long)]
    skip_extracted: bool,

    /// Copy slides to this directory before extraction
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// Slides queued (and staged) ahead of the workers
    #[arg(long, default_value_t = 4)]
    queue_depth: usize,

    #[command(flatten)]
    extract: ExtractArgs,
}

#[derive(Args, Debug)]
struct ExtractSlideCmd {
    #[arg(long)]
    slide: PathBuf,

    #[arg(long)]
    out: PathBuf,

    #[command(flatten)]
    extract: ExtractArgs,
}

#[derive(Args, Debug)]
struct DatasetArgs {
    /// Container directories
    #[arg(long = "dir", required = true)]
    dirs: Vec<PathBuf>,

    /// Annotations CSV (slide, patient, label columns, site)
    #[arg(long)]
    annotations: Option<PathBuf>,
}

impl DatasetArgs {
    fn dataset(&self) -> Result<Dataset> {
        let annotations = match &self.annotations {
            Some(path) => Annotations::load_csv(path)?,
            None => Annotations::default(),
        };
        Ok(Dataset::new(self.dirs.clone(), annotations))
    }
}

#[derive(Args, Debug)]
struct SplitCmd {
    #[command(flatten)]
    dataset: DatasetArgs,

    /// Outcome annotation header
    #[arg(long)]
    outcome: String,

    /// none, bootstrap, fixed, k-fold, k-fold-preserved-site
    #[arg(long, default_value = "k-fold")]
    strategy: String,

    #[arg(long)]
    val_fraction: Option<f64>,

    #[arg(long)]
    k_fold: Option<usize>,

    #[arg(long)]
    k_fold_iter: Option<usize>,

    /// Persisted splits file
    #[arg(long)]
    splits: Option<PathBuf>,

    #[arg(long)]
    read_only: bool,

    /// Treat the outcome as continuous
    #[arg(long)]
    linear: bool,

    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Debug)]
struct SampleCmd {
    #[command(flatten)]
    dataset: DatasetArgs,

    /// Tiles to draw
    #[arg(short, long, default_value_t = 1000)]
    n: usize,

    /// tile, slide, patient, category
    #[arg(long)]
    balance: Option<String>,

    /// slide, patient, category
    #[arg(long)]
    clip: Option<String>,

    /// Label header for category clip/balance
    #[arg(long)]
    header: Option<String>,

    #[arg(long)]
    max_tiles: Option<usize>,

    #[arg(long)]
    infinite: bool,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long, default_value_t = 4)]
    decode_threads: usize,

    /// Augmentation flags, e.g. xyrjb
    #[arg(long, default_value = "")]
    augment: String,

    #[arg(long)]
    standardize: bool,
}

fn invalid(e: String) -> anyhow::Error {
    TileError::InvalidConfig(e).into()
}

/// Expand directories into the slide files they contain, sorted.
fn find_slides(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let is_slide = |p: &Path| {
        p.extension()
            .and_then(|e| e.to_str())
            .map(|e| SLIDE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false)
    };
    let mut out = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_slide(p))
                .collect();
            found.sort();
            out.extend(found);
        } else {
            out.push(path.clone());
        }
    }
    Ok(out)
}

fn cmd_extract(cmd: ExtractCmd) -> Result<()> {
    let config = cmd.extract.to_config()?;
    let slides = find_slides(&cmd.slides)?;
    if slides.is_empty() {
        return Err(anyhow!("no slides found"));
    }
    let mut opts = RunnerOptions::new(&cmd.out);
    opts.num_workers = cmd.workers;
    opts.isolation = if cmd.subprocess { Isolation::Subprocess } else { Isolation::InProcess };
    opts.skip_extracted = cmd.skip_extracted;
    opts.staging_dir = cmd.staging_dir;
    opts.queue_depth = cmd.queue_depth;

    let summary = run_extraction(&slides, &config, &opts)?;
    let tiles: usize = summary.reports.iter().map(|r| r.tiles_written).sum();
    println!(
        "{} slides extracted ({} tiles), {} skipped, {} failed",
        summary.reports.len(),
        tiles,
        summary.skipped.len(),
        summary.failed.len()
    );
    for (slide, reason) in &summary.failed {
        println!("  FAILED {}: {}", slide, reason);
    }
    Ok(())
}

fn cmd_extract_slide(cmd: ExtractSlideCmd) -> Result<()> {
    let config = cmd.extract.to_config()?;
    let report = extract_one(&cmd.slide, &config, &ExtractOptions::new(&cmd.out))?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

fn cmd_manifest(dir: &Path, force: bool) -> Result<()> {
    let manifest = Manifest::update(dir, force)?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

fn cmd_index(dirs: Vec<PathBuf>, force: bool) -> Result<()> {
    let built = Dataset::new(dirs, Annotations::default()).build_index(force)?;
    println!("{} indices built", built);
    Ok(())
}

fn cmd_split(cmd: SplitCmd) -> Result<()> {
    let dataset = cmd.dataset.dataset()?;
    let mut req = SplitRequest::new(cmd.strategy.parse().map_err(invalid)?, &cmd.outcome);
    req.val_fraction = cmd.val_fraction;
    req.k_fold = cmd.k_fold;
    req.k_fold_iter = cmd.k_fold_iter;
    req.splits_file = cmd.splits;
    req.read_only = cmd.read_only;
    req.linear = cmd.linear;
    req.seed = cmd.seed;

    let solver = GreedySiteSolver;
    let solver: Option<&dyn SiteSolver> =
        if req.strategy == SplitStrategy::KFoldPreservedSite { Some(&solver) } else { None };
    let result = split(&dataset, &req, solver)?;
    println!("training:   {} slides", result.training.len());
    println!("validation: {} slides", result.validation.len());
    Ok(())
}

fn cmd_sample(cmd: SampleCmd) -> Result<()> {
    let mut dataset = cmd.dataset.dataset()?;
    let clip: Option<ClipStrategy> = cmd.clip.as_deref().map(str::parse::<ClipStrategy>).transpose().map_err(invalid)?;
    let header = cmd.header.as_deref();
    if clip.is_some() || cmd.max_tiles.is_some() {
        dataset = dataset.clip(cmd.max_tiles, clip, header)?;
    }
    if let Some(balance) = &cmd.balance {
        let strategy: BalanceStrategy = balance.parse().map_err(invalid)?;
        dataset = dataset.balance(Some(strategy), header)?;
    }
    dataset.build_index(false)?;

    let opts = SamplerOptions {
        infinite: cmd.infinite,
        seed: cmd.seed,
        num_threads: cmd.decode_threads,
        augment: cmd.augment.parse::<Augment>().map_err(invalid)?,
        standardize: cmd.standardize,
        ..Default::default()
    };
    let mut sampler = TileSampler::from_dataset(&dataset, opts)?;
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut errors = 0usize;
    for item in sampler.by_ref().take(cmd.n) {
        match item {
            Ok(tile) => *counts.entry(tile.slide).or_default() += 1,
            Err(e) => {
                warn!("{:#}", e);
                errors += 1;
            }
        }
    }
    sampler.close();

    let total: usize = counts.values().sum();
    for (slide, n) in &counts {
        println!("{}\t{}", slide, n);
    }
    println!("total\t{}", total);
    if errors > 0 {
        println!("errors\t{}", errors);
    }
    Ok(())
}

fn cmd_split_roi(container: &Path, roi_dir: &Path, out: &Path) -> Result<()> {
    let slide = container_name(container);
    let rois = RoiSet::from_rois(&rois_for_slide(Some(roi_dir), &slide)?, &slide);
    if rois.is_empty() {
        return Err(TileError::MissingRoi { slide, method: "split".into() }.into());
    }
    let split = split_container_by_roi(container, &rois, out)?;
    println!("{}: {} inside, {} outside", split.slide, split.inside, split.outside);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    // stdout carries command output (and worker reports)
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(threads) = cli.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|e| anyhow!("rayon init failed: {}", e))?;
        info!("Using {} rayon threads", threads);
    }

    match cli.command {
        Command::Extract(cmd) => cmd_extract(cmd),
        Command::ExtractSlide(cmd) => cmd_extract_slide(cmd),
        Command::Manifest { dir, force } => cmd_manifest(&dir, force),
        Command::Index { dirs, force } => cmd_index(dirs, force),
        Command::Split(cmd) => cmd_split(cmd),
        Command::Sample(cmd) => cmd_sample(cmd),
        Command::SplitRoi { container, roi_dir, out } => cmd_split_roi(&container, &roi_dir, &out),
    }
}

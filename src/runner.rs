//! Multi-slide extraction: a producer feeds slide paths (optionally staged
//! into a local buffer directory) through a bounded queue to slide workers.

use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam::channel::bounded;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ExtractionConfig;
use crate::core::pyramid::slide_name;
use crate::core::record::{build_index, index_path_for, CONTAINER_EXT};
use crate::error::{slide_severity, Severity, TileError};
use crate::extract::{container_path, report_path, unfinished_marker, ExtractOptions, SlideReport};
use crate::manifest::{list_containers, Manifest};
use crate::progress::{ExtractionProgress, ProgressSnapshot};
use crate::slide::Slide;

/// Config file handed to subprocess workers.
const WORKER_CONFIG_FILE: &str = ".tilestream-extract.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// Each slide runs in a child process (`tilestream extract-slide`).
    Subprocess,
    /// Slides run on worker threads; panics are caught per slide.
    InProcess,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub out_dir: PathBuf,
    pub num_workers: usize,
    pub isolation: Isolation,
    pub skip_extracted: bool,
    /// Copy slides here before extraction, at most `queue_depth` at a time.
    pub staging_dir: Option<PathBuf>,
    pub queue_depth: usize,
    pub retry_interval: Duration,
    /// Binary used for subprocess workers; defaults to the running executable.
    pub worker_exe: Option<PathBuf>,
}

impl RunnerOptions {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            num_workers: 1,
            isolation: Isolation::InProcess,
            skip_extracted: false,
            staging_dir: None,
            queue_depth: 4,
            retry_interval: Duration::from_secs(1),
            worker_exe: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub reports: Vec<SlideReport>,
    pub failed: Vec<(String, String)>,
    pub skipped: Vec<String>,
    pub progress: ProgressSnapshot,
}

/// True when a previous run finished this slide: a container or report
/// exists and no unfinished marker is left behind.
pub fn is_extracted(out_dir: &Path, slide: &str) -> bool {
    if unfinished_marker(out_dir, slide).exists() {
        return false;
    }
    container_path(out_dir, slide).exists() || report_path(out_dir, slide).exists()
}

/// Local copy area bounded to `capacity` slides.
struct StagingBuffer {
    dir: PathBuf,
    capacity: usize,
    in_use: AtomicUsize,
}

impl StagingBuffer {
    fn stage(&self, src: &Path) -> Result<PathBuf, TileError> {
        if self.in_use.load(Ordering::Acquire) >= self.capacity {
            return Err(TileError::BufferFull);
        }
        let name = src.file_name().ok_or_else(|| TileError::SlideLoad {
            path: src.to_path_buf(),
            reason: "path has no file name".into(),
        })?;
        let dst = self.dir.join(name);
        fs::copy(src, &dst)?;
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Ok(dst)
    }

    fn release(&self, staged: &Path) {
        if let Err(e) = fs::remove_file(staged) {
            warn!("Failed to remove staged copy {}: {}", staged.display(), e);
        }
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Job {
    name: String,
    path: PathBuf,
    staged: bool,
}

enum SlideOutcome {
    Done(SlideReport),
    Failed(anyhow::Error),
}

/// Open and extract a single slide in this process.
pub fn extract_one(path: &Path, config: &ExtractionConfig, opts: &ExtractOptions) -> Result<SlideReport> {
    let slide = Slide::open(path, config)?;
    slide.extract(opts)
}

fn run_in_process(job: &Job, config: &ExtractionConfig, out_dir: &Path) -> SlideOutcome {
    let opts = ExtractOptions::new(out_dir);
    match catch_unwind(AssertUnwindSafe(|| extract_one(&job.path, config, &opts))) {
        Ok(Ok(report)) => SlideOutcome::Done(report),
        Ok(Err(e)) => SlideOutcome::Failed(e),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            SlideOutcome::Failed(anyhow!("worker panicked: {}", msg))
        }
    }
}

fn run_subprocess(job: &Job, exe: &Path, config_file: &Path, out_dir: &Path) -> SlideOutcome {
    let output = Command::new(exe)
        .arg("extract-slide")
        .arg("--slide")
        .arg(&job.path)
        .arg("--out")
        .arg(out_dir)
        .arg("--config")
        .arg(config_file)
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .output();
    let output = match output {
        Ok(o) => o,
        Err(e) => return SlideOutcome::Failed(anyhow!("failed to spawn {}: {}", exe.display(), e)),
    };
    if !output.status.success() {
        return SlideOutcome::Failed(anyhow!("worker exited with {}", output.status));
    }
    match serde_json::from_slice::<SlideReport>(&output.stdout) {
        Ok(report) => SlideOutcome::Done(report),
        Err(e) => SlideOutcome::Failed(anyhow!("unreadable worker report: {}", e)),
    }
}

/// Extract many slides into `opts.out_dir`.
///
/// Per-slide failures are logged and skipped. A fatal error stops dispatch of
/// further slides and is returned after in-flight slides finish. The
/// manifest and indices of the output directory are refreshed at the end.
pub fn run_extraction(slides: &[PathBuf], config: &ExtractionConfig, opts: &RunnerOptions) -> Result<RunSummary> {
    config.validate()?;
    fs::create_dir_all(&opts.out_dir).with_context(|| format!("Failed to create {}", opts.out_dir.display()))?;
    let progress = ExtractionProgress::new(slides.len());

    let mut skipped = Vec::new();
    let mut pending = Vec::new();
    for path in slides {
        let name = slide_name(path);
        if opts.skip_extracted && is_extracted(&opts.out_dir, &name) {
            info!("{}: already extracted, skipping", name);
            progress.record_skip(&name);
            skipped.push(name);
            continue;
        }
        if unfinished_marker(&opts.out_dir, &name).exists() {
            warn!("{}: previous extraction was interrupted, re-extracting", name);
        }
        pending.push((name, path.clone()));
    }

    let config_file = opts.out_dir.join(WORKER_CONFIG_FILE);
    let worker_exe = match opts.isolation {
        Isolation::Subprocess => {
            config.save(&config_file)?;
            Some(match &opts.worker_exe {
                Some(exe) => exe.clone(),
                None => std::env::current_exe().context("Locating worker executable")?,
            })
        }
        Isolation::InProcess => None,
    };

    let staging = match &opts.staging_dir {
        Some(dir) => {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
            Some(StagingBuffer { dir: dir.clone(), capacity: opts.queue_depth.max(1), in_use: AtomicUsize::new(0) })
        }
        None => None,
    };

    struct RunState {
        reports: Vec<SlideReport>,
        failed: Vec<(String, String)>,
        extracted: Vec<String>,
        first_fatal: Option<anyhow::Error>,
    }
    let state = Mutex::new(RunState { reports: Vec::new(), failed: Vec::new(), extracted: Vec::new(), first_fatal: None });
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let (tx, rx) = bounded::<Job>(opts.queue_depth.max(1));

    thread::scope(|s| {
        let producer_stop = Arc::clone(&stop);
        let staging_ref = staging.as_ref();
        s.spawn(move || {
            for (name, path) in pending {
                if producer_stop.load(Ordering::Relaxed) {
                    break;
                }
                let job = match staging_ref {
                    Some(buf) => loop {
                        match buf.stage(&path) {
                            Ok(staged) => break Job { name: name.clone(), path: staged, staged: true },
                            Err(TileError::BufferFull) => thread::sleep(opts.retry_interval),
                            Err(e) => {
                                warn!("{}: staging failed ({}), reading in place", name, e);
                                break Job { name: name.clone(), path: path.clone(), staged: false };
                            }
                        }
                        if producer_stop.load(Ordering::Relaxed) {
                            break Job { name: name.clone(), path: path.clone(), staged: false };
                        }
                    },
                    None => Job { name, path, staged: false },
                };
                if tx.send(job).is_err() {
                    break;
                }
            }
        });

        for _ in 0..opts.num_workers.max(1) {
            let rx = rx.clone();
            let stop = Arc::clone(&stop);
            let (state, progress, staging_ref) = (&state, &progress, staging.as_ref());
            let (worker_exe, config_file) = (worker_exe.as_deref(), config_file.as_path());
            s.spawn(move || {
                for job in rx.iter() {
                    if stop.load(Ordering::Relaxed) {
                        if job.staged {
                            if let Some(buf) = staging_ref {
                                buf.release(&job.path);
                            }
                        }
                        continue;
                    }
                    let started = Instant::now();
                    let outcome = match worker_exe {
                        Some(exe) => run_subprocess(&job, exe, config_file, &opts.out_dir),
                        None => run_in_process(&job, config, &opts.out_dir),
                    };
                    if job.staged {
                        if let Some(buf) = staging_ref {
                            buf.release(&job.path);
                        }
                    }
                    match outcome {
                        SlideOutcome::Done(report) => {
                            progress.record_slide(&job.name, report.tiles_written, started.elapsed());
                            let mut st = state.lock();
                            st.extracted.push(job.name.clone());
                            st.reports.push(report);
                        }
                        SlideOutcome::Failed(err) => {
                            progress.record_failure(&job.name);
                            let severity = slide_severity(&err);
                            warn!("{}: extraction failed: {:#}", job.name, err);
                            let mut st = state.lock();
                            st.failed.push((job.name.clone(), format!("{:#}", err)));
                            if severity == Severity::Fatal && st.first_fatal.is_none() {
                                stop.store(true, Ordering::Relaxed);
                                st.first_fatal = Some(err.context(format!("Extracting {}", job.name)));
                            }
                        }
                    }
                }
            });
        }
        drop(rx);
    });

    let st = state.into_inner();
    if worker_exe.is_some() {
        let _ = fs::remove_file(&config_file);
    }
    if let Some(err) = st.first_fatal {
        return Err(err);
    }

    if !config.dry_run {
        let stale: Vec<String> = st
            .extracted
            .iter()
            .map(|n| format!("{}.{}", n, CONTAINER_EXT))
            .collect();
        Manifest::update_with(&opts.out_dir, false, &stale)?;
        for container in list_containers(&opts.out_dir)? {
            if index_path_for(&container).exists() {
                continue;
            }
            if let Err(e) = build_index(&container) {
                warn!("Not indexing {}: {:#}", container.display(), e);
            }
        }
    }

    let mut reports = st.reports;
    reports.sort_by(|a, b| a.slide.cmp(&b.slide));
    let summary = RunSummary { reports, failed: st.failed, skipped, progress: progress.snapshot() };
    info!(
        "Extraction finished: {} slides, {} failed, {} skipped, {} tiles",
        summary.reports.len(),
        summary.failed.len(),
        summary.skipped.len(),
        summary.progress.tiles_written
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ImageFormat, TileSize};
    use image::{Rgb, RgbImage};

    fn write_png(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(format!("{}.png", name));
        RgbImage::from_fn(300, 200, |x, y| Rgb([150 + (x % 50) as u8, 40 + (y % 60) as u8, 120]))
            .save(&path)
            .unwrap();
        path
    }

    fn config() -> ExtractionConfig {
        let mut c = ExtractionConfig::new(50, TileSize::Microns(100));
        c.img_format = ImageFormat::Png;
        c
    }

    #[test]
    fn test_bad_slide_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_png(dir.path(), "good");
        let missing = dir.path().join("missing.png");
        let mut opts = RunnerOptions::new(dir.path().join("out"));
        opts.num_workers = 2;
        let summary = run_extraction(&[good, missing], &config(), &opts).unwrap();
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.reports[0].tiles_written, 6);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "missing");
        let manifest = Manifest::load(&opts.out_dir);
        assert_eq!(manifest.total("good.tfrecords"), Some(6));
    }

    #[test]
    fn test_skip_extracted_and_interrupted_marker() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_png(dir.path(), "a");
        let b = write_png(dir.path(), "b");
        let mut opts = RunnerOptions::new(dir.path().join("out"));
        run_extraction(&[a.clone(), b.clone()], &config(), &opts).unwrap();

        // simulate an interrupted run for b
        fs::write(unfinished_marker(&opts.out_dir, "b"), b"").unwrap();
        opts.skip_extracted = true;
        let summary = run_extraction(&[a, b], &config(), &opts).unwrap();
        assert_eq!(summary.skipped, vec!["a".to_string()]);
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.reports[0].slide, "b");
        assert!(!unfinished_marker(&opts.out_dir, "b").exists());
        assert_eq!(Manifest::load(&opts.out_dir).total("b.tfrecords"), Some(6));
    }

    #[test]
    fn test_staging_buffer_is_drained() {
        let dir = tempfile::tempdir().unwrap();
        let slides: Vec<PathBuf> = (0..4).map(|i| write_png(dir.path(), &format!("s{}", i))).collect();
        let mut opts = RunnerOptions::new(dir.path().join("out"));
        opts.staging_dir = Some(dir.path().join("stage"));
        opts.queue_depth = 1;
        opts.num_workers = 2;
        opts.retry_interval = Duration::from_millis(10);
        let summary = run_extraction(&slides, &config(), &opts).unwrap();
        assert_eq!(summary.reports.len(), 4);
        assert_eq!(fs::read_dir(dir.path().join("stage")).unwrap().count(), 0);
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.tile_px = 0;
        let err = run_extraction(&[], &cfg, &RunnerOptions::new(dir.path())).unwrap_err();
        assert!(matches!(err.downcast_ref::<TileError>(), Some(TileError::InvalidConfig(_))));
    }
}

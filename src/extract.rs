use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use image::RgbImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ExtractionConfig, IncludeLoc};
use crate::core::encode::{create_encoder, TileEncoder};
use crate::core::record::{Record, RecordWriter, CONTAINER_EXT};
use crate::core::resize_rgb;
use crate::error::TileError;
use crate::qc::pixel_saturation;
use crate::slide::{RawTile, Slide};

/// Extension of the marker present while a slide is being extracted.
pub const UNFINISHED_EXT: &str = "unfinished";
/// Jobs processed per parallel batch; records are written in job order.
const JOB_CHUNK: usize = 256;

/// Per-tile background rejection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileFilter {
    pub whitespace_threshold: u8,
    pub whitespace_fraction: f32,
    pub grayspace_threshold: f32,
    pub grayspace_fraction: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Whitespace,
    Grayspace,
}

impl TileFilter {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            whitespace_threshold: config.whitespace_threshold,
            whitespace_fraction: config.whitespace_fraction,
            grayspace_threshold: config.grayspace_threshold,
            grayspace_fraction: config.grayspace_fraction,
        }
    }

    /// Share of pixels whose mean RGB is above the brightness threshold.
    pub fn whitespace_fraction(&self, img: &RgbImage) -> f32 {
        let n = img.width() as usize * img.height() as usize;
        if n == 0 {
            return 0.0;
        }
        let limit = self.whitespace_threshold as u32 * 3;
        let white = img.pixels().filter(|p| p.0.iter().map(|&c| c as u32).sum::<u32>() > limit).count();
        white as f32 / n as f32
    }

    /// Share of pixels whose HSV saturation is below the threshold.
    pub fn grayspace_fraction(&self, img: &RgbImage) -> f32 {
        let n = img.width() as usize * img.height() as usize;
        if n == 0 {
            return 0.0;
        }
        let limit = self.grayspace_threshold * 255.0;
        let gray = img.pixels().filter(|p| (pixel_saturation(&p.0) as f32) < limit).count();
        gray as f32 / n as f32
    }

    /// A fraction of 1.0 disables the corresponding test.
    pub fn check(&self, img: &RgbImage) -> Option<Rejection> {
        if self.whitespace_fraction < 1.0 && self.whitespace_fraction(img) > self.whitespace_fraction {
            return Some(Rejection::Whitespace);
        }
        if self.grayspace_fraction < 1.0 && self.grayspace_fraction(img) > self.grayspace_fraction {
            return Some(Rejection::Grayspace);
        }
        None
    }

    pub fn accepts(&self, img: &RgbImage) -> bool {
        self.check(img).is_none()
    }
}

/// Stain-color transform applied to accepted tiles. A failure drops the tile.
pub trait StainNormalizer: Send + Sync {
    fn transform(&self, rgb: &RgbImage) -> Result<RgbImage>;
    fn name(&self) -> &str;
}

/// Where and how one slide is written.
#[derive(Clone)]
pub struct ExtractOptions {
    pub out_dir: PathBuf,
    pub normalizer: Option<Arc<dyn StainNormalizer>>,
}

impl ExtractOptions {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self { out_dir: out_dir.into(), normalizer: None }
    }
}

pub fn container_path(out_dir: &Path, slide: &str) -> PathBuf {
    out_dir.join(format!("{}.{}", slide, CONTAINER_EXT))
}

pub fn unfinished_marker(out_dir: &Path, slide: &str) -> PathBuf {
    out_dir.join(format!("{}.{}", slide, UNFINISHED_EXT))
}

pub fn report_path(out_dir: &Path, slide: &str) -> PathBuf {
    out_dir.join(format!("{}.report.json", slide))
}

/// Distribution of encoded tile sizes in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SizeStats {
    pub count: usize,
    pub total_bytes: usize,
    pub avg: f64,
    pub min: usize,
    pub p5: usize,
    pub p25: usize,
    pub median: usize,
    pub p75: usize,
    pub p95: usize,
    pub p99: usize,
    pub max: usize,
}

impl SizeStats {
    pub fn from_sizes(mut sizes: Vec<usize>) -> Self {
        if sizes.is_empty() {
            return Self::default();
        }
        sizes.sort_unstable();
        let n = sizes.len();
        let at = |q: f64| sizes[((n as f64 * q) as usize).min(n - 1)];
        let total: usize = sizes.iter().sum();
        Self {
            count: n,
            total_bytes: total,
            avg: total as f64 / n as f64,
            min: sizes[0],
            p5: at(0.05),
            p25: at(0.25),
            median: sizes[n / 2],
            p75: at(0.75),
            p95: at(0.95),
            p99: at(0.99),
            max: sizes[n - 1],
        }
    }
}

/// Outcome of extracting one slide, saved next to its container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlideReport {
    pub slide: String,
    pub estimated_tiles: usize,
    pub tiles_written: usize,
    pub rejected_whitespace: usize,
    pub rejected_grayspace: usize,
    pub normalizer_failures: usize,
    pub blur_burden: Option<f64>,
    pub dry_run: bool,
    pub elapsed_ms: u64,
    pub tile_sizes: SizeStats,
}

impl SlideReport {
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write report {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read report {}", path.display()))?;
        Ok(serde_json::from_str(&text)?)
    }
}

enum TileOutcome {
    Encoded { bytes: Vec<u8>, loc: (i64, i64) },
    Rejected(Rejection),
    NormalizerFailed,
}

fn process_raw(
    raw: RawTile,
    config: &ExtractionConfig,
    filter: &TileFilter,
    normalizer: Option<&dyn StainNormalizer>,
    encoder: &dyn TileEncoder,
) -> Result<TileOutcome> {
    if let Some(rejection) = filter.check(&raw.image) {
        return Ok(TileOutcome::Rejected(rejection));
    }
    let mut image = raw.image;
    if let Some(norm) = normalizer {
        match norm.transform(&image) {
            Ok(out) => image = out,
            Err(e) => {
                debug!("{} failed on tile {:?}: {}", norm.name(), raw.center, e);
                return Ok(TileOutcome::NormalizerFailed);
            }
        }
    }
    let tile_px = config.tile_px;
    if image.dimensions() != (tile_px, tile_px) {
        image = resize_rgb(&image, tile_px, tile_px, config.resample)?;
    }
    let bytes = encoder.encode_rgb(&image).map_err(|e| TileError::TileCorruption {
        x: raw.center.0,
        y: raw.center.1,
        reason: e.to_string(),
    })?;
    let loc = match config.include_loc {
        IncludeLoc::Coord => raw.center,
        IncludeLoc::Grid => (raw.grid.0 as i64, raw.grid.1 as i64),
    };
    Ok(TileOutcome::Encoded { bytes, loc })
}

/// Per-slide tile pipeline shared by every job.
struct TileSink<'a> {
    name: &'a str,
    config: &'a ExtractionConfig,
    filter: TileFilter,
    normalizer: Option<&'a dyn StainNormalizer>,
    encoder: &'a dyn TileEncoder,
    tiles_dir: Option<&'a Path>,
}

/// Run every job in chunks and append accepted tiles in job order.
fn write_jobs(
    slide: &Slide,
    sink: &TileSink<'_>,
    mut writer: Option<&mut RecordWriter>,
    report: &mut SlideReport,
    sizes: &mut Vec<usize>,
) -> Result<()> {
    let config = sink.config;
    let job_ids: Vec<usize> = (0..slide.job_count()).collect();
    for chunk in job_ids.chunks(JOB_CHUNK) {
        let outcomes: Vec<Result<Vec<TileOutcome>>> = chunk
            .par_iter()
            .map(|&job| {
                slide
                    .read_job(job)?
                    .into_iter()
                    .map(|raw| process_raw(raw, config, &sink.filter, sink.normalizer, sink.encoder))
                    .collect()
            })
            .collect();

        for outcome in outcomes {
            for tile in outcome? {
                match tile {
                    TileOutcome::Encoded { bytes, loc } => {
                        if let Some(dir) = sink.tiles_dir {
                            let file = format!("{}_{}-{}.{}", sink.name, loc.0, loc.1, config.img_format.extension());
                            let path = dir.join(file);
                            fs::write(&path, &bytes).with_context(|| format!("Failed to write {}", path.display()))?;
                        }
                        sizes.push(bytes.len());
                        if let Some(w) = writer.as_deref_mut() {
                            w.write(&Record { slide: sink.name.to_string(), image_raw: bytes, loc_x: loc.0, loc_y: loc.1 })?;
                        }
                        report.tiles_written += 1;
                    }
                    TileOutcome::Rejected(Rejection::Whitespace) => report.rejected_whitespace += 1,
                    TileOutcome::Rejected(Rejection::Grayspace) => report.rejected_grayspace += 1,
                    TileOutcome::NormalizerFailed => report.normalizer_failures += 1,
                }
            }
        }
    }
    Ok(())
}

/// Extract every active job of `slide` into `{out_dir}/{slide}.tfrecords`.
///
/// A `{slide}.unfinished` marker exists for the whole write and is removed
/// only after the container and index are complete. A slide that yields no
/// tiles, or fails part-way, leaves no container behind.
pub fn extract_slide(slide: &Slide, opts: &ExtractOptions) -> Result<SlideReport> {
    let start = Instant::now();
    let config = slide.config();
    let name = slide.name().to_string();
    let encoder = create_encoder(config.img_format, config.jpeg_quality);
    let jobs = slide.job_count();

    let marker = unfinished_marker(&opts.out_dir, &name);
    let mut writer = if config.dry_run {
        None
    } else {
        fs::create_dir_all(&opts.out_dir)
            .with_context(|| format!("Failed to create {}", opts.out_dir.display()))?;
        fs::write(&marker, b"").with_context(|| format!("Failed to write marker {}", marker.display()))?;
        Some(RecordWriter::create(&container_path(&opts.out_dir, &name))?)
    };
    let tiles_dir = match (&config.tiles_dir, config.dry_run) {
        (Some(dir), false) => {
            let d = dir.join(&name);
            fs::create_dir_all(&d).with_context(|| format!("Failed to create {}", d.display()))?;
            Some(d)
        }
        _ => None,
    };

    let mut report = SlideReport {
        slide: name.clone(),
        estimated_tiles: slide.estimated_tiles(),
        blur_burden: slide.qc_report().and_then(|q| q.blur_burden),
        dry_run: config.dry_run,
        ..SlideReport::default()
    };
    let mut sizes = Vec::with_capacity(report.estimated_tiles);

    info!("{}: extracting {} jobs ({} estimated tiles)", name, jobs, report.estimated_tiles);
    let sink = TileSink {
        name: &name,
        config,
        filter: TileFilter::from_config(config),
        normalizer: opts.normalizer.as_deref(),
        encoder: encoder.as_ref(),
        tiles_dir: tiles_dir.as_deref(),
    };
    if let Err(e) = write_jobs(slide, &sink, writer.as_mut(), &mut report, &mut sizes) {
        if let Some(w) = writer {
            w.abandon();
            if let Err(rm) = fs::remove_file(&marker) {
                warn!("Failed to remove marker {}: {}", marker.display(), rm);
            }
        }
        return Err(e.context(format!("Extracting {}", name)));
    }

    if let Some(w) = writer {
        let written = w.finish()?;
        if written == 0 {
            info!("{}: no tiles passed filtering, container removed", name);
        }
        report.elapsed_ms = start.elapsed().as_millis() as u64;
        report.tile_sizes = SizeStats::from_sizes(sizes);
        report.save(&report_path(&opts.out_dir, &name))?;
        fs::remove_file(&marker).with_context(|| format!("Failed to remove marker {}", marker.display()))?;
    } else {
        report.elapsed_ms = start.elapsed().as_millis() as u64;
        report.tile_sizes = SizeStats::from_sizes(sizes);
    }

    info!(
        "{}: {} tiles{} (whitespace {}, grayspace {}, normalizer {}), {} ms",
        name,
        report.tiles_written,
        if report.dry_run { " (dry run)" } else { "" },
        report.rejected_whitespace,
        report.rejected_grayspace,
        report.normalizer_failures,
        report.elapsed_ms
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ImageFormat, TileSize};
    use crate::core::encode::decode_rgb;
    use crate::core::pyramid::{ImageFileReader, LevelInfo, PyramidReader};
    use crate::core::record::{index_path_for, read_index, RecordReader};
    use anyhow::anyhow;
    use image::Rgb;

    fn tissue_slide(config: &ExtractionConfig) -> Slide {
        // left half tissue, right half white
        let img = RgbImage::from_fn(400, 200, |x, y| {
            if x < 200 {
                Rgb([180 + (x % 30) as u8, 60 + (y % 40) as u8, 150])
            } else {
                Rgb([250, 250, 250])
            }
        });
        let reader: Box<dyn PyramidReader> = Box::new(ImageFileReader::from_image("tissue".into(), img, 0.5));
        Slide::from_reader(reader, config).unwrap()
    }

    fn config() -> ExtractionConfig {
        let mut c = ExtractionConfig::new(64, TileSize::Microns(50));
        c.img_format = ImageFormat::Png;
        c
    }

    #[test]
    fn test_filter_fractions() {
        let filter = TileFilter::from_config(&config());
        let white = RgbImage::from_pixel(10, 10, Rgb([240, 240, 240]));
        assert_eq!(filter.whitespace_fraction(&white), 1.0);
        assert_eq!(filter.grayspace_fraction(&white), 1.0);
        // default: whitespace disabled, grayspace at 0.6
        assert_eq!(filter.check(&white), Some(Rejection::Grayspace));

        let mut strict = filter;
        strict.whitespace_fraction = 0.5;
        assert_eq!(strict.check(&white), Some(Rejection::Whitespace));

        let pink = RgbImage::from_pixel(10, 10, Rgb([220, 100, 180]));
        assert!(strict.accepts(&pink));

        let off = TileFilter { whitespace_fraction: 1.0, grayspace_fraction: 1.0, ..filter };
        assert!(off.accepts(&white));
    }

    #[test]
    fn test_size_stats() {
        let stats = SizeStats::from_sizes(vec![5, 1, 3, 2, 4]);
        assert_eq!(stats.count, 5);
        assert_eq!(stats.total_bytes, 15);
        assert_eq!((stats.min, stats.median, stats.max), (1, 3, 5));
        assert_eq!(SizeStats::from_sizes(Vec::new()), SizeStats::default());
    }

    #[test]
    fn test_extract_writes_container_index_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let slide = tissue_slide(&config());
        // 100 px tiles over 400x200 -> 4x2 cells, the right half is white
        assert_eq!(slide.estimated_tiles(), 8);
        let report = slide.extract(&ExtractOptions::new(dir.path())).unwrap();
        assert_eq!(report.tiles_written, 4);
        assert_eq!(report.rejected_grayspace, 4);

        let container = container_path(dir.path(), "tissue");
        let records: Vec<Record> = RecordReader::open(&container).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 4);
        assert_eq!((records[0].loc_x, records[0].loc_y), (50, 50));
        assert_eq!((records[1].loc_x, records[1].loc_y), (150, 50));
        assert_eq!(decode_rgb(&records[0].image_raw).unwrap().dimensions(), (64, 64));
        assert_eq!(read_index(&index_path_for(&container)).unwrap().unwrap().len(), 4);

        assert!(!unfinished_marker(dir.path(), "tissue").exists());
        let saved = SlideReport::load(&report_path(dir.path(), "tissue")).unwrap();
        assert_eq!(saved.tiles_written, 4);
        assert_eq!(saved.tile_sizes.count, 4);
    }

    #[test]
    fn test_extract_grid_locations_and_loose_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.include_loc = IncludeLoc::Grid;
        cfg.tiles_dir = Some(dir.path().join("tiles"));
        let slide = tissue_slide(&cfg);
        slide.extract(&ExtractOptions::new(dir.path().join("records"))).unwrap();

        let container = container_path(&dir.path().join("records"), "tissue");
        let locs: Vec<(i64, i64)> =
            RecordReader::open(&container).unwrap().map(|r| r.unwrap()).map(|r| (r.loc_x, r.loc_y)).collect();
        assert_eq!(locs, vec![(0, 0), (1, 0), (0, 1), (1, 1)]);
        assert!(dir.path().join("tiles/tissue/tissue_1-0.png").exists());
    }

    #[test]
    fn test_empty_slide_leaves_no_container() {
        let dir = tempfile::tempdir().unwrap();
        let img = RgbImage::from_pixel(200, 200, Rgb([250, 250, 250]));
        let reader: Box<dyn PyramidReader> = Box::new(ImageFileReader::from_image("blank".into(), img, 0.5));
        let slide = Slide::from_reader(reader, &config()).unwrap();
        let report = slide.extract(&ExtractOptions::new(dir.path())).unwrap();
        assert_eq!(report.tiles_written, 0);
        assert!(!container_path(dir.path(), "blank").exists());
        assert!(!unfinished_marker(dir.path(), "blank").exists());
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.dry_run = true;
        let report = tissue_slide(&cfg).extract(&ExtractOptions::new(dir.path().join("out"))).unwrap();
        assert_eq!(report.tiles_written, 4);
        assert!(!dir.path().join("out").exists());
    }

    /// Level 0 alternates saturated red and cyan columns; level 1 (4x) is
    /// their average, flat gray.
    struct StripedReader {
        levels: Vec<LevelInfo>,
    }

    impl PyramidReader for StripedReader {
        fn name(&self) -> &str {
            "striped"
        }

        fn levels(&self) -> &[LevelInfo] {
            &self.levels
        }

        fn mpp(&self) -> f64 {
            1.0
        }

        fn read_region(&self, x: u32, _y: u32, level: usize, w: u32, h: u32) -> Result<RgbImage> {
            Ok(match level {
                0 => RgbImage::from_fn(w, h, |i, _| if (x + i) % 2 == 0 { Rgb([255, 0, 0]) } else { Rgb([0, 255, 255]) }),
                _ => RgbImage::from_pixel(w, h, Rgb([128, 128, 128])),
            })
        }
    }

    #[test]
    fn test_filter_runs_at_extraction_level() {
        let dir = tempfile::tempdir().unwrap();
        let reader = StripedReader {
            levels: vec![
                LevelInfo { width: 800, height: 800, downsample: 1.0 },
                LevelInfo { width: 200, height: 200, downsample: 4.0 },
            ],
        };
        let mut cfg = ExtractionConfig::new(200, TileSize::Microns(200));
        cfg.img_format = ImageFormat::Png;
        let filter = TileFilter::from_config(&cfg);
        // the coarse level alone would reject everything as grayspace
        assert!(!filter.accepts(&reader.read_region(0, 0, 1, 50, 50).unwrap()));
        assert!(filter.accepts(&reader.read_region(0, 0, 0, 200, 200).unwrap()));

        let slide = Slide::from_reader(Box::new(reader), &cfg).unwrap();
        let report = slide.extract(&ExtractOptions::new(dir.path())).unwrap();
        assert_eq!(report.estimated_tiles, 16);
        assert_eq!(report.tiles_written, 16);
        assert_eq!(report.rejected_grayspace, 0);
    }

    struct FailOnFirstColumn;

    impl StainNormalizer for FailOnFirstColumn {
        fn transform(&self, rgb: &RgbImage) -> Result<RgbImage> {
            // tiles from the first column have red channel starting at 180
            if rgb.get_pixel(0, 0)[0] == 180 {
                return Err(anyhow!("degenerate tile"));
            }
            Ok(rgb.clone())
        }

        fn name(&self) -> &str {
            "fail-first"
        }
    }

    #[test]
    fn test_normalizer_failure_drops_tile() {
        let dir = tempfile::tempdir().unwrap();
        let slide = tissue_slide(&config());
        let mut opts = ExtractOptions::new(dir.path());
        opts.normalizer = Some(Arc::new(FailOnFirstColumn));
        let report = slide.extract(&opts).unwrap();
        assert_eq!(report.normalizer_failures, 2);
        assert_eq!(report.tiles_written, 2);
    }
}

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};

use crate::core::ResampleFilter;
use crate::error::TileError;

/// Physical size of one tile: microns, or an objective magnification such as "20x".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileSize {
    Microns(u32),
    Magnification(f64),
}

impl fmt::Display for TileSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileSize::Microns(um) => write!(f, "{}um", um),
            TileSize::Magnification(mag) => write!(f, "{}x", mag),
        }
    }
}

impl FromStr for TileSize {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if let Some(mag) = s.strip_suffix('x') {
            let mag: f64 = mag
                .parse()
                .map_err(|_| format!("invalid magnification '{}'", s))?;
            if mag <= 0.0 {
                return Err(format!("magnification must be positive, got '{}'", s));
            }
            return Ok(TileSize::Magnification(mag));
        }
        let um = s.strip_suffix("um").unwrap_or(&s);
        um.parse::<u32>()
            .map(TileSize::Microns)
            .map_err(|_| format!("invalid tile size '{}': expected microns (302) or magnification (20x)", s))
    }
}

/// How ROIs restrict the extraction grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoiMethod {
    Inside,
    Outside,
    Auto,
    Ignore,
}

impl fmt::Display for RoiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoiMethod::Inside => "inside",
            RoiMethod::Outside => "outside",
            RoiMethod::Auto => "auto",
            RoiMethod::Ignore => "ignore",
        };
        f.write_str(s)
    }
}

impl FromStr for RoiMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inside" => Ok(RoiMethod::Inside),
            "outside" => Ok(RoiMethod::Outside),
            "auto" => Ok(RoiMethod::Auto),
            "ignore" => Ok(RoiMethod::Ignore),
            _ => Err(format!("unknown ROI method '{}'. Available: inside, outside, auto, ignore", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QcMethod {
    None,
    Otsu,
    Blur,
    Both,
}

impl FromStr for QcMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "" => Ok(QcMethod::None),
            "otsu" => Ok(QcMethod::Otsu),
            "blur" => Ok(QcMethod::Blur),
            "both" => Ok(QcMethod::Both),
            _ => Err(format!("unknown QC method '{}'. Available: none, otsu, blur, both", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcConfig {
    pub method: QcMethod,
    pub blur_radius: f32,
    pub blur_threshold: f32,
    pub filter_threshold: f32,
    pub blur_mpp: f64,
}

impl Default for QcConfig {
    fn default() -> Self {
        Self {
            method: QcMethod::None,
            blur_radius: 3.0,
            blur_threshold: 0.02,
            filter_threshold: 0.6,
            blur_mpp: 4.0,
        }
    }
}

/// Encoding used for tile images inside record containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpg,
    Png,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpg => "jpg",
            ImageFormat::Png => "png",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(ImageFormat::Jpg),
            "png" => Ok(ImageFormat::Png),
            _ => Err(format!("unknown image format '{}'. Available: jpg, png", s)),
        }
    }
}

/// What is stored in a record's loc_x/loc_y fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncludeLoc {
    /// Level-0 pixel coordinates of the tile center.
    Coord,
    /// Grid column and row.
    Grid,
}

impl FromStr for IncludeLoc {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "coord" => Ok(IncludeLoc::Coord),
            "grid" => Ok(IncludeLoc::Grid),
            _ => Err(format!("unknown loc mode '{}'. Available: coord, grid", s)),
        }
    }
}

/// Which slide variant to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlideKind {
    /// Whole-slide image tiled on a regular grid.
    #[default]
    Wsi,
    /// Tissue microarray: one or more tiles per detected core.
    Tma,
}

impl FromStr for SlideKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "wsi" => Ok(SlideKind::Wsi),
            "tma" => Ok(SlideKind::Tma),
            _ => Err(format!("unknown slide kind '{}'. Available: wsi, tma", s)),
        }
    }
}

/// Core detection settings for tissue microarrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TmaOptions {
    /// Detection thumbnail width is the level-0 width divided by this.
    pub thumb_divisor: u32,
    /// Cores must be wider and taller than this, in thumbnail pixels.
    pub min_core_px: u32,
    /// A pixel is foreground when any channel is below `255 - foreground_margin`.
    pub foreground_margin: u8,
}

impl Default for TmaOptions {
    fn default() -> Self {
        Self { thumb_divisor: 100, min_core_px: 20, foreground_margin: 28 }
    }
}

/// Immutable extraction settings, built once and shared by every worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub tile_px: u32,
    pub tile_um: TileSize,
    pub stride_div: u32,
    pub enable_downsample: bool,
    pub roi_method: RoiMethod,
    pub roi_dir: Option<PathBuf>,
    pub qc: QcConfig,
    pub whitespace_threshold: u8,
    pub whitespace_fraction: f32,
    pub grayspace_threshold: f32,
    pub grayspace_fraction: f32,
    pub img_format: ImageFormat,
    pub jpeg_quality: u8,
    pub resample: ResampleFilter,
    pub random_origin: bool,
    pub seed: u64,
    pub include_loc: IncludeLoc,
    pub dry_run: bool,
    pub mpp_override: Option<f64>,
    pub tiles_dir: Option<PathBuf>,
    #[serde(default)]
    pub slide_kind: SlideKind,
    #[serde(default)]
    pub tma: TmaOptions,
}

impl ExtractionConfig {
    pub fn new(tile_px: u32, tile_um: TileSize) -> Self {
        Self {
            tile_px,
            tile_um,
            stride_div: 1,
            enable_downsample: true,
            roi_method: RoiMethod::Auto,
            roi_dir: None,
            qc: QcConfig::default(),
            whitespace_threshold: 230,
            whitespace_fraction: 1.0,
            grayspace_threshold: 0.05,
            grayspace_fraction: 0.6,
            img_format: ImageFormat::Jpg,
            jpeg_quality: 100,
            resample: ResampleFilter::Lanczos3,
            random_origin: false,
            seed: 0,
            include_loc: IncludeLoc::Coord,
            dry_run: false,
            mpp_override: None,
            tiles_dir: None,
            slide_kind: SlideKind::Wsi,
            tma: TmaOptions::default(),
        }
    }

    pub fn validate(&self) -> Result<(), TileError> {
        if self.tile_px == 0 {
            return Err(TileError::InvalidConfig("tile_px must be positive".into()));
        }
        match self.tile_um {
            TileSize::Microns(0) => {
                return Err(TileError::InvalidConfig("tile_um must be positive".into()))
            }
            TileSize::Magnification(m) if m <= 0.0 || !m.is_finite() => {
                return Err(TileError::InvalidConfig(format!("invalid magnification {}", m)))
            }
            _ => {}
        }
        if self.stride_div == 0 {
            return Err(TileError::InvalidConfig("stride_div must be at least 1".into()));
        }
        for (name, v) in [
            ("whitespace_fraction", self.whitespace_fraction),
            ("grayspace_fraction", self.grayspace_fraction),
            ("grayspace_threshold", self.grayspace_threshold),
            ("qc.filter_threshold", self.qc.filter_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(TileError::InvalidConfig(format!("{} must be in [0, 1], got {}", name, v)));
            }
        }
        if self.tma.thumb_divisor == 0 {
            return Err(TileError::InvalidConfig("tma.thumb_divisor must be at least 1".into()));
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(TileError::InvalidConfig("jpeg_quality must be in 1..=100".into()));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: ExtractionConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("Failed to write config {}", path.display()))
    }
}

/// Extraction flags shared by the `extract` and `extract-slide` subcommands.
#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    /// Load all settings from a JSON config instead of the flags below
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Output tile size in pixels
    #[arg(long, default_value_t = 299)]
    pub tile_px: u32,

    /// Physical tile size: microns (302) or magnification (20x)
    #[arg(long, default_value = "302")]
    pub tile_um: String,

    /// Stride divisor (1 = no overlap, 2 = 50% overlap)
    #[arg(long, default_value_t = 1)]
    pub stride_div: u32,

    /// Read every tile from level 0 instead of the best downsampled level
    #[arg(long)]
    pub no_downsample: bool,

    /// ROI policy: inside, outside, auto, ignore
    #[arg(long, default_value = "auto")]
    pub roi_method: String,

    /// Directory holding {slide}.csv / {slide}.json ROI files
    #[arg(long)]
    pub roi_dir: Option<PathBuf>,

    /// Slide-level QC: none, otsu, blur, both
    #[arg(long, default_value = "none")]
    pub qc: String,

    /// Fraction of excluded QC mask above which a cell is disabled
    #[arg(long, default_value_t = 0.6)]
    pub qc_filter_threshold: f32,

    /// Brightness (0-255) above which a pixel counts as whitespace
    #[arg(long, default_value_t = 230)]
    pub whitespace_threshold: u8,

    /// Drop tiles with more whitespace than this (1.0 disables)
    #[arg(long, default_value_t = 1.0)]
    pub whitespace_fraction: f32,

    /// HSV saturation (0-1) below which a pixel counts as grayspace
    #[arg(long, default_value_t = 0.05)]
    pub grayspace_threshold: f32,

    /// Drop tiles with more grayspace than this (1.0 disables)
    #[arg(long, default_value_t = 0.6)]
    pub grayspace_fraction: f32,

    /// Tile image format: jpg or png
    #[arg(long, default_value = "jpg")]
    pub img_format: String,

    /// JPEG quality
    #[arg(long, default_value_t = 100)]
    pub jpeg_quality: u8,

    /// Resize filter: bilinear, bicubic, lanczos3
    #[arg(long, default_value = "lanczos3")]
    pub resample: String,

    /// Jitter the grid origin by a random sub-stride offset
    #[arg(long)]
    pub random_origin: bool,

    /// Seed for origin jitter
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Record location mode: coord or grid
    #[arg(long, default_value = "coord")]
    pub include_loc: String,

    /// Count tiles without writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Microns-per-pixel to use when the slide has no resolution metadata
    #[arg(long)]
    pub mpp: Option<f64>,

    /// Also export loose tile images under this directory
    #[arg(long)]
    pub tiles_dir: Option<PathBuf>,

    /// Slide kind: wsi or tma
    #[arg(long, default_value = "wsi")]
    pub kind: String,
}

impl ExtractArgs {
    pub fn to_config(&self) -> Result<ExtractionConfig> {
        if let Some(path) = &self.config {
            return ExtractionConfig::load(path);
        }
        let parse_err = |e: String| anyhow::Error::from(TileError::InvalidConfig(e));
        let tile_um: TileSize = self.tile_um.parse().map_err(parse_err)?;
        let mut config = ExtractionConfig::new(self.tile_px, tile_um);
        config.stride_div = self.stride_div;
        config.enable_downsample = !self.no_downsample;
        config.roi_method = self.roi_method.parse().map_err(parse_err)?;
        config.roi_dir = self.roi_dir.clone();
        config.qc.method = self.qc.parse().map_err(parse_err)?;
        config.qc.filter_threshold = self.qc_filter_threshold;
        config.whitespace_threshold = self.whitespace_threshold;
        config.whitespace_fraction = self.whitespace_fraction;
        config.grayspace_threshold = self.grayspace_threshold;
        config.grayspace_fraction = self.grayspace_fraction;
        config.img_format = self.img_format.parse().map_err(parse_err)?;
        config.jpeg_quality = self.jpeg_quality;
        config.resample = self.resample.parse().map_err(parse_err)?;
        config.random_origin = self.random_origin;
        config.seed = self.seed;
        config.include_loc = self.include_loc.parse().map_err(parse_err)?;
        config.dry_run = self.dry_run;
        config.mpp_override = self.mpp;
        config.tiles_dir = self.tiles_dir.clone();
        config.slide_kind = self.kind.parse().map_err(parse_err)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_size_parse() {
        assert_eq!("302".parse::<TileSize>(), Ok(TileSize::Microns(302)));
        assert_eq!("302um".parse::<TileSize>(), Ok(TileSize::Microns(302)));
        assert_eq!("20x".parse::<TileSize>(), Ok(TileSize::Magnification(20.0)));
        assert_eq!("2.5X".parse::<TileSize>(), Ok(TileSize::Magnification(2.5)));
        assert!("abc".parse::<TileSize>().is_err());
        assert!("0x".parse::<TileSize>().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ExtractionConfig::new(0, TileSize::Microns(302));
        assert!(matches!(config.validate(), Err(TileError::InvalidConfig(_))));

        config.tile_px = 256;
        assert!(config.validate().is_ok());

        config.stride_div = 0;
        assert!(config.validate().is_err());
        config.stride_div = 2;

        config.grayspace_fraction = 1.5;
        assert!(config.validate().is_err());
        config.grayspace_fraction = 0.6;

        config.tile_um = TileSize::Microns(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = ExtractionConfig::new(256, TileSize::Magnification(20.0));
        config.roi_method = RoiMethod::Inside;
        config.qc.method = QcMethod::Both;
        config.save(&path).unwrap();
        let loaded = ExtractionConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops, Rgb, RgbImage};
use tracing::{debug, info};

use crate::error::TileError;

/// Private TIFF tag some scanners use to store microns-per-pixel as text.
pub const TIFF_MPP_TAG: u16 = 65326;
/// Resolution assumed for plain JPEG/PNG images, which carry no physical units.
pub const DEFAULT_JPG_MPP: f64 = 1.0;
const MAX_PLAUSIBLE_MPP: f64 = 1000.0;

/// Extensions read through libopenslide when the `openslide` feature is on.
pub const OPENSLIDE_EXTENSIONS: &[&str] = &["svs", "ndpi", "mrxs", "vms", "vmu", "scn", "bif", "svslide"];

/// One resolution level of a pyramid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelInfo {
    pub width: u32,
    pub height: u32,
    /// Downsample relative to level 0.
    pub downsample: f64,
}

/// A multi-resolution slide image.
pub trait PyramidReader: Send + Sync {
    fn name(&self) -> &str;

    /// Levels ordered from full resolution (level 0) to coarsest.
    fn levels(&self) -> &[LevelInfo];

    /// Microns per pixel at level 0.
    fn mpp(&self) -> f64;

    /// Read a `w` x `h` region of `level`, with the origin in level-0 pixels.
    /// Pixels outside the image are white.
    fn read_region(&self, x: u32, y: u32, level: usize, w: u32, h: u32) -> Result<RgbImage>;

    fn dimensions(&self) -> (u32, u32) {
        let l0 = self.levels()[0];
        (l0.width, l0.height)
    }

    fn level_count(&self) -> usize {
        self.levels().len()
    }

    /// Read an entire level into memory.
    fn read_level(&self, level: usize) -> Result<RgbImage> {
        let info = self
            .levels()
            .get(level)
            .copied()
            .ok_or_else(|| anyhow!("level {} out of range", level))?;
        self.read_region(0, 0, level, info.width, info.height)
    }
}

/// Index of the coarsest level whose downsample does not exceed `downsample`.
/// Falls back to level 0.
pub fn best_level_for_downsample(levels: &[LevelInfo], downsample: f64) -> usize {
    let mut best = 0;
    let mut best_ds = 0.0;
    for (i, level) in levels.iter().enumerate() {
        if level.downsample <= downsample + 1e-6 && level.downsample > best_ds {
            best = i;
            best_ds = level.downsample;
        }
    }
    best
}

/// Thumbnail `width` pixels wide, read from the coarsest sufficient level.
pub fn thumbnail(reader: &dyn PyramidReader, width: u32) -> Result<RgbImage> {
    let (w0, h0) = reader.dimensions();
    let width = width.clamp(1, w0.max(1));
    let height = ((h0 as f64 * width as f64 / w0 as f64).round() as u32).max(1);
    let level = best_level_for_downsample(reader.levels(), w0 as f64 / width as f64);
    let img = reader.read_level(level)?;
    Ok(imageops::resize(&img, width, height, imageops::FilterType::Triangle))
}

/// Microns-per-pixel from TIFF XResolution / ResolutionUnit (2 = inch, 3 = cm).
pub fn mpp_from_resolution(xres: f64, unit: u16) -> Option<f64> {
    if xres <= 0.0 || !xres.is_finite() {
        return None;
    }
    let mpp = match unit {
        // Some scanners write 4000 px/cm where 40000 was meant.
        3 if xres == 4000.0 => (1.0 / xres) * 1000.0,
        3 => 10_000.0 / xres,
        2 => 25_400.0 / xres,
        _ => return None,
    };
    // Placeholder resolutions (1 px/inch and the like) carry no physical meaning.
    (mpp < MAX_PLAUSIBLE_MPP).then_some(mpp)
}

/// Resolution stored in TIFF tags, if any.
pub fn tiff_mpp(path: &Path) -> Result<Option<f64>> {
    use tiff::decoder::{ifd::Value, Decoder};
    use tiff::tags::Tag;

    let file = File::open(path)?;
    let mut decoder = Decoder::new(BufReader::new(file))
        .map_err(|e| anyhow!("tiff header for {}: {}", path.display(), e))?;

    if let Ok(Some(value)) = decoder.find_tag(Tag::Unknown(TIFF_MPP_TAG)) {
        let parsed = match value {
            Value::Ascii(s) => s.trim().trim_end_matches('\0').parse::<f64>().ok(),
            Value::Float(f) => Some(f as f64),
            Value::Double(d) => Some(d),
            Value::Rational(n, d) if d != 0 => Some(n as f64 / d as f64),
            _ => None,
        };
        if let Some(mpp) = parsed.filter(|m| *m > 0.0) {
            debug!("Using MPP {} from TIFF tag {}", mpp, TIFF_MPP_TAG);
            return Ok(Some(mpp));
        }
    }

    let xres = match decoder.find_tag(Tag::XResolution) {
        Ok(Some(Value::Rational(n, d))) if d != 0 => n as f64 / d as f64,
        _ => return Ok(None),
    };
    let unit = match decoder.find_tag(Tag::ResolutionUnit) {
        Ok(Some(v)) => v.into_u16().unwrap_or(2),
        _ => 2,
    };
    Ok(mpp_from_resolution(xres, unit))
}

fn is_tiff(path: &Path) -> bool {
    matches!(extension(path).as_str(), "tif" | "tiff")
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Slide identity: the file name without its extension.
pub fn slide_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

// ---------------------------------------------------------------------------
// Single-level image backend
// ---------------------------------------------------------------------------

/// A plain raster image (TIFF, PNG, JPEG) exposed as a one-level pyramid.
pub struct ImageFileReader {
    name: String,
    image: RgbImage,
    levels: Vec<LevelInfo>,
    mpp: f64,
}

impl ImageFileReader {
    pub fn open(path: &Path, mpp_override: Option<f64>) -> Result<Self> {
        let name = slide_name(path);
        let image = image::open(path)
            .map_err(|e| TileError::SlideLoad { path: path.to_path_buf(), reason: e.to_string() })?
            .to_rgb8();

        let mpp = match mpp_override {
            Some(mpp) => Some(mpp),
            None if is_tiff(path) => tiff_mpp(path).unwrap_or(None),
            None => {
                info!("{}: no physical resolution metadata, using default MPP {}", name, DEFAULT_JPG_MPP);
                Some(DEFAULT_JPG_MPP)
            }
        };
        let mpp = mpp.ok_or_else(|| TileError::MissingResolution { slide: name.clone() })?;

        Ok(Self::from_image(name, image, mpp))
    }

    pub fn from_image(name: String, image: RgbImage, mpp: f64) -> Self {
        let levels = vec![LevelInfo { width: image.width(), height: image.height(), downsample: 1.0 }];
        Self { name, image, levels, mpp }
    }
}

impl PyramidReader for ImageFileReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn levels(&self) -> &[LevelInfo] {
        &self.levels
    }

    fn mpp(&self) -> f64 {
        self.mpp
    }

    fn read_region(&self, x: u32, y: u32, level: usize, w: u32, h: u32) -> Result<RgbImage> {
        if level != 0 {
            return Err(anyhow!("{}: single-level image has no level {}", self.name, level));
        }
        let mut out = RgbImage::from_pixel(w, h, Rgb([255, 255, 255]));
        let (iw, ih) = self.image.dimensions();
        if x >= iw || y >= ih {
            return Ok(out);
        }
        let cw = w.min(iw - x);
        let ch = h.min(ih - y);
        let view = imageops::crop_imm(&self.image, x, y, cw, ch).to_image();
        imageops::replace(&mut out, &view, 0, 0);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// OpenSlide backend
// ---------------------------------------------------------------------------

#[cfg(feature = "openslide")]
pub use self::openslide_backend::OpenSlideReader;

#[cfg(feature = "openslide")]
mod openslide_backend {
    use std::path::Path;

    use anyhow::{anyhow, Result};
    use image::RgbImage;
    use openslide_rs::{Address, OpenSlide, Region, Size};

    use super::{slide_name, tiff_mpp, LevelInfo, PyramidReader};
    use crate::error::TileError;

    pub struct OpenSlideReader {
        name: String,
        slide: OpenSlide,
        levels: Vec<LevelInfo>,
        mpp: f64,
    }

    impl OpenSlideReader {
        pub fn open(path: &Path, mpp_override: Option<f64>) -> Result<Self> {
            let name = slide_name(path);
            let load_err = |reason: String| TileError::SlideLoad { path: path.to_path_buf(), reason };
            let slide = OpenSlide::new(path).map_err(|e| load_err(format!("{:?}", e)))?;
            let level_count = slide.get_level_count().map_err(|e| load_err(format!("{:?}", e)))?;
            let mut levels = Vec::with_capacity(level_count as usize);
            for level in 0..level_count {
                let dims = slide
                    .get_level_dimensions(level)
                    .map_err(|e| load_err(format!("level {} dimensions: {:?}", level, e)))?;
                let downsample = slide
                    .get_level_downsample(level)
                    .map_err(|e| load_err(format!("level {} downsample: {:?}", level, e)))?;
                levels.push(LevelInfo { width: dims.w, height: dims.h, downsample });
            }
            if levels.is_empty() {
                return Err(load_err("no pyramid levels".into()).into());
            }

            let mpp = mpp_override
                .or_else(|| {
                    slide
                        .get_property_value("openslide.mpp-x")
                        .ok()
                        .and_then(|v| v.trim().parse::<f64>().ok())
                        .filter(|m| *m > 0.0)
                })
                .or_else(|| tiff_mpp(path).ok().flatten())
                .ok_or_else(|| TileError::MissingResolution { slide: name.clone() })?;

            Ok(Self { name, slide, levels, mpp })
        }
    }

    impl PyramidReader for OpenSlideReader {
        fn name(&self) -> &str {
            &self.name
        }

        fn levels(&self) -> &[LevelInfo] {
            &self.levels
        }

        fn mpp(&self) -> f64 {
            self.mpp
        }

        fn read_region(&self, x: u32, y: u32, level: usize, w: u32, h: u32) -> Result<RgbImage> {
            let region = Region {
                address: Address { x, y },
                level: level as u32,
                size: Size { w, h },
            };
            let bgra = self
                .slide
                .read_region(&region)
                .map_err(|e| anyhow!("read_region({},{}) failed: {:?}", x, y, e))?;

            // Pre-multiplied BGRA to RGB; transparent pixels become white.
            let n = (w * h) as usize;
            let mut rgb = vec![255u8; n * 3];
            for i in 0..n {
                let a = bgra[i * 4 + 3];
                if a == 0 {
                    continue;
                }
                if a == 255 {
                    rgb[i * 3] = bgra[i * 4 + 2];
                    rgb[i * 3 + 1] = bgra[i * 4 + 1];
                    rgb[i * 3 + 2] = bgra[i * 4];
                } else {
                    let af = a as f32;
                    rgb[i * 3] = ((bgra[i * 4 + 2] as f32 * 255.0 / af).round().min(255.0)) as u8;
                    rgb[i * 3 + 1] = ((bgra[i * 4 + 1] as f32 * 255.0 / af).round().min(255.0)) as u8;
                    rgb[i * 3 + 2] = ((bgra[i * 4] as f32 * 255.0 / af).round().min(255.0)) as u8;
                }
            }
            RgbImage::from_raw(w, h, rgb).ok_or_else(|| anyhow!("region buffer size mismatch"))
        }
    }
}

/// Open a slide with the backend matching its extension.
pub fn open_pyramid(path: &Path, mpp_override: Option<f64>) -> Result<Box<dyn PyramidReader>> {
    if !path.exists() {
        return Err(TileError::SlideLoad { path: path.to_path_buf(), reason: "file not found".into() }.into());
    }
    let ext = extension(path);
    if OPENSLIDE_EXTENSIONS.contains(&ext.as_str()) {
        #[cfg(feature = "openslide")]
        {
            let reader = OpenSlideReader::open(path, mpp_override)
                .with_context(|| format!("Opening slide {}", path.display()))?;
            return Ok(Box::new(reader));
        }
        #[cfg(not(feature = "openslide"))]
        {
            return Err(TileError::SlideLoad {
                path: path.to_path_buf(),
                reason: format!(".{} slides require building with --features openslide", ext),
            }
            .into());
        }
    }
    let reader = ImageFileReader::open(path, mpp_override)
        .with_context(|| format!("Opening slide {}", path.display()))?;
    Ok(Box::new(reader))
}

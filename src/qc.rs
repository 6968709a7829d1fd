//! Slide-level quality control: background (Otsu) and blur masks computed at a
//! coarse resolution and projected onto the extraction grid.

use anyhow::Result;
use image::{DynamicImage, GrayImage, Luma, RgbImage};
use imageproc::contrast::otsu_level;
use imageproc::definitions::Image;
use imageproc::filter::{filter3x3, gaussian_blur_f32, median_filter};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{QcConfig, QcMethod};
use crate::core::pyramid::{thumbnail, PyramidReader};
use crate::error::TileError;
use crate::grid::Grid;

const K_LAPLACE: [f32; 9] = [0.0, 1.0, 0.0, 1.0, -4.0, 1.0, 0.0, 1.0, 0.0];
const SATURATION_MEDIAN_RADIUS: u32 = 3;

/// HSV saturation scaled to 0..=255.
pub fn pixel_saturation(p: &[u8; 3]) -> u8 {
    let max = p[0].max(p[1]).max(p[2]);
    if max == 0 {
        return 0;
    }
    let min = p[0].min(p[1]).min(p[2]);
    (((max - min) as u32 * 255) / max as u32) as u8
}

pub fn saturation(rgb: &RgbImage) -> GrayImage {
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| Luma([pixel_saturation(&rgb.get_pixel(x, y).0)]))
}

/// Boolean exclusion mask plus the factor mapping level-0 pixels into it.
#[derive(Debug, Clone)]
pub struct QcMask {
    width: u32,
    height: u32,
    excluded: Vec<bool>,
    /// Mask pixels per level-0 pixel.
    pub ratio: f64,
}

impl QcMask {
    pub fn from_fn(width: u32, height: u32, ratio: f64, mut f: impl FnMut(u32, u32) -> bool) -> Self {
        let mut excluded = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                excluded.push(f(x, y));
            }
        }
        Self { width, height, excluded, ratio }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_excluded(&self, x: u32, y: u32) -> bool {
        self.excluded[(y * self.width + x) as usize]
    }

    pub fn excluded_fraction(&self) -> f64 {
        if self.excluded.is_empty() {
            return 0.0;
        }
        self.excluded.iter().filter(|&&e| e).count() as f64 / self.excluded.len() as f64
    }

    /// Mean exclusion over a window clipped to the mask. Empty windows read as 0.
    pub fn window_mean(&self, x: u32, y: u32, w: u32, h: u32) -> f64 {
        let x1 = x.saturating_add(w).min(self.width);
        let y1 = y.saturating_add(h).min(self.height);
        if x >= x1 || y >= y1 {
            return 0.0;
        }
        let mut hits = 0usize;
        for row in y..y1 {
            let base = (row * self.width) as usize;
            hits += self.excluded[base + x as usize..base + x1 as usize].iter().filter(|&&e| e).count();
        }
        hits as f64 / ((x1 - x) as usize * (y1 - y) as usize) as f64
    }

    /// Mean exclusion over the footprint of a tile at level-0 origin `(x, y)`.
    pub fn cell_mean(&self, x: u32, y: u32, full_extract_px: u32) -> f64 {
        let qx = (x as f64 * self.ratio) as u32;
        let qy = (y as f64 * self.ratio) as u32;
        let qw = ((full_extract_px as f64 * self.ratio) as u32).max(1);
        self.window_mean(qx, qy, qw, qw)
    }

    /// Nearest-neighbour resample onto a `width` x `height` lattice.
    pub fn resize_nearest(&self, width: u32, height: u32, ratio: f64) -> Self {
        let sx = self.width as f64 / width.max(1) as f64;
        let sy = self.height as f64 / height.max(1) as f64;
        Self::from_fn(width, height, ratio, |x, y| {
            let src_x = ((x as f64 * sx) as u32).min(self.width.saturating_sub(1));
            let src_y = ((y as f64 * sy) as u32).min(self.height.saturating_sub(1));
            self.width > 0 && self.height > 0 && self.is_excluded(src_x, src_y)
        })
    }

    pub fn or(mut self, other: &QcMask) -> Self {
        for (a, b) in self.excluded.iter_mut().zip(&other.excluded) {
            *a |= *b;
        }
        self
    }
}

/// Background mask from the coarsest level: median-smoothed saturation at or
/// below the Otsu threshold is excluded.
pub fn otsu_mask(reader: &dyn PyramidReader) -> Result<QcMask> {
    let lowest = reader.level_count() - 1;
    let ds = reader.levels()[lowest].downsample;
    let level_img = reader.read_level(lowest)?;
    let sat = median_filter(&saturation(&level_img), SATURATION_MEDIAN_RADIUS, SATURATION_MEDIAN_RADIUS);
    let threshold = otsu_level(&sat);
    debug!("{}: otsu threshold {} at level {}", reader.name(), threshold, lowest);
    Ok(QcMask::from_fn(sat.width(), sat.height(), 1.0 / ds, |x, y| sat.get_pixel(x, y)[0] <= threshold))
}

/// Blur mask from a thumbnail at `blur_mpp`: smoothed |Laplacian| at or
/// below `threshold` is excluded.
pub fn blur_mask(reader: &dyn PyramidReader, blur_mpp: f64, radius: f32, threshold: f32) -> Result<QcMask> {
    let (w0, _) = reader.dimensions();
    let target_w = ((w0 as f64 * reader.mpp() / blur_mpp).round() as u32).max(1);
    let thumb = thumbnail(reader, target_w)?;
    let ratio = thumb.width() as f64 / w0 as f64;

    let gray = DynamicImage::ImageRgb8(thumb).to_luma32f();
    let mut lap: Image<Luma<f32>> = filter3x3(&gray, &K_LAPLACE);
    for p in lap.pixels_mut() {
        p[0] = p[0].abs();
    }
    let smoothed = if radius > 0.0 { gaussian_blur_f32(&lap, radius) } else { lap };
    Ok(QcMask::from_fn(smoothed.width(), smoothed.height(), ratio, |x, y| {
        smoothed.get_pixel(x, y)[0] <= threshold
    }))
}

/// What a QC pass did to a grid.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QcReport {
    pub cells_before: usize,
    pub cells_after: usize,
    /// Percent of cells whose footprint is mostly blurry.
    pub blur_burden: Option<f64>,
}

/// Build the configured mask. `None` when QC is disabled.
pub fn compute_mask(reader: &dyn PyramidReader, qc: &QcConfig) -> Result<Option<(QcMask, Option<QcMask>)>> {
    let blur = || blur_mask(reader, qc.blur_mpp, qc.blur_radius, qc.blur_threshold);
    Ok(match qc.method {
        QcMethod::None => None,
        QcMethod::Otsu => Some((otsu_mask(reader)?, None)),
        QcMethod::Blur => {
            let b = blur()?;
            Some((b.clone(), Some(b)))
        }
        QcMethod::Both => {
            let otsu = otsu_mask(reader)?;
            let b = blur()?;
            let (w, h) = otsu.dimensions();
            let combined = otsu.clone().or(&b.resize_nearest(w, h, otsu.ratio));
            Some((combined, Some(b)))
        }
    })
}

/// Disable active cells whose footprint is mostly excluded by the QC mask.
pub fn apply_qc(grid: &mut Grid, reader: &dyn PyramidReader, qc: &QcConfig) -> Result<QcReport> {
    let before = grid.active_count();
    let Some((mask, blur)) = compute_mask(reader, qc)? else {
        return Ok(QcReport { cells_before: before, cells_after: before, blur_burden: None });
    };
    if mask.dimensions().0 == 0 || mask.dimensions().1 == 0 {
        return Err(TileError::Qc { slide: reader.name().to_string(), reason: "empty QC mask".into() }.into());
    }

    let full = grid.geometry.full_extract_px;
    let threshold = qc.filter_threshold as f64;
    let blur_burden = blur.as_ref().map(|b| {
        if before == 0 {
            return 0.0;
        }
        let blurry = grid.active_cells().filter(|c| b.cell_mean(c.x, c.y, full) > threshold).count();
        100.0 * blurry as f64 / before as f64
    });

    for cell in grid.cells_mut().iter_mut().filter(|c| c.active) {
        if mask.cell_mean(cell.x, cell.y, full) > threshold {
            cell.active = false;
        }
    }
    let after = grid.active_count();
    info!(
        "{}: QC ({:?}) kept {}/{} cells, {:.1}% of mask excluded",
        reader.name(),
        qc.method,
        after,
        before,
        100.0 * mask.excluded_fraction()
    );
    Ok(QcReport { cells_before: before, cells_after: after, blur_burden })
}

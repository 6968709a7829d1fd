use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::debug;

use crate::config::{ExtractionConfig, RoiMethod, TileSize};
use crate::core::pyramid::{best_level_for_downsample, LevelInfo};
use crate::error::TileError;
use crate::roi::RoiSet;

/// Pixel geometry of one tile, resolved against a slide's pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TileGeometry {
    /// Output tile size.
    pub tile_px: u32,
    /// Physical tile width in microns.
    pub tile_um: f64,
    /// Level-0 pixels spanned by one tile.
    pub full_extract_px: u32,
    /// Pixels read at `level` before resizing to `tile_px`.
    pub extract_px: u32,
    pub stride: u32,
    /// Lattice spacing in level-0 pixels.
    pub full_stride: u32,
    pub level: usize,
    pub level_downsample: f64,
}

impl TileGeometry {
    pub fn compute(levels: &[LevelInfo], mpp: f64, config: &ExtractionConfig) -> Result<Self, TileError> {
        if levels.is_empty() {
            return Err(TileError::Geometry("slide has no pyramid levels".into()));
        }
        let tile_px = config.tile_px;
        let (level, full_extract_px, extract_px, tile_um) = match config.tile_um {
            TileSize::Magnification(mag) => {
                let mags: Vec<f64> = levels.iter().map(|l| 10.0 / (l.downsample * mpp)).collect();
                let (level, closest) = mags
                    .iter()
                    .copied()
                    .enumerate()
                    .min_by(|a, b| (a.1 - mag).abs().total_cmp(&(b.1 - mag).abs()))
                    .unwrap_or((0, mags[0]));
                if (closest - mag).abs() > 2.0 {
                    return Err(TileError::Geometry(format!(
                        "no pyramid level matches magnification {}x (closest: {:.1}x)",
                        mag, closest
                    )));
                }
                if !config.enable_downsample && level != 0 {
                    return Err(TileError::Geometry(format!(
                        "magnification {}x needs level {} but downsampling is disabled",
                        mag, level
                    )));
                }
                let ds = levels[level].downsample;
                let full = (ds * tile_px as f64) as u32;
                let um = (ds * mpp * tile_px as f64).trunc();
                (level, full, tile_px, um)
            }
            TileSize::Microns(um) => {
                let full = (um as f64 / mpp) as u32;
                if full == 0 {
                    return Err(TileError::Geometry(format!(
                        "tile of {}um is smaller than one pixel at {} mpp",
                        um, mpp
                    )));
                }
                let ds = full as f64 / tile_px as f64;
                let level = if config.enable_downsample { best_level_for_downsample(levels, ds) } else { 0 };
                let extract = (full as f64 / levels[level].downsample) as u32;
                (level, full, extract, um as f64)
            }
        };

        let stride = extract_px / config.stride_div;
        let full_stride = full_extract_px / config.stride_div;
        if full_stride == 0 || extract_px == 0 {
            return Err(TileError::Geometry(format!(
                "stride_div {} is too large for a {} px tile",
                config.stride_div, full_extract_px
            )));
        }

        Ok(Self {
            tile_px,
            tile_um,
            full_extract_px,
            extract_px,
            stride,
            full_stride,
            level,
            level_downsample: levels[level].downsample,
        })
    }
}

/// One candidate tile origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridCell {
    /// Level-0 origin.
    pub x: u32,
    pub y: u32,
    pub col: u32,
    pub row: u32,
    pub active: bool,
}

impl GridCell {
    /// Level-0 center of the tile this cell spans.
    pub fn center(&self, full_extract_px: u32) -> (f64, f64) {
        let half = full_extract_px as f64 / 2.0;
        (self.x as f64 + half, self.y as f64 + half)
    }
}

/// The lattice of candidate tiles over a slide. Only the active flags change after build.
#[derive(Debug, Clone)]
pub struct Grid {
    pub cols: u32,
    pub rows: u32,
    pub geometry: TileGeometry,
    cells: Vec<GridCell>,
}

impl Grid {
    /// Lay out origins `start, start + full_stride, ...` while the tile fits
    /// inside the level-0 image. With `random_origin`, `start` is drawn from
    /// `[0, full_stride)` on each axis.
    pub fn build(geometry: TileGeometry, dimensions: (u32, u32), random_origin: bool, seed: u64) -> Self {
        let (width, height) = dimensions;
        let (start_x, start_y) = if random_origin && geometry.full_stride > 1 {
            let mut rng = StdRng::seed_from_u64(seed);
            (rng.random_range(0..geometry.full_stride), rng.random_range(0..geometry.full_stride))
        } else {
            (0, 0)
        };
        let axis = |start: u32, extent: u32| -> Vec<u32> {
            let end = (extent as i64) + 1 - geometry.full_extract_px as i64;
            (start as i64..end.max(0))
                .step_by(geometry.full_stride as usize)
                .map(|v| v as u32)
                .collect()
        };
        let xs = axis(start_x, width);
        let ys = axis(start_y, height);

        let mut cells = Vec::with_capacity(xs.len() * ys.len());
        for (row, &y) in ys.iter().enumerate() {
            for (col, &x) in xs.iter().enumerate() {
                cells.push(GridCell { x, y, col: col as u32, row: row as u32, active: true });
            }
        }
        debug!(
            "Grid {}x{} (origin {},{} stride {})",
            xs.len(),
            ys.len(),
            start_x,
            start_y,
            geometry.full_stride
        );
        Self { cols: xs.len() as u32, rows: ys.len() as u32, geometry, cells }
    }

    pub fn cells(&self) -> &[GridCell] {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut [GridCell] {
        &mut self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Estimated tile count: the number of active cells.
    pub fn active_count(&self) -> usize {
        self.cells.iter().filter(|c| c.active).count()
    }

    pub fn active_cells(&self) -> impl Iterator<Item = &GridCell> {
        self.cells.iter().filter(|c| c.active)
    }

    /// Apply an ROI policy. Returns the policy actually used (`auto` resolves
    /// to `inside` or `ignore`).
    pub fn apply_roi(&mut self, rois: &RoiSet, method: RoiMethod, slide: &str) -> Result<RoiMethod, TileError> {
        let method = match method {
            RoiMethod::Auto if rois.is_empty() => RoiMethod::Ignore,
            RoiMethod::Auto => RoiMethod::Inside,
            m => m,
        };
        if matches!(method, RoiMethod::Inside | RoiMethod::Outside) && rois.is_empty() {
            return Err(TileError::MissingRoi { slide: slide.to_string(), method: method.to_string() });
        }
        if method == RoiMethod::Ignore {
            return Ok(method);
        }
        let full = self.geometry.full_extract_px;
        for cell in self.cells.iter_mut().filter(|c| c.active) {
            let (cx, cy) = cell.center(full);
            let inside = rois.contains_cell_center(cx, cy);
            cell.active = if method == RoiMethod::Inside { inside } else { !inside };
        }
        Ok(method)
    }
}

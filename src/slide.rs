//! Slide variants behind one interface: open, build the tile layout, extract.

use std::path::Path;

use anyhow::Result;
use image::{imageops, GrayImage, Luma, Rgb, RgbImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use tracing::{debug, info};

use crate::config::{ExtractionConfig, RoiMethod, SlideKind, TmaOptions};
use crate::core::pyramid::{open_pyramid, thumbnail, PyramidReader};
use crate::core::resize_rgb;
use crate::extract::{extract_slide, ExtractOptions, SlideReport};
use crate::grid::{Grid, GridCell, TileGeometry};
use crate::qc::{apply_qc, QcReport};
use crate::roi::{rois_for_slide, RoiSet};

/// A source region ready for filtering, before resize and encoding.
#[derive(Debug, Clone)]
pub struct RawTile {
    pub image: RgbImage,
    /// Level-0 center of the tile.
    pub center: (i64, i64),
    /// Grid column/row (WSI) or core/sub-tile index (TMA).
    pub grid: (u32, u32),
}

/// A whole-slide image tiled on a regular lattice.
pub struct WsiSlide {
    reader: Box<dyn PyramidReader>,
    config: ExtractionConfig,
    rois: RoiSet,
    grid: Grid,
    roi_method: RoiMethod,
    qc: QcReport,
    active: Vec<GridCell>,
}

impl WsiSlide {
    pub fn new(reader: Box<dyn PyramidReader>, rois: RoiSet, config: &ExtractionConfig) -> Result<Self> {
        let geometry = TileGeometry::compute(reader.levels(), reader.mpp(), config)?;
        let grid = Grid::build(geometry, reader.dimensions(), config.random_origin, config.seed);
        let mut slide = Self {
            reader,
            config: config.clone(),
            rois,
            grid,
            roi_method: config.roi_method,
            qc: QcReport::default(),
            active: Vec::new(),
        };
        slide.build_grid(true)?;
        Ok(slide)
    }

    /// Rebuild the lattice from scratch, then apply ROI and (optionally) QC.
    fn build_grid(&mut self, with_qc: bool) -> Result<()> {
        let name = self.reader.name().to_string();
        self.grid = Grid::build(
            self.grid.geometry,
            self.reader.dimensions(),
            self.config.random_origin,
            self.config.seed,
        );
        let total = self.grid.active_count();
        self.roi_method = self.grid.apply_roi(&self.rois, self.config.roi_method, &name)?;
        let after_roi = self.grid.active_count();
        self.qc = if with_qc {
            apply_qc(&mut self.grid, self.reader.as_ref(), &self.config.qc)?
        } else {
            QcReport { cells_before: after_roi, cells_after: after_roi, blur_burden: None }
        };
        self.active = self.grid.active_cells().copied().collect();
        info!(
            "{}: grid {}x{}, {} cells, {} after ROI ({}), {} estimated tiles",
            name,
            self.grid.cols,
            self.grid.rows,
            total,
            after_roi,
            self.roi_method,
            self.active.len()
        );
        Ok(())
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn roi_method(&self) -> RoiMethod {
        self.roi_method
    }

    fn read_cell(&self, cell: &GridCell) -> Result<Vec<RawTile>> {
        let g = &self.grid.geometry;
        let image = self.reader.read_region(cell.x, cell.y, g.level, g.extract_px, g.extract_px)?;
        let (cx, cy) = cell.center(g.full_extract_px);
        Ok(vec![RawTile { image, center: (cx as i64, cy as i64), grid: (cell.col, cell.row) }])
    }
}

/// Axis-aligned bounding box of one detected core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Foreground components of a thumbnail, as bounding boxes in thumbnail pixels.
pub fn detect_cores(thumb: &RgbImage, opts: &TmaOptions) -> Vec<CoreBox> {
    let cutoff = 255u8.saturating_sub(opts.foreground_margin);
    let fg = GrayImage::from_fn(thumb.width(), thumb.height(), |x, y| {
        let p = thumb.get_pixel(x, y);
        Luma([if p.0.iter().any(|&c| c < cutoff) { 255 } else { 0 }])
    });
    let labels = connected_components(&fg, Connectivity::Eight, Luma([0u8]));

    // label -> (min_x, min_y, max_x, max_y)
    let mut bounds: Vec<Option<(u32, u32, u32, u32)>> = Vec::new();
    for (x, y, p) in labels.enumerate_pixels() {
        let label = p[0] as usize;
        if label == 0 {
            continue;
        }
        if bounds.len() <= label {
            bounds.resize(label + 1, None);
        }
        bounds[label] = Some(match bounds[label] {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    let mut cores: Vec<CoreBox> = bounds
        .into_iter()
        .flatten()
        .map(|(x0, y0, x1, y1)| CoreBox { x: x0, y: y0, w: x1 - x0 + 1, h: y1 - y0 + 1 })
        .filter(|c| c.w > opts.min_core_px && c.h > opts.min_core_px)
        .collect();
    cores.sort_by_key(|c| (c.y, c.x));
    cores
}

/// A tissue microarray: each detected core is cut into centered sub-tiles.
pub struct TmaSlide {
    reader: Box<dyn PyramidReader>,
    config: ExtractionConfig,
    geometry: TileGeometry,
    cores: Vec<CoreBox>,
}

impl TmaSlide {
    pub fn new(reader: Box<dyn PyramidReader>, config: &ExtractionConfig) -> Result<Self> {
        let geometry = TileGeometry::compute(reader.levels(), reader.mpp(), config)?;
        let mut slide = Self { reader, config: config.clone(), geometry, cores: Vec::new() };
        slide.build_grid()?;
        Ok(slide)
    }

    fn build_grid(&mut self) -> Result<()> {
        let (w0, _) = self.reader.dimensions();
        let thumb = thumbnail(self.reader.as_ref(), (w0 / self.config.tma.thumb_divisor).max(1))?;
        let scale = w0 as f64 / thumb.width() as f64;
        self.cores = detect_cores(&thumb, &self.config.tma)
            .into_iter()
            .map(|c| CoreBox {
                x: (c.x as f64 * scale) as u32,
                y: (c.y as f64 * scale) as u32,
                w: (c.w as f64 * scale).round() as u32,
                h: (c.h as f64 * scale).round() as u32,
            })
            .collect();
        info!("{}: detected {} TMA cores", self.reader.name(), self.cores.len());
        Ok(())
    }

    pub fn cores(&self) -> &[CoreBox] {
        &self.cores
    }

    /// Level-0 pixels per output pixel.
    fn output_scale(&self) -> f64 {
        self.geometry.tile_um / self.geometry.tile_px as f64 / self.reader.mpp()
    }

    fn read_core(&self, index: usize) -> Result<Vec<RawTile>> {
        let core = self.cores[index];
        let g = &self.geometry;
        let lds = g.level_downsample;
        let rw = ((core.w as f64 / lds).ceil() as u32).max(1);
        let rh = ((core.h as f64 / lds).ceil() as u32).max(1);
        let region = self.reader.read_region(core.x, core.y, g.level, rw, rh)?;

        let scale = self.output_scale();
        let factor = lds / scale;
        let out_w = ((rw as f64 * factor).round() as u32).max(1);
        let out_h = ((rh as f64 * factor).round() as u32).max(1);
        let resized = resize_rgb(&region, out_w, out_h, self.config.resample)?;

        let tile = g.tile_px;
        let nx = (out_w / tile).max(1);
        let ny = (out_h / tile).max(1);
        let off_x = (out_w as i64 - (nx * tile) as i64) / 2;
        let off_y = (out_h as i64 - (ny * tile) as i64) / 2;

        let mut tiles = Vec::with_capacity((nx * ny) as usize);
        for j in 0..ny {
            for i in 0..nx {
                let sx = off_x + (i * tile) as i64;
                let sy = off_y + (j * tile) as i64;
                let mut sub = RgbImage::from_pixel(tile, tile, Rgb([255, 255, 255]));
                imageops::replace(&mut sub, &resized, -sx, -sy);
                let cx = core.x as f64 + (sx as f64 + tile as f64 / 2.0) * scale;
                let cy = core.y as f64 + (sy as f64 + tile as f64 / 2.0) * scale;
                tiles.push(RawTile { image: sub, center: (cx as i64, cy as i64), grid: (index as u32, j * nx + i) });
            }
        }
        debug!("{}: core {} -> {} sub-tiles", self.reader.name(), index, tiles.len());
        Ok(tiles)
    }
}

/// The closed set of slide variants.
pub enum Slide {
    Wsi(WsiSlide),
    Tma(TmaSlide),
}

impl Slide {
    /// Open the file, load ROIs and lay out the tiles.
    pub fn open(path: &Path, config: &ExtractionConfig) -> Result<Self> {
        config.validate()?;
        let reader = open_pyramid(path, config.mpp_override)?;
        info!(
            "Opened {}: {}x{} px, {:.4} mpp, {} levels",
            reader.name(),
            reader.dimensions().0,
            reader.dimensions().1,
            reader.mpp(),
            reader.level_count()
        );
        Self::from_reader(reader, config)
    }

    pub fn from_reader(reader: Box<dyn PyramidReader>, config: &ExtractionConfig) -> Result<Self> {
        match config.slide_kind {
            SlideKind::Wsi => {
                let rois = rois_for_slide(config.roi_dir.as_deref(), reader.name())?;
                let rois = RoiSet::from_rois(&rois, reader.name());
                Ok(Slide::Wsi(WsiSlide::new(reader, rois, config)?))
            }
            SlideKind::Tma => Ok(Slide::Tma(TmaSlide::new(reader, config)?)),
        }
    }

    pub fn name(&self) -> &str {
        self.reader().name()
    }

    pub fn reader(&self) -> &dyn PyramidReader {
        match self {
            Slide::Wsi(s) => s.reader.as_ref(),
            Slide::Tma(s) => s.reader.as_ref(),
        }
    }

    pub fn config(&self) -> &ExtractionConfig {
        match self {
            Slide::Wsi(s) => &s.config,
            Slide::Tma(s) => &s.config,
        }
    }

    pub fn geometry(&self) -> &TileGeometry {
        match self {
            Slide::Wsi(s) => &s.grid.geometry,
            Slide::Tma(s) => &s.geometry,
        }
    }

    /// Recompute the tile layout from scratch.
    pub fn build_grid(&mut self) -> Result<()> {
        match self {
            Slide::Wsi(s) => s.build_grid(true),
            Slide::Tma(s) => s.build_grid(),
        }
    }

    /// Drop QC by rebuilding the grid with ROI filtering only.
    pub fn remove_qc(&mut self) -> Result<()> {
        match self {
            Slide::Wsi(s) => s.build_grid(false),
            Slide::Tma(_) => Ok(()),
        }
    }

    pub fn qc_report(&self) -> Option<&QcReport> {
        match self {
            Slide::Wsi(s) => Some(&s.qc),
            Slide::Tma(_) => None,
        }
    }

    /// Units of extraction work: active cells or detected cores.
    pub fn job_count(&self) -> usize {
        match self {
            Slide::Wsi(s) => s.active.len(),
            Slide::Tma(s) => s.cores.len(),
        }
    }

    /// Tiles expected before per-tile filtering.
    pub fn estimated_tiles(&self) -> usize {
        match self {
            Slide::Wsi(s) => s.active.len(),
            Slide::Tma(s) => {
                let scale = s.output_scale();
                let tile = s.geometry.tile_px as f64;
                s.cores
                    .iter()
                    .map(|c| {
                        let nx = ((c.w as f64 / scale / tile) as usize).max(1);
                        let ny = ((c.h as f64 / scale / tile) as usize).max(1);
                        nx * ny
                    })
                    .sum()
            }
        }
    }

    /// Read the source regions of one job at the extraction level.
    pub fn read_job(&self, job: usize) -> Result<Vec<RawTile>> {
        match self {
            Slide::Wsi(s) => s.read_cell(&s.active[job]),
            Slide::Tma(s) => s.read_core(job),
        }
    }

    pub fn extract(&self, opts: &ExtractOptions) -> Result<SlideReport> {
        extract_slide(self, opts)
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

/// Level-0 coordinates are divided by this before polygon tests.
pub const ROI_SCALE: f64 = 10.0;

/// A named polygon outline in level-0 pixel space.
#[derive(Debug, Clone, PartialEq)]
pub struct Roi {
    pub name: String,
    pub points: Vec<(f64, f64)>,
}

/// Closed polygon tested with the even-odd rule.
#[derive(Debug, Clone)]
pub struct Polygon {
    vertices: Vec<(f64, f64)>,
}

impl Polygon {
    /// Returns `None` for fewer than three vertices.
    pub fn new(vertices: Vec<(f64, f64)>) -> Option<Self> {
        if vertices.len() < 3 {
            return None;
        }
        Some(Self { vertices })
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        let n = self.vertices.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = self.vertices[i];
            let (xj, yj) = self.vertices[j];
            if (yi > y) != (yj > y) {
                let x_cross = (xj - xi) * (y - yi) / (yj - yi) + xi;
                if x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    pub fn area(&self) -> f64 {
        let n = self.vertices.len();
        let mut sum = 0.0;
        for i in 0..n {
            let (x1, y1) = self.vertices[i];
            let (x2, y2) = self.vertices[(i + 1) % n];
            sum += x1 * y2 - x2 * y1;
        }
        sum.abs() / 2.0
    }
}

/// The usable polygons of one slide, stored in ROI space.
#[derive(Debug, Clone, Default)]
pub struct RoiSet {
    polygons: Vec<Polygon>,
}

impl RoiSet {
    /// Build polygons, skipping (with a warning) ROIs with fewer than three points.
    pub fn from_rois(rois: &[Roi], slide: &str) -> Self {
        let mut polygons = Vec::with_capacity(rois.len());
        for (i, roi) in rois.iter().enumerate() {
            let scaled = roi.points.iter().map(|&(x, y)| (x / ROI_SCALE, y / ROI_SCALE)).collect();
            match Polygon::new(scaled) {
                Some(p) => polygons.push(p),
                None => warn!(
                    "{}: skipping ROI {} ('{}'), needs at least 3 points, has {}",
                    slide,
                    i,
                    roi.name,
                    roi.points.len()
                ),
            }
        }
        Self { polygons }
    }

    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }

    pub fn len(&self) -> usize {
        self.polygons.len()
    }

    /// Whether a level-0 point lies inside any polygon.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let (sx, sy) = (x / ROI_SCALE, y / ROI_SCALE);
        self.polygons.iter().any(|p| p.contains(sx, sy))
    }

    /// Grid-cell membership: the level-0 centre is truncated to whole ROI
    /// units before the polygon test.
    pub fn contains_cell_center(&self, x: f64, y: f64) -> bool {
        let (sx, sy) = ((x / ROI_SCALE).trunc(), (y / ROI_SCALE).trunc());
        self.polygons.iter().any(|p| p.contains(sx, sy))
    }
}

/// Load ROIs from a CSV with `roi_name`, `x_base`, `y_base` columns (any case).
/// Rows are grouped by name in order of first appearance.
pub fn load_roi_csv(path: &Path) -> Result<Vec<Roi>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open ROI file {}", path.display()))?;

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_lowercase()).collect();
    let column = |name: &str| {
        headers.iter().position(|h| h == name).ok_or_else(|| {
            anyhow!(
                "Unable to read ROI {}: headers must contain roi_name, x_base and y_base",
                path.display()
            )
        })
    };
    let (i_name, i_x, i_y) = (column("roi_name")?, column("x_base")?, column("y_base")?);

    let mut rois: Vec<Roi> = Vec::new();
    for (row_no, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("{}: row {}", path.display(), row_no + 2))?;
        let field = |i: usize| row.get(i).unwrap_or("");
        let coord = |i: usize| -> Result<f64> {
            let v: f64 = field(i)
                .parse()
                .map_err(|_| anyhow!("{}: row {}: bad coordinate '{}'", path.display(), row_no + 2, field(i)))?;
            Ok(v.trunc())
        };
        let name = field(i_name).to_string();
        let point = (coord(i_x)?, coord(i_y)?);
        match rois.iter_mut().find(|r| r.name == name) {
            Some(roi) => roi.points.push(point),
            None => rois.push(Roi { name, points: vec![point] }),
        }
    }
    debug!("Loaded {} ROIs from {}", rois.len(), path.display());
    Ok(rois)
}

#[derive(Deserialize)]
struct JsonRoiFile {
    shapes: Vec<JsonShape>,
}

#[derive(Deserialize)]
struct JsonShape {
    #[serde(default)]
    label: Option<String>,
    points: Vec<[f64; 2]>,
}

/// Load ROIs from a `{"shapes": [{"points": [[x, y], ...]}]}` file. Points are
/// in ROI space and are scaled up to level-0 pixels.
pub fn load_roi_json(path: &Path) -> Result<Vec<Roi>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read ROI file {}", path.display()))?;
    let file: JsonRoiFile = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse ROI file {}", path.display()))?;
    Ok(file
        .shapes
        .into_iter()
        .enumerate()
        .map(|(i, shape)| Roi {
            name: shape.label.unwrap_or_else(|| format!("Object{}", i)),
            points: shape.points.iter().map(|p| (p[0] * ROI_SCALE, p[1] * ROI_SCALE)).collect(),
        })
        .collect())
}

/// Locate `{slide}.csv` or `{slide}.json` in `roi_dir`.
pub fn find_roi_file(roi_dir: &Path, slide: &str) -> Option<PathBuf> {
    ["csv", "json"]
        .iter()
        .map(|ext| roi_dir.join(format!("{}.{}", slide, ext)))
        .find(|p| p.exists())
}

pub fn load_rois(path: &Path) -> Result<Vec<Roi>> {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()).as_deref() {
        Some("json") => load_roi_json(path),
        _ => load_roi_csv(path),
    }
}

/// ROIs for a slide, or an empty list when no ROI directory or file exists.
pub fn rois_for_slide(roi_dir: Option<&Path>, slide: &str) -> Result<Vec<Roi>> {
    match roi_dir.and_then(|d| find_roi_file(d, slide)) {
        Some(path) => load_rois(&path),
        None => Ok(Vec::new()),
    }
}

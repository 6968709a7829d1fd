//! Dataset views over record containers: annotations, clip and balance.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::record::{build_index, container_name, index_path_for, RecordReader, RecordWriter, CONTAINER_EXT};
use crate::error::TileError;
use crate::manifest::{list_containers, Manifest};
use crate::roi::{rois_for_slide, RoiSet};

/// One annotation row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub slide: String,
    pub patient: String,
    pub site: Option<String>,
    /// Every column of the row, keyed by header.
    pub fields: BTreeMap<String, String>,
}

/// Slide annotations: `slide`, `patient`, optional `site`, plus label columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotations {
    rows: Vec<Annotation>,
}

impl Annotations {
    pub fn from_rows(rows: Vec<Annotation>) -> Self {
        Self { rows }
    }

    /// Load from CSV. `slide` and `patient` headers are required (any case).
    pub fn load_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("Failed to open annotations {}", path.display()))?;
        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
        let find = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
        let i_slide = find("slide").ok_or_else(|| anyhow!("{}: missing 'slide' column", path.display()))?;
        let i_patient = find("patient").ok_or_else(|| anyhow!("{}: missing 'patient' column", path.display()))?;
        let i_site = find("site");

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("Reading {}", path.display()))?;
            let get = |i: usize| record.get(i).unwrap_or("").to_string();
            let fields = headers.iter().enumerate().map(|(i, h)| (h.clone(), get(i))).collect();
            rows.push(Annotation {
                slide: get(i_slide),
                patient: get(i_patient),
                site: i_site.map(get).filter(|s| !s.is_empty()),
                fields,
            });
        }
        debug!("Loaded {} annotations from {}", rows.len(), path.display());
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[Annotation] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A per-slide outcome value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Label {
    Categorical(usize),
    Linear(f64),
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Categorical(i) => write!(f, "{}", i),
            Label::Linear(v) => write!(f, "{}", v),
        }
    }
}

/// Slide -> label, plus the sorted category names for categorical labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Labels {
    pub by_slide: BTreeMap<String, Label>,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipStrategy {
    Slide,
    Patient,
    Category,
}

impl FromStr for ClipStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "slide" => Ok(ClipStrategy::Slide),
            "patient" => Ok(ClipStrategy::Patient),
            "category" => Ok(ClipStrategy::Category),
            _ => Err(format!("unknown clip strategy '{}'. Available: slide, patient, category", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceStrategy {
    Tile,
    Slide,
    Patient,
    Category,
}

impl FromStr for BalanceStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tile" => Ok(BalanceStrategy::Tile),
            "slide" => Ok(BalanceStrategy::Slide),
            "patient" => Ok(BalanceStrategy::Patient),
            "category" => Ok(BalanceStrategy::Category),
            _ => Err(format!("unknown balance strategy '{}'. Available: tile, slide, patient, category", s)),
        }
    }
}

/// Record counts for one container in a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContainerCounts {
    pub total: usize,
    /// Records the sampler may draw; equals `total` without a clip.
    pub clipped: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct BalanceState {
    strategy: BalanceStrategy,
    header: Option<String>,
}

/// An immutable view over record containers. `clip`, `unclip`, `balance`
/// and `filter` return new views sharing the same containers.
#[derive(Clone)]
pub struct Dataset {
    dirs: Vec<PathBuf>,
    annotations: Arc<Annotations>,
    slide_filter: Option<BTreeSet<String>>,
    clips: BTreeMap<PathBuf, usize>,
    balance: Option<BalanceState>,
    totals: Arc<Mutex<BTreeMap<PathBuf, usize>>>,
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("dirs", &self.dirs)
            .field("annotations", &self.annotations.rows.len())
            .field("slide_filter", &self.slide_filter.as_ref().map(|s| s.len()))
            .field("clips", &self.clips.len())
            .field("balance", &self.balance)
            .finish()
    }
}

impl Dataset {
    pub fn new(dirs: Vec<PathBuf>, annotations: Annotations) -> Self {
        Self {
            dirs,
            annotations: Arc::new(annotations),
            slide_filter: None,
            clips: BTreeMap::new(),
            balance: None,
            totals: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    /// Restrict the view to `slides`.
    pub fn filter<S: AsRef<str>>(&self, slides: &[S]) -> Self {
        let wanted: BTreeSet<String> = slides.iter().map(|s| s.as_ref().to_string()).collect();
        let filter = match &self.slide_filter {
            Some(existing) => existing.intersection(&wanted).cloned().collect(),
            None => wanted,
        };
        let mut out = self.clone();
        out.slide_filter = Some(filter);
        out
    }

    fn slide_allowed(&self, slide: &str) -> bool {
        self.slide_filter.as_ref().map_or(true, |f| f.contains(slide))
    }

    /// Annotated slides in the view, sorted. Without annotations, the slides
    /// that have containers.
    pub fn slides(&self) -> Result<Vec<String>> {
        if self.annotations.is_empty() {
            return Ok(self.tfrecords()?.iter().map(|p| container_name(p)).collect());
        }
        let set: BTreeSet<String> =
            self.annotations.rows.iter().map(|a| a.slide.clone()).filter(|s| self.slide_allowed(s)).collect();
        Ok(set.into_iter().collect())
    }

    /// Container paths in the view, sorted by path.
    pub fn tfrecords(&self) -> Result<Vec<PathBuf>> {
        let annotated: Option<BTreeSet<&str>> = if self.annotations.is_empty() {
            None
        } else {
            Some(self.annotations.rows.iter().map(|a| a.slide.as_str()).collect())
        };
        let mut out = Vec::new();
        for dir in &self.dirs {
            if !dir.exists() {
                warn!("Container directory {} does not exist", dir.display());
                continue;
            }
            for path in list_containers(dir)? {
                let name = container_name(&path);
                let known = annotated.as_ref().map_or(true, |a| a.contains(name.as_str()));
                if known && self.slide_allowed(&name) {
                    out.push(path);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Slide -> patient. A slide listed under two patients is fatal.
    pub fn patients(&self) -> Result<BTreeMap<String, String>> {
        let mut out: BTreeMap<String, String> = BTreeMap::new();
        for row in &self.annotations.rows {
            if !self.slide_allowed(&row.slide) {
                continue;
            }
            if let Some(existing) = out.get(&row.slide) {
                if existing != &row.patient {
                    return Err(TileError::DuplicatePatient {
                        slide: row.slide.clone(),
                        first: existing.clone(),
                        second: row.patient.clone(),
                    }
                    .into());
                }
                continue;
            }
            out.insert(row.slide.clone(), row.patient.clone());
        }
        Ok(out)
    }

    /// Slide -> site, for slides with a site column value.
    pub fn sites(&self) -> BTreeMap<String, String> {
        self.annotations
            .rows
            .iter()
            .filter(|r| self.slide_allowed(&r.slide))
            .filter_map(|r| r.site.clone().map(|s| (r.slide.clone(), s)))
            .collect()
    }

    /// Raw label strings for `header`. Slides with an empty value are skipped.
    pub fn label_values(&self, header: &str) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        let mut seen_header = false;
        for row in &self.annotations.rows {
            if !self.slide_allowed(&row.slide) {
                continue;
            }
            match row.fields.get(header) {
                Some(v) => {
                    seen_header = true;
                    if v.is_empty() {
                        debug!("{}: no value for '{}'", row.slide, header);
                        continue;
                    }
                    out.insert(row.slide.clone(), v.clone());
                }
                None => {}
            }
        }
        if !seen_header && !self.annotations.is_empty() {
            return Err(TileError::InvalidConfig(format!("annotation header '{}' not found", header)).into());
        }
        Ok(out)
    }

    /// Labels for `header`: categorical (index into sorted unique values) or linear floats.
    pub fn labels(&self, header: &str, linear: bool) -> Result<Labels> {
        let values = self.label_values(header)?;
        if linear {
            let mut by_slide = BTreeMap::new();
            for (slide, v) in values {
                let f: f64 = v.parse().map_err(|_| {
                    TileError::InvalidConfig(format!("slide {}: '{}' is not numeric for '{}'", slide, v, header))
                })?;
                by_slide.insert(slide, Label::Linear(f));
            }
            return Ok(Labels { by_slide, categories: Vec::new() });
        }
        let categories: Vec<String> = values.values().cloned().collect::<BTreeSet<_>>().into_iter().collect();
        let by_slide = values
            .into_iter()
            .map(|(slide, v)| {
                let idx = categories.iter().position(|c| *c == v).unwrap_or(0);
                (slide, Label::Categorical(idx))
            })
            .collect();
        Ok(Labels { by_slide, categories })
    }

    /// Total records per container, from the directory manifests. The cache
    /// is refreshed whenever a container in the view is missing from it.
    fn totals(&self) -> Result<BTreeMap<PathBuf, usize>> {
        let containers = self.tfrecords()?;
        let mut cache = self.totals.lock();
        if containers.iter().any(|c| !cache.contains_key(c)) {
            let dirs: BTreeSet<&Path> = containers.iter().filter_map(|c| c.parent()).collect();
            for dir in dirs {
                let manifest = Manifest::update(dir, false)?;
                for (file, entry) in manifest.entries() {
                    cache.insert(dir.join(file), entry.total);
                }
            }
        }
        Ok(containers
            .into_iter()
            .filter_map(|c| match cache.get(&c) {
                Some(&total) => Some((c, total)),
                None => {
                    warn!("{} has no manifest entry, skipping", c.display());
                    None
                }
            })
            .collect())
    }

    /// Total and clipped counts per container.
    pub fn manifest(&self) -> Result<BTreeMap<PathBuf, ContainerCounts>> {
        Ok(self
            .totals()?
            .into_iter()
            .map(|(path, total)| {
                let clipped = self.clips.get(&path).copied().unwrap_or(total).min(total);
                (path, ContainerCounts { total, clipped })
            })
            .collect())
    }

    pub fn num_tiles(&self) -> Result<usize> {
        Ok(self.manifest()?.values().map(|c| c.clipped).sum())
    }

    /// Containers with an active clip and their caps.
    pub fn clip_map(&self) -> Result<BTreeMap<PathBuf, usize>> {
        Ok(self
            .manifest()?
            .into_iter()
            .filter(|(p, _)| self.clips.contains_key(p))
            .map(|(p, c)| (p, c.clipped))
            .collect())
    }

    fn category_of(&self, header: &str) -> Result<BTreeMap<PathBuf, String>> {
        let values = self.label_values(header)?;
        self.tfrecords()?
            .into_iter()
            .map(|p| {
                let slide = container_name(&p);
                let v = values.get(&slide).cloned().ok_or_else(|| {
                    TileError::InvalidConfig(format!("slide {} has no value for '{}'", slide, header))
                })?;
                Ok((p, v))
            })
            .collect()
    }

    fn patient_of(&self) -> Result<BTreeMap<PathBuf, String>> {
        let patients = self.patients()?;
        Ok(self
            .tfrecords()?
            .into_iter()
            .map(|p| {
                let slide = container_name(&p);
                let patient = patients.get(&slide).cloned().unwrap_or(slide);
                (p, patient)
            })
            .collect())
    }

    /// Derive a clipped view.
    ///
    /// With no arguments the view is returned unchanged. A header without a
    /// strategy means `category`. `max_tiles` caps every container, on its
    /// own or on top of a strategy.
    pub fn clip(
        &self,
        max_tiles: Option<usize>,
        strategy: Option<ClipStrategy>,
        header: Option<&str>,
    ) -> Result<Self> {
        let strategy = match (strategy, header) {
            (None, Some(_)) => Some(ClipStrategy::Category),
            (s, _) => s,
        };
        if strategy.is_none() && max_tiles.is_none() {
            return Ok(self.clone());
        }
        if strategy == Some(ClipStrategy::Category) && header.is_none() {
            return Err(TileError::InvalidConfig("category clipping requires a label header".into()).into());
        }

        let totals = self.totals()?;
        let mut clips: BTreeMap<PathBuf, usize> = BTreeMap::new();
        match strategy {
            None => {}
            Some(ClipStrategy::Slide) => {
                let limit = totals.values().copied().min().unwrap_or(0);
                for (p, &t) in &totals {
                    clips.insert(p.clone(), t.min(limit));
                }
            }
            Some(ClipStrategy::Patient) => {
                let patient_of = self.patient_of()?;
                let mut per_patient: BTreeMap<&str, usize> = BTreeMap::new();
                for (p, &t) in &totals {
                    *per_patient.entry(patient_of[p].as_str()).or_default() += t;
                }
                let limit = per_patient.values().copied().min().unwrap_or(0);
                for (p, &t) in &totals {
                    if per_patient[patient_of[p].as_str()] > limit {
                        clips.insert(p.clone(), t.min(limit));
                    }
                }
            }
            Some(ClipStrategy::Category) => {
                let header = header.unwrap_or_default();
                let category_of = self.category_of(header)?;
                let mut per_cat: BTreeMap<&str, usize> = BTreeMap::new();
                for (p, &t) in &totals {
                    *per_cat.entry(category_of[p].as_str()).or_default() += t;
                }
                let min_cat = per_cat.values().copied().min().unwrap_or(0);
                for (p, &t) in &totals {
                    let cat_total = per_cat[category_of[p].as_str()];
                    let limit = if cat_total == 0 { 0 } else { (t as f64 * (min_cat as f64 / cat_total as f64)) as usize };
                    clips.insert(p.clone(), t.min(limit));
                }
            }
        }
        if let Some(max) = max_tiles {
            for (p, &t) in &totals {
                let current = clips.get(p).copied().unwrap_or(t);
                clips.insert(p.clone(), current.min(max));
            }
        }
        info!("Clipped {} containers ({:?}, max_tiles {:?})", clips.len(), strategy, max_tiles);
        let mut out = self.clone();
        out.clips = clips;
        Ok(out)
    }

    /// A view with every clip removed.
    pub fn unclip(&self) -> Self {
        let mut out = self.clone();
        out.clips.clear();
        out
    }

    /// Derive a balanced view. A header without a strategy means `category`.
    pub fn balance(&self, strategy: Option<BalanceStrategy>, header: Option<&str>) -> Result<Self> {
        let strategy = match (strategy, header) {
            (Some(s), _) => s,
            (None, Some(_)) => BalanceStrategy::Category,
            (None, None) => return Ok(self.clone()),
        };
        if strategy == BalanceStrategy::Category && header.is_none() {
            return Err(TileError::InvalidConfig("category balancing requires a label header".into()).into());
        }
        if self.tfrecords()?.is_empty() {
            return Err(TileError::NoContainers.into());
        }
        let mut out = self.clone();
        out.balance = Some(BalanceState { strategy, header: header.map(str::to_string) });
        Ok(out)
    }

    /// Sampling probabilities per container, summing to 1. `None` when the
    /// view is not balanced.
    pub fn prob_weights(&self) -> Result<Option<BTreeMap<PathBuf, f64>>> {
        let Some(state) = &self.balance else {
            return Ok(None);
        };
        let manifest = self.manifest()?;
        if manifest.is_empty() {
            return Err(TileError::NoContainers.into());
        }
        let raw: BTreeMap<PathBuf, f64> = match state.strategy {
            BalanceStrategy::Tile => {
                manifest.iter().map(|(p, c)| (p.clone(), c.clipped as f64)).collect()
            }
            BalanceStrategy::Slide => manifest.keys().map(|p| (p.clone(), 1.0)).collect(),
            BalanceStrategy::Patient => {
                let patient_of = self.patient_of()?;
                let mut count: BTreeMap<&str, usize> = BTreeMap::new();
                for p in manifest.keys() {
                    *count.entry(patient_of[p].as_str()).or_default() += 1;
                }
                manifest.keys().map(|p| (p.clone(), 1.0 / count[patient_of[p].as_str()] as f64)).collect()
            }
            BalanceStrategy::Category => {
                let header = state.header.as_deref().unwrap_or_default();
                let category_of = self.category_of(header)?;
                let mut count: BTreeMap<&str, usize> = BTreeMap::new();
                for p in manifest.keys() {
                    *count.entry(category_of[p].as_str()).or_default() += 1;
                }
                manifest.keys().map(|p| (p.clone(), 1.0 / count[category_of[p].as_str()] as f64)).collect()
            }
        };
        let sum: f64 = raw.values().sum();
        if sum <= 0.0 {
            let n = raw.len() as f64;
            return Ok(Some(raw.into_keys().map(|p| (p, 1.0 / n)).collect()));
        }
        Ok(Some(raw.into_iter().map(|(p, w)| (p, w / sum)).collect()))
    }

    /// Build missing indices (or all, with `force`). Returns how many were written.
    pub fn build_index(&self, force: bool) -> Result<usize> {
        let mut built = 0;
        for container in self.tfrecords()? {
            if force || !index_path_for(&container).exists() {
                build_index(&container)?;
                built += 1;
            }
        }
        if built > 0 {
            info!("Built {} indices", built);
        }
        Ok(built)
    }

    /// Split every container by its slide's ROIs into `{name}_inside` and
    /// `{name}_outside` containers under `dest`.
    pub fn split_by_roi(&self, roi_dir: &Path, dest: &Path) -> Result<Vec<RoiSplit>> {
        let mut out = Vec::new();
        for container in self.tfrecords()? {
            let slide = container_name(&container);
            let rois = RoiSet::from_rois(&rois_for_slide(Some(roi_dir), &slide)?, &slide);
            if rois.is_empty() {
                warn!("{}: no ROIs found, not split", slide);
                continue;
            }
            out.push(split_container_by_roi(&container, &rois, dest)?);
        }
        Ok(out)
    }
}

/// Record counts written by [`split_container_by_roi`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoiSplit {
    pub slide: String,
    pub inside: usize,
    pub outside: usize,
}

/// Reclassify each record of `container` by whether its location lies inside
/// any ROI. Locations must be level-0 coordinates.
pub fn split_container_by_roi(container: &Path, rois: &RoiSet, dest: &Path) -> Result<RoiSplit> {
    let name = container_name(container);
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut inside = RecordWriter::create(&dest.join(format!("{}_inside.{}", name, CONTAINER_EXT)))?;
    let mut outside = RecordWriter::create(&dest.join(format!("{}_outside.{}", name, CONTAINER_EXT)))?;
    for record in RecordReader::open(container)? {
        let record = record?;
        if rois.contains(record.loc_x as f64, record.loc_y as f64) {
            inside.write(&record)?;
        } else {
            outside.write(&record)?;
        }
    }
    let split = RoiSplit { slide: name, inside: inside.finish()?, outside: outside.finish()? };
    info!("{}: {} records inside ROIs, {} outside", split.slide, split.inside, split.outside);
    Ok(split)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::Record;

    fn write_container(dir: &Path, name: &str, n: usize) {
        let mut w = RecordWriter::create(&dir.join(format!("{}.{}", name, CONTAINER_EXT))).unwrap();
        for i in 0..n {
            w.write(&Record { slide: name.into(), image_raw: vec![0; 4], loc_x: (i * 100) as i64, loc_y: 50 })
                .unwrap();
        }
        w.finish().unwrap();
    }

    fn row(slide: &str, patient: &str, label: &str) -> Annotation {
        let mut fields = BTreeMap::new();
        fields.insert("slide".to_string(), slide.to_string());
        fields.insert("patient".to_string(), patient.to_string());
        fields.insert("outcome".to_string(), label.to_string());
        Annotation { slide: slide.into(), patient: patient.into(), site: None, fields }
    }

    /// s1(10, p1, A) s2(20, p1, A) s3(5, p2, B) s4(30, p3, B)
    fn fixture() -> (tempfile::TempDir, Dataset) {
        let dir = tempfile::tempdir().unwrap();
        for (name, n) in [("s1", 10), ("s2", 20), ("s3", 5), ("s4", 30)] {
            write_container(dir.path(), name, n);
        }
        let ann = Annotations::from_rows(vec![
            row("s1", "p1", "A"),
            row("s2", "p1", "A"),
            row("s3", "p2", "B"),
            row("s4", "p3", "B"),
        ]);
        let ds = Dataset::new(vec![dir.path().to_path_buf()], ann);
        (dir, ds)
    }

    fn clipped(ds: &Dataset) -> Vec<usize> {
        ds.manifest().unwrap().values().map(|c| c.clipped).collect()
    }

    #[test]
    fn test_manifest_and_filter() {
        let (_dir, ds) = fixture();
        let m = ds.manifest().unwrap();
        assert_eq!(m.values().map(|c| c.total).collect::<Vec<_>>(), vec![10, 20, 5, 30]);
        assert!(m.values().all(|c| c.clipped == c.total));
        let sub = ds.filter(&["s2", "s4"]);
        assert_eq!(sub.slides().unwrap(), vec!["s2", "s4"]);
        assert_eq!(sub.num_tiles().unwrap(), 50);
        // the parent view is unchanged
        assert_eq!(ds.num_tiles().unwrap(), 65);
    }

    #[test]
    fn test_clip_strategies() {
        let (_dir, ds) = fixture();
        assert_eq!(clipped(&ds.clip(None, Some(ClipStrategy::Slide), None).unwrap()), vec![5, 5, 5, 5]);
        // patient sums: p1 30, p2 5, p3 30 -> limit 5
        assert_eq!(clipped(&ds.clip(None, Some(ClipStrategy::Patient), None).unwrap()), vec![5, 5, 5, 5]);
        // category sums: A 30, B 35 -> B scaled by 30/35, truncated
        assert_eq!(clipped(&ds.clip(None, None, Some("outcome")).unwrap()), vec![10, 20, 4, 25]);
        assert_eq!(clipped(&ds.clip(Some(12), None, None).unwrap()), vec![10, 12, 5, 12]);
        assert_eq!(clipped(&ds.clip(Some(3), Some(ClipStrategy::Slide), None).unwrap()), vec![3, 3, 3, 3]);
    }

    #[test]
    fn test_clip_rules_and_unclip() {
        let (_dir, ds) = fixture();
        let same = ds.clip(None, None, None).unwrap();
        assert_eq!(clipped(&same), vec![10, 20, 5, 30]);
        let err = ds.clip(None, Some(ClipStrategy::Category), None).unwrap_err();
        assert!(matches!(err.downcast_ref::<TileError>(), Some(TileError::InvalidConfig(_))));

        let c = ds.clip(Some(7), None, None).unwrap();
        for counts in c.manifest().unwrap().values() {
            assert!(counts.clipped <= counts.total);
        }
        assert_eq!(c.clip_map().unwrap().len(), 4);
        let u = c.unclip();
        assert!(u.manifest().unwrap().values().all(|c| c.clipped == c.total));
        assert!(u.clip_map().unwrap().is_empty());
    }

    #[test]
    fn test_balance_weights_sum_to_one() {
        let (_dir, ds) = fixture();
        assert!(ds.prob_weights().unwrap().is_none());
        for (strategy, header) in [
            (BalanceStrategy::Tile, None),
            (BalanceStrategy::Slide, None),
            (BalanceStrategy::Patient, None),
            (BalanceStrategy::Category, Some("outcome")),
        ] {
            let w = ds.balance(Some(strategy), header).unwrap().prob_weights().unwrap().unwrap();
            let sum: f64 = w.values().sum();
            assert!((sum - 1.0).abs() < 1e-9, "{:?} sums to {}", strategy, sum);
        }
        let w: Vec<f64> =
            ds.balance(Some(BalanceStrategy::Patient), None).unwrap().prob_weights().unwrap().unwrap().into_values().collect();
        // p1 has two slides sharing one third
        assert!((w[0] - 1.0 / 6.0).abs() < 1e-9);
        assert!((w[3] - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_tile_balance_follows_clip() {
        let (_dir, ds) = fixture();
        let w = ds.clip(Some(10), None, None).unwrap().balance(Some(BalanceStrategy::Tile), None).unwrap();
        let weights: Vec<f64> = w.prob_weights().unwrap().unwrap().into_values().collect();
        assert!((weights[0] - 10.0 / 35.0).abs() < 1e-9);
        assert!((weights[2] - 5.0 / 35.0).abs() < 1e-9);
    }

    #[test]
    fn test_balance_without_containers() {
        let dir = tempfile::tempdir().unwrap();
        let ds = Dataset::new(vec![dir.path().to_path_buf()], Annotations::default());
        let err = ds.balance(Some(BalanceStrategy::Slide), None).unwrap_err();
        assert!(matches!(err.downcast_ref::<TileError>(), Some(TileError::NoContainers)));
    }

    #[test]
    fn test_duplicate_patient_is_fatal() {
        let ann = Annotations::from_rows(vec![row("s1", "p1", "A"), row("s1", "p2", "A")]);
        let ds = Dataset::new(Vec::new(), ann);
        let err = ds.patients().unwrap_err();
        assert!(matches!(err.downcast_ref::<TileError>(), Some(TileError::DuplicatePatient { .. })));
    }

    #[test]
    fn test_labels() {
        let (_dir, ds) = fixture();
        let labels = ds.labels("outcome", false).unwrap();
        assert_eq!(labels.categories, vec!["A", "B"]);
        assert_eq!(labels.by_slide["s3"], Label::Categorical(1));
        assert!(ds.labels("outcome", true).is_err());
        assert!(ds.labels("missing", false).is_err());
    }

    #[test]
    fn test_load_annotations_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ann.csv");
        fs::write(&path, "Patient,Slide,outcome,Site\np1,s1,A,X\np2,s2,B,\n").unwrap();
        let ann = Annotations::load_csv(&path).unwrap();
        assert_eq!(ann.rows().len(), 2);
        assert_eq!(ann.rows()[0].slide, "s1");
        assert_eq!(ann.rows()[0].site.as_deref(), Some("X"));
        assert_eq!(ann.rows()[1].site, None);
        assert_eq!(ann.rows()[1].fields["outcome"], "B");
    }

    #[test]
    fn test_split_by_roi() {
        let (dir, ds) = fixture();
        let roi_dir = dir.path().join("rois");
        fs::create_dir_all(&roi_dir).unwrap();
        fs::write(roi_dir.join("s1.csv"), "roi_name,x_base,y_base\nr,-10,0\nr,450,0\nr,450,100\nr,-10,100\n").unwrap();
        let out = dir.path().join("split");
        let splits = ds.split_by_roi(&roi_dir, &out).unwrap();
        assert_eq!(splits, vec![RoiSplit { slide: "s1".into(), inside: 5, outside: 5 }]);
        assert!(out.join("s1_inside.tfrecords").exists());
    }
}

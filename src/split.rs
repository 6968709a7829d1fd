//! Patient-level training/validation splits.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::record::container_name;
use crate::dataset::Dataset;
use crate::error::TileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitStrategy {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "bootstrap")]
    Bootstrap,
    #[serde(rename = "fixed")]
    Fixed,
    #[serde(rename = "k-fold")]
    KFold,
    #[serde(rename = "k-fold-preserved-site")]
    KFoldPreservedSite,
}

impl fmt::Display for SplitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SplitStrategy::None => "none",
            SplitStrategy::Bootstrap => "bootstrap",
            SplitStrategy::Fixed => "fixed",
            SplitStrategy::KFold => "k-fold",
            SplitStrategy::KFoldPreservedSite => "k-fold-preserved-site",
        };
        f.write_str(s)
    }
}

impl FromStr for SplitStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(SplitStrategy::None),
            "bootstrap" => Ok(SplitStrategy::Bootstrap),
            "fixed" => Ok(SplitStrategy::Fixed),
            "k-fold" | "kfold" => Ok(SplitStrategy::KFold),
            "k-fold-preserved-site" => Ok(SplitStrategy::KFoldPreservedSite),
            _ => Err(format!(
                "unknown split strategy '{}'. Available: none, bootstrap, fixed, k-fold, k-fold-preserved-site",
                s
            )),
        }
    }
}

impl SplitStrategy {
    fn is_k_fold(self) -> bool {
        matches!(self, SplitStrategy::KFold | SplitStrategy::KFoldPreservedSite)
    }
}

/// Parameters of one split invocation.
#[derive(Debug, Clone)]
pub struct SplitRequest {
    pub strategy: SplitStrategy,
    /// Annotation header holding the outcome.
    pub outcome: String,
    /// Linear outcomes are split without category balancing.
    pub linear: bool,
    pub val_fraction: Option<f64>,
    pub k_fold: Option<usize>,
    /// 1-based fold used for validation.
    pub k_fold_iter: Option<usize>,
    /// Persisted assignments (`splits.json`).
    pub splits_file: Option<PathBuf>,
    pub read_only: bool,
    pub seed: Option<u64>,
}

impl SplitRequest {
    pub fn new(strategy: SplitStrategy, outcome: &str) -> Self {
        Self {
            strategy,
            outcome: outcome.to_string(),
            linear: false,
            val_fraction: None,
            k_fold: None,
            k_fold_iter: None,
            splits_file: None,
            read_only: false,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<(), TileError> {
        match self.strategy {
            SplitStrategy::KFold | SplitStrategy::KFoldPreservedSite => {
                let k = self.k_fold.unwrap_or(0);
                if k < 2 {
                    return Err(TileError::InvalidConfig(format!("{} requires k_fold >= 2", self.strategy)));
                }
                match self.k_fold_iter {
                    Some(i) if (1..=k).contains(&i) => {}
                    other => {
                        return Err(TileError::InvalidConfig(format!(
                            "k_fold_iter must be in 1..={} (got {:?})",
                            k, other
                        )))
                    }
                }
            }
            SplitStrategy::Bootstrap | SplitStrategy::Fixed => match self.val_fraction {
                Some(f) if f > 0.0 && f < 1.0 => {}
                other => {
                    return Err(TileError::InvalidConfig(format!(
                        "{} requires val_fraction in (0, 1) (got {:?})",
                        self.strategy, other
                    )))
                }
            },
            SplitStrategy::None => {}
        }
        Ok(())
    }

    fn buckets(&self) -> usize {
        if self.strategy.is_k_fold() {
            self.k_fold.unwrap_or(0)
        } else {
            2
        }
    }
}

/// A patient as recorded in a persisted split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientInfo {
    pub outcome_label: String,
    pub slides: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
}

/// One entry of `splits.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSplit {
    pub strategy: SplitStrategy,
    pub patients: BTreeMap<String, PatientInfo>,
    /// `training`/`validation`, or `k-fold-1` .. `k-fold-k`, each a slide list.
    pub tfrecords: BTreeMap<String, Vec<String>>,
}

impl PersistedSplit {
    fn matches(&self, req: &SplitRequest, patients: &BTreeMap<String, PatientInfo>) -> bool {
        self.strategy == req.strategy
            && self.tfrecords.len() == req.buckets()
            && self.patients.keys().eq(patients.keys())
            && self.patients.values().map(|p| &p.outcome_label).eq(patients.values().map(|p| &p.outcome_label))
    }
}

pub fn load_splits(path: &std::path::Path) -> Result<Vec<PersistedSplit>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Places patients into `k` folds so that each site lands in as few folds as possible.
pub trait SiteSolver: Send + Sync {
    fn assign(&self, patients: &BTreeMap<String, PatientInfo>, k: usize) -> Result<Vec<Vec<String>>>;
}

/// Puts whole sites into folds, largest site first, each into the fold with
/// the fewest patients. Every site ends up in exactly one fold; outcome
/// balance across folds is not considered.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedySiteSolver;

impl SiteSolver for GreedySiteSolver {
    fn assign(&self, patients: &BTreeMap<String, PatientInfo>, k: usize) -> Result<Vec<Vec<String>>> {
        let mut by_site: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for (pid, info) in patients {
            let site = info
                .site
                .as_deref()
                .ok_or_else(|| TileError::InvalidConfig(format!("patient {} has no site label", pid)))?;
            by_site.entry(site).or_default().push(pid.clone());
        }
        let mut sites: Vec<(&str, Vec<String>)> = by_site.into_iter().collect();
        sites.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(b.0)));

        let mut folds: Vec<Vec<String>> = vec![Vec::new(); k];
        for (site, members) in sites {
            let target = (0..k).min_by_key(|&i| (folds[i].len(), i)).unwrap_or(0);
            debug!("Site {} ({} patients) -> fold {}", site, members.len(), target + 1);
            folds[target].extend(members);
        }
        Ok(folds)
    }
}

/// Training and validation slide names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SplitResult {
    pub training: Vec<String>,
    pub validation: Vec<String>,
}

/// Shuffle within each category, then deal patients round-robin into `k`
/// folds. The deal position carries over between categories so fold sizes
/// stay within one of each other.
fn split_balanced(patients: &BTreeMap<String, PatientInfo>, k: usize, rng: &mut StdRng) -> Vec<Vec<String>> {
    let mut by_label: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (pid, info) in patients {
        by_label.entry(info.outcome_label.as_str()).or_default().push(pid.clone());
    }
    let mut folds: Vec<Vec<String>> = vec![Vec::new(); k];
    let mut next = 0;
    for (label, mut members) in by_label {
        members.shuffle(rng);
        let mut counts = vec![0usize; k];
        for pid in members {
            counts[next] += 1;
            folds[next].push(pid);
            next = (next + 1) % k;
        }
        info!("Category {}: {:?} patients per fold", label, counts);
    }
    folds
}

fn split_plain(patients: &BTreeMap<String, PatientInfo>, k: usize, rng: &mut StdRng) -> Vec<Vec<String>> {
    let mut ids: Vec<String> = patients.keys().cloned().collect();
    ids.shuffle(rng);
    let mut folds: Vec<Vec<String>> = vec![Vec::new(); k];
    for (i, pid) in ids.into_iter().enumerate() {
        folds[i % k].push(pid);
    }
    folds
}

fn slides_of(patients: &BTreeMap<String, PatientInfo>, ids: &[String]) -> Vec<String> {
    ids.iter().flat_map(|p| patients[p].slides.iter().cloned()).collect()
}

/// Build the patient table: outcome label, slides with containers, and site.
fn patient_table(dataset: &Dataset, req: &SplitRequest) -> Result<BTreeMap<String, PatientInfo>> {
    let labels = dataset.label_values(&req.outcome)?;
    if req.linear {
        // reject non-numeric outcomes up front
        dataset.labels(&req.outcome, true)?;
    }
    let patients = dataset.patients()?;
    let sites = dataset.sites();
    let with_container: BTreeSet<String> = dataset.tfrecords()?.iter().map(|p| container_name(p)).collect();
    if with_container.is_empty() {
        return Err(TileError::NoContainers.into());
    }

    let mut table: BTreeMap<String, PatientInfo> = BTreeMap::new();
    let mut missing = 0;
    for (slide, label) in &labels {
        if !with_container.contains(slide) {
            debug!("Slide {} has no container, skipping", slide);
            missing += 1;
            continue;
        }
        let patient = patients.get(slide).cloned().unwrap_or_else(|| slide.clone());
        let site = sites.get(slide).cloned();
        match table.get_mut(&patient) {
            None => {
                table.insert(patient, PatientInfo { outcome_label: label.clone(), slides: vec![slide.clone()], site });
            }
            Some(info) => {
                if &info.outcome_label != label {
                    return Err(TileError::MultipleLabels {
                        patient,
                        labels: format!("{}, {}", info.outcome_label, label),
                    }
                    .into());
                }
                if req.strategy == SplitStrategy::KFoldPreservedSite && info.site != site {
                    return Err(TileError::MultipleSites {
                        patient,
                        sites: format!("{:?}, {:?}", info.site, site),
                    }
                    .into());
                }
                info.slides.push(slide.clone());
            }
        }
    }
    if missing > 0 {
        warn!("{} slides missing containers, skipping", missing);
    }
    if req.strategy == SplitStrategy::KFoldPreservedSite {
        if let Some((pid, _)) = table.iter().find(|(_, info)| info.site.is_none()) {
            return Err(TileError::InvalidConfig(format!(
                "k-fold-preserved-site requires site labels (patient {} has none)",
                pid
            ))
            .into());
        }
    }
    Ok(table)
}

fn fraction_split(ids: &[String], fraction: f64) -> Result<(Vec<String>, Vec<String>)> {
    let num_val = (fraction * ids.len() as f64) as usize;
    let (val, train) = ids.split_at(num_val.min(ids.len()));
    if val.is_empty() || train.is_empty() {
        return Err(TileError::InsufficientDataForSplit(format!(
            "{} patients with val_fraction {}",
            ids.len(),
            fraction
        ))
        .into());
    }
    Ok((train.to_vec(), val.to_vec()))
}

/// Split the slides of `dataset` into training and validation sets.
///
/// `fixed` and k-fold assignments are looked up in `splits_file` first and
/// reused when strategy, bucket count, patients and outcome labels all
/// match. New assignments are appended to the file unless `read_only`.
pub fn split(dataset: &Dataset, req: &SplitRequest, solver: Option<&dyn SiteSolver>) -> Result<SplitResult> {
    req.validate()?;
    let patients = patient_table(dataset, req)?;
    let mut rng = match req.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let mut ids: Vec<String> = patients.keys().cloned().collect();
    ids.shuffle(&mut rng);

    let result = match req.strategy {
        SplitStrategy::None => {
            info!("No validation split; {} patients train", patients.len());
            SplitResult { training: slides_of(&patients, &ids), validation: Vec::new() }
        }
        SplitStrategy::Bootstrap => {
            let (train, val) = fraction_split(&ids, req.val_fraction.unwrap_or_default())?;
            info!("Bootstrap validation: {} of {} patients", val.len(), ids.len());
            SplitResult { training: slides_of(&patients, &train), validation: slides_of(&patients, &val) }
        }
        SplitStrategy::Fixed | SplitStrategy::KFold | SplitStrategy::KFoldPreservedSite => {
            persisted_split(req, &patients, &ids, &mut rng, solver)?
        }
    };
    check_leakage(&patients, &result)?;
    Ok(result)
}

fn persisted_split(
    req: &SplitRequest,
    patients: &BTreeMap<String, PatientInfo>,
    shuffled: &[String],
    rng: &mut StdRng,
    solver: Option<&dyn SiteSolver>,
) -> Result<SplitResult> {
    let mut loaded = match &req.splits_file {
        Some(path) => load_splits(path)?,
        None => Vec::new(),
    };
    let accepted = loaded.iter().position(|s| s.matches(req, patients));

    let buckets = match accepted {
        Some(id) => {
            info!("Using {} split from {:?} (ID: {})", req.strategy, req.splits_file, id);
            loaded[id].tfrecords.clone()
        }
        None => {
            let mut tfrecords: BTreeMap<String, Vec<String>> = BTreeMap::new();
            if req.strategy == SplitStrategy::Fixed {
                let (train, val) = fraction_split(shuffled, req.val_fraction.unwrap_or_default())?;
                tfrecords.insert("training".into(), slides_of(patients, &train));
                tfrecords.insert("validation".into(), slides_of(patients, &val));
            } else {
                let k = req.k_fold.unwrap_or(0);
                let folds = if req.strategy == SplitStrategy::KFoldPreservedSite {
                    solver.ok_or(TileError::SolverUnavailable)?.assign(patients, k)?
                } else if req.linear {
                    split_plain(patients, k, rng)
                } else {
                    split_balanced(patients, k, rng)
                };
                if folds.len() != k || folds.iter().any(|f| f.is_empty()) {
                    return Err(TileError::InsufficientDataForSplit(format!(
                        "{} patients cannot fill {} folds",
                        patients.len(),
                        k
                    ))
                    .into());
                }
                for (i, fold) in folds.iter().enumerate() {
                    tfrecords.insert(format!("k-fold-{}", i + 1), slides_of(patients, fold));
                }
            }
            loaded.push(PersistedSplit { strategy: req.strategy, patients: patients.clone(), tfrecords: tfrecords.clone() });
            match &req.splits_file {
                Some(path) if !req.read_only => {
                    fs::write(path, serde_json::to_string_pretty(&loaded)?)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!("Logged new {} split at {}", req.strategy, path.display());
                }
                Some(_) => info!("Read-only; new {} split not saved", req.strategy),
                None => info!("No splits file provided; split will not be saved"),
            }
            tfrecords
        }
    };

    let bucket = |key: &str| -> Result<Vec<String>> {
        buckets
            .get(key)
            .cloned()
            .ok_or_else(|| TileError::DatasetSplit(format!("persisted split has no '{}' bucket", key)).into())
    };
    if req.strategy == SplitStrategy::Fixed {
        return Ok(SplitResult { training: bucket("training")?, validation: bucket("validation")? });
    }
    let k = req.k_fold.unwrap_or(0);
    let iter = req.k_fold_iter.unwrap_or(1);
    let mut training = Vec::new();
    for ki in (1..=k).filter(|&ki| ki != iter) {
        training.extend(bucket(&format!("k-fold-{}", ki))?);
    }
    Ok(SplitResult { training, validation: bucket(&format!("k-fold-{}", iter))? })
}

/// No patient may appear in both training and validation.
fn check_leakage(patients: &BTreeMap<String, PatientInfo>, result: &SplitResult) -> Result<()> {
    let patient_of: BTreeMap<&str, &str> = patients
        .iter()
        .flat_map(|(pid, info)| info.slides.iter().map(move |s| (s.as_str(), pid.as_str())))
        .collect();
    let owner = |s: &String| patient_of.get(s.as_str()).map(|p| p.to_string()).unwrap_or_else(|| s.clone());
    let training: BTreeSet<String> = result.training.iter().map(owner).collect();
    if let Some(shared) = result.validation.iter().map(owner).find(|p| training.contains(p)) {
        return Err(TileError::DatasetSplit(format!("patient {} is in both training and validation", shared)).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::{Record, RecordWriter, CONTAINER_EXT};
    use crate::dataset::{Annotation, Annotations};
    use std::path::Path;

    fn touch_container(dir: &Path, slide: &str) {
        let mut w = RecordWriter::create(&dir.join(format!("{}.{}", slide, CONTAINER_EXT))).unwrap();
        w.write(&Record { slide: slide.into(), image_raw: vec![0], loc_x: 0, loc_y: 0 }).unwrap();
        w.finish().unwrap();
    }

    fn annotation(slide: &str, patient: &str, outcome: &str, site: Option<&str>) -> Annotation {
        let mut fields = BTreeMap::new();
        fields.insert("slide".to_string(), slide.to_string());
        fields.insert("patient".to_string(), patient.to_string());
        fields.insert("outcome".to_string(), outcome.to_string());
        Annotation { slide: slide.into(), patient: patient.into(), site: site.map(str::to_string), fields }
    }

    /// 5 category-A patients and 4 category-B patients, one slide each.
    fn cohort(dir: &Path) -> Dataset {
        let mut rows = Vec::new();
        for i in 0..9 {
            let slide = format!("s{}", i);
            touch_container(dir, &slide);
            let outcome = if i < 5 { "A" } else { "B" };
            let site = format!("site{}", i % 3);
            rows.push(annotation(&slide, &format!("p{}", i), outcome, Some(&site)));
        }
        Dataset::new(vec![dir.to_path_buf()], Annotations::from_rows(rows))
    }

    fn k_fold(k: usize, iter: usize, seed: u64) -> SplitRequest {
        let mut req = SplitRequest::new(SplitStrategy::KFold, "outcome");
        req.k_fold = Some(k);
        req.k_fold_iter = Some(iter);
        req.seed = Some(seed);
        req
    }

    #[test]
    fn test_k_fold_balances_categories() {
        let dir = tempfile::tempdir().unwrap();
        let ds = cohort(dir.path());
        let mut seen: Vec<String> = Vec::new();
        for iter in 1..=3 {
            let r = split(&ds, &k_fold(3, iter, 11), None).unwrap();
            assert_eq!(r.training.len() + r.validation.len(), 9);
            let a = r.validation.iter().filter(|s| s[1..].parse::<usize>().unwrap() < 5).count();
            let b = r.validation.len() - a;
            assert!((1..=2).contains(&a), "fold {} has {} A", iter, a);
            assert!((1..=2).contains(&b), "fold {} has {} B", iter, b);
            seen.extend(r.validation);
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn test_persisted_split_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let ds = cohort(dir.path());
        let file = dir.path().join("splits.json");
        let mut req = k_fold(3, 2, 1);
        req.splits_file = Some(file.clone());
        let first = split(&ds, &req, None).unwrap();
        req.seed = Some(999);
        let second = split(&ds, &req, None).unwrap();
        assert_eq!(first, second);
        assert_eq!(load_splits(&file).unwrap().len(), 1);

        // a different fold count does not match
        let mut other = k_fold(4, 1, 1);
        other.splits_file = Some(file.clone());
        split(&ds, &other, None).unwrap();
        assert_eq!(load_splits(&file).unwrap().len(), 2);
    }

    #[test]
    fn test_read_only_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let ds = cohort(dir.path());
        let file = dir.path().join("splits.json");
        let mut req = SplitRequest::new(SplitStrategy::Fixed, "outcome");
        req.val_fraction = Some(0.3);
        req.splits_file = Some(file.clone());
        req.read_only = true;
        let r = split(&ds, &req, None).unwrap();
        assert_eq!(r.validation.len(), 2);
        assert_eq!(r.training.len(), 7);
        assert!(!file.exists());
    }

    #[test]
    fn test_leakage_in_persisted_split_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        touch_container(dir.path(), "a1");
        touch_container(dir.path(), "a2");
        touch_container(dir.path(), "b1");
        let ds = Dataset::new(
            vec![dir.path().to_path_buf()],
            Annotations::from_rows(vec![
                annotation("a1", "pa", "X", None),
                annotation("a2", "pa", "X", None),
                annotation("b1", "pb", "Y", None),
            ]),
        );
        let mut patients = BTreeMap::new();
        patients.insert("pa".to_string(), PatientInfo { outcome_label: "X".into(), slides: vec!["a1".into(), "a2".into()], site: None });
        patients.insert("pb".to_string(), PatientInfo { outcome_label: "Y".into(), slides: vec!["b1".into()], site: None });
        let mut tfrecords = BTreeMap::new();
        tfrecords.insert("k-fold-1".to_string(), vec!["a1".to_string()]);
        tfrecords.insert("k-fold-2".to_string(), vec!["a2".to_string(), "b1".to_string()]);
        let file = dir.path().join("splits.json");
        let tampered = vec![PersistedSplit { strategy: SplitStrategy::KFold, patients, tfrecords }];
        fs::write(&file, serde_json::to_string(&tampered).unwrap()).unwrap();

        let mut req = k_fold(2, 1, 0);
        req.splits_file = Some(file);
        let err = split(&ds, &req, None).unwrap_err();
        assert!(matches!(err.downcast_ref::<TileError>(), Some(TileError::DatasetSplit(_))));
    }

    #[test]
    fn test_preserved_site() {
        let dir = tempfile::tempdir().unwrap();
        let ds = cohort(dir.path());
        let mut req = k_fold(3, 1, 5);
        req.strategy = SplitStrategy::KFoldPreservedSite;
        let err = split(&ds, &req, None).unwrap_err();
        assert!(matches!(err.downcast_ref::<TileError>(), Some(TileError::SolverUnavailable)));

        let r = split(&ds, &req, Some(&GreedySiteSolver)).unwrap();
        let site_of = |s: &String| s[1..].parse::<usize>().unwrap() % 3;
        let val_sites: BTreeSet<usize> = r.validation.iter().map(site_of).collect();
        let train_sites: BTreeSet<usize> = r.training.iter().map(site_of).collect();
        assert_eq!(val_sites.len(), 1);
        assert!(val_sites.is_disjoint(&train_sites));
    }

    #[test]
    fn test_multiple_labels_for_patient() {
        let dir = tempfile::tempdir().unwrap();
        touch_container(dir.path(), "a1");
        touch_container(dir.path(), "a2");
        let ds = Dataset::new(
            vec![dir.path().to_path_buf()],
            Annotations::from_rows(vec![annotation("a1", "pa", "X", None), annotation("a2", "pa", "Y", None)]),
        );
        let err = split(&ds, &SplitRequest::new(SplitStrategy::None, "outcome"), None).unwrap_err();
        assert!(matches!(err.downcast_ref::<TileError>(), Some(TileError::MultipleLabels { .. })));
    }

    #[test]
    fn test_bootstrap_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        touch_container(dir.path(), "only");
        let ds = Dataset::new(
            vec![dir.path().to_path_buf()],
            Annotations::from_rows(vec![annotation("only", "p", "X", None), annotation("ghost", "q", "X", None)]),
        );
        let mut req = SplitRequest::new(SplitStrategy::Bootstrap, "outcome");
        req.val_fraction = Some(0.5);
        let err = split(&ds, &req, None).unwrap_err();
        assert!(matches!(err.downcast_ref::<TileError>(), Some(TileError::InsufficientDataForSplit(_))));

        let none = split(&ds, &SplitRequest::new(SplitStrategy::None, "outcome"), None).unwrap();
        assert_eq!(none.training, vec!["only"]);

        assert!(k_fold(1, 1, 0).validate().is_err());
        assert!(k_fold(3, 4, 0).validate().is_err());
        assert!(k_fold(3, 0, 0).validate().is_err());
        assert!(SplitRequest::new(SplitStrategy::Fixed, "outcome").validate().is_err());
    }
}

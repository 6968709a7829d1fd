use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::record::{container_name, count_records, CONTAINER_EXT};
use crate::extract::unfinished_marker;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub total: usize,
}

/// Per-directory cache of record counts, keyed by container file name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

/// Finished containers in `dir`, sorted by file name. A container whose
/// slide still has an unfinished marker is mid-write or was interrupted and
/// is left out.
pub fn list_containers(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(CONTAINER_EXT) {
            continue;
        }
        if unfinished_marker(dir, &container_name(&path)).exists() {
            debug!("Skipping unfinished container {}", path.display());
            continue;
        }
        out.push(path);
    }
    out.sort();
    Ok(out)
}

fn file_key(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
}

impl Manifest {
    /// Load `{dir}/manifest.json`; a missing or unreadable file gives an empty manifest.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(MANIFEST_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                debug!("Ignoring malformed manifest {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write manifest {}", path.display()))
    }

    /// Bring the manifest for `dir` up to date. Only containers missing from
    /// the cache (or everything, with `force`) are scanned; entries for
    /// deleted containers are dropped. Unreadable containers get no entry.
    pub fn update(dir: &Path, force: bool) -> Result<Self> {
        Self::update_with(dir, force, &[])
    }

    /// Like [`Manifest::update`], also rescanning the named containers.
    pub fn update_with(dir: &Path, force: bool, stale: &[String]) -> Result<Self> {
        let mut manifest = if force { Self::default() } else { Self::load(dir) };
        let containers = list_containers(dir)?;
        let mut changed = force;

        let present: Vec<String> = containers.iter().map(|p| file_key(p)).collect();
        let before = manifest.entries.len();
        manifest.entries.retain(|k, _| present.contains(k) && !stale.contains(k));
        changed |= manifest.entries.len() != before;

        for (path, key) in containers.iter().zip(present) {
            if manifest.entries.contains_key(&key) {
                continue;
            }
            match count_records(path) {
                Ok(total) => {
                    manifest.entries.insert(key, ManifestEntry { total });
                    changed = true;
                }
                Err(e) => warn!("Leaving {} out of the manifest: {:#}", path.display(), e),
            }
        }
        if changed {
            manifest.save(dir)?;
            info!("Updated manifest for {} ({} containers)", dir.display(), manifest.entries.len());
        }
        Ok(manifest)
    }

    pub fn total(&self, file_name: &str) -> Option<usize> {
        self.entries.get(file_name).map(|e| e.total)
    }

    /// Count for a container path, looked up by its file name.
    pub fn total_for(&self, container: &Path) -> Option<usize> {
        self.total(&file_key(container))
    }

    pub fn entries(&self) -> &BTreeMap<String, ManifestEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::{Record, RecordWriter};

    fn write_container(dir: &Path, name: &str, n: usize) -> PathBuf {
        let path = dir.join(format!("{}.{}", name, CONTAINER_EXT));
        let mut w = RecordWriter::create(&path).unwrap();
        for i in 0..n {
            w.write(&Record { slide: name.into(), image_raw: vec![1, 2, 3], loc_x: i as i64, loc_y: 0 }).unwrap();
        }
        w.finish().unwrap();
        path
    }

    #[test]
    fn test_update_scans_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        write_container(dir.path(), "a", 3);
        write_container(dir.path(), "b", 5);
        let m = Manifest::update(dir.path(), false).unwrap();
        assert_eq!(m.total("a.tfrecords"), Some(3));
        assert_eq!(m.total("b.tfrecords"), Some(5));
        assert!(dir.path().join(MANIFEST_FILE).exists());

        // cached values are trusted until forced or marked stale
        let mut edited = Manifest::load(dir.path());
        edited.entries.insert("a.tfrecords".into(), ManifestEntry { total: 99 });
        edited.save(dir.path()).unwrap();
        assert_eq!(Manifest::update(dir.path(), false).unwrap().total("a.tfrecords"), Some(99));
        assert_eq!(
            Manifest::update_with(dir.path(), false, &["a.tfrecords".into()]).unwrap().total("a.tfrecords"),
            Some(3)
        );
    }

    #[test]
    fn test_update_drops_deleted_containers() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_container(dir.path(), "a", 2);
        write_container(dir.path(), "b", 1);
        assert_eq!(Manifest::update(dir.path(), false).unwrap().len(), 2);
        fs::remove_file(a).unwrap();
        let m = Manifest::update(dir.path(), false).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.total("a.tfrecords"), None);
    }

    #[test]
    fn test_manifest_json_shape() {
        let dir = tempfile::tempdir().unwrap();
        write_container(dir.path(), "s", 4);
        Manifest::update(dir.path(), false).unwrap();
        let text = fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["s.tfrecords"]["total"], 4);
    }
}

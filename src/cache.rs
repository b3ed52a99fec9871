//! On-disk cache of extracted datasets
//!
//! Layout: `<root>/<dataset>/<fingerprint>/` with one `<split>.jsonl` per
//! split and a `dataset_info.json` manifest. The manifest is written last, so
//! an entry without one is an interrupted build and is ignored.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{ResolvedExtraction, SplitType};
use crate::dataset::{DatasetSplit, ExtractionPlan, NamedDatasetDict};
use crate::extract::HiddenRecord;
use crate::schema::Schema;

pub const MANIFEST_FILE: &str = "dataset_info.json";

/// blake3 over the resolved config, the split plan and the schema
pub fn fingerprint(
    resolved: &ResolvedExtraction,
    plan: &ExtractionPlan,
    schema: &Schema,
) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&serde_json::to_vec(resolved)?);
    hasher.update(&serde_json::to_vec(plan)?);
    hasher.update(&serde_json::to_vec(schema)?);
    Ok(hasher.finalize().to_hex().to_string())
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestSplit {
    name: String,
    split_type: SplitType,
    num_examples: usize,
}

/// Contents of `dataset_info.json`
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    name: String,
    fingerprint: String,
    schema: Schema,
    splits: Vec<ManifestSplit>,
}

/// Keyed store of finished datasets
#[derive(Debug, Clone)]
pub struct DatasetCache {
    root: PathBuf,
}

impl DatasetCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn entry_dir(&self, name: &str, fingerprint: &str) -> PathBuf {
        self.root
            .join(name.replace(['/', '\\', ' '], "__"))
            .join(fingerprint)
    }

    /// Load a finished entry; `None` when absent or unreadable
    pub fn load(&self, name: &str, fingerprint: &str) -> Result<Option<NamedDatasetDict>> {
        let dir = self.entry_dir(name, fingerprint);
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            debug!("No cache entry at {}", dir.display());
            return Ok(None);
        }

        match read_entry(&dir, fingerprint) {
            Ok(dataset) => Ok(Some(dataset)),
            Err(e) => {
                warn!("Ignoring corrupt cache entry {}: {e:#}", dir.display());
                Ok(None)
            }
        }
    }

    /// Persist `dataset`, replacing any entry with the same fingerprint
    pub fn store(&self, dataset: &NamedDatasetDict) -> Result<PathBuf> {
        let dir = self.entry_dir(dataset.name(), dataset.fingerprint());
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to clear {}", dir.display()))?;
        }
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        for split in dataset.splits() {
            write_records(&dir.join(format!("{}.jsonl", split.name())), split.records())?;
        }

        let manifest = Manifest {
            name: dataset.name().to_string(),
            fingerprint: dataset.fingerprint().to_string(),
            schema: dataset.schema().clone(),
            splits: dataset
                .splits()
                .iter()
                .map(|s| ManifestSplit {
                    name: s.name().to_string(),
                    split_type: s.split_type(),
                    num_examples: s.len(),
                })
                .collect(),
        };
        let manifest_path = dir.join(MANIFEST_FILE);
        std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
            .with_context(|| format!("Failed to write {}", manifest_path.display()))?;

        debug!("Cached {} at {}", dataset.name(), dir.display());
        Ok(dir)
    }

    /// Drop an entry so the next run rebuilds it
    pub fn remove(&self, name: &str, fingerprint: &str) -> Result<()> {
        let dir = self.entry_dir(name, fingerprint);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        Ok(())
    }
}

fn read_entry(dir: &Path, fingerprint: &str) -> Result<NamedDatasetDict> {
    let manifest: Manifest = serde_json::from_str(&std::fs::read_to_string(dir.join(MANIFEST_FILE))?)?;
    anyhow::ensure!(
        manifest.fingerprint == fingerprint,
        "manifest fingerprint {} does not match {fingerprint}",
        manifest.fingerprint
    );

    let splits = manifest
        .splits
        .iter()
        .map(|split| {
            let records = read_records(&dir.join(format!("{}.jsonl", split.name)))?;
            anyhow::ensure!(
                records.len() == split.num_examples,
                "split '{}' has {} records, manifest says {}",
                split.name,
                records.len(),
                split.num_examples
            );
            for record in &records {
                manifest.schema.validate(record)?;
            }
            Ok(DatasetSplit::new(split.name.clone(), split.split_type, records))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(NamedDatasetDict::new(
        manifest.name,
        manifest.fingerprint,
        manifest.schema,
        splits,
    ))
}

fn write_records(path: &Path, records: &[HiddenRecord]) -> Result<()> {
    let mut file = BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
    );
    for record in records {
        serde_json::to_writer(&mut file, record)?;
        writeln!(file)?;
    }
    file.flush()?;
    Ok(())
}

fn read_records(path: &Path) -> Result<Vec<HiddenRecord>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    BufReader::new(file)
        .lines()
        .enumerate()
        .map(|(i, line)| {
            let line = line?;
            serde_json::from_str(&line)
                .with_context(|| format!("{}: invalid record on line {}", path.display(), i + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::hidden_column;
    use ndarray::Array3;

    fn dataset(fingerprint: &str) -> NamedDatasetDict {
        let record = HiddenRecord {
            label: 1,
            variant_ids: vec!["t0".into()],
            text_questions: vec![vec!["a?".into(), "b?".into()]],
            hiddens: [(
                hidden_column(0),
                Array3::from_shape_vec((1, 2, 2), vec![1i16, -2, 3, -4]).unwrap(),
            )]
            .into_iter()
            .collect(),
            model_logits: None,
        };
        NamedDatasetDict::new(
            "org/toy",
            fingerprint,
            Schema::build(&[0], 1, 2, 2, false),
            vec![
                DatasetSplit::new("train", SplitType::Train, vec![record.clone(), record]),
                DatasetSplit::new("validation", SplitType::Val, vec![]),
            ],
        )
    }

    #[test]
    fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DatasetCache::new(dir.path());
        let original = dataset("fp1");

        let entry = cache.store(&original).unwrap();
        assert!(entry.ends_with("org__toy/fp1"));

        let loaded = cache.load("org/toy", "fp1").unwrap().unwrap();
        assert_eq!(loaded, original);
        assert!(cache.load("org/toy", "fp2").unwrap().is_none());
    }

    #[test]
    fn test_incomplete_entry_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DatasetCache::new(dir.path());
        cache.store(&dataset("fp1")).unwrap();

        let entry = cache.entry_dir("org/toy", "fp1");
        std::fs::remove_file(entry.join(MANIFEST_FILE)).unwrap();
        assert!(cache.load("org/toy", "fp1").unwrap().is_none());

        cache.store(&dataset("fp1")).unwrap();
        std::fs::write(entry.join("train.jsonl"), "").unwrap();
        assert!(cache.load("org/toy", "fp1").unwrap().is_none());
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DatasetCache::new(dir.path());
        cache.store(&dataset("fp1")).unwrap();
        cache.remove("org/toy", "fp1").unwrap();
        assert!(cache.load("org/toy", "fp1").unwrap().is_none());
        cache.remove("org/toy", "fp1").unwrap();
    }
}

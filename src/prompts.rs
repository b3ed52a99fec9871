//! Prompt corpora and their partitioning across workers
//!
//! A prompt example is one labeled question rendered through several
//! templates ("variants"), each listing one prompt per answer choice.
//! Sources hand every worker a contiguous, disjoint slice of a split.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{split_dataset_name, VariantCount};
use crate::error::ExtractError;

/// One candidate answer as fed to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptChoice {
    pub question: String,
    pub answer: String,
}

/// A labeled example with every variant's choices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptExample {
    pub label: usize,
    /// Template name per variant
    pub template_names: Vec<String>,
    /// `[variant][choice]`
    pub prompts: Vec<Vec<PromptChoice>>,
}

impl PromptExample {
    pub fn num_variants(&self) -> usize {
        self.prompts.len()
    }

    /// Choice count shared by every variant
    ///
    /// Fails on an empty example or when any variant disagrees with the
    /// first one.
    pub fn num_choices(&self) -> Result<usize> {
        let expected = self
            .prompts
            .first()
            .map(Vec::len)
            .context("prompt example has no variants")?;
        for (variant, choices) in self.prompts.iter().enumerate() {
            if choices.len() != expected {
                return Err(ExtractError::RaggedChoices {
                    variant,
                    expected,
                    found: choices.len(),
                }
                .into());
            }
        }
        Ok(expected)
    }
}

/// Declared size of one split
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitInfo {
    pub name: String,
    pub num_examples: usize,
}

/// Dataset-level metadata a source exposes before any example is read
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub name: String,
    pub splits: Vec<SplitInfo>,
    #[serde(default)]
    pub label_column: Option<String>,
    #[serde(default)]
    pub num_classes: Option<usize>,
}

impl DatasetInfo {
    pub fn split(&self, name: &str) -> Option<&SplitInfo> {
        self.splits.iter().find(|s| s.name == name)
    }
}

/// A worker's slice of a split
///
/// Every rank gets `total / world_size` examples; the last rank also takes
/// the remainder. Slices are contiguous and ordered by rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub rank: usize,
    pub world_size: usize,
    pub total: usize,
}

impl Shard {
    pub fn new(rank: usize, world_size: usize, total: usize) -> Result<Self> {
        anyhow::ensure!(world_size > 0, "world size must be positive");
        anyhow::ensure!(
            rank < world_size,
            "rank {rank} outside world of size {world_size}"
        );
        Ok(Self {
            rank,
            world_size,
            total,
        })
    }

    /// Everything on a single worker
    pub fn whole(total: usize) -> Self {
        Self {
            rank: 0,
            world_size: 1,
            total,
        }
    }

    pub fn len(&self) -> usize {
        let base = self.total / self.world_size;
        if self.rank == self.world_size - 1 {
            base + self.total % self.world_size
        } else {
            base
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn start(&self) -> usize {
        self.rank * (self.total / self.world_size)
    }

    pub fn range(&self) -> Range<usize> {
        self.start()..self.start() + self.len()
    }
}

/// What a worker asks its source for
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub dataset: String,
    pub label_column: Option<String>,
    pub num_classes: usize,
    pub num_variants: VariantCount,
    pub split_name: String,
    pub stream: bool,
    pub seed: u64,
    pub shard: Shard,
}

/// Lazily evaluated examples of one shard
pub type PromptStream = Box<dyn Iterator<Item = Result<PromptExample>> + Send>;

/// Supplies prompt examples, partitioned by rank
///
/// Implementations must yield exactly the examples in `request.shard.range()`
/// of the split, in order, so that the union over ranks covers the first
/// `shard.total` examples once each.
pub trait PromptSource: Send + Sync {
    fn info(&self, dataset: &str) -> Result<DatasetInfo>;

    /// Number of prompt templates, used when every variant is requested
    fn template_count(&self, dataset: &str) -> Result<usize>;

    fn load(&self, request: &PromptRequest) -> Result<PromptStream>;
}

/// Pick (train, validation) split names
///
/// The training split is `train` or the first name containing it; the
/// validation split is the best of `validation`, `val`, `test`, `dev`,
/// falling back to the first remaining split.
pub fn select_train_val_splits(splits: &[SplitInfo]) -> Result<(String, String)> {
    let names: Vec<&str> = splits.iter().map(|s| s.name.as_str()).collect();
    let missing = || ExtractError::MissingSplits(names.iter().map(|s| s.to_string()).collect());
    if names.len() < 2 {
        return Err(missing().into());
    }

    let train = names
        .iter()
        .find(|&&n| n == "train")
        .or_else(|| names.iter().find(|n| n.contains("train")))
        .copied()
        .ok_or_else(missing)?;

    let rest: Vec<&str> = names.iter().copied().filter(|&n| n != train).collect();
    let val = ["validation", "val", "test", "dev"]
        .iter()
        .find_map(|p| rest.iter().find(|&&n| n == *p))
        .or_else(|| {
            ["validation", "val", "test", "dev"]
                .iter()
                .find_map(|p| rest.iter().find(|n| n.contains(p)))
        })
        .or_else(|| rest.first())
        .copied()
        .ok_or_else(missing)?;

    Ok((train.to_string(), val.to_string()))
}

/// `info.json` next to the split files
#[derive(Debug, Deserialize)]
struct InfoFile {
    splits: std::collections::BTreeMap<String, usize>,
    #[serde(default)]
    label_column: Option<String>,
    #[serde(default)]
    num_classes: Option<usize>,
    templates: Vec<String>,
}

/// Pre-rendered prompts on local disk
///
/// Layout: `<root>/<dataset>[/<config>]/info.json` plus one
/// `<split>.jsonl` per split. Each line holds the label under the label
/// column, `template_names`, and `prompts` as `[variant][choice]` objects
/// with `question` and `answer`.
#[derive(Debug, Clone)]
pub struct JsonlPromptSource {
    root: PathBuf,
}

impl JsonlPromptSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dataset_dir(&self, dataset: &str) -> PathBuf {
        let (name, config) = split_dataset_name(dataset);
        let dir = self.root.join(name);
        match config {
            Some(config) => dir.join(config),
            None => dir,
        }
    }

    fn read_info(&self, dataset: &str) -> Result<InfoFile> {
        let path = self.dataset_dir(dataset).join("info.json");
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid {}", path.display()))
    }
}

impl PromptSource for JsonlPromptSource {
    fn info(&self, dataset: &str) -> Result<DatasetInfo> {
        let info = self.read_info(dataset)?;
        Ok(DatasetInfo {
            name: split_dataset_name(dataset).0,
            splits: info
                .splits
                .into_iter()
                .map(|(name, num_examples)| SplitInfo { name, num_examples })
                .collect(),
            label_column: info.label_column,
            num_classes: info.num_classes,
        })
    }

    fn template_count(&self, dataset: &str) -> Result<usize> {
        Ok(self.read_info(dataset)?.templates.len())
    }

    fn load(&self, request: &PromptRequest) -> Result<PromptStream> {
        let path = self
            .dataset_dir(&request.dataset)
            .join(format!("{}.jsonl", request.split_name));
        let file =
            File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
        let range = request.shard.range();
        debug!(
            "Rank {} reading examples {:?} of {}",
            request.shard.rank,
            range,
            path.display()
        );

        let decoder = ExampleDecoder::from_request(request);
        let lines = BufReader::new(file)
            .lines()
            .enumerate()
            .skip(range.start)
            .take(range.len());
        let stream = lines.map(move |(index, line)| {
            let line = line.with_context(|| format!("Failed to read line {}", index + 1))?;
            decoder.decode(index, &line)
        });

        if request.stream {
            Ok(Box::new(stream))
        } else {
            let examples = stream.collect::<Result<Vec<_>>>()?;
            Ok(Box::new(examples.into_iter().map(Ok)))
        }
    }
}

/// Turns one JSONL line into a validated example
#[derive(Debug, Clone)]
struct ExampleDecoder {
    label_column: String,
    num_classes: usize,
    num_variants: VariantCount,
    seed: u64,
}

impl ExampleDecoder {
    fn from_request(request: &PromptRequest) -> Self {
        Self {
            label_column: request
                .label_column
                .clone()
                .unwrap_or_else(|| "label".to_string()),
            num_classes: request.num_classes,
            num_variants: request.num_variants,
            seed: request.seed,
        }
    }

    fn decode(&self, index: usize, line: &str) -> Result<PromptExample> {
        let mut record: serde_json::Value = serde_json::from_str(line)
            .with_context(|| format!("Invalid JSON on line {}", index + 1))?;
        let label = record
            .get(&self.label_column)
            .and_then(serde_json::Value::as_u64)
            .with_context(|| {
                format!(
                    "line {} has no integer '{}' column",
                    index + 1,
                    self.label_column
                )
            })? as usize;
        anyhow::ensure!(
            label < self.num_classes,
            "line {}: label {label} outside 0..{}",
            index + 1,
            self.num_classes
        );

        let template_names: Vec<String> = serde_json::from_value(
            record
                .get_mut("template_names")
                .map(serde_json::Value::take)
                .with_context(|| format!("line {} has no template_names", index + 1))?,
        )?;
        let prompts: Vec<Vec<PromptChoice>> = serde_json::from_value(
            record
                .get_mut("prompts")
                .map(serde_json::Value::take)
                .with_context(|| format!("line {} has no prompts", index + 1))?,
        )?;
        anyhow::ensure!(
            template_names.len() == prompts.len(),
            "line {}: {} template names for {} variants",
            index + 1,
            template_names.len(),
            prompts.len()
        );

        let example = PromptExample {
            label,
            template_names,
            prompts,
        };
        self.sample_variants(index, example)
    }

    /// Keep exactly the requested number of variants
    fn sample_variants(&self, index: usize, example: PromptExample) -> Result<PromptExample> {
        let VariantCount::Count(k) = self.num_variants else {
            return Ok(example);
        };
        let available = example.num_variants();
        anyhow::ensure!(
            available >= k,
            "line {}: {available} variants, {k} requested",
            index + 1
        );
        if available == k {
            return Ok(example);
        }

        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(index as u64));
        let mut keep = rand::seq::index::sample(&mut rng, available, k).into_vec();
        keep.sort_unstable();

        let PromptExample {
            label,
            template_names,
            prompts,
        } = example;
        Ok(PromptExample {
            label,
            template_names: keep.iter().map(|&i| template_names[i].clone()).collect(),
            prompts: keep.iter().map(|&i| prompts[i].clone()).collect(),
        })
    }
}

/// Write examples in the layout [`JsonlPromptSource`] reads
pub fn write_split(dir: &Path, split: &str, examples: &[PromptExample]) -> Result<()> {
    use std::io::Write;

    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{split}.jsonl"));
    let mut file = std::io::BufWriter::new(
        File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?,
    );
    for example in examples {
        serde_json::to_writer(&mut file, example)?;
        writeln!(file)?;
    }
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choice(q: &str) -> PromptChoice {
        PromptChoice {
            question: q.into(),
            answer: "yes".into(),
        }
    }

    fn example(shape: &[usize]) -> PromptExample {
        PromptExample {
            label: 0,
            template_names: (0..shape.len()).map(|i| format!("t{i}")).collect(),
            prompts: shape
                .iter()
                .map(|&n| (0..n).map(|j| choice(&format!("q{j}"))).collect())
                .collect(),
        }
    }

    #[test]
    fn test_num_choices_ragged() {
        assert_eq!(example(&[2, 2, 2]).num_choices().unwrap(), 2);
        let err = example(&[2, 3]).num_choices().unwrap_err();
        assert_eq!(
            err.downcast_ref::<ExtractError>(),
            Some(&ExtractError::RaggedChoices {
                variant: 1,
                expected: 2,
                found: 3
            })
        );
        assert!(example(&[]).num_choices().is_err());
    }

    #[test]
    fn test_shard_sizes_cover_total() {
        for total in 0..50 {
            for world in 1..8 {
                let mut covered = Vec::new();
                for rank in 0..world {
                    let shard = Shard::new(rank, world, total).unwrap();
                    let expected = if rank == world - 1 {
                        total / world + total % world
                    } else {
                        total / world
                    };
                    assert_eq!(shard.len(), expected);
                    covered.extend(shard.range());
                }
                assert_eq!(covered, (0..total).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn test_shard_rejects_bad_rank() {
        assert!(Shard::new(3, 3, 10).is_err());
        assert!(Shard::new(0, 0, 10).is_err());
    }

    fn splits(names: &[&str]) -> Vec<SplitInfo> {
        names
            .iter()
            .map(|n| SplitInfo {
                name: n.to_string(),
                num_examples: 10,
            })
            .collect()
    }

    #[test]
    fn test_select_train_val_splits() {
        let pick = |names: &[&str]| select_train_val_splits(&splits(names)).unwrap();
        assert_eq!(
            pick(&["test", "train", "validation"]),
            ("train".into(), "validation".into())
        );
        assert_eq!(pick(&["train", "test"]), ("train".into(), "test".into()));
        assert_eq!(
            pick(&["train_r1", "dev_r1"]),
            ("train_r1".into(), "dev_r1".into())
        );
        let err = select_train_val_splits(&splits(&["train"])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExtractError>(),
            Some(ExtractError::MissingSplits(_))
        ));
    }

    fn request(num_variants: VariantCount, shard: Shard, stream: bool) -> PromptRequest {
        PromptRequest {
            dataset: "toy".into(),
            label_column: None,
            num_classes: 2,
            num_variants,
            split_name: "train".into(),
            stream,
            seed: 42,
            shard,
        }
    }

    #[test]
    fn test_jsonl_source_shards() {
        let dir = tempfile::tempdir().unwrap();
        let ds_dir = dir.path().join("toy");
        let examples: Vec<PromptExample> = (0..5)
            .map(|i| PromptExample {
                label: i % 2,
                ..example(&[2, 2])
            })
            .collect();
        write_split(&ds_dir, "train", &examples).unwrap();
        std::fs::write(
            ds_dir.join("info.json"),
            r#"{"splits": {"train": 5, "test": 3}, "num_classes": 2, "templates": ["a", "b"]}"#,
        )
        .unwrap();

        let source = JsonlPromptSource::new(dir.path());
        assert_eq!(source.template_count("toy").unwrap(), 2);
        let info = source.info("toy").unwrap();
        assert_eq!(info.split("train").unwrap().num_examples, 5);

        let mut labels = Vec::new();
        for rank in 0..2 {
            let shard = Shard::new(rank, 2, 5).unwrap();
            for stream in [true, false] {
                let got: Vec<PromptExample> = source
                    .load(&request(VariantCount::All, shard, stream))
                    .unwrap()
                    .collect::<Result<_>>()
                    .unwrap();
                assert_eq!(got.len(), shard.len());
                if stream {
                    labels.extend(got.iter().map(|e| e.label));
                }
            }
        }
        assert_eq!(labels, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_variant_sampling_deterministic() {
        let decoder = ExampleDecoder {
            label_column: "label".into(),
            num_classes: 2,
            num_variants: VariantCount::Count(2),
            seed: 7,
        };
        let a = decoder.sample_variants(3, example(&[2, 2, 2, 2])).unwrap();
        let b = decoder.sample_variants(3, example(&[2, 2, 2, 2])).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.num_variants(), 2);
        assert_eq!(a.template_names.len(), 2);
        assert!(decoder.sample_variants(0, example(&[2])).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_label() {
        let decoder = ExampleDecoder {
            label_column: "answer_idx".into(),
            num_classes: 2,
            num_variants: VariantCount::All,
            seed: 0,
        };
        let line = r#"{"answer_idx": 5, "template_names": ["t"], "prompts": [[{"question": "q", "answer": "a"}]]}"#;
        assert!(decoder.decode(0, line).is_err());
        let line = r#"{"answer_idx": 1, "template_names": ["t"], "prompts": [[{"question": "q", "answer": "a"}]]}"#;
        assert_eq!(decoder.decode(0, line).unwrap().label, 1);
    }
}

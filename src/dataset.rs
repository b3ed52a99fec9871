//! Dataset assembly
//!
//! Plans the train/validation splits, fixes the schema, runs one extraction
//! worker per device over disjoint shards and merges their records in rank
//! order into an immutable [`NamedDatasetDict`].

use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::subscriber::NoSubscriber;
use tracing::{info, warn};

use crate::cache::{fingerprint, DatasetCache};
use crate::config::{
    split_dataset_name, ExtractOptions, ExtractionConfig, ResolvedExtraction, SplitType,
    VariantCount,
};
use crate::device::{select_usable_devices, DeviceSpec};
use crate::extract::{extract_hiddens, HiddenRecord};
use crate::model::{LoadedModel, ModelMetadata, ModelProvider};
use crate::prompts::{select_train_val_splits, PromptRequest, PromptSource, Shard};
use crate::schema::{build_schema, Schema};

/// Records of one split, frozen once built
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSplit {
    name: String,
    split_type: SplitType,
    records: Arc<[HiddenRecord]>,
}

impl DatasetSplit {
    pub fn new(name: impl Into<String>, split_type: SplitType, records: Vec<HiddenRecord>) -> Self {
        Self {
            name: name.into(),
            split_type,
            records: records.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn split_type(&self) -> SplitType {
        self.split_type
    }

    pub fn records(&self) -> &[HiddenRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HiddenRecord> {
        self.records.iter()
    }
}

/// Train and validation splits of one dataset, with their shared schema
#[derive(Debug, Clone, PartialEq)]
pub struct NamedDatasetDict {
    name: String,
    fingerprint: String,
    schema: Arc<Schema>,
    splits: Vec<DatasetSplit>,
}

impl NamedDatasetDict {
    pub fn new(
        name: impl Into<String>,
        fingerprint: impl Into<String>,
        schema: Schema,
        splits: Vec<DatasetSplit>,
    ) -> Self {
        Self {
            name: name.into(),
            fingerprint: fingerprint.into(),
            schema: Arc::new(schema),
            splits,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn splits(&self) -> &[DatasetSplit] {
        &self.splits
    }

    /// Split by its source name, e.g. `"validation"`
    pub fn split(&self, name: &str) -> Option<&DatasetSplit> {
        self.splits.iter().find(|s| s.name == name)
    }

    pub fn by_type(&self, split_type: SplitType) -> Option<&DatasetSplit> {
        self.splits.iter().find(|s| s.split_type == split_type)
    }
}

/// How many examples of one split to extract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPlan {
    pub split_type: SplitType,
    pub name: String,
    pub num_examples: usize,
}

/// `min(limit, available)` scaled by the number of combined datasets
pub fn plan_split_size(limit: usize, available: usize, num_datasets: usize) -> usize {
    limit.min(available) * num_datasets
}

/// Everything known about the prompts before a model is touched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionPlan {
    /// Dataset name without its config suffix
    pub name: String,
    /// Full dataset id as passed to the prompt source
    pub dataset: String,
    pub label_column: Option<String>,
    pub num_classes: usize,
    pub num_variants: usize,
    pub splits: Vec<SplitPlan>,
}

/// Choose splits and infer label column, class and variant counts
pub fn plan_extraction(cfg: &ExtractionConfig, source: &dyn PromptSource) -> Result<ExtractionPlan> {
    let prompts = &cfg.prompts;
    anyhow::ensure!(
        prompts.datasets.len() == 1,
        "can only extract hiddens from one dataset at a time, got {}",
        prompts.datasets.len()
    );
    let dataset = prompts.datasets[0].clone();
    let (name, _) = split_dataset_name(&dataset);

    let info = source
        .info(&dataset)
        .with_context(|| format!("Failed to read dataset info of {dataset}"))?;
    let (train, val) = select_train_val_splits(&info.splits)?;
    info!("{name}: using '{train}' for training and '{val}' for validation");

    let label_column = prompts
        .label_column()
        .map(str::to_string)
        .or(info.label_column.clone());
    let num_classes = prompts
        .num_classes
        .or(info.num_classes)
        .with_context(|| format!("number of classes of {dataset} is neither configured nor declared"))?;
    anyhow::ensure!(num_classes > 0, "{dataset} declares zero classes");

    let num_variants = match prompts.num_variants {
        VariantCount::All => source.template_count(&dataset)?,
        VariantCount::Count(k) => k,
    };
    anyhow::ensure!(num_variants > 0, "{dataset} has no prompt templates");

    let splits = [(SplitType::Train, train), (SplitType::Val, val)]
        .into_iter()
        .map(|(split_type, split_name)| {
            let available = info
                .split(&split_name)
                .map(|s| s.num_examples)
                .unwrap_or_default();
            SplitPlan {
                split_type,
                num_examples: plan_split_size(
                    prompts.limit(split_type),
                    available,
                    prompts.datasets.len(),
                ),
                name: split_name,
            }
        })
        .collect();

    Ok(ExtractionPlan {
        name,
        dataset,
        label_column,
        num_classes,
        num_variants,
        splits,
    })
}

/// Fixed inputs of one extraction run, shared read-only by its workers
pub struct DatasetAssembler<'a> {
    resolved: ResolvedExtraction,
    plan: ExtractionPlan,
    schema: Schema,
    source: &'a dyn PromptSource,
}

impl<'a> DatasetAssembler<'a> {
    /// Resolve layers and fix the schema; no device work happens here
    pub fn new(
        cfg: &ExtractionConfig,
        metadata: &ModelMetadata,
        source: &'a dyn PromptSource,
    ) -> Result<Self> {
        let plan = plan_extraction(cfg, source)?;
        let resolved = cfg.resolve(metadata)?;
        let schema = build_schema(&resolved, metadata, plan.num_variants, plan.num_classes);
        Ok(Self {
            resolved,
            plan,
            schema,
            source,
        })
    }

    pub fn plan(&self) -> &ExtractionPlan {
        &self.plan
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Cache key of the dataset this assembler would build
    pub fn fingerprint(&self) -> Result<String> {
        fingerprint(&self.resolved, &self.plan, &self.schema)
    }

    /// Extract every planned split with one worker per device
    ///
    /// `model` must already live on `devices[0]`; other devices get replicas.
    pub fn assemble(&self, model: &LoadedModel, devices: &[Device]) -> Result<NamedDatasetDict> {
        anyhow::ensure!(!devices.is_empty(), "no devices to run extraction on");
        let shared = model.share_memory();

        let splits = self
            .plan
            .splits
            .iter()
            .map(|split| self.run_split(split, &shared, devices))
            .collect::<Result<Vec<_>>>()?;

        Ok(NamedDatasetDict::new(
            self.plan.name.clone(),
            self.fingerprint()?,
            self.schema.clone(),
            splits,
        ))
    }

    fn run_split(
        &self,
        split: &SplitPlan,
        model: &Arc<LoadedModel>,
        devices: &[Device],
    ) -> Result<DatasetSplit> {
        let world_size = devices.len();
        info!(
            "Extracting {} examples of '{}' on {world_size} device(s)",
            split.num_examples, split.name
        );

        let results: Vec<Result<Vec<HiddenRecord>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = devices
                .iter()
                .enumerate()
                .map(|(rank, device)| {
                    let model = Arc::clone(model);
                    scope.spawn(move || {
                        let work = || self.run_worker(split, &model, device, rank, world_size);
                        if rank == 0 {
                            work()
                        } else {
                            tracing::subscriber::with_default(NoSubscriber::default(), work)
                        }
                    })
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow::anyhow!("worker {rank} panicked")))
                })
                .collect()
        });

        let mut records = Vec::with_capacity(split.num_examples);
        for result in results {
            records.extend(result?);
        }
        anyhow::ensure!(
            records.len() == split.num_examples,
            "split '{}' has {} records, planned {}",
            split.name,
            records.len(),
            split.num_examples
        );
        Ok(DatasetSplit::new(split.name.clone(), split.split_type, records))
    }

    fn run_worker(
        &self,
        split: &SplitPlan,
        model: &LoadedModel,
        device: &Device,
        rank: usize,
        world_size: usize,
    ) -> Result<Vec<HiddenRecord>> {
        let shard = Shard::new(rank, world_size, split.num_examples)?;
        let model = model.to_device(device)?;
        let prompts = &self.resolved.config.prompts;
        let request = PromptRequest {
            dataset: self.plan.dataset.clone(),
            label_column: self.plan.label_column.clone(),
            num_classes: self.plan.num_classes,
            num_variants: prompts.num_variants,
            split_name: split.name.clone(),
            stream: prompts.stream,
            seed: prompts.seed,
            shard,
        };

        let records = extract_hiddens(&self.resolved, &model, self.source, &request)?
            .map(|record| {
                let record = record?;
                self.schema.validate(&record)?;
                Ok(record)
            })
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("rank {rank} failed on split '{}'", split.name))?;

        anyhow::ensure!(
            records.len() == shard.len(),
            "rank {rank} was assigned {} examples of '{}' but the source yielded {}",
            shard.len(),
            split.name,
            records.len()
        );
        info!("Rank {rank}: extracted {} examples of '{}'", records.len(), split.name);
        Ok(records)
    }
}

/// Reuse a cached build or run `build` and persist its result
fn with_cache(
    assembler: &DatasetAssembler<'_>,
    options: &ExtractOptions,
    build: impl FnOnce() -> Result<NamedDatasetDict>,
) -> Result<NamedDatasetDict> {
    let cache = DatasetCache::new(&options.cache_dir);
    let fingerprint = assembler.fingerprint()?;
    let name = &assembler.plan().name;

    if options.disable_cache {
        cache.remove(name, &fingerprint)?;
    } else if let Some(dataset) = cache.load(name, &fingerprint)? {
        info!("Reusing cached hidden states of {name} ({fingerprint})");
        return Ok(dataset);
    }

    let dataset = build()?;
    if let Err(e) = cache.store(&dataset) {
        warn!("Failed to cache hidden states of {name}: {e:#}");
    }
    Ok(dataset)
}

/// Extract hidden states of `cfg.model` over the configured prompts
pub fn extract(
    cfg: &ExtractionConfig,
    source: &dyn PromptSource,
    provider: &dyn ModelProvider,
    options: &ExtractOptions,
) -> Result<NamedDatasetDict> {
    let metadata = provider.metadata(&cfg.model)?;
    let assembler = DatasetAssembler::new(cfg, &metadata, source)?;

    with_cache(&assembler, options, || {
        let specs =
            select_usable_devices(options.num_gpus, options.min_gpu_mem, options.allow_cpu_fallback)?;
        // Open each device once; rank 0 reuses the handle the model lives on
        let devices = specs
            .iter()
            .map(DeviceSpec::to_device)
            .collect::<Result<Vec<_>>>()?;
        let model = LoadedModel::from_config(cfg, provider, &devices[0], specs[0].dtype())?;
        assembler.assemble(&model, &devices)
    })
}

/// Same as [`extract`] with a model already loaded on `devices[0]`
pub fn extract_with_model(
    cfg: &ExtractionConfig,
    source: &dyn PromptSource,
    model: &LoadedModel,
    devices: &[Device],
    options: &ExtractOptions,
) -> Result<NamedDatasetDict> {
    let assembler = DatasetAssembler::new(cfg, model.metadata(), source)?;
    with_cache(&assembler, options, || assembler.assemble(model, devices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PromptConfig, TokenLoc};
    use crate::prompts::{DatasetInfo, PromptStream, SplitInfo};

    #[test]
    fn test_plan_split_size() {
        assert_eq!(plan_split_size(750, 100, 1), 100);
        assert_eq!(plan_split_size(5, 100, 1), 5);
        assert_eq!(plan_split_size(5, 100, 3), 15);
        assert_eq!(plan_split_size(5, 0, 1), 0);
    }

    struct InfoOnly(DatasetInfo);

    impl PromptSource for InfoOnly {
        fn info(&self, _dataset: &str) -> Result<DatasetInfo> {
            Ok(self.0.clone())
        }

        fn template_count(&self, _dataset: &str) -> Result<usize> {
            Ok(4)
        }

        fn load(&self, _request: &PromptRequest) -> Result<PromptStream> {
            Ok(Box::new(std::iter::empty()))
        }
    }

    fn source() -> InfoOnly {
        InfoOnly(DatasetInfo {
            name: "toy".into(),
            splits: vec![
                SplitInfo {
                    name: "train".into(),
                    num_examples: 10,
                },
                SplitInfo {
                    name: "test".into(),
                    num_examples: 2,
                },
            ],
            label_column: Some("answer".into()),
            num_classes: Some(3),
        })
    }

    fn config(prompts: PromptConfig) -> ExtractionConfig {
        ExtractionConfig::new("toy-model", prompts, vec![], 1, TokenLoc::Last, false).unwrap()
    }

    #[test]
    fn test_plan_infers_from_info() {
        let cfg = config(PromptConfig {
            datasets: vec!["toy sub".into()],
            max_examples: [5, 5],
            ..Default::default()
        });
        let plan = plan_extraction(&cfg, &source()).unwrap();
        assert_eq!(plan.name, "toy");
        assert_eq!(plan.dataset, "toy sub");
        assert_eq!(plan.label_column.as_deref(), Some("answer"));
        assert_eq!(plan.num_classes, 3);
        assert_eq!(plan.num_variants, 4);
        assert_eq!(
            plan.splits,
            vec![
                SplitPlan {
                    split_type: SplitType::Train,
                    name: "train".into(),
                    num_examples: 5
                },
                SplitPlan {
                    split_type: SplitType::Val,
                    name: "test".into(),
                    num_examples: 2
                },
            ]
        );
    }

    #[test]
    fn test_plan_prefers_configured_values() {
        let cfg = config(PromptConfig {
            datasets: vec!["toy".into()],
            label_columns: vec!["label".into()],
            num_classes: Some(2),
            num_variants: VariantCount::Count(1),
            ..Default::default()
        });
        let plan = plan_extraction(&cfg, &source()).unwrap();
        assert_eq!(plan.label_column.as_deref(), Some("label"));
        assert_eq!(plan.num_classes, 2);
        assert_eq!(plan.num_variants, 1);
    }

    #[test]
    fn test_plan_rejects_multiple_datasets() {
        let cfg = config(PromptConfig {
            datasets: vec!["a".into(), "b".into()],
            ..Default::default()
        });
        assert!(plan_extraction(&cfg, &source()).is_err());
    }

    #[test]
    fn test_dataset_dict_lookup() {
        let dict = NamedDatasetDict::new(
            "toy",
            "abc",
            Schema::build(&[0], 1, 2, 4, false),
            vec![
                DatasetSplit::new("train", SplitType::Train, vec![]),
                DatasetSplit::new("validation", SplitType::Val, vec![]),
            ],
        );
        assert_eq!(dict.split("validation").unwrap().split_type(), SplitType::Val);
        assert_eq!(dict.by_type(SplitType::Train).unwrap().name(), "train");
        assert!(dict.split("test").is_none());
    }
}

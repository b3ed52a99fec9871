//! Extraction configuration
//!
//! Construction only validates. Anything that needs model metadata happens
//! in [`ExtractionConfig::resolve`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::ExtractError;
use crate::layers::{check_layer_options, resolve_layers, LayerSelection};
use crate::model::ModelMetadata;

/// Which token's hidden state summarizes a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenLoc {
    First,
    #[default]
    Last,
    Mean,
}

impl FromStr for TokenLoc {
    type Err = ExtractError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "first" => Ok(TokenLoc::First),
            "last" => Ok(TokenLoc::Last),
            "mean" => Ok(TokenLoc::Mean),
            other => Err(ExtractError::InvalidTokenLoc(other.to_string())),
        }
    }
}

impl fmt::Display for TokenLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenLoc::First => "first",
            TokenLoc::Last => "last",
            TokenLoc::Mean => "mean",
        };
        f.write_str(s)
    }
}

/// How many prompt variants each example carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantCount {
    /// One variant per available template
    #[default]
    All,
    Count(usize),
}

/// Which of the two planned splits a worker is filling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitType {
    Train,
    Val,
}

/// Prompt corpus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Dataset ids, optionally `"<name> <config>"`
    pub datasets: Vec<String>,
    /// Label column per dataset (empty = inferred from dataset info)
    pub label_columns: Vec<String>,
    /// Number of answer classes (None = inferred from dataset info)
    pub num_classes: Option<usize>,
    pub num_variants: VariantCount,
    /// Example limits for [train, validation]
    pub max_examples: [usize; 2],
    /// Seed for variant sub-sampling
    pub seed: u64,
    /// Read examples lazily instead of loading the split up front
    pub stream: bool,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            datasets: vec![],
            label_columns: vec![],
            num_classes: None,
            num_variants: VariantCount::All,
            max_examples: [750, 250],
            seed: 42,
            stream: false,
        }
    }
}

impl PromptConfig {
    /// Example limit for a split
    pub fn limit(&self, split: SplitType) -> usize {
        match split {
            SplitType::Train => self.max_examples[0],
            SplitType::Val => self.max_examples[1],
        }
    }

    /// Label column configured for the first dataset, if any
    pub fn label_column(&self) -> Option<&str> {
        self.label_columns.first().map(String::as_str)
    }

    /// One config per dataset, each carrying its own label column
    pub fn explode(&self) -> Vec<PromptConfig> {
        self.datasets
            .iter()
            .enumerate()
            .map(|(i, ds)| {
                let label_columns = match self.label_columns.len() {
                    0 => vec![],
                    1 => self.label_columns.clone(),
                    _ => self.label_columns.get(i).cloned().into_iter().collect(),
                };
                PromptConfig {
                    datasets: vec![ds.clone()],
                    label_columns,
                    ..self.clone()
                }
            })
            .collect()
    }
}

/// Split `"super_glue boolq"` into `("super_glue", Some("boolq"))`
pub fn split_dataset_name(dataset: &str) -> (String, Option<String>) {
    let mut parts = dataset.split_whitespace();
    let name = parts.next().unwrap_or_default().to_string();
    let config = parts.next().map(str::to_string);
    (name, config)
}

/// Validated extraction request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Hub id or local directory of the model
    pub model: String,
    pub prompts: PromptConfig,
    /// Explicit hidden-state indices (empty = all, unless a stride is set)
    pub layers: Vec<usize>,
    /// Take every k-th block instead of listing layers
    pub layer_stride: usize,
    pub token_loc: TokenLoc,
    /// Extract encoder states from encoder-decoder models
    pub use_encoder_states: bool,
}

impl ExtractionConfig {
    /// Validate the options; touches nothing outside its arguments
    pub fn new(
        model: impl Into<String>,
        prompts: PromptConfig,
        layers: Vec<usize>,
        layer_stride: usize,
        token_loc: TokenLoc,
        use_encoder_states: bool,
    ) -> Result<Self> {
        check_layer_options(&layers, layer_stride)?;
        anyhow::ensure!(
            !prompts.datasets.is_empty(),
            "at least one dataset is required"
        );
        Ok(Self {
            model: model.into(),
            prompts,
            layers,
            layer_stride,
            token_loc,
            use_encoder_states,
        })
    }

    /// Resolve the layer options against model metadata
    pub fn resolve(&self, metadata: &ModelMetadata) -> Result<ResolvedExtraction> {
        let layers = resolve_layers(&self.layers, self.layer_stride, metadata.num_hidden_layers)?;
        Ok(ResolvedExtraction {
            config: self.clone(),
            layers,
        })
    }

    /// One config per dataset
    pub fn explode(&self) -> Vec<ExtractionConfig> {
        self.prompts
            .explode()
            .into_iter()
            .map(|prompts| ExtractionConfig {
                prompts,
                ..self.clone()
            })
            .collect()
    }
}

/// Config whose layer options have been pinned against a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedExtraction {
    pub config: ExtractionConfig,
    pub layers: LayerSelection,
}

/// Run-level knobs that do not change the dataset contents
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Rebuild even when a matching cache entry exists
    pub disable_cache: bool,
    /// Number of accelerators to use (None = all usable)
    pub num_gpus: Option<usize>,
    /// Free-memory floor in bytes for an accelerator to qualify
    pub min_gpu_mem: Option<u64>,
    pub allow_cpu_fallback: bool,
    pub cache_dir: PathBuf,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            disable_cache: false,
            num_gpus: None,
            min_gpu_mem: None,
            allow_cpu_fallback: true,
            cache_dir: PathBuf::from("cache/elk"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompts() -> PromptConfig {
        PromptConfig {
            datasets: vec!["imdb".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_token_loc_parse() {
        assert_eq!("mean".parse::<TokenLoc>().unwrap(), TokenLoc::Mean);
        assert_eq!(
            "middle".parse::<TokenLoc>().unwrap_err(),
            ExtractError::InvalidTokenLoc("middle".into())
        );
        assert_eq!(TokenLoc::default().to_string(), "last");
    }

    #[test]
    fn test_new_rejects_layers_with_stride() {
        let err = ExtractionConfig::new("gpt2", prompts(), vec![1], 2, TokenLoc::Last, false)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExtractError>(),
            Some(ExtractError::ConflictingLayerOptions { .. })
        ));
    }

    #[test]
    fn test_resolve_stride() {
        let cfg = ExtractionConfig::new("gpt2", prompts(), vec![], 2, TokenLoc::Last, false).unwrap();
        let metadata = ModelMetadata {
            hidden_size: 8,
            num_hidden_layers: 4,
            ..Default::default()
        };
        let resolved = cfg.resolve(&metadata).unwrap();
        assert_eq!(resolved.layers, LayerSelection::Explicit(vec![0, 1, 3]));
    }

    #[test]
    fn test_explode_pairs_label_columns() {
        let p = PromptConfig {
            datasets: vec!["a".into(), "b".into()],
            label_columns: vec!["la".into(), "lb".into()],
            ..Default::default()
        };
        let parts = p.explode();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].datasets, vec!["b".to_string()]);
        assert_eq!(parts[1].label_column(), Some("lb"));
    }

    #[test]
    fn test_split_dataset_name() {
        assert_eq!(
            split_dataset_name("super_glue boolq"),
            ("super_glue".to_string(), Some("boolq".to_string()))
        );
        assert_eq!(split_dataset_name("imdb"), ("imdb".to_string(), None));
    }

    #[test]
    fn test_limits() {
        let p = prompts();
        assert_eq!(p.limit(SplitType::Train), 750);
        assert_eq!(p.limit(SplitType::Val), 250);
    }
}

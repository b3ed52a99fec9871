// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 for the label column
#![allow(clippy::many_single_char_names)] // i, j, k standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // ExtractError in error.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! elk-rs: hidden-state extraction for latent knowledge probing
//!
//! Runs a pretrained language model over multiple-choice prompts and
//! collects quantized per-layer activations, plus answer log-probabilities
//! for autoregressive models, into a split dataset for probe training.
//!
//! ## Architecture
//!
//! - `config`: Extraction and prompt configuration, validated then resolved
//! - `layers`: Layer selection from explicit lists or a stride
//! - `device`: Accelerator inventory and device selection
//! - `model`: LoadedModel, capability resolution, backend/tokenizer/provider traits
//! - `forward_llama`: LLaMA/Mistral/Qwen2 forward pass returning every hidden state
//! - `masks`: Shared causal mask cache
//! - `prompts`: Prompt examples, sharding, and the JSONL prompt source
//! - `schema`: Fixed column layout of the output dataset
//! - `quant`: float32 → int16 activation quantization
//! - `extract`: Per-example hidden-state extraction
//! - `dataset`: Split planning and multi-device assembly
//! - `cache`: Fingerprinted on-disk dataset cache

pub mod cache;
pub mod config;
pub mod dataset;
pub mod device;
pub mod error;
pub mod extract;
pub mod forward_llama;
pub mod layers;
pub mod masks;
pub mod model;
pub mod prompts;
pub mod quant;
pub mod schema;

pub use cache::DatasetCache;
pub use config::{
    ExtractOptions, ExtractionConfig, PromptConfig, ResolvedExtraction, SplitType, TokenLoc,
    VariantCount,
};
pub use dataset::{
    extract, extract_with_model, DatasetAssembler, DatasetSplit, ExtractionPlan,
    NamedDatasetDict,
};
pub use device::{select_usable_devices, DeviceSpec};
pub use error::ExtractError;
pub use extract::{HiddenRecord, HiddenStateExtractor};
pub use forward_llama::LlamaBackend;
pub use layers::LayerSelection;
pub use masks::{clear_mask_caches, create_causal_mask};
pub use model::{
    BackendFeatures, ForwardInput, ForwardOutput, HiddenStateBackend, HubModelProvider,
    LoadedModel, ModelArchitecture, ModelCapability, ModelMetadata, ModelProvider,
    PromptTokenizer,
};
pub use prompts::{JsonlPromptSource, PromptChoice, PromptExample, PromptSource, Shard};
pub use quant::{dequantize, quantize};
pub use schema::Schema;

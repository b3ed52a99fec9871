//! Model loading and the forward-pass seam
//!
//! A model is reached through [`HiddenStateBackend`], which returns every
//! hidden state of a forward pass plus whatever prediction outputs the
//! architecture has. What the extractor may do with those outputs is decided
//! once, at load time, as a [`ModelCapability`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::{Deserialize, Serialize};
use tokenizers::{Tokenizer, TruncationDirection, TruncationParams};
use tracing::info;

use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use crate::forward_llama::LlamaBackend;

/// Architecture-level facts needed before any inference runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub hidden_size: usize,
    /// Transformer blocks, excluding the embedding layer
    pub num_hidden_layers: usize,
    pub is_encoder_decoder: bool,
    /// Longest sequence the model accepts, if known
    pub max_context_length: Option<usize>,
    /// e.g. `["LlamaForCausalLM"]`
    pub architectures: Vec<String>,
    pub model_type: Option<String>,
}

impl ModelMetadata {
    /// Whether the architecture carries a token-prediction head
    ///
    /// Encoder-decoder heads (`ForConditionalGeneration`) only count when
    /// `include_enc_dec` is set, i.e. when decoder states are extracted.
    pub fn is_autoregressive(&self, include_enc_dec: bool) -> bool {
        self.architectures.iter().any(|arch| {
            arch.ends_with("ForCausalLM")
                || arch.ends_with("LMHeadModel")
                || (include_enc_dec && arch.ends_with("ForConditionalGeneration"))
        })
    }
}

/// Supported decoder-only families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    /// LLaMA / Code-LLaMA (Meta)
    Llama,
    /// Mistral (LLaMA layout, separate lm_head)
    Mistral,
    /// Qwen2 / Qwen2.5 (bias on Q/K/V)
    Qwen2,
}

impl ModelArchitecture {
    /// Detect the family from `architectures`, then `model_type`
    pub fn from_metadata(metadata: &ModelMetadata) -> Option<Self> {
        for arch in &metadata.architectures {
            if arch.starts_with("Llama") {
                return Some(ModelArchitecture::Llama);
            }
            if arch.starts_with("Mistral") {
                return Some(ModelArchitecture::Mistral);
            }
            if arch.starts_with("Qwen2") {
                return Some(ModelArchitecture::Qwen2);
            }
        }
        match metadata.model_type.as_deref() {
            Some("llama") => Some(ModelArchitecture::Llama),
            Some("mistral") => Some(ModelArchitecture::Mistral),
            Some("qwen2") => Some(ModelArchitecture::Qwen2),
            _ => None,
        }
    }
}

/// Prediction outputs a backend can produce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendFeatures {
    /// Forward returns token logits
    pub lm_head: bool,
    /// Forward returns a mean cross-entropy loss when given labels
    pub seq2seq_loss: bool,
}

/// How answer log-probabilities can be obtained, fixed at load time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelCapability {
    /// Sum log-softmax of the answer tokens from the logits
    HasLogits,
    /// Reconstruct the sum from a mean sequence loss
    HasSeq2SeqLoss,
    /// No prediction head; hidden states only
    EncoderOnly,
    /// Encoder-decoder without a usable head; hidden states only
    PlainEncoderDecoder,
}

impl ModelCapability {
    pub fn resolve(
        is_encoder_decoder: bool,
        has_lm_preds: bool,
        features: BackendFeatures,
    ) -> Result<Self> {
        match (has_lm_preds, is_encoder_decoder) {
            (true, _) if features.lm_head => Ok(ModelCapability::HasLogits),
            (true, true) if features.seq2seq_loss => Ok(ModelCapability::HasSeq2SeqLoss),
            (true, _) => Err(ExtractError::Unsupported(
                "model declares a prediction head but the backend exposes neither logits nor loss"
                    .into(),
            )
            .into()),
            (false, true) => Ok(ModelCapability::PlainEncoderDecoder),
            (false, false) => Ok(ModelCapability::EncoderOnly),
        }
    }

    pub fn emits_log_probs(&self) -> bool {
        matches!(
            self,
            ModelCapability::HasLogits | ModelCapability::HasSeq2SeqLoss
        )
    }
}

/// Inputs for one forward pass, batch size 1
#[derive(Debug, Clone, Copy)]
pub struct ForwardInput<'a> {
    /// `[1, seq_len]` u32 token ids
    pub input_ids: &'a Tensor,
    /// `[1, target_len]` decoder targets (encoder-decoder only)
    pub labels: Option<&'a Tensor>,
}

/// Everything a forward pass exposes
#[derive(Debug)]
pub struct ForwardOutput {
    /// `num_hidden_layers + 1` tensors of shape `[1, seq_len, hidden_size]`
    pub hidden_states: Vec<Tensor>,
    /// Decoder-side states for encoder-decoder models
    pub decoder_hidden_states: Option<Vec<Tensor>>,
    /// `[1, seq_len, vocab_size]`
    pub logits: Option<Tensor>,
    /// Scalar mean cross-entropy over `labels`
    pub loss: Option<Tensor>,
}

impl ForwardOutput {
    /// Decoder states when present, otherwise the main stack
    pub fn selected_hidden_states(&self) -> &[Tensor] {
        self.decoder_hidden_states
            .as_deref()
            .unwrap_or(&self.hidden_states)
    }
}

/// Forward-pass provider shared read-only by every worker
///
/// Implementations must not mutate weights during `forward`.
pub trait HiddenStateBackend: Send + Sync {
    fn metadata(&self) -> &ModelMetadata;
    fn features(&self) -> BackendFeatures;
    /// Device the weights live on
    fn device(&self) -> &Device;

    /// Run one pass and return all hidden states
    fn forward(&self, input: ForwardInput<'_>) -> Result<ForwardOutput>;

    /// Detach the encoder of an encoder-decoder model
    fn into_encoder(self: Box<Self>) -> Result<Box<dyn HiddenStateBackend>> {
        Err(ExtractError::Unsupported("this backend has no separable encoder".into()).into())
    }

    /// Instantiate the same read-only weights on another device
    fn replicate(&self, _device: &Device) -> Result<Box<dyn HiddenStateBackend>> {
        Err(ExtractError::Unsupported("this backend cannot be replicated across devices".into())
            .into())
    }
}

/// Tokenizer as seen by the extractor
pub trait PromptTokenizer: Send + Sync {
    /// Encode `text`; with `truncate`, drop tokens from the left so at most
    /// [`Self::model_max_length`] remain
    fn encode(&self, text: &str, add_special_tokens: bool, truncate: bool) -> Result<Vec<u32>>;

    fn model_max_length(&self) -> Option<usize>;
}

/// `tokenizers` tokenizer truncating from the left
pub struct HfTokenizer {
    truncating: Tokenizer,
    plain: Tokenizer,
    max_length: Option<usize>,
}

impl HfTokenizer {
    pub fn new(tokenizer: Tokenizer, max_length: Option<usize>) -> Result<Self> {
        let mut plain = tokenizer;
        plain
            .with_truncation(None)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        let mut truncating = plain.clone();
        if let Some(max_length) = max_length {
            truncating
                .with_truncation(Some(TruncationParams {
                    direction: TruncationDirection::Left,
                    max_length,
                    ..Default::default()
                }))
                .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        }
        Ok(Self {
            truncating,
            plain,
            max_length,
        })
    }

    pub fn from_file(path: &Path, max_length: Option<usize>) -> Result<Self> {
        let tokenizer =
            Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        Self::new(tokenizer, max_length)
    }
}

impl PromptTokenizer for HfTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool, truncate: bool) -> Result<Vec<u32>> {
        let tokenizer = if truncate {
            &self.truncating
        } else {
            &self.plain
        };
        let encoding = tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn model_max_length(&self) -> Option<usize> {
        self.max_length
    }
}

/// Resolves model ids into metadata, backends and tokenizers
pub trait ModelProvider: Send + Sync {
    fn metadata(&self, model_id: &str) -> Result<ModelMetadata>;

    fn load_backend(
        &self,
        model_id: &str,
        device: &Device,
        dtype: DType,
    ) -> Result<Box<dyn HiddenStateBackend>>;

    fn load_tokenizer(
        &self,
        model_id: &str,
        metadata: &ModelMetadata,
    ) -> Result<Arc<dyn PromptTokenizer>>;
}

/// Source of model files: a HuggingFace repo or a local directory
pub enum ModelRepo {
    Hub(ApiRepo),
    Local(PathBuf),
}

impl ModelRepo {
    /// A directory path is used as-is; anything else is a hub id
    pub fn open(model_id: &str) -> Result<Self> {
        let path = Path::new(model_id);
        if path.is_dir() {
            return Ok(ModelRepo::Local(path.to_path_buf()));
        }
        let api = Api::new()?;
        Ok(ModelRepo::Hub(
            api.repo(Repo::new(model_id.to_string(), RepoType::Model)),
        ))
    }

    pub fn get(&self, filename: &str) -> Result<PathBuf> {
        match self {
            ModelRepo::Hub(repo) => repo
                .get(filename)
                .with_context(|| format!("Failed to download {filename}")),
            ModelRepo::Local(dir) => {
                let path = dir.join(filename);
                anyhow::ensure!(path.exists(), "{} not found", path.display());
                Ok(path)
            }
        }
    }

    /// Like [`Self::get`] but a missing file is `None`
    pub fn try_get(&self, filename: &str) -> Option<PathBuf> {
        self.get(filename).ok()
    }
}

/// `config.json` fields shared by the supported families
#[derive(Debug, Deserialize)]
struct HubConfig {
    #[serde(alias = "d_model", alias = "n_embd")]
    hidden_size: usize,
    #[serde(alias = "num_layers", alias = "n_layer")]
    num_hidden_layers: usize,
    #[serde(default)]
    is_encoder_decoder: bool,
    #[serde(default)]
    architectures: Vec<String>,
    #[serde(default)]
    model_type: Option<String>,
    #[serde(default, alias = "n_positions")]
    max_position_embeddings: Option<usize>,
}

/// Tokenizer limits above this are placeholder sentinels
const MAX_SANE_MODEL_LENGTH: f64 = 1_000_000.0;

fn read_model_max_length(path: &Path) -> Result<Option<usize>> {
    let content = std::fs::read_to_string(path).context("Failed to read tokenizer config")?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    Ok(value
        .get("model_max_length")
        .and_then(serde_json::Value::as_f64)
        .filter(|&len| len > 0.0 && len < MAX_SANE_MODEL_LENGTH)
        .map(|len| len as usize))
}

/// Provider backed by HuggingFace Hub repos (or local checkouts)
#[derive(Debug, Default, Clone, Copy)]
pub struct HubModelProvider;

impl ModelProvider for HubModelProvider {
    fn metadata(&self, model_id: &str) -> Result<ModelMetadata> {
        let repo = ModelRepo::open(model_id)?;
        let config_path = repo.get("config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: HubConfig = serde_json::from_str(&config_str)
            .with_context(|| format!("Failed to parse config.json of {model_id}"))?;

        Ok(ModelMetadata {
            hidden_size: config.hidden_size,
            num_hidden_layers: config.num_hidden_layers,
            is_encoder_decoder: config.is_encoder_decoder,
            max_context_length: config.max_position_embeddings,
            architectures: config.architectures,
            model_type: config.model_type,
        })
    }

    fn load_backend(
        &self,
        model_id: &str,
        device: &Device,
        dtype: DType,
    ) -> Result<Box<dyn HiddenStateBackend>> {
        let metadata = self.metadata(model_id)?;
        let architecture = ModelArchitecture::from_metadata(&metadata).ok_or_else(|| {
            ExtractError::Unsupported(format!(
                "architecture {:?} of {model_id}",
                metadata.architectures
            ))
        })?;
        info!("Architecture: {:?}", architecture);

        let repo = ModelRepo::open(model_id)?;
        Ok(Box::new(LlamaBackend::load(
            &repo,
            architecture,
            metadata,
            device,
            dtype,
        )?))
    }

    fn load_tokenizer(
        &self,
        model_id: &str,
        metadata: &ModelMetadata,
    ) -> Result<Arc<dyn PromptTokenizer>> {
        let repo = ModelRepo::open(model_id)?;
        let tokenizer_path = repo.get("tokenizer.json")?;
        let max_length = match repo.try_get("tokenizer_config.json") {
            Some(path) => read_model_max_length(&path)?,
            None => None,
        }
        .or(metadata.max_context_length);

        Ok(Arc::new(HfTokenizer::from_file(&tokenizer_path, max_length)?))
    }
}

/// A model plus tokenizer, ready to be shared with workers
///
/// Cloning is cheap: both halves are reference counted and never mutated.
#[derive(Clone)]
pub struct LoadedModel {
    backend: Arc<dyn HiddenStateBackend>,
    tokenizer: Arc<dyn PromptTokenizer>,
    pub is_encoder_decoder: bool,
    pub has_lm_preds: bool,
    pub capability: ModelCapability,
}

impl LoadedModel {
    /// Apply the encoder-states request and fix the capability
    pub fn new(
        backend: Box<dyn HiddenStateBackend>,
        tokenizer: Arc<dyn PromptTokenizer>,
        use_encoder_states: bool,
    ) -> Result<Self> {
        let mut backend = backend;
        let mut is_encoder_decoder = backend.metadata().is_encoder_decoder;
        if is_encoder_decoder && use_encoder_states {
            backend = backend.into_encoder()?;
            is_encoder_decoder = false;
        }

        let has_lm_preds = backend.metadata().is_autoregressive(!use_encoder_states);
        let capability =
            ModelCapability::resolve(is_encoder_decoder, has_lm_preds, backend.features())?;
        if has_lm_preds {
            info!("Model has language model head, will store predictions.");
        }

        Ok(Self {
            backend: Arc::from(backend),
            tokenizer,
            is_encoder_decoder,
            has_lm_preds,
            capability,
        })
    }

    /// Load onto an already opened `device`
    ///
    /// Workers must be handed this same `Device` handle: a second open of the
    /// same CUDA ordinal is a different device to candle and would trigger a
    /// full replica in [`Self::to_device`].
    pub fn from_config(
        cfg: &ExtractionConfig,
        provider: &dyn ModelProvider,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        info!("Loading model: {} on {:?} ({:?})", cfg.model, device.location(), dtype);
        let backend = provider.load_backend(&cfg.model, device, dtype)?;
        let tokenizer = provider.load_tokenizer(&cfg.model, backend.metadata())?;
        Self::new(backend, tokenizer, cfg.use_encoder_states)
    }

    /// Read-only handle for concurrent workers
    ///
    /// The weights stay where they are; every clone points at the same blob.
    pub fn share_memory(&self) -> Arc<LoadedModel> {
        Arc::new(self.clone())
    }

    /// Handle bound to `device`, replicating the weights only if needed
    pub fn to_device(&self, device: &Device) -> Result<LoadedModel> {
        if self.backend.device().same_device(device) {
            return Ok(self.clone());
        }
        let replica = self.backend.replicate(device)?;
        Ok(LoadedModel {
            backend: Arc::from(replica),
            ..self.clone()
        })
    }

    pub fn backend(&self) -> &dyn HiddenStateBackend {
        self.backend.as_ref()
    }

    pub fn tokenizer(&self) -> &dyn PromptTokenizer {
        self.tokenizer.as_ref()
    }

    pub fn metadata(&self) -> &ModelMetadata {
        self.backend.metadata()
    }

    pub fn device(&self) -> &Device {
        self.backend.device()
    }
}

//! LLaMA-family forward pass exposing every hidden state
//!
//! Runs the decoder layer by layer and keeps the residual stream after the
//! embedding and after each block, the HuggingFace `output_hidden_states`
//! convention: the last entry has the final RMSNorm applied.
//!
//! One implementation covers three families through config axes:
//! - LLaMA / Code-LLaMA: no bias anywhere, separate lm_head
//! - Mistral: same layout as LLaMA
//! - Qwen2: bias on Q/K/V, tied embeddings by default

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ExtractError;
use crate::masks::create_causal_mask;
use crate::model::{
    BackendFeatures, ForwardInput, ForwardOutput, HiddenStateBackend, ModelArchitecture,
    ModelMetadata, ModelRepo,
};

/// Model configuration (subset of HuggingFace config.json)
#[derive(Debug, Clone, Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub attention_bias: bool,
    /// Any non-null value is rejected: only plain rotary embeddings are built
    #[serde(default)]
    pub rope_scaling: Option<serde_json::Value>,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl LlamaConfig {
    fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    fn check_supported(&self) -> Result<()> {
        match &self.rope_scaling {
            None | Some(serde_json::Value::Null) => Ok(()),
            Some(scaling) => {
                Err(ExtractError::Unsupported(format!("rope_scaling {scaling}")).into())
            }
        }
    }
}

/// Rotary position embeddings, precomputed up to the max context
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(
        dim: usize,
        max_seq_len: usize,
        theta: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::new(inv_freq, device)?;
        let positions: Vec<f32> = (0..max_seq_len).map(|i| i as f32).collect();
        let positions = Tensor::new(positions, device)?;

        // [max_seq_len, dim/2]
        let freqs = positions.unsqueeze(1)?.matmul(&inv_freq.unsqueeze(0)?)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let max_len = self.cos.dim(0)?;
        anyhow::ensure!(
            seq_len <= max_len,
            "sequence of {seq_len} tokens exceeds {max_len} positions"
        );
        let cos = self.cos.narrow(0, 0, seq_len)?;
        let sin = self.sin.narrow(0, 0, seq_len)?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

/// Grouped-query self attention
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &LlamaConfig, qkv_bias: bool) -> Result<Self> {
        let head_dim = config.head_dim();
        let num_kv_heads = config.num_kv_heads();
        let qkv = |out: usize, name: &str| -> Result<Linear> {
            Ok(if qkv_bias {
                linear(config.hidden_size, out, vb.pp(name))?
            } else {
                linear_no_bias(config.hidden_size, out, vb.pp(name))?
            })
        };

        Ok(Self {
            q_proj: qkv(config.num_attention_heads * head_dim, "q_proj")?,
            k_proj: qkv(num_kv_heads * head_dim, "k_proj")?,
            v_proj: qkv(num_kv_heads * head_dim, "v_proj")?,
            o_proj: linear_no_bias(
                config.num_attention_heads * head_dim,
                config.hidden_size,
                vb.pp("o_proj"),
            )?,
            num_heads: config.num_attention_heads,
            num_kv_heads,
            head_dim,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = rotary.apply(&q, &k)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let mask = create_causal_mask(seq_len, x.device(), x.dtype())?;
        let attn_weights = attn_weights.broadcast_add(&mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok(self.o_proj.forward(&attn_output)?)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x.unsqueeze(2)?;
    let x = x.expand((b, num_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// SwiGLU MLP, no bias
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_no_bias(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("gate_proj"),
            )?,
            up_proj: linear_no_bias(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("up_proj"),
            )?,
            down_proj: linear_no_bias(
                config.intermediate_size,
                config.hidden_size,
                vb.pp("down_proj"),
            )?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // down(silu(gate(x)) * up(x))
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &LlamaConfig, qkv_bias: bool) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config, qkv_bias)?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
            input_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = self.self_attn.forward(&x, rotary)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.post_attention_layernorm.forward(&x)?;
        let x = self.mlp.forward(&x)?;
        Ok((residual + x)?)
    }
}

/// Safetensors index for sharded checkpoints
#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Weight files resolved from the checkpoint
fn resolve_weight_paths(repo: &ModelRepo) -> Result<Vec<PathBuf>> {
    if let Some(index_path) = repo.try_get("model.safetensors.index.json") {
        info!("Model is sharded, loading index...");
        let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
        let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

        let mut shard_names: Vec<String> = index.weight_map.values().cloned().collect();
        shard_names.sort();
        shard_names.dedup();

        info!("Fetching {} shard files...", shard_names.len());
        shard_names.iter().map(|name| repo.get(name)).collect()
    } else {
        Ok(vec![repo.get("model.safetensors")?])
    }
}

/// Everything needed to instantiate the model on any device
///
/// The safetensors files are memory-mapped read-only; every device instance
/// reads from the same mapped pages.
struct LlamaWeights {
    config: LlamaConfig,
    architecture: ModelArchitecture,
    metadata: ModelMetadata,
    paths: Vec<PathBuf>,
    dtype: DType,
}

/// LLaMA-family decoder with all-layer hidden state capture
pub struct LlamaBackend {
    weights: Arc<LlamaWeights>,
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    /// None when tied to the embedding matrix
    lm_head: Option<Linear>,
    rotary: RotaryEmbedding,
    device: Device,
}

impl LlamaBackend {
    /// Load config and weights from a repo onto `device`
    pub fn load(
        repo: &ModelRepo,
        architecture: ModelArchitecture,
        metadata: ModelMetadata,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let config_path = repo.get("config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let mut config: LlamaConfig = serde_json::from_str(&config_str)?;
        config.check_supported()?;
        if architecture == ModelArchitecture::Qwen2 && !config_str.contains("tie_word_embeddings")
        {
            config.tie_word_embeddings = true;
        }

        info!(
            "Model config: {} layers, {} hidden, {} vocab",
            config.num_hidden_layers, config.hidden_size, config.vocab_size
        );

        let paths = resolve_weight_paths(repo)?;
        let weights = LlamaWeights {
            config,
            architecture,
            metadata,
            paths,
            dtype,
        };
        Self::build(Arc::new(weights), device)
    }

    fn build(weights: Arc<LlamaWeights>, device: &Device) -> Result<Self> {
        let config = &weights.config;
        info!(
            "Loading weights from {} file(s) onto {:?}...",
            weights.paths.len(),
            device
        );

        // SAFETY: the checkpoint files are not modified while mapped
        let vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&weights.paths, weights.dtype, device)? };
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let qkv_bias =
            config.attention_bias || weights.architecture == ModelArchitecture::Qwen2;
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                debug!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(
                vb_model.pp(format!("layers.{i}")),
                config,
                qkv_bias,
            )?);
        }

        let norm =
            candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb.pp("lm_head"),
            )?)
        };

        let rotary = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            device,
            weights.dtype,
        )?;

        info!(
            "Model loaded with {} layers (vocab_size: {})",
            config.num_hidden_layers, config.vocab_size
        );

        Ok(Self {
            weights,
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            device: device.clone(),
        })
    }

    /// Project normed hidden states to vocabulary logits
    fn logits(&self, normed: &Tensor) -> Result<Tensor> {
        match &self.lm_head {
            Some(lm_head) => Ok(lm_head.forward(normed)?),
            None => {
                let weight = self.embed_tokens.embeddings();
                Ok(normed.broadcast_matmul(&weight.t()?)?)
            }
        }
    }
}

impl HiddenStateBackend for LlamaBackend {
    fn metadata(&self) -> &ModelMetadata {
        &self.weights.metadata
    }

    fn features(&self) -> BackendFeatures {
        BackendFeatures {
            lm_head: true,
            seq2seq_loss: false,
        }
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, input: ForwardInput<'_>) -> Result<ForwardOutput> {
        let mut hidden = self.embed_tokens.forward(input.input_ids)?;
        let mut hidden_states = Vec::with_capacity(self.layers.len() + 1);
        hidden_states.push(hidden.clone());

        for layer in &self.layers {
            hidden = layer.forward(&hidden, &self.rotary)?;
            hidden_states.push(hidden.clone());
        }

        let normed = self.norm.forward(&hidden)?;
        let logits = self.logits(&normed)?;
        if let Some(last) = hidden_states.last_mut() {
            *last = normed;
        }

        Ok(ForwardOutput {
            hidden_states,
            decoder_hidden_states: None,
            logits: Some(logits),
            loss: None,
        })
    }

    fn replicate(&self, device: &Device) -> Result<Box<dyn HiddenStateBackend>> {
        Ok(Box::new(Self::build(Arc::clone(&self.weights), device)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: LlamaConfig = serde_json::from_str(
            r#"{"hidden_size": 64, "intermediate_size": 128, "num_attention_heads": 4,
                "num_hidden_layers": 2, "vocab_size": 100}"#,
        )
        .unwrap();
        assert_eq!(config.num_kv_heads(), 4);
        assert_eq!(config.head_dim(), 16);
        assert!(!config.tie_word_embeddings);
        assert_eq!(config.max_position_embeddings, 4096);
    }

    #[test]
    fn test_rope_scaling_rejected() {
        let base = r#""hidden_size": 64, "intermediate_size": 128, "num_attention_heads": 4,
                "num_hidden_layers": 2, "vocab_size": 100"#;
        let config: LlamaConfig = serde_json::from_str(&format!(
            r#"{{{base}, "rope_scaling": {{"rope_type": "llama3", "factor": 8.0}}}}"#
        ))
        .unwrap();
        let err = config.check_supported().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExtractError>(),
            Some(ExtractError::Unsupported(msg)) if msg.contains("llama3")
        ));

        let config: LlamaConfig =
            serde_json::from_str(&format!(r#"{{{base}, "rope_scaling": null}}"#)).unwrap();
        assert!(config.check_supported().is_ok());
        let config: LlamaConfig = serde_json::from_str(&format!("{{{base}}}")).unwrap();
        assert!(config.check_supported().is_ok());
    }

    #[test]
    fn test_repeat_kv() {
        let x = Tensor::zeros((1, 2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let y = repeat_kv(x, 3).unwrap();
        assert_eq!(y.dims(), &[1, 6, 3, 4]);
    }

    #[test]
    fn test_rotary_rejects_long_sequences() {
        let rotary = RotaryEmbedding::new(8, 4, 10_000.0, &Device::Cpu, DType::F32).unwrap();
        let q = Tensor::zeros((1, 2, 5, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(rotary.apply(&q, &q).is_err());

        let q = Tensor::ones((1, 2, 3, 8), DType::F32, &Device::Cpu).unwrap();
        let (q_rot, _) = rotary.apply(&q, &q).unwrap();
        assert_eq!(q_rot.dims(), &[1, 2, 3, 8]);
    }
}

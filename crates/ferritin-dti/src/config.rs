//! Hyperparameters for the dual-encoder DTI model.
//!
//! Field names follow the fairseq RoBERTa argument names so that an
//! existing training configuration can be dumped to JSON and read back here.
use crate::error::{DtiError, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strum::{Display, EnumString};

pub const DEFAULT_MAX_MOLECULE_POSITIONS: usize = 512;
pub const DEFAULT_MAX_PROTEIN_POSITIONS: usize = 1024;

/// Activation functions available to the encoder FFN and the pooler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActivationFn {
    Relu,
    Gelu,
    /// tanh approximation of gelu
    GeluAccurate,
    Tanh,
    Linear,
}

impl ActivationFn {
    pub fn apply(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            ActivationFn::Relu => xs.relu(),
            ActivationFn::Gelu => xs.gelu_erf(),
            ActivationFn::GeluAccurate => xs.gelu(),
            ActivationFn::Tanh => xs.tanh(),
            ActivationFn::Linear => Ok(xs.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DtiConfig {
    pub encoder_layers: usize,
    pub encoder_embed_dim: usize,
    pub encoder_ffn_embed_dim: usize,
    pub encoder_attention_heads: usize,
    pub activation_fn: ActivationFn,
    pub pooler_activation_fn: ActivationFn,
    pub dropout: f64,
    pub attention_dropout: f64,
    pub activation_dropout: f64,
    pub pooler_dropout: f64,
    /// LayerDrop probability, train time only.
    pub encoder_layerdrop: f64,
    pub quant_noise_pq: f64,
    pub quant_noise_pq_block_size: usize,
    pub untie_weights_roberta: bool,
    pub spectral_norm_classification_head: bool,
    /// Gradient multiplier applied to the head input.
    pub grad_multiply: f64,
    pub layer_norm_eps: f64,
    pub max_positions_molecule: usize,
    pub max_positions_protein: usize,
    pub pretrained_molecule_checkpoint: Option<PathBuf>,
    pub pretrained_protein_checkpoint: Option<PathBuf>,
    pub init_molecule_encoder_only: bool,
    pub init_protein_encoder_only: bool,
    pub freeze_lower_layers: bool,
}

impl Default for DtiConfig {
    fn default() -> Self {
        Self {
            encoder_layers: 12,
            encoder_embed_dim: 768,
            encoder_ffn_embed_dim: 3072,
            encoder_attention_heads: 12,
            activation_fn: ActivationFn::Gelu,
            pooler_activation_fn: ActivationFn::Tanh,
            dropout: 0.1,
            attention_dropout: 0.1,
            activation_dropout: 0.0,
            pooler_dropout: 0.0,
            encoder_layerdrop: 0.0,
            quant_noise_pq: 0.0,
            quant_noise_pq_block_size: 8,
            untie_weights_roberta: false,
            spectral_norm_classification_head: false,
            grad_multiply: 1.0,
            layer_norm_eps: 1e-5,
            max_positions_molecule: DEFAULT_MAX_MOLECULE_POSITIONS,
            max_positions_protein: DEFAULT_MAX_PROTEIN_POSITIONS,
            pretrained_molecule_checkpoint: None,
            pretrained_protein_checkpoint: None,
            init_molecule_encoder_only: false,
            init_protein_encoder_only: false,
            freeze_lower_layers: true,
        }
    }
}

impl DtiConfig {
    pub fn roberta_base() -> Self {
        Self::default()
    }
    pub fn roberta_large() -> Self {
        Self {
            encoder_layers: 24,
            encoder_embed_dim: 1024,
            encoder_ffn_embed_dim: 4096,
            encoder_attention_heads: 16,
            ..Self::default()
        }
    }
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)?;
        let config: DtiConfig = serde_json::from_str(&config_str)?;
        Ok(config)
    }

    /// Width of the classification-head input: both pooled embeddings side by side.
    pub fn head_input_dim(&self) -> usize {
        2 * self.encoder_embed_dim
    }

    pub fn validate(&self) -> Result<()> {
        if self.init_molecule_encoder_only && self.init_protein_encoder_only {
            return Err(DtiError::Config(
                "only one of init_molecule_encoder_only and init_protein_encoder_only can be set"
                    .to_string(),
            ));
        }
        if self.encoder_attention_heads == 0
            || self.encoder_embed_dim % self.encoder_attention_heads != 0
        {
            return Err(DtiError::Config(format!(
                "encoder_embed_dim {} must be divisible by encoder_attention_heads {}",
                self.encoder_embed_dim, self.encoder_attention_heads
            )));
        }
        for (name, p) in [
            ("dropout", self.dropout),
            ("attention_dropout", self.attention_dropout),
            ("activation_dropout", self.activation_dropout),
            ("pooler_dropout", self.pooler_dropout),
            ("encoder_layerdrop", self.encoder_layerdrop),
            ("quant_noise_pq", self.quant_noise_pq),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(DtiError::Config(format!("{name} must lie in [0, 1], got {p}")));
            }
        }
        if self.quant_noise_pq > 0.0 {
            if self.spectral_norm_classification_head {
                return Err(DtiError::Config(
                    "spectral normalization cannot be combined with quant noise".to_string(),
                ));
            }
            let block = self.quant_noise_pq_block_size;
            if block == 0 || self.head_input_dim() % block != 0 {
                return Err(DtiError::Config(format!(
                    "quant_noise_pq_block_size {block} must divide the head input width {}",
                    self.head_input_dim()
                )));
            }
        }
        if self.max_positions_molecule == 0 || self.max_positions_protein == 0 {
            return Err(DtiError::Config(
                "max positions must be positive for both branches".to_string(),
            ));
        }
        Ok(())
    }
}

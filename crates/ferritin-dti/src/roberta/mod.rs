//! RoBERTa
//!
//! A candle port of the fairseq RoBERTa encoder. Parameter names match the
//! fairseq state dict (with the leading `encoder.` removed) so pretrained
//! checkpoints can be transferred key-for-key.
//!
//! - [fairseq RoBERTa](https://github.com/facebookresearch/fairseq/tree/main/fairseq/models/roberta)
//! - [paper](https://arxiv.org/abs/1907.11692)
//!
pub mod attention;
pub mod encoder;

pub use encoder::{EncoderOutput, RobertaEncoder};

use crate::config::{ActivationFn, DtiConfig};

/// Shape of a single RoBERTa encoder.
#[derive(Debug, Clone)]
pub struct RobertaEncoderConfig {
    pub vocab_size: usize,
    pub padding_idx: u32,
    pub max_positions: usize,
    pub num_layers: usize,
    pub embed_dim: usize,
    pub ffn_embed_dim: usize,
    pub attention_heads: usize,
    pub activation_fn: ActivationFn,
    pub dropout: f64,
    pub attention_dropout: f64,
    pub activation_dropout: f64,
    pub layerdrop: f64,
    pub layer_norm_eps: f64,
    pub untie_weights: bool,
}

impl RobertaEncoderConfig {
    pub fn from_dti(
        cfg: &DtiConfig,
        vocab_size: usize,
        padding_idx: u32,
        max_positions: usize,
    ) -> Self {
        Self {
            vocab_size,
            padding_idx,
            max_positions,
            num_layers: cfg.encoder_layers,
            embed_dim: cfg.encoder_embed_dim,
            ffn_embed_dim: cfg.encoder_ffn_embed_dim,
            attention_heads: cfg.encoder_attention_heads,
            activation_fn: cfg.activation_fn,
            dropout: cfg.dropout,
            attention_dropout: cfg.attention_dropout,
            activation_dropout: cfg.activation_dropout,
            layerdrop: cfg.encoder_layerdrop,
            layer_norm_eps: cfg.layer_norm_eps,
            untie_weights: cfg.untie_weights_roberta,
        }
    }

    // learned positions are offset by the padding index
    pub fn num_position_embeddings(&self) -> usize {
        self.max_positions + self.padding_idx as usize + 1
    }
}

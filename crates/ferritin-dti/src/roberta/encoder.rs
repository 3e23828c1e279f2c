use super::attention::SelfAttention;
use super::RobertaEncoderConfig;
use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{
    embedding, layer_norm, linear, Dropout, Embedding, LayerNorm, LayerNormConfig, Linear,
    VarBuilder,
};

/// Post-norm transformer block.
///
/// - [fairseq TransformerSentenceEncoderLayer](https://github.com/facebookresearch/fairseq/blob/main/fairseq/modules/transformer_sentence_encoder_layer.py)
#[derive(Debug)]
pub struct TransformerLayer {
    self_attn: SelfAttention,
    self_attn_layer_norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    final_layer_norm: LayerNorm,
    dropout: Dropout,
    activation_dropout: Dropout,
    config: RobertaEncoderConfig,
}

impl TransformerLayer {
    pub fn load(vb: VarBuilder, config: &RobertaEncoderConfig, layer: usize) -> Result<Self> {
        let vb = vb.pp(layer);
        let ln_conf = LayerNormConfig::from(config.layer_norm_eps);
        Ok(Self {
            self_attn: SelfAttention::load(vb.pp("self_attn"), config)?,
            self_attn_layer_norm: layer_norm(
                config.embed_dim,
                ln_conf,
                vb.pp("self_attn_layer_norm"),
            )?,
            fc1: linear(config.embed_dim, config.ffn_embed_dim, vb.pp("fc1"))?,
            fc2: linear(config.ffn_embed_dim, config.embed_dim, vb.pp("fc2"))?,
            final_layer_norm: layer_norm(config.embed_dim, ln_conf, vb.pp("final_layer_norm"))?,
            dropout: Dropout::new(config.dropout as f32),
            activation_dropout: Dropout::new(config.activation_dropout as f32),
            config: config.clone(),
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        key_padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let residual = x;
        let x = self.self_attn.forward(x, key_padding_mask, train)?;
        let x = self.dropout.forward(&x, train)?;
        let x = self.self_attn_layer_norm.forward(&(residual + x)?)?;

        let residual = &x;
        let h = self.fc1.forward(&x)?;
        let h = self.config.activation_fn.apply(&h)?;
        let h = self.activation_dropout.forward(&h, train)?;
        let h = self.fc2.forward(&h)?;
        let h = self.dropout.forward(&h, train)?;
        self.final_layer_norm.forward(&(residual + h)?)
    }
}

/// Token + learned position embeddings followed by the transformer stack.
#[derive(Debug)]
pub struct SentenceEncoder {
    embed_tokens: Embedding,
    embed_positions: Embedding,
    emb_layer_norm: LayerNorm,
    layers: Vec<TransformerLayer>,
    dropout: Dropout,
    config: RobertaEncoderConfig,
}

impl SentenceEncoder {
    pub fn load(vb: VarBuilder, config: &RobertaEncoderConfig) -> Result<Self> {
        let embed_tokens = embedding(config.vocab_size, config.embed_dim, vb.pp("embed_tokens"))?;
        let embed_positions = embedding(
            config.num_position_embeddings(),
            config.embed_dim,
            vb.pp("embed_positions"),
        )?;
        let emb_layer_norm = layer_norm(
            config.embed_dim,
            LayerNormConfig::from(config.layer_norm_eps),
            vb.pp("emb_layer_norm"),
        )?;
        let layers = (0..config.num_layers)
            .map(|i| TransformerLayer::load(vb.pp("layers"), config, i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embed_tokens,
            embed_positions,
            emb_layer_norm,
            layers,
            dropout: Dropout::new(config.dropout as f32),
            config: config.clone(),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn embed_tokens(&self) -> &Embedding {
        &self.embed_tokens
    }

    /// Returns every intermediate state; the first is the embedding output.
    pub fn forward(&self, tokens: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let padding_mask = tokens.eq(self.config.padding_idx)?;
        let has_padding = padding_mask.to_dtype(DType::U32)?.sum_all()?.to_scalar::<u32>()? > 0;
        let positions = make_positions(tokens, self.config.padding_idx)?;

        let x = self.embed_tokens.forward(tokens)?;
        let x = (x + self.embed_positions.forward(&positions)?)?;
        let x = self.emb_layer_norm.forward(&x)?;
        let x = self.dropout.forward(&x, train)?;
        let keep = padding_mask
            .eq(0u8)?
            .to_dtype(x.dtype())?
            .unsqueeze(D::Minus1)?;
        let mut x = x.broadcast_mul(&keep)?;

        let key_padding_mask = if has_padding {
            Some(&padding_mask)
        } else {
            None
        };
        let mut inner_states = Vec::with_capacity(self.layers.len() + 1);
        inner_states.push(x.clone());
        for layer in self.layers.iter() {
            // LayerDrop: skip whole layers at train time.
            if train
                && self.config.layerdrop > 0.0
                && rand::random::<f64>() < self.config.layerdrop
            {
                continue;
            }
            x = layer.forward(&x, key_padding_mask, train)?;
            inner_states.push(x.clone());
        }
        Ok(inner_states)
    }
}

/// Positions count non-padding tokens from `padding_idx + 1`; pads keep `padding_idx`.
pub fn make_positions(tokens: &Tensor, padding_idx: u32) -> Result<Tensor> {
    let mask = tokens.ne(padding_idx)?.to_dtype(DType::F32)?;
    let positions = mask.cumsum(D::Minus1)?.mul(&mask)?;
    (positions + padding_idx as f64)?.to_dtype(DType::U32)
}

/// Masked-LM projection back onto the vocabulary.
#[derive(Debug)]
pub struct LmHead {
    dense: Linear,
    layer_norm: LayerNorm,
    weight: Tensor,
    bias: Tensor,
    config: RobertaEncoderConfig,
}

impl LmHead {
    pub fn load(
        vb: VarBuilder,
        config: &RobertaEncoderConfig,
        embed_tokens: &Embedding,
    ) -> Result<Self> {
        let weight = if config.untie_weights {
            vb.get((config.vocab_size, config.embed_dim), "weight")?
        } else {
            embed_tokens.embeddings().clone()
        };
        Ok(Self {
            dense: linear(config.embed_dim, config.embed_dim, vb.pp("dense"))?,
            layer_norm: layer_norm(
                config.embed_dim,
                LayerNormConfig::from(config.layer_norm_eps),
                vb.pp("layer_norm"),
            )?,
            weight,
            bias: vb.get_with_hints(config.vocab_size, "bias", candle_nn::Init::Const(0.))?,
            config: config.clone(),
        })
    }

    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let x = self.dense.forward(features)?;
        let x = self.config.activation_fn.apply(&x)?;
        let x = self.layer_norm.forward(&x)?;
        let (batch_size, seq_len, embed_dim) = x.dims3()?;
        x.reshape((batch_size * seq_len, embed_dim))?
            .matmul(&self.weight.t()?.contiguous()?)?
            .broadcast_add(&self.bias)?
            .reshape((batch_size, seq_len, self.config.vocab_size))
    }
}

#[derive(Debug)]
pub struct EncoderOutput {
    /// Last-layer features, `[batch, seq_len, embed_dim]`.
    pub features: Tensor,
    /// Vocabulary logits, present when `features_only` is false.
    pub logits: Option<Tensor>,
    pub inner_states: Option<Vec<Tensor>>,
}

/// The fairseq RoBERTa encoder: `sentence_encoder` plus `lm_head`.
#[derive(Debug)]
pub struct RobertaEncoder {
    sentence_encoder: SentenceEncoder,
    lm_head: LmHead,
    device: Device,
    config: RobertaEncoderConfig,
}

impl RobertaEncoder {
    pub fn load(vb: VarBuilder, config: &RobertaEncoderConfig) -> Result<Self> {
        let sentence_encoder = SentenceEncoder::load(vb.pp("sentence_encoder"), config)?;
        let lm_head = LmHead::load(vb.pp("lm_head"), config, sentence_encoder.embed_tokens())?;
        Ok(Self {
            sentence_encoder,
            lm_head,
            device: vb.device().clone(),
            config: config.clone(),
        })
    }

    pub fn forward(
        &self,
        tokens: &Tensor,
        features_only: bool,
        return_all_hiddens: bool,
        train: bool,
    ) -> Result<EncoderOutput> {
        let tokens = tokens.to_device(&self.device)?.to_dtype(DType::U32)?;
        let inner_states = self.sentence_encoder.forward(&tokens, train)?;
        let features = match inner_states.last() {
            Some(x) => x.clone(),
            None => candle_core::bail!("sentence encoder produced no states"),
        };
        let logits = if features_only {
            None
        } else {
            Some(self.lm_head.forward(&features)?)
        };
        Ok(EncoderOutput {
            features,
            logits,
            inner_states: return_all_hiddens.then_some(inner_states),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.sentence_encoder.num_layers()
    }
    pub fn max_positions(&self) -> usize {
        self.config.max_positions
    }
    pub fn config(&self) -> &RobertaEncoderConfig {
        &self.config
    }
    pub fn device(&self) -> &Device {
        &self.device
    }
}

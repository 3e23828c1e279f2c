use super::RobertaEncoderConfig;
use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{linear, ops::softmax_last_dim, Dropout, Linear, VarBuilder};

/// Multi-head self attention with fairseq parameter names
/// (`q_proj`, `k_proj`, `v_proj`, `out_proj`).
#[derive(Debug)]
pub struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    dropout: Dropout,
    num_heads: usize,
    head_dim: usize,
    scaling: f64,
}

impl SelfAttention {
    pub fn load(vb: VarBuilder, config: &RobertaEncoderConfig) -> Result<Self> {
        let embed_dim = config.embed_dim;
        let head_dim = embed_dim / config.attention_heads;
        Ok(Self {
            q_proj: linear(embed_dim, embed_dim, vb.pp("q_proj"))?,
            k_proj: linear(embed_dim, embed_dim, vb.pp("k_proj"))?,
            v_proj: linear(embed_dim, embed_dim, vb.pp("v_proj"))?,
            out_proj: linear(embed_dim, embed_dim, vb.pp("out_proj"))?,
            dropout: Dropout::new(config.attention_dropout as f32),
            num_heads: config.attention_heads,
            head_dim,
            scaling: (head_dim as f64).powf(-0.5),
        })
    }

    // [batch, seq_len, embed] -> [batch, heads, seq_len, head_dim]
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;
        x.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `key_padding_mask` is `[batch, seq_len]` with 1 at padded positions.
    pub fn forward(
        &self,
        x: &Tensor,
        key_padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (batch_size, seq_len, embed_dim) = x.dims3()?;
        let q = (self.q_proj.forward(x)? * self.scaling)?;
        let q = self.split_heads(&q)?;
        let k = self.split_heads(&self.k_proj.forward(x)?)?;
        let v = self.split_heads(&self.v_proj.forward(x)?)?;

        // (B, H, T, S)
        let scores = q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?;
        let scores = match key_padding_mask {
            Some(mask) => {
                let mask = mask
                    .unsqueeze(1)?
                    .unsqueeze(1)?
                    .broadcast_as(scores.shape())?;
                let neg_inf = Tensor::new(f32::NEG_INFINITY, scores.device())?
                    .to_dtype(scores.dtype())?
                    .broadcast_as(scores.shape())?;
                mask.where_cond(&neg_inf, &scores)?
            }
            None => scores,
        };
        let probs = softmax_last_dim(&scores.to_dtype(DType::F32)?)?.to_dtype(v.dtype())?;
        let probs = self.dropout.forward(&probs, train)?;

        let attn = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch_size, seq_len, embed_dim))?;
        self.out_proj.forward(&attn)
    }
}

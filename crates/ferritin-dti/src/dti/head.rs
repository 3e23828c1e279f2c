//! Sentence-level classification head over the concatenated pooled embeddings.
//!
//! - [fairseq RobertaClassificationHead](https://github.com/facebookresearch/fairseq/blob/main/fairseq/models/roberta/model.py)
use crate::config::{ActivationFn, DtiConfig};
use crate::error::{DtiError, Result};
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{linear, Dropout, Linear, VarBuilder, VarMap};

const SPECTRAL_NORM_ITERATIONS: usize = 20;
const SPECTRAL_NORM_EPS: f64 = 1e-12;

/// Hyperparameters of one classification head.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadSpec {
    pub input_dim: usize,
    pub inner_dim: usize,
    pub num_classes: usize,
    pub activation: ActivationFn,
    pub dropout: f64,
    pub q_noise: f64,
    pub qn_block_size: usize,
    pub spectral_norm: bool,
}

impl HeadSpec {
    /// `inner_dim` defaults to the encoder embedding width.
    pub fn from_config(cfg: &DtiConfig, num_classes: usize, inner_dim: Option<usize>) -> Self {
        Self {
            input_dim: cfg.head_input_dim(),
            inner_dim: inner_dim.unwrap_or(cfg.encoder_embed_dim),
            num_classes,
            activation: cfg.pooler_activation_fn,
            dropout: cfg.pooler_dropout,
            q_noise: cfg.quant_noise_pq,
            qn_block_size: cfg.quant_noise_pq_block_size,
            spectral_norm: cfg.spectral_norm_classification_head,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 || self.inner_dim == 0 {
            return Err(DtiError::Config(
                "classification head needs at least one class and a non-empty inner layer"
                    .to_string(),
            ));
        }
        if self.q_noise > 0.0 {
            if self.spectral_norm {
                return Err(DtiError::Config(
                    "spectral normalization cannot be combined with quant noise".to_string(),
                ));
            }
            if self.q_noise >= 1.0 {
                return Err(DtiError::Config(format!(
                    "quant noise must be below 1, got {}",
                    self.q_noise
                )));
            }
            let block = self.qn_block_size;
            if block == 0 || self.input_dim % block != 0 || self.inner_dim % block != 0 {
                return Err(DtiError::Config(format!(
                    "quant noise block size {block} must divide {} and {}",
                    self.input_dim, self.inner_dim
                )));
            }
        }
        Ok(())
    }
}

/// Drops whole blocks of input weights per output row, rescaling the rest.
///
/// - [Training with Quantization Noise](https://arxiv.org/abs/2004.07320)
pub fn quant_noise(weight: &Tensor, p: f64, block_size: usize) -> candle_core::Result<Tensor> {
    let (out_features, in_features) = weight.dims2()?;
    let n_blocks = in_features / block_size;
    let dropped = Tensor::rand(0f32, 1f32, (out_features, n_blocks), weight.device())?
        .lt(p as f32)?
        .unsqueeze(2)?
        .broadcast_as((out_features, n_blocks, block_size))?
        .reshape((out_features, in_features))?;
    let keep = dropped.eq(0u8)?.to_dtype(weight.dtype())?;
    weight.mul(&keep)?.affine(1.0 / (1.0 - p), 0.0)
}

/// Divides `weight` by its largest singular value, estimated by power iteration.
///
/// The singular vectors are computed on a detached copy, so gradients only
/// flow through the final `u^T W v` estimate as in `torch.nn.utils.spectral_norm`.
pub fn spectral_normalize(weight: &Tensor) -> candle_core::Result<Tensor> {
    let (out_features, _) = weight.dims2()?;
    let w = weight.detach();
    let normalize = |x: Tensor| -> candle_core::Result<Tensor> {
        let norm = (x.sqr()?.sum_all()?.sqrt()? + SPECTRAL_NORM_EPS)?;
        x.broadcast_div(&norm)
    };
    let mut u = normalize(Tensor::ones((out_features, 1), w.dtype(), w.device())?)?;
    let mut v = normalize(w.t()?.matmul(&u)?)?;
    for _ in 1..SPECTRAL_NORM_ITERATIONS {
        u = normalize(w.matmul(&v)?)?;
        v = normalize(w.t()?.matmul(&u)?)?;
    }
    u = normalize(w.matmul(&v)?)?;
    let sigma = u.t()?.matmul(&weight.matmul(&v)?)?.reshape(())?;
    weight.broadcast_div(&sigma)
}

#[derive(Debug)]
struct NoisyLinear {
    linear: Linear,
    q_noise: f64,
    block_size: usize,
}

impl NoisyLinear {
    fn load(in_dim: usize, out_dim: usize, spec: &HeadSpec, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear: linear(in_dim, out_dim, vb)?,
            q_noise: spec.q_noise,
            block_size: spec.qn_block_size,
        })
    }

    fn forward(&self, x: &Tensor, spectral_norm: bool, train: bool) -> candle_core::Result<Tensor> {
        let weight = self.linear.weight();
        let weight = if train && self.q_noise > 0.0 {
            quant_noise(weight, self.q_noise, self.block_size)?
        } else if spectral_norm {
            spectral_normalize(weight)?
        } else {
            return self.linear.forward(x);
        };
        Linear::new(weight, self.linear.bias().cloned()).forward(x)
    }
}

/// `dropout -> dense -> activation -> dropout -> out_proj`
pub struct ClassificationHead {
    dense: NoisyLinear,
    out_proj: NoisyLinear,
    dropout: Dropout,
    spec: HeadSpec,
    varmap: VarMap,
}

impl ClassificationHead {
    pub fn new(spec: HeadSpec, device: &Device) -> Result<Self> {
        spec.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let dense = NoisyLinear::load(spec.input_dim, spec.inner_dim, &spec, vb.pp("dense"))?;
        let out_proj =
            NoisyLinear::load(spec.inner_dim, spec.num_classes, &spec, vb.pp("out_proj"))?;
        Ok(Self {
            dense,
            out_proj,
            dropout: Dropout::new(spec.dropout as f32),
            spec,
            varmap,
        })
    }

    /// `[batch, input_dim]` -> `[batch, num_classes]`
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.dropout.forward(x, train)?;
        let x = self.dense.forward(&x, false, train)?;
        let x = self.spec.activation.apply(&x)?;
        let x = self.dropout.forward(&x, train)?;
        Ok(self.out_proj.forward(&x, self.spec.spectral_norm, train)?)
    }

    pub fn num_classes(&self) -> usize {
        self.spec.num_classes
    }
    pub fn inner_dim(&self) -> usize {
        self.spec.inner_dim
    }
    pub fn spec(&self) -> &HeadSpec {
        &self.spec
    }
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }
}

//! Branch encoders initialised from pretrained RoBERTa checkpoints.
use super::freeze::FreezePolicy;
use super::weights::transfer_roberta_weights;
use super::Branch;
use crate::config::DtiConfig;
use crate::error::{DtiError, Result};
use crate::roberta::{EncoderOutput, RobertaEncoder, RobertaEncoderConfig};
use candle_core::{DType, Device, IndexOp, Tensor, Var, D};
use candle_nn::{VarBuilder, VarMap};
use std::collections::HashMap;

/// One branch of the dual encoder. Owns its parameters.
pub struct PretrainedEncoder {
    branch: Branch,
    encoder: RobertaEncoder,
    varmap: VarMap,
    freeze: FreezePolicy,
}

impl PretrainedEncoder {
    /// A randomly initialised encoder; no checkpoint is read.
    pub fn new(
        branch: Branch,
        cfg: &DtiConfig,
        vocab_size: usize,
        padding_idx: u32,
        device: &Device,
    ) -> Result<Self> {
        let max_positions = match branch {
            Branch::Molecule => cfg.max_positions_molecule,
            Branch::Protein => cfg.max_positions_protein,
        };
        let encoder_cfg = RobertaEncoderConfig::from_dti(cfg, vocab_size, padding_idx, max_positions);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let encoder = RobertaEncoder::load(vb, &encoder_cfg)?;
        let freeze = if cfg.freeze_lower_layers {
            FreezePolicy::for_encoder(encoder.num_layers())
        } else {
            FreezePolicy::none()
        };
        tracing::debug!(
            "{branch} encoder: {} layers, frozen layers {:?}",
            encoder.num_layers(),
            freeze.frozen_layers
        );
        Ok(Self {
            branch,
            encoder,
            varmap,
            freeze,
        })
    }

    /// Builds the branch encoder and loads its pretrained checkpoint, unless
    /// the config asks to initialise only the other branch.
    pub fn from_config(
        branch: Branch,
        cfg: &DtiConfig,
        vocab_size: usize,
        padding_idx: u32,
        device: &Device,
    ) -> Result<Self> {
        let mut encoder = Self::new(branch, cfg, vocab_size, padding_idx, device)?;
        let (skip, checkpoint) = match branch {
            Branch::Molecule => (
                cfg.init_protein_encoder_only,
                cfg.pretrained_molecule_checkpoint.as_ref(),
            ),
            Branch::Protein => (
                cfg.init_molecule_encoder_only,
                cfg.pretrained_protein_checkpoint.as_ref(),
            ),
        };
        if skip {
            tracing::info!("{branch} encoder left randomly initialised");
            return Ok(encoder);
        }
        let Some(path) = checkpoint else {
            return Err(DtiError::Config(format!(
                "a pretrained {branch} checkpoint must be specified to load the {branch} encoder"
            )));
        };
        let transfer = transfer_roberta_weights(encoder.state_dict()?, path, device)?;
        encoder.load_state_dict(&transfer.state_dict)?;
        Ok(encoder)
    }

    /// Current parameter values keyed by name.
    pub fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let data = self.lock_vars()?;
        Ok(data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect())
    }

    /// Sets every named parameter that exists in this encoder. Shapes must match.
    pub fn load_state_dict(&mut self, state_dict: &HashMap<String, Tensor>) -> Result<()> {
        let data = self.lock_vars()?;
        for (name, tensor) in state_dict {
            if let Some(var) = data.get(name) {
                var.set(&tensor.to_device(var.device())?.to_dtype(var.dtype())?)?;
            }
        }
        Ok(())
    }

    fn lock_vars(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Var>>> {
        self.varmap
            .data()
            .lock()
            .map_err(|e| DtiError::Input(format!("parameter store poisoned: {e}")))
    }

    /// Parameters an optimizer may update.
    pub fn trainable_vars(&self) -> Result<Vec<Var>> {
        let data = self.lock_vars()?;
        let mut names: Vec<&String> = data
            .keys()
            .filter(|name| !self.freeze.is_frozen(name))
            .collect();
        names.sort();
        Ok(names.into_iter().map(|name| data[name].clone()).collect())
    }

    pub fn frozen_parameter_names(&self) -> Result<Vec<String>> {
        let data = self.lock_vars()?;
        let mut names: Vec<String> = data
            .keys()
            .filter(|name| self.freeze.is_frozen(name))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    /// Rejects token batches the encoder cannot pool: empty sequences, rows made
    /// only of padding, and sequences longer than the position table.
    pub fn check_tokens(&self, tokens: &Tensor) -> Result<()> {
        let len = tokens.dim(D::Minus1)?;
        if len == 0 {
            return Err(DtiError::Input(format!("{} tokens are empty", self.branch)));
        }
        let max = self.max_positions();
        if len > max {
            return Err(DtiError::SequenceTooLong {
                branch: self.branch,
                len,
                max,
            });
        }
        // a row without any real token has every attention key masked
        let padding_idx = self.encoder.config().padding_idx;
        let min_tokens = tokens
            .ne(padding_idx)?
            .to_dtype(DType::U32)?
            .sum_keepdim(D::Minus1)?
            .flatten_all()?
            .min(0)?
            .to_scalar::<u32>()?;
        if min_tokens == 0 {
            return Err(DtiError::Input(format!(
                "{} tokens contain a row made only of padding",
                self.branch
            )));
        }
        Ok(())
    }

    pub fn forward(
        &self,
        tokens: &Tensor,
        features_only: bool,
        return_all_hiddens: bool,
        train: bool,
    ) -> Result<EncoderOutput> {
        self.check_tokens(tokens)?;
        Ok(self
            .encoder
            .forward(tokens, features_only, return_all_hiddens, train)?)
    }

    /// First-position ("CLS") output, `[batch, embed_dim]`.
    pub fn pooled(&self, tokens: &Tensor, train: bool) -> Result<Tensor> {
        let output = self.forward(tokens, true, false, train)?;
        Ok(output.features.i((.., 0, ..))?.contiguous()?)
    }

    pub fn branch(&self) -> Branch {
        self.branch
    }
    pub fn max_positions(&self) -> usize {
        self.encoder.max_positions()
    }
    pub fn embed_dim(&self) -> usize {
        self.encoder.config().embed_dim
    }
    pub fn num_layers(&self) -> usize {
        self.encoder.num_layers()
    }
    pub fn freeze_policy(&self) -> &FreezePolicy {
        &self.freeze
    }
    pub fn device(&self) -> &Device {
        self.encoder.device()
    }
}

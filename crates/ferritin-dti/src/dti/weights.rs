//! Transfer of pretrained RoBERTa weights into a branch encoder.
//!
//! The load is partial: only target keys that also appear in the
//! checkpoint are overwritten, everything else keeps its initial value.
use crate::error::{DtiError, Result};
use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::path::Path;

/// Checkpoint keys carry the encoder module name; target keys do not.
pub const CHECKPOINT_ENCODER_PREFIX: &str = "encoder.";

/// Older RoBERTa checkpoints name the embedding layer norm `layernorm_embedding`.
const LEGACY_RENAMES: [(&str, &str); 2] = [
    (
        "encoder.sentence_encoder.layernorm_embedding.weight",
        "encoder.sentence_encoder.emb_layer_norm.weight",
    ),
    (
        "encoder.sentence_encoder.layernorm_embedding.bias",
        "encoder.sentence_encoder.emb_layer_norm.bias",
    ),
];

#[derive(Debug)]
pub struct WeightTransfer {
    pub state_dict: HashMap<String, Tensor>,
    /// Number of target entries overwritten from the checkpoint.
    pub loaded: usize,
}

pub fn load_checkpoint(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    if !path.exists() {
        return Err(DtiError::CheckpointNotFound(path.to_path_buf()));
    }
    Ok(candle_core::safetensors::load(path, device)?)
}

pub fn rename_legacy_keys(checkpoint: &mut HashMap<String, Tensor>) {
    for (old, new) in LEGACY_RENAMES {
        if let Some(tensor) = checkpoint.remove(old) {
            checkpoint.insert(new.to_string(), tensor);
        }
    }
}

/// Overwrites every entry of `state_dict` whose name matches a checkpoint key
/// once the checkpoint's `encoder.` prefix is stripped.
pub fn transfer_weights(
    mut state_dict: HashMap<String, Tensor>,
    mut checkpoint: HashMap<String, Tensor>,
) -> WeightTransfer {
    rename_legacy_keys(&mut checkpoint);
    let mut loaded = 0;
    for (key, tensor) in checkpoint {
        let Some(subkey) = key.strip_prefix(CHECKPOINT_ENCODER_PREFIX) else {
            continue;
        };
        if let Some(slot) = state_dict.get_mut(subkey) {
            *slot = tensor;
            loaded += 1;
        }
    }
    WeightTransfer { state_dict, loaded }
}

/// Reads the checkpoint at `path` and transfers its encoder weights into `state_dict`.
pub fn transfer_roberta_weights(
    state_dict: HashMap<String, Tensor>,
    path: &Path,
    device: &Device,
) -> Result<WeightTransfer> {
    let checkpoint = load_checkpoint(path, device)?;
    let transfer = transfer_weights(state_dict, checkpoint);
    tracing::info!(
        "load {} values from pretrained model {}",
        transfer.loaded,
        path.display()
    );
    Ok(transfer)
}

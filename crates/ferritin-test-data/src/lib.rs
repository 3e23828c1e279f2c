//! ferritin-test-data
//!
//! A module to provide test files embedded in the crate for use in testing.
//!
//! Dictionaries are shipped as raw text and represented as `TestFile`
//! objects which create temporary files for programs to operate on.
//! Pretrained-encoder checkpoints are too large to ship, so `RobertaCheckpoint`
//! synthesizes a fairseq-named safetensors file of the requested shape.
use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::fs;
use tempfile::{Builder, NamedTempFile};

#[derive(Debug)]
/// Test File
///
/// Example usage:
///
/// ```ignore
/// // returns (filepath, _tempfile_handle).
/// // _handle ensures the tempfile remains in scope
/// use ferritin_test_data::TestFile;
/// let (dict_file, _temp) = TestFile::molecule_dict().create_temp().unwrap();
/// ```
pub struct TestFile {
    filebinary: &'static [u8],
    suffix: &'static str,
}

impl TestFile {
    /// SMILES token counts, one `symbol count` pair per line.
    pub fn molecule_dict() -> Self {
        Self {
            filebinary: include_bytes!("../data/dict/molecule.txt"),
            suffix: "txt",
        }
    }
    /// Amino-acid token counts.
    pub fn protein_dict() -> Self {
        Self {
            filebinary: include_bytes!("../data/dict/protein.txt"),
            suffix: "txt",
        }
    }

    pub fn as_str(&self) -> &'static str {
        std::str::from_utf8(self.filebinary).unwrap_or_default()
    }

    pub fn create_temp(&self) -> std::io::Result<(String, NamedTempFile)> {
        let temp = Builder::new()
            .suffix(&format!(".{}", self.suffix))
            .tempfile()?;

        fs::write(&temp, self.filebinary)?;
        let path = temp.path().to_string_lossy().into_owned();

        Ok((path, temp))
    }
}

/// A constant-valued RoBERTa checkpoint with fairseq parameter names.
///
/// Every tensor is filled with `fill`, so a test can tell transferred
/// weights apart from randomly initialised ones.
///
/// ```ignore
/// use ferritin_test_data::RobertaCheckpoint;
/// let ckpt = RobertaCheckpoint::tiny(35);
/// let (path, _handle) = ckpt.create_temp()?;
/// ```
#[derive(Debug, Clone)]
pub struct RobertaCheckpoint {
    pub vocab_size: usize,
    pub padding_idx: usize,
    pub max_positions: usize,
    pub num_layers: usize,
    pub embed_dim: usize,
    pub ffn_embed_dim: usize,
    /// Name the embedding layer norm `layernorm_embedding` as older checkpoints do.
    pub legacy_layer_norm: bool,
    /// Add tensors that no encoder parameter corresponds to.
    pub extra_keys: bool,
    pub fill: f32,
}

impl RobertaCheckpoint {
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            padding_idx: 1,
            max_positions: 64,
            num_layers: 2,
            embed_dim: 16,
            ffn_embed_dim: 32,
            legacy_layer_norm: false,
            extra_keys: false,
            fill: 0.5,
        }
    }

    pub fn tensors(&self, device: &Device) -> candle_core::Result<HashMap<String, Tensor>> {
        let d = self.embed_dim;
        let mut shapes: Vec<(String, Vec<usize>)> = Vec::new();
        let mut push = |name: String, shape: &[usize]| shapes.push((name, shape.to_vec()));

        let se = "encoder.sentence_encoder";
        push(format!("{se}.embed_tokens.weight"), &[self.vocab_size, d]);
        push(
            format!("{se}.embed_positions.weight"),
            &[self.max_positions + self.padding_idx + 1, d],
        );
        let emb_ln = if self.legacy_layer_norm {
            "layernorm_embedding"
        } else {
            "emb_layer_norm"
        };
        push(format!("{se}.{emb_ln}.weight"), &[d]);
        push(format!("{se}.{emb_ln}.bias"), &[d]);
        for i in 0..self.num_layers {
            let layer = format!("{se}.layers.{i}");
            for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
                push(format!("{layer}.self_attn.{proj}.weight"), &[d, d]);
                push(format!("{layer}.self_attn.{proj}.bias"), &[d]);
            }
            for ln in ["self_attn_layer_norm", "final_layer_norm"] {
                push(format!("{layer}.{ln}.weight"), &[d]);
                push(format!("{layer}.{ln}.bias"), &[d]);
            }
            push(format!("{layer}.fc1.weight"), &[self.ffn_embed_dim, d]);
            push(format!("{layer}.fc1.bias"), &[self.ffn_embed_dim]);
            push(format!("{layer}.fc2.weight"), &[d, self.ffn_embed_dim]);
            push(format!("{layer}.fc2.bias"), &[d]);
        }
        push("encoder.lm_head.dense.weight".to_string(), &[d, d]);
        push("encoder.lm_head.dense.bias".to_string(), &[d]);
        push("encoder.lm_head.layer_norm.weight".to_string(), &[d]);
        push("encoder.lm_head.layer_norm.bias".to_string(), &[d]);
        push("encoder.lm_head.bias".to_string(), &[self.vocab_size]);
        if self.extra_keys {
            push("classification_heads.old.dense.weight".to_string(), &[d, d]);
            push(format!("{se}.unused.weight"), &[d]);
        }

        shapes
            .into_iter()
            .map(|(name, shape)| {
                let t = Tensor::full(self.fill, shape, device)?.contiguous()?;
                Ok::<_, candle_core::Error>((name, t))
            })
            .collect()
    }

    pub fn create_temp(&self) -> candle_core::Result<(String, NamedTempFile)> {
        let temp = Builder::new().suffix(".safetensors").tempfile()?;
        let tensors = self.tensors(&Device::Cpu)?;
        candle_core::safetensors::save(&tensors, temp.path())?;
        let path = temp.path().to_string_lossy().into_owned();
        Ok((path, temp))
    }
}

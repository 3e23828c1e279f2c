//! Which encoder parameters stay fixed while fine-tuning.
use std::ops::Range;

/// Number of leading transformer layers kept fixed.
pub const FROZEN_LAYER_COUNT: usize = 12;

/// Parameter groups that make up the embedding block of a sentence encoder.
const EMBEDDING_BLOCK: [&str; 3] = [
    "sentence_encoder.embed_tokens.",
    "sentence_encoder.embed_positions.",
    "sentence_encoder.emb_layer_norm.",
];

/// Frozen parameter ranges of one encoder.
///
/// Built once from the encoder's layer count; the embedding block and the
/// first [`FROZEN_LAYER_COUNT`] transformer layers are frozen, the remaining
/// layers and the LM head stay trainable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezePolicy {
    pub embedding_block: bool,
    pub frozen_layers: Range<usize>,
}

impl FreezePolicy {
    pub fn for_encoder(num_layers: usize) -> Self {
        Self {
            embedding_block: true,
            frozen_layers: 0..num_layers.min(FROZEN_LAYER_COUNT),
        }
    }

    pub fn none() -> Self {
        Self {
            embedding_block: false,
            frozen_layers: 0..0,
        }
    }

    /// Name prefixes of every frozen parameter.
    pub fn frozen_prefixes(&self) -> Vec<String> {
        let embeddings = self
            .embedding_block
            .then_some(EMBEDDING_BLOCK.iter().map(|p| p.to_string()))
            .into_iter()
            .flatten();
        let layers = self
            .frozen_layers
            .clone()
            .map(|i| format!("sentence_encoder.layers.{i}."));
        embeddings.chain(layers).collect()
    }

    pub fn is_frozen(&self, name: &str) -> bool {
        self.frozen_prefixes()
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }
}

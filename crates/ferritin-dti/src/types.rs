//! Types for Standardizing Outputs of the hub interface

use serde::{Deserialize, Serialize};

// One candidate for a masked position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilledMask {
    /// Input text with the mask replaced by `token`.
    pub sequence: String,
    pub score: f32,
    pub token: String,
}

// Most likely class of one drug-target pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassScore {
    pub class: usize,
    pub log_prob: f32,
}

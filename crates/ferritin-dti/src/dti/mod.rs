//! Drug-target interaction model built from two pretrained RoBERTa encoders.
pub mod freeze;
pub mod fusion;
pub mod head;
pub mod model;
pub mod pretrained;
pub mod weights;

pub use freeze::FreezePolicy;
pub use fusion::{FusionParams, KnnEmbeddings, KnnMode};
pub use head::{ClassificationHead, HeadSpec};
pub use model::{DtiInput, DtiModel, DtiOutput, ForwardArgs};
pub use pretrained::PretrainedEncoder;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// The two input sides of the model.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Branch {
    Molecule,
    Protein,
}

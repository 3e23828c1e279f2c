//! Text-level inference on top of [`crate::dti::DtiModel`].
pub mod dictionary;
pub mod interface;

pub use dictionary::Dictionary;
pub use interface::DtiHubInterface;

//! Named model architectures.
//!
//! An architecture fixes the encoder shape on top of a user supplied
//! [`DtiConfig`]. The registry is an ordinary value: build it once with
//! [`ArchitectureRegistry::with_defaults`] and register extra shapes as needed.
use crate::config::DtiConfig;
use crate::dti::DtiModel;
use crate::error::{DtiError, Result};
use crate::hub::Dictionary;
use candle_core::Device;
use std::collections::BTreeMap;

pub const DTI_KNN_ROBERTA: &str = "dti_knn_roberta";
pub const DTI_KNN_ROBERTA_LARGE: &str = "dti_knn_roberta_large";

type ArchitectureFn = Box<dyn Fn(DtiConfig) -> DtiConfig + Send + Sync>;

/// RoBERTa-base shape: the config is used as given.
pub fn dti_knn_roberta(config: DtiConfig) -> DtiConfig {
    config
}

/// RoBERTa-large shape: 24 layers of width 1024.
pub fn dti_knn_roberta_large(config: DtiConfig) -> DtiConfig {
    let large = DtiConfig::roberta_large();
    DtiConfig {
        encoder_layers: large.encoder_layers,
        encoder_embed_dim: large.encoder_embed_dim,
        encoder_ffn_embed_dim: large.encoder_ffn_embed_dim,
        encoder_attention_heads: large.encoder_attention_heads,
        ..config
    }
}

#[derive(Default)]
pub struct ArchitectureRegistry {
    architectures: BTreeMap<String, ArchitectureFn>,
}

impl ArchitectureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(DTI_KNN_ROBERTA, dti_knn_roberta);
        registry.register(DTI_KNN_ROBERTA_LARGE, dti_knn_roberta_large);
        registry
    }

    /// Adds or replaces an architecture.
    pub fn register<F>(&mut self, name: &str, architecture: F)
    where
        F: Fn(DtiConfig) -> DtiConfig + Send + Sync + 'static,
    {
        self.architectures
            .insert(name.to_string(), Box::new(architecture));
    }

    pub fn names(&self) -> Vec<&str> {
        self.architectures.keys().map(|k| k.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.architectures.contains_key(name)
    }

    /// The config with the named architecture applied.
    pub fn resolve(&self, name: &str, config: &DtiConfig) -> Result<DtiConfig> {
        let architecture = self
            .architectures
            .get(name)
            .ok_or_else(|| DtiError::UnknownArchitecture(name.to_string()))?;
        let resolved = architecture(config.clone());
        resolved.validate()?;
        Ok(resolved)
    }

    pub fn build_model(
        &self,
        name: &str,
        config: &DtiConfig,
        molecule_dict: &Dictionary,
        protein_dict: &Dictionary,
        device: &Device,
    ) -> Result<DtiModel> {
        let config = self.resolve(name, config)?;
        tracing::info!("building architecture {name}");
        DtiModel::build(&config, molecule_dict, protein_dict, device)
    }
}

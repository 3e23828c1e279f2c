//! The dual-encoder drug-target interaction model.
//!
//! A molecule encoder and a protein encoder, each initialised from its own
//! pretrained RoBERTa, feed their first-position embeddings (optionally
//! blended with retrieved kNN neighbour embeddings) into a named
//! classification head.
use super::fusion::{grad_multiply, knn_blend, FusionParams, KnnEmbeddings, KnnMode};
use super::head::{ClassificationHead, HeadSpec};
use super::pretrained::PretrainedEncoder;
use super::Branch;
use crate::config::DtiConfig;
use crate::error::{DtiError, Result};
use crate::hub::Dictionary;
use candle_core::{Device, Tensor, Var, D};
use std::collections::HashMap;

/// What the model runs on.
#[derive(Debug, Clone)]
pub enum DtiInput {
    /// Run the molecule encoder alone and return its pooled embedding.
    MoleculeOnly { molecule: Tensor },
    /// Token ids, `[batch, seq_len]` per branch. Every row needs at least one
    /// non-padding token.
    Tokens { molecule: Tensor, protein: Tensor },
    /// Precomputed pooled embeddings, `[batch, embed_dim]` per branch.
    /// Both encoders are skipped.
    Pooled { molecule: Tensor, protein: Tensor },
}

#[derive(Debug, Clone)]
pub struct ForwardArgs<'a> {
    pub input: DtiInput,
    pub knn: KnnEmbeddings,
    pub fusion: FusionParams,
    pub head: Option<&'a str>,
    pub train: bool,
}

impl<'a> ForwardArgs<'a> {
    pub fn new(input: DtiInput) -> Self {
        Self {
            input,
            knn: KnnEmbeddings::default(),
            fusion: FusionParams::default(),
            head: None,
            train: false,
        }
    }
    pub fn tokens(molecule: Tensor, protein: Tensor) -> Self {
        Self::new(DtiInput::Tokens { molecule, protein })
    }
    pub fn pooled(molecule: Tensor, protein: Tensor) -> Self {
        Self::new(DtiInput::Pooled { molecule, protein })
    }
    pub fn molecule_only(molecule: Tensor) -> Self {
        Self::new(DtiInput::MoleculeOnly { molecule })
    }
    pub fn with_head(mut self, head: &'a str) -> Self {
        self.head = Some(head);
        self
    }
    pub fn with_knn(mut self, knn: KnnEmbeddings) -> Self {
        self.knn = knn;
        self
    }
    pub fn with_fusion(mut self, fusion: FusionParams) -> Self {
        self.fusion = fusion;
        self
    }
    pub fn with_train(mut self, train: bool) -> Self {
        self.train = train;
        self
    }
}

#[derive(Debug)]
pub struct DtiOutput {
    /// `[batch, num_classes]`, present when a head was requested.
    pub logits: Option<Tensor>,
    /// Molecule-side embedding: the raw pooled output for token input, the
    /// kNN-blended value for pooled input.
    pub molecule: Tensor,
    /// Protein-side counterpart; absent in molecule-only mode.
    pub protein: Option<Tensor>,
}

pub struct DtiModel {
    config: DtiConfig,
    encoder_0: PretrainedEncoder,
    encoder_1: PretrainedEncoder,
    classification_heads: HashMap<String, ClassificationHead>,
    device: Device,
}

impl DtiModel {
    pub fn new(
        config: DtiConfig,
        encoder_0: PretrainedEncoder,
        encoder_1: PretrainedEncoder,
    ) -> Result<Self> {
        if encoder_0.branch() != Branch::Molecule || encoder_1.branch() != Branch::Protein {
            return Err(DtiError::Config(
                "expected a molecule encoder followed by a protein encoder".to_string(),
            ));
        }
        if encoder_0.embed_dim() != config.encoder_embed_dim
            || encoder_1.embed_dim() != config.encoder_embed_dim
        {
            return Err(DtiError::Config(format!(
                "encoder widths {} / {} do not match encoder_embed_dim {}",
                encoder_0.embed_dim(),
                encoder_1.embed_dim(),
                config.encoder_embed_dim
            )));
        }
        let device = encoder_0.device().clone();
        Ok(Self {
            config,
            encoder_0,
            encoder_1,
            classification_heads: HashMap::new(),
            device,
        })
    }

    /// Builds both branch encoders, loading their pretrained checkpoints.
    pub fn build(
        config: &DtiConfig,
        molecule_dict: &Dictionary,
        protein_dict: &Dictionary,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let encoder_0 = PretrainedEncoder::from_config(
            Branch::Molecule,
            config,
            molecule_dict.len(),
            molecule_dict.pad(),
            device,
        )?;
        let encoder_1 = PretrainedEncoder::from_config(
            Branch::Protein,
            config,
            protein_dict.len(),
            protein_dict.pad(),
            device,
        )?;
        tracing::info!(
            "built DTI model: {} layers, embed dim {}, max positions {}/{}",
            config.encoder_layers,
            config.encoder_embed_dim,
            config.max_positions_molecule,
            config.max_positions_protein
        );
        Self::new(config.clone(), encoder_0, encoder_1)
    }

    /// Registers a head with the model's pooler settings, replacing any head
    /// of the same name.
    pub fn register_classification_head(
        &mut self,
        name: &str,
        num_classes: usize,
        inner_dim: Option<usize>,
    ) -> Result<()> {
        let spec = HeadSpec::from_config(&self.config, num_classes, inner_dim);
        self.register_head(name, spec)
    }

    pub fn register_head(&mut self, name: &str, spec: HeadSpec) -> Result<()> {
        if spec.input_dim != self.config.head_input_dim() {
            return Err(DtiError::Config(format!(
                "head '{name}' expects input width {}, the model provides {}",
                spec.input_dim,
                self.config.head_input_dim()
            )));
        }
        if let Some(prev) = self.classification_heads.get(name) {
            if prev.num_classes() != spec.num_classes || prev.inner_dim() != spec.inner_dim {
                tracing::warn!(
                    "re-registering head \"{}\" with num_classes {} (prev: {}) and inner_dim {} (prev: {})",
                    name,
                    spec.num_classes,
                    prev.num_classes(),
                    spec.inner_dim,
                    prev.inner_dim()
                );
            }
        }
        let head = ClassificationHead::new(spec, &self.device)?;
        self.classification_heads.insert(name.to_string(), head);
        Ok(())
    }

    pub fn classification_head(&self, name: &str) -> Result<&ClassificationHead> {
        self.classification_heads
            .get(name)
            .ok_or_else(|| DtiError::HeadNotFound(name.to_string()))
    }

    pub fn forward(&self, args: ForwardArgs) -> Result<DtiOutput> {
        let ForwardArgs {
            input,
            knn,
            fusion,
            head,
            train,
        } = args;
        match input {
            DtiInput::MoleculeOnly { molecule } => {
                let molecule = self.encoder_0.pooled(&molecule, train)?;
                Ok(DtiOutput {
                    logits: None,
                    molecule,
                    protein: None,
                })
            }
            DtiInput::Tokens { molecule, protein } => {
                let head = head.map(|name| self.classification_head(name)).transpose()?;
                self.encoder_0.check_tokens(&molecule)?;
                self.encoder_1.check_tokens(&protein)?;
                let x_0 = self.encoder_0.pooled(&molecule, train)?;
                let x_1 = self.encoder_1.pooled(&protein, train)?;
                tracing::debug!("pooled molecule {:?}, protein {:?}", x_0.dims(), x_1.dims());
                let logits = match head {
                    Some(head) => {
                        let x = match fusion.mode {
                            KnnMode::MolPro => self.blend_pair(&x_0, &x_1, &knn, &fusion)?,
                            // single-branch modes do not touch the head input
                            KnnMode::No | KnnMode::Mol | KnnMode::Pro => {
                                Tensor::cat(&[&x_0, &x_1], 1)?
                            }
                        };
                        Some(self.classify(&x, head, train)?)
                    }
                    None => None,
                };
                Ok(DtiOutput {
                    logits,
                    molecule: x_0,
                    protein: Some(x_1),
                })
            }
            DtiInput::Pooled { molecule, protein } => {
                let head = head.map(|name| self.classification_head(name)).transpose()?;
                let cls_0 = self.check_pooled(&molecule)?;
                let cls_1 = self.check_pooled(&protein)?;
                let fused_0 =
                    knn_blend(&cls_0, knn.molecule.as_ref(), fusion.molecule_weight, fusion.alpha)?;
                let fused_1 =
                    knn_blend(&cls_1, knn.protein.as_ref(), fusion.protein_weight, fusion.alpha)?;
                let logits = match head {
                    Some(head) => {
                        let x = match fusion.mode {
                            KnnMode::MolPro => Tensor::cat(&[&fused_0, &fused_1], 1)?,
                            // the protein embedding fills both halves of the head input here
                            KnnMode::No | KnnMode::Mol | KnnMode::Pro => {
                                Tensor::cat(&[&cls_1, &cls_1], 1)?
                            }
                        };
                        Some(self.classify(&x, head, train)?)
                    }
                    None => None,
                };
                Ok(DtiOutput {
                    logits,
                    molecule: fused_0,
                    protein: Some(fused_1),
                })
            }
        }
    }

    fn blend_pair(
        &self,
        x_0: &Tensor,
        x_1: &Tensor,
        knn: &KnnEmbeddings,
        fusion: &FusionParams,
    ) -> Result<Tensor> {
        let fused_0 = knn_blend(x_0, knn.molecule.as_ref(), fusion.molecule_weight, fusion.alpha)?;
        let fused_1 = knn_blend(x_1, knn.protein.as_ref(), fusion.protein_weight, fusion.alpha)?;
        Ok(Tensor::cat(&[&fused_0, &fused_1], 1)?)
    }

    fn classify(&self, x: &Tensor, head: &ClassificationHead, train: bool) -> Result<Tensor> {
        let x = grad_multiply(x, self.config.grad_multiply)?;
        head.forward(&x, train)
    }

    fn check_pooled(&self, x: &Tensor) -> Result<Tensor> {
        let width = x.dim(D::Minus1)?;
        if x.rank() != 2 || width != self.config.encoder_embed_dim {
            return Err(DtiError::Input(format!(
                "pooled embeddings must be [batch, {}], got {:?}",
                self.config.encoder_embed_dim,
                x.dims()
            )));
        }
        Ok(x.to_device(&self.device)?)
    }

    /// Parameters an optimizer may update: unfrozen encoder weights and all heads.
    pub fn trainable_vars(&self) -> Result<Vec<Var>> {
        let mut vars = self.encoder_0.trainable_vars()?;
        vars.extend(self.encoder_1.trainable_vars()?);
        let mut names: Vec<&String> = self.classification_heads.keys().collect();
        names.sort();
        for name in names {
            vars.extend(self.classification_heads[name].trainable_vars());
        }
        Ok(vars)
    }

    pub fn encoder(&self, branch: Branch) -> &PretrainedEncoder {
        match branch {
            Branch::Molecule => &self.encoder_0,
            Branch::Protein => &self.encoder_1,
        }
    }
    pub fn head_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.classification_heads.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
    pub fn config(&self) -> &DtiConfig {
        &self.config
    }
    pub fn device(&self) -> &Device {
        &self.device
    }
}

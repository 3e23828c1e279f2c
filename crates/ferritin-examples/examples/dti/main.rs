use anyhow::Result;
use clap::Parser;
use ferritin_dti::registry::DTI_KNN_ROBERTA;
use ferritin_dti::{
    device, ArchitectureRegistry, Branch, Dictionary, DtiConfig, DtiHubInterface, DtiModel,
    FusionParams, KnnEmbeddings, KnnMode, PretrainedEncoder,
};
use ferritin_test_data::TestFile;
use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

const HEAD_NAME: &str = "sentence_classification_head";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Model architecture name.
    #[arg(long, default_value = DTI_KNN_ROBERTA)]
    arch: String,

    /// JSON file with model hyperparameters. A small demo shape is used otherwise.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    molecule_dict: Option<PathBuf>,

    #[arg(long)]
    protein_dict: Option<PathBuf>,

    /// Pretrained molecule RoBERTa (safetensors).
    #[arg(long)]
    molecule_checkpoint: Option<PathBuf>,

    /// Pretrained protein RoBERTa (safetensors).
    #[arg(long)]
    protein_checkpoint: Option<PathBuf>,

    /// Space separated SMILES tokens.
    #[arg(long, default_value = "C C ( = O ) O c 1 c c c c c 1 C ( = O ) O")]
    molecule: String,

    /// Space separated residues.
    #[arg(long, default_value = "M K T A Y I A K Q R Q I S F V K S H F S R Q")]
    protein: String,

    /// Which neighbour embeddings to blend in: no, mol, pro or mol_pro.
    #[arg(long, default_value = "no")]
    knn_mode: String,

    #[arg(long, default_value = "2")]
    num_classes: usize,
}

impl Args {
    fn dictionary(path: &Option<PathBuf>, fallback: TestFile) -> Result<Dictionary> {
        Ok(match path {
            Some(path) => Dictionary::load(path)?,
            None => Dictionary::parse(fallback.as_str())?,
        })
    }

    fn base_config(&self) -> Result<DtiConfig> {
        let mut config = match &self.config {
            Some(path) => DtiConfig::from_json_file(path)?,
            None => DtiConfig {
                encoder_layers: 2,
                encoder_embed_dim: 64,
                encoder_ffn_embed_dim: 128,
                encoder_attention_heads: 4,
                ..DtiConfig::default()
            },
        };
        if self.molecule_checkpoint.is_some() {
            config.pretrained_molecule_checkpoint = self.molecule_checkpoint.clone();
        }
        if self.protein_checkpoint.is_some() {
            config.pretrained_protein_checkpoint = self.protein_checkpoint.clone();
        }
        Ok(config)
    }

    fn build_hub(&self) -> Result<DtiHubInterface> {
        let device = device(self.cpu)?;
        let molecule_dict = Self::dictionary(&self.molecule_dict, TestFile::molecule_dict())?;
        let protein_dict = Self::dictionary(&self.protein_dict, TestFile::protein_dict())?;
        let registry = ArchitectureRegistry::with_defaults();
        let config = self.base_config()?;

        let model = if config.pretrained_molecule_checkpoint.is_none()
            && config.pretrained_protein_checkpoint.is_none()
        {
            tracing::info!("no checkpoints given, both encoders are randomly initialised");
            let config = registry.resolve(&self.arch, &config)?;
            let encoder_0 = PretrainedEncoder::new(
                Branch::Molecule,
                &config,
                molecule_dict.len(),
                molecule_dict.pad(),
                &device,
            )?;
            let encoder_1 = PretrainedEncoder::new(
                Branch::Protein,
                &config,
                protein_dict.len(),
                protein_dict.pad(),
                &device,
            )?;
            DtiModel::new(config, encoder_0, encoder_1)?
        } else {
            registry.build_model(&self.arch, &config, &molecule_dict, &protein_dict, &device)?
        };
        Ok(DtiHubInterface::new(model, molecule_dict, protein_dict))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mode = KnnMode::from_str(&args.knn_mode)?;
    let mut hub = args.build_hub()?;
    hub.register_classification_head(HEAD_NAME, args.num_classes, None)?;

    let (molecule, protein) = hub.encode_pair(&args.molecule, &args.protein)?;
    tracing::info!(
        "molecule: {:?}",
        hub.decode(Branch::Molecule, &molecule)?
    );

    // the pair is its own nearest neighbour in this demo
    let knn = match mode {
        KnnMode::No => KnnEmbeddings::default(),
        _ => {
            let pooled = hub.extract_features(
                &molecule,
                &protein,
                KnnEmbeddings::default(),
                FusionParams::default(),
            )?;
            KnnEmbeddings {
                molecule: Some(pooled.molecule),
                protein: pooled.protein,
            }
        }
    };

    let scores = hub.classify(
        HEAD_NAME,
        &molecule,
        &protein,
        knn,
        FusionParams::with_mode(mode),
    )?;
    println!("{}", serde_json::to_string_pretty(&scores)?);

    let masked = args.molecule.replacen('C', "<mask>", 1);
    let filled = hub.fill_mask(Branch::Molecule, &masked, 3)?;
    println!("{}", serde_json::to_string_pretty(&filled)?);
    Ok(())
}

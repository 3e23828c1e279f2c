#![allow(dead_code)]
use anyhow::Result;
use candle_core::{Device, Tensor};
use ferritin_dti::{Branch, Dictionary, DtiConfig, DtiModel, PretrainedEncoder};
use ferritin_test_data::TestFile;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

pub const HEAD: &str = "sentence_classification_head";
pub const EMBED_DIM: usize = 16;
pub const MAX_POSITIONS: usize = 64;

/// Two layers of width 16; matches `RobertaCheckpoint::tiny`.
pub fn tiny_config() -> DtiConfig {
    DtiConfig {
        encoder_layers: 2,
        encoder_embed_dim: EMBED_DIM,
        encoder_ffn_embed_dim: 32,
        encoder_attention_heads: 4,
        max_positions_molecule: MAX_POSITIONS,
        max_positions_protein: MAX_POSITIONS,
        ..DtiConfig::default()
    }
}

pub fn dictionaries() -> Result<(Dictionary, Dictionary)> {
    Ok((
        Dictionary::parse(TestFile::molecule_dict().as_str())?,
        Dictionary::parse(TestFile::protein_dict().as_str())?,
    ))
}

pub fn random_model(config: &DtiConfig) -> Result<DtiModel> {
    let (molecule_dict, protein_dict) = dictionaries()?;
    let dev = Device::Cpu;
    let encoder_0 = PretrainedEncoder::new(
        Branch::Molecule,
        config,
        molecule_dict.len(),
        molecule_dict.pad(),
        &dev,
    )?;
    let encoder_1 = PretrainedEncoder::new(
        Branch::Protein,
        config,
        protein_dict.len(),
        protein_dict.pad(),
        &dev,
    )?;
    Ok(DtiModel::new(config.clone(), encoder_0, encoder_1)?)
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?)
}

/// Collects formatted log lines so tests can assert on them.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    pub fn capture<T>(&self, f: impl FnOnce() -> T) -> T {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        tracing::subscriber::with_default(subscriber, f)
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;
    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

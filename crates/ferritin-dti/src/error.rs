//! Error types for building and running the DTI models.
use crate::dti::Branch;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DtiError>;

#[derive(Error, Debug)]
pub enum DtiError {
    /// Invalid or conflicting hyperparameters, caught at build time.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{branch} tokens exceed maximum length: {len} > {max}")]
    SequenceTooLong {
        branch: Branch,
        len: usize,
        max: usize,
    },

    #[error("model file not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("no classification head registered under '{0}'")]
    HeadNotFound(String),

    #[error("unknown architecture '{0}'")]
    UnknownArchitecture(String),

    /// A malformed `dict.txt` line.
    #[error("bad dictionary line {line}: '{content}'")]
    Dictionary { line: usize, content: String },

    #[error("{0}")]
    Input(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

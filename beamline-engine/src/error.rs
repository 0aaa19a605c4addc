//! Error types for decoder construction and batch decoding

use crate::fst::FstError;
use crate::lm::LmError;

/// Errors surfaced at the decoding API edge.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("worker pool start failed")]
    Pool(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Fst(#[from] FstError),

    #[error(transparent)]
    Lm(#[from] LmError),

    #[error("config parse error")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DecodeError>;

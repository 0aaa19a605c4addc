pub mod beam;
pub mod config;
pub mod decoder;
pub mod error;
pub mod fst;
pub mod lm;
pub mod logits;
pub mod scorer;
pub mod tree;

pub use config::DecoderConfig;
pub use decoder::{Decoder, Hotwords, LogitsBatch, OutputBuffers};
pub use error::{DecodeError, Result};
pub use fst::{Fst, FstArc, WordTokenizer};
pub use lm::{ArpaLm, LanguageModel, LmState};

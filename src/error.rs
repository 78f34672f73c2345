//! Error types for the seq2seq forward pass

use thiserror::Error;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Seq2SeqError>;

/// Errors raised while building or running the model
#[derive(Error, Debug)]
pub enum Seq2SeqError {
    /// Alignment score that has no implementation
    #[error("unsupported alignment score method: {0}")]
    UnsupportedScore(String),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tensor shape disagrees with what the component expects
    #[error("shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        got: String,
    },

    /// Source mask inconsistent with its lengths
    #[error("invalid source mask: {0}")]
    InvalidMask(String),

    /// Token id outside the embedding table
    #[error("token id {id} out of range for vocabulary of size {vocab_size}")]
    TokenOutOfRange { id: usize, vocab_size: usize },

    /// Recurrent state used before `reset`
    #[error("{0} state used before reset")]
    StateNotInitialized(&'static str),

    /// Array reshape or concatenation failed
    #[error("array shape error: {0}")]
    Array(#[from] ndarray::ShapeError),

    /// Reading a configuration file failed
    #[error("failed to read config: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// Parsing a configuration file failed
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl Seq2SeqError {
    pub(crate) fn shape(what: &'static str, expected: impl std::fmt::Debug, got: impl std::fmt::Debug) -> Self {
        Seq2SeqError::ShapeMismatch {
            what,
            expected: format!("{:?}", expected),
            got: format!("{:?}", got),
        }
    }

    /// True for errors caused by the model configuration rather than the inputs
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Seq2SeqError::UnsupportedScore(_)
                | Seq2SeqError::InvalidConfig(_)
                | Seq2SeqError::ConfigIo(_)
                | Seq2SeqError::ConfigParse(_)
        )
    }
}

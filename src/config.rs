//! Model hyperparameters and attention variant selection

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, Seq2SeqError};

// Reserved token ids
pub const PAD_IDX: usize = 0;
pub const EOS_IDX: usize = 1;
pub const SOS_IDX: usize = 2;

// Model hyperparameters
pub const EMBED_SIZE: usize = 300;
pub const HIDDEN_SIZE: usize = 1000;
pub const NUM_LAYERS: usize = 2;
pub const DROPOUT_RATE: f32 = 0.5;
pub const WINDOW_SIZE: usize = 5;
pub const SEED: u64 = 1;

/// Which source positions the attention may look at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttentionScope {
    /// Every valid source position
    #[serde(rename = "global")]
    Global,
    /// Window centered on the decoding timestep
    #[serde(rename = "local-m")]
    LocalMonotonic,
    /// Window centered on a position predicted from the decoder state
    #[serde(rename = "local-p")]
    LocalPredictive,
}

impl AttentionScope {
    pub fn is_local(&self) -> bool {
        !matches!(self, AttentionScope::Global)
    }
}

impl fmt::Display for AttentionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttentionScope::Global => "global",
            AttentionScope::LocalMonotonic => "local-m",
            AttentionScope::LocalPredictive => "local-p",
        };
        f.write_str(name)
    }
}

/// Alignment score between the decoder state and encoder states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreMethod {
    Dot,
    General,
    /// Declared for config compatibility; rejected when the attention is built
    Concat,
}

impl fmt::Display for ScoreMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScoreMethod::Dot => "dot",
            ScoreMethod::General => "general",
            ScoreMethod::Concat => "concat",
        };
        f.write_str(name)
    }
}

/// Recurrent cell used by encoder and decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Gru,
    Lstm,
}

/// How the decoder recurrent state is initialised at sequence start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecoderInit {
    Zeros,
    EncoderFinal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    pub scope: AttentionScope,
    pub score: ScoreMethod,
    /// Half-width D of local windows; ignored for global scope
    pub window_size: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            scope: AttentionScope::LocalPredictive,
            score: ScoreMethod::Dot,
            window_size: WINDOW_SIZE,
        }
    }
}

/// Full model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub embed_size: usize,
    /// Total hidden size; each direction gets `hidden_size / num_directions`
    pub hidden_size: usize,
    pub num_layers: usize,
    pub bidirectional: bool,
    /// Dropout between stacked recurrent layers, training mode only
    pub dropout: f32,
    pub cell: CellKind,
    pub input_feeding: bool,
    pub attention: AttentionConfig,
    pub decoder_init: DecoderInit,
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embed_size: EMBED_SIZE,
            hidden_size: HIDDEN_SIZE,
            num_layers: NUM_LAYERS,
            bidirectional: true,
            dropout: DROPOUT_RATE,
            cell: CellKind::Gru,
            input_feeding: true,
            attention: AttentionConfig::default(),
            decoder_init: DecoderInit::Zeros,
            seed: SEED,
        }
    }
}

impl ModelConfig {
    /// Small model handy for demos and tests
    pub fn small() -> Self {
        Self::default()
            .with_embed_size(16)
            .with_hidden_size(32)
            .with_dropout(0.0)
    }

    pub fn with_embed_size(mut self, embed_size: usize) -> Self {
        self.embed_size = embed_size;
        self
    }

    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    pub fn with_layers(mut self, num_layers: usize) -> Self {
        self.num_layers = num_layers;
        self
    }

    pub fn with_bidirectional(mut self, bidirectional: bool) -> Self {
        self.bidirectional = bidirectional;
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_cell(mut self, cell: CellKind) -> Self {
        self.cell = cell;
        self
    }

    pub fn with_input_feeding(mut self, input_feeding: bool) -> Self {
        self.input_feeding = input_feeding;
        self
    }

    pub fn with_scope(mut self, scope: AttentionScope) -> Self {
        self.attention.scope = scope;
        self
    }

    pub fn with_score(mut self, score: ScoreMethod) -> Self {
        self.attention.score = score;
        self
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.attention.window_size = window_size;
        self
    }

    pub fn with_decoder_init(mut self, decoder_init: DecoderInit) -> Self {
        self.decoder_init = decoder_init;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn num_directions(&self) -> usize {
        if self.bidirectional {
            2
        } else {
            1
        }
    }

    /// Hidden size of a single direction
    pub fn direction_size(&self) -> usize {
        self.hidden_size / self.num_directions()
    }

    pub fn validate(&self) -> Result<()> {
        if self.embed_size == 0 || self.hidden_size == 0 || self.num_layers == 0 {
            return Err(Seq2SeqError::InvalidConfig(format!(
                "embed_size, hidden_size and num_layers must be positive (got {}, {}, {})",
                self.embed_size, self.hidden_size, self.num_layers
            )));
        }
        if self.hidden_size % self.num_directions() != 0 {
            return Err(Seq2SeqError::InvalidConfig(format!(
                "hidden_size {} is not divisible by {} directions",
                self.hidden_size,
                self.num_directions()
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Seq2SeqError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.attention.scope.is_local() && self.attention.window_size == 0 {
            return Err(Seq2SeqError::InvalidConfig(format!(
                "{} attention needs a positive window size",
                self.attention.scope
            )));
        }
        if self.attention.score == ScoreMethod::Concat {
            return Err(Seq2SeqError::UnsupportedScore(self.attention.score.to_string()));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_reference_hyperparameters() {
        let config = ModelConfig::default();
        assert_eq!(config.embed_size, 300);
        assert_eq!(config.hidden_size, 1000);
        assert_eq!(config.num_layers, 2);
        assert_eq!(config.direction_size(), 500);
        assert_eq!(config.attention.scope, AttentionScope::LocalPredictive);
        assert_eq!(config.attention.window_size, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_concat_is_rejected() {
        let err = ModelConfig::small()
            .with_score(ScoreMethod::Concat)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Seq2SeqError::UnsupportedScore(_)));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_odd_hidden_size_with_two_directions() {
        let err = ModelConfig::small().with_hidden_size(33).validate().unwrap_err();
        assert!(matches!(err, Seq2SeqError::InvalidConfig(_)));
        assert!(ModelConfig::small()
            .with_hidden_size(33)
            .with_bidirectional(false)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_zero_window_only_matters_for_local_scope() {
        let config = ModelConfig::small().with_window_size(0);
        assert!(config.clone().with_scope(AttentionScope::Global).validate().is_ok());
        assert!(config.with_scope(AttentionScope::LocalMonotonic).validate().is_err());
    }

    #[test]
    fn test_json_partial_config() {
        let json = r#"{
            "hidden_size": 8,
            "embed_size": 4,
            "cell": "lstm",
            "attention": { "scope": "local-m", "score": "general" }
        }"#;
        let config = ModelConfig::from_json_str(json).unwrap();
        assert_eq!(config.hidden_size, 8);
        assert_eq!(config.cell, CellKind::Lstm);
        assert_eq!(config.attention.scope, AttentionScope::LocalMonotonic);
        assert_eq!(config.attention.score, ScoreMethod::General);
        assert_eq!(config.attention.window_size, WINDOW_SIZE);
        assert_eq!(config.num_layers, NUM_LAYERS);
    }

    #[test]
    fn test_json_concat_fails_fast() {
        let json = r#"{ "attention": { "score": "concat" } }"#;
        assert!(matches!(
            ModelConfig::from_json_str(json),
            Err(Seq2SeqError::UnsupportedScore(_))
        ));
    }

    #[test]
    fn test_json_file_round_trip() {
        let path = std::env::temp_dir().join(format!("luong_seq2seq_config_{}.json", std::process::id()));
        let config = ModelConfig::small()
            .with_cell(CellKind::Lstm)
            .with_scope(AttentionScope::Global)
            .with_seed(9);
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
        let loaded = ModelConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded.cell, CellKind::Lstm);
        assert_eq!(loaded.attention.scope, AttentionScope::Global);
        assert_eq!(loaded.hidden_size, 32);
        assert_eq!(loaded.seed, 9);
    }

    #[test]
    fn test_missing_json_file_is_io_error() {
        let path = std::env::temp_dir().join("luong_seq2seq_no_such_config.json");
        let err = ModelConfig::from_json_file(&path).unwrap_err();
        assert!(matches!(err, Seq2SeqError::ConfigIo(_)));
        assert!(err.is_config_error());
    }
}

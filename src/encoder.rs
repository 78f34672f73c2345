//! Bidirectional recurrent encoder producing the attention memory.

use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, trace};

use crate::config::{ModelConfig, PAD_IDX};
use crate::error::{Result, Seq2SeqError};
use crate::layers::Embedding;
use crate::mask::SourceMask;
use crate::rnn::{RecurrentState, StackedRnn};

// Keeps encoder dropout masks independent from parameter initialisation
const DROPOUT_STREAM: u64 = 0x656e63;

pub struct Encoder {
    embedding: Embedding,
    rnn: StackedRnn,
    hidden: Option<RecurrentState>,
    training: bool,
    dropout_rng: StdRng,
}

impl Encoder {
    pub fn new(config: &ModelConfig, vocab_size: usize, rng: &mut StdRng) -> Result<Self> {
        config.validate()?;
        let embedding = Embedding::new(vocab_size, config.embed_size, PAD_IDX, rng);
        let rnn = StackedRnn::new(
            config.cell,
            config.embed_size,
            config.direction_size(),
            config.num_layers,
            config.bidirectional,
            config.dropout,
            rng,
        );
        debug!(
            vocab_size,
            parameters = embedding.num_parameters() + rnn.num_parameters(),
            "built encoder"
        );
        Ok(Self {
            embedding,
            rnn,
            hidden: None,
            training: false,
            dropout_rng: StdRng::seed_from_u64(config.seed ^ DROPOUT_STREAM),
        })
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Width of each encoder state
    pub fn hidden_size(&self) -> usize {
        self.rnn.output_size()
    }

    /// State each sequence reached at its true length during the last `encode`
    pub fn final_state(&self) -> Option<&RecurrentState> {
        self.hidden.as_ref()
    }

    /// Encodes a right-padded batch `(batch, max_len)` into
    /// `(batch, max_len, hidden)`; positions past each true length are zero.
    pub fn encode(&mut self, tokens: &Array2<usize>, mask: &SourceMask) -> Result<Array3<f32>> {
        let (batch, max_len) = tokens.dim();
        if (mask.batch_size(), mask.max_len()) != (batch, max_len) {
            return Err(Seq2SeqError::shape(
                "source mask",
                (batch, max_len),
                (mask.batch_size(), mask.max_len()),
            ));
        }

        let embedded = self.embedding.forward(tokens)?;
        let init = self.rnn.init_state(batch);
        let dropout_rng = if self.training {
            Some(&mut self.dropout_rng)
        } else {
            None
        };
        let (states, final_state) = self.rnn.forward(&embedded, mask.lengths(), &init, dropout_rng)?;
        trace!(shape = ?states.dim(), lengths = ?mask.lengths(), "encoded batch");

        self.hidden = Some(final_state);
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CellKind;
    use ndarray::{array, s};

    fn encoder(config: &ModelConfig) -> Encoder {
        Encoder::new(config, 20, &mut StdRng::seed_from_u64(1)).unwrap()
    }

    #[test]
    fn test_encode_shape_and_padding() {
        let config = ModelConfig::small();
        let mut enc = encoder(&config);
        let tokens = array![[5, 6, 7, 0, 0], [3, 4, 5, 6, 1]];
        let mask = SourceMask::from_tokens(&tokens).unwrap();
        let states = enc.encode(&tokens, &mask).unwrap();
        assert_eq!(states.dim(), (2, 5, config.hidden_size));
        assert_eq!(enc.hidden_size(), config.hidden_size);
        assert!(states.slice(s![0, 3.., ..]).iter().all(|&v| v == 0.0));
        assert_eq!(enc.final_state().unwrap().shape(), (4, 2, 16));
    }

    #[test]
    fn test_lstm_encoder() {
        let config = ModelConfig::small().with_cell(CellKind::Lstm).with_layers(1);
        let mut enc = encoder(&config);
        let tokens = array![[5, 6, 0]];
        let mask = SourceMask::from_tokens(&tokens).unwrap();
        let states = enc.encode(&tokens, &mask).unwrap();
        assert_eq!(states.dim(), (1, 3, 32));
        assert!(enc.final_state().unwrap().c.is_some());
    }

    #[test]
    fn test_encode_rejects_mask_mismatch() {
        let mut enc = encoder(&ModelConfig::small());
        let tokens = array![[5, 6, 7]];
        let mask = SourceMask::from_lengths(&[2, 3], 3).unwrap();
        assert!(enc.encode(&tokens, &mask).is_err());
    }

    #[test]
    fn test_training_mode_changes_output_only_with_dropout() {
        let config = ModelConfig::small().with_dropout(0.5);
        let mut enc = encoder(&config);
        let tokens = array![[5, 6, 7, 8]];
        let mask = SourceMask::from_tokens(&tokens).unwrap();
        assert!(!enc.is_training());
        let eval = enc.encode(&tokens, &mask).unwrap();
        enc.set_training(true);
        assert!(enc.is_training());
        let train = enc.encode(&tokens, &mask).unwrap();
        enc.set_training(false);
        assert_ne!(eval, train);
        assert_eq!(eval, enc.encode(&tokens, &mask).unwrap());
    }
}

//! One-step recurrent decoder with attention and input feeding.

use ndarray::{Array2, Array3, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, trace};

use crate::attention::Attention;
use crate::config::{ModelConfig, PAD_IDX};
use crate::error::{Result, Seq2SeqError};
use crate::layers::{concat_features, log_softmax, Embedding, Linear};
use crate::mask::SourceMask;
use crate::rnn::{RecurrentState, StackedRnn};

const DROPOUT_STREAM: u64 = 0x646563;

pub struct Decoder {
    embedding: Embedding,
    rnn: StackedRnn,
    attention: Attention,
    out: Linear,
    input_feeding: bool,
    hidden: Option<RecurrentState>,
    training: bool,
    dropout_rng: StdRng,
}

impl Decoder {
    pub fn new(config: &ModelConfig, vocab_size: usize, rng: &mut StdRng) -> Result<Self> {
        config.validate()?;
        let embedding = Embedding::new(vocab_size, config.embed_size, PAD_IDX, rng);
        let rnn_input = if config.input_feeding {
            config.embed_size + config.hidden_size
        } else {
            config.embed_size
        };
        let rnn = StackedRnn::new(
            config.cell,
            rnn_input,
            config.direction_size(),
            config.num_layers,
            config.bidirectional,
            config.dropout,
            rng,
        );
        let attention = Attention::new(&config.attention, config.hidden_size, rng)?;
        let out = Linear::new(config.hidden_size, vocab_size, rng);
        debug!(
            vocab_size,
            input_feeding = config.input_feeding,
            parameters = embedding.num_parameters() + rnn.num_parameters() + out.num_parameters(),
            "built decoder"
        );
        Ok(Self {
            embedding,
            rnn,
            attention,
            out,
            input_feeding: config.input_feeding,
            hidden: None,
            training: false,
            dropout_rng: StdRng::seed_from_u64(config.seed ^ DROPOUT_STREAM),
        })
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn attention(&self) -> &Attention {
        &self.attention
    }

    pub fn vocab_size(&self) -> usize {
        self.out.out_features()
    }

    pub fn hidden(&self) -> Option<&RecurrentState> {
        self.hidden.as_ref()
    }

    /// Zeroes the recurrent state and the attention cache for a new batch.
    pub fn reset(&mut self, batch_size: usize) {
        self.hidden = Some(self.rnn.init_state(batch_size));
        self.attention.reset(batch_size);
    }

    /// Like [`reset`](Self::reset) but starts the recurrence from `state`.
    pub fn reset_with(&mut self, state: RecurrentState) -> Result<()> {
        let expected = self.rnn.init_state(state.batch_size());
        if expected.shape() != state.shape() || expected.c.is_some() != state.c.is_some() {
            return Err(Seq2SeqError::shape("decoder initial state", expected.shape(), state.shape()));
        }
        self.attention.reset(state.batch_size());
        self.hidden = Some(state);
        Ok(())
    }

    /// Advances one timestep and returns log-probabilities `(batch, vocab)`.
    pub fn step(
        &mut self,
        prev_tokens: ArrayView1<usize>,
        encoder_states: &Array3<f32>,
        t: usize,
        mask: &SourceMask,
    ) -> Result<Array2<f32>> {
        let hidden = self
            .hidden
            .as_ref()
            .ok_or(Seq2SeqError::StateNotInitialized("decoder"))?;
        let batch = prev_tokens.len();
        if hidden.batch_size() != batch {
            return Err(Seq2SeqError::shape("decoder input batch", hidden.batch_size(), batch));
        }

        let mut input = self.embedding.lookup(prev_tokens)?;
        if self.input_feeding {
            let fed = self
                .attention
                .hidden()
                .ok_or(Seq2SeqError::StateNotInitialized("attention"))?;
            input = concat_features(&input, fed)?;
        }

        let input = input.insert_axis(Axis(1));
        let dropout_rng = if self.training {
            Some(&mut self.dropout_rng)
        } else {
            None
        };
        let (output, next_hidden) = self.rnn.forward(&input, &vec![1; batch], hidden, dropout_rng)?;
        self.hidden = Some(next_hidden);

        let ht = output.index_axis(Axis(1), 0).to_owned();
        let attentional = self.attention.forward(&ht, encoder_states, t, mask)?;
        let log_probs = log_softmax(&self.out.forward(&attentional));
        trace!(t, batch, "decoder step");
        Ok(log_probs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttentionScope, CellKind, ScoreMethod};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1};

    const VOCAB: usize = 12;

    fn setup(config: &ModelConfig) -> (Decoder, Array3<f32>, SourceMask) {
        let mut rng = StdRng::seed_from_u64(3);
        let decoder = Decoder::new(config, VOCAB, &mut rng).unwrap();
        let memory = Array3::from_shape_fn((2, 5, config.hidden_size), |(b, t, h)| {
            ((b + 1) * (t + 1) * (h + 1)) as f32 * 0.01
        });
        let mask = SourceMask::from_lengths(&[3, 5], 5).unwrap();
        (decoder, memory, mask)
    }

    #[test]
    fn test_step_requires_reset() {
        let (mut decoder, memory, mask) = setup(&ModelConfig::small());
        let err = decoder
            .step(array![2, 2].view(), &memory, 0, &mask)
            .unwrap_err();
        assert!(matches!(err, Seq2SeqError::StateNotInitialized("decoder")));
    }

    #[test]
    fn test_log_probs_normalised() {
        for scope in [
            AttentionScope::Global,
            AttentionScope::LocalMonotonic,
            AttentionScope::LocalPredictive,
        ] {
            let config = ModelConfig::small().with_scope(scope).with_window_size(1);
            let (mut decoder, memory, mask) = setup(&config);
            decoder.reset(2);
            let mut prev = array![2, 2];
            for t in 0..4 {
                let log_probs = decoder.step(prev.view(), &memory, t, &mask).unwrap();
                assert_eq!(log_probs.dim(), (2, VOCAB));
                for row in log_probs.outer_iter() {
                    assert!(row.iter().all(|&v| v <= 0.0));
                    assert_abs_diff_eq!(row.mapv(f32::exp).sum(), 1.0, epsilon = 1e-5);
                }
                prev = Array1::from(crate::layers::argmax_rows(&log_probs));
            }
        }
    }

    #[test]
    fn test_input_feeding_uses_cached_state() {
        let config = ModelConfig::small().with_score(ScoreMethod::General);
        let (mut decoder, memory, mask) = setup(&config);
        decoder.reset(2);
        let first = decoder.step(array![2, 2].view(), &memory, 0, &mask).unwrap();
        assert!(decoder.attention().hidden().unwrap().iter().any(|&v| v != 0.0));

        decoder.reset(2);
        let again = decoder.step(array![2, 2].view(), &memory, 0, &mask).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_without_input_feeding() {
        let config = ModelConfig::small()
            .with_input_feeding(false)
            .with_cell(CellKind::Lstm)
            .with_bidirectional(false);
        let (mut decoder, memory, mask) = setup(&config);
        decoder.reset(2);
        let log_probs = decoder.step(array![2, 5].view(), &memory, 0, &mask).unwrap();
        assert_eq!(log_probs.dim(), (2, VOCAB));
    }

    #[test]
    fn test_reset_with_rejects_wrong_shape() {
        let (mut decoder, _, _) = setup(&ModelConfig::small());
        let state = RecurrentState::zeros(CellKind::Gru, 1, 2, 16);
        assert!(decoder.reset_with(state).is_err());
        let state = RecurrentState::zeros(CellKind::Gru, 4, 2, 16);
        assert!(decoder.reset_with(state).is_ok());
        assert_eq!(decoder.hidden().unwrap().shape(), (4, 2, 16));
    }

    #[test]
    fn test_step_advances_recurrent_state() {
        let (mut decoder, memory, mask) = setup(&ModelConfig::small());
        assert!(decoder.hidden().is_none());
        decoder.reset(2);
        assert!(decoder.hidden().unwrap().h.iter().all(|&v| v == 0.0));
        decoder.step(array![2, 2].view(), &memory, 0, &mask).unwrap();
        assert!(decoder.hidden().unwrap().h.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_dropout_only_in_training_mode() {
        let config = ModelConfig::small().with_dropout(0.5);
        let (mut decoder, memory, mask) = setup(&config);
        let sos = array![2, 2];

        decoder.reset(2);
        let eval = decoder.step(sos.view(), &memory, 0, &mask).unwrap();

        decoder.set_training(true);
        decoder.reset(2);
        let train = decoder.step(sos.view(), &memory, 0, &mask).unwrap();
        assert_ne!(eval, train);
        for row in train.outer_iter() {
            assert_abs_diff_eq!(row.mapv(f32::exp).sum(), 1.0, epsilon = 1e-5);
        }

        decoder.set_training(false);
        decoder.reset(2);
        assert_eq!(decoder.step(sos.view(), &memory, 0, &mask).unwrap(), eval);
    }
}

//! Encoder-decoder wiring for inference: teacher-forced scoring and greedy
//! decoding.

use ndarray::{s, Array1, Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::config::{DecoderInit, ModelConfig, EOS_IDX, PAD_IDX, SOS_IDX};
use crate::decoder::Decoder;
use crate::encoder::Encoder;
use crate::error::{Result, Seq2SeqError};
use crate::layers::argmax_rows;
use crate::mask::SourceMask;

pub struct Seq2Seq {
    config: ModelConfig,
    encoder: Encoder,
    decoder: Decoder,
}

impl Seq2Seq {
    /// Builds both halves from one rng seeded with `config.seed`, so equal
    /// configs give identical parameters.
    pub fn new(config: ModelConfig, src_vocab_size: usize, tgt_vocab_size: usize) -> Result<Self> {
        config.validate()?;
        if src_vocab_size <= SOS_IDX || tgt_vocab_size <= SOS_IDX {
            return Err(Seq2SeqError::InvalidConfig(format!(
                "vocabularies must include the reserved ids 0..={} (got {} and {})",
                SOS_IDX, src_vocab_size, tgt_vocab_size
            )));
        }
        let mut rng = StdRng::seed_from_u64(config.seed);
        let encoder = Encoder::new(&config, src_vocab_size, &mut rng)?;
        let decoder = Decoder::new(&config, tgt_vocab_size, &mut rng)?;
        info!(
            cell = ?config.cell,
            scope = %config.attention.scope,
            score = %config.attention.score,
            hidden_size = config.hidden_size,
            "built seq2seq model"
        );
        Ok(Self {
            config,
            encoder,
            decoder,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn set_training(&mut self, training: bool) {
        self.encoder.set_training(training);
        self.decoder.set_training(training);
    }

    /// Encodes the source and resets the decoder for a new batch.
    pub fn begin(&mut self, src: &Array2<usize>, mask: &SourceMask) -> Result<Array3<f32>> {
        let states = self.encoder.encode(src, mask)?;
        match (self.config.decoder_init, self.encoder.final_state()) {
            (DecoderInit::EncoderFinal, Some(state)) => self.decoder.reset_with(state.clone())?,
            _ => self.decoder.reset(src.nrows()),
        }
        Ok(states)
    }

    /// Teacher-forced pass: step `t` is fed `SOS` for `t == 0` and `tgt[.., t-1]`
    /// afterwards. Returns log-probabilities `(batch, tgt_len, vocab)`.
    pub fn score(&mut self, src: &Array2<usize>, mask: &SourceMask, tgt: &Array2<usize>) -> Result<Array3<f32>> {
        let (batch, tgt_len) = tgt.dim();
        if batch != src.nrows() {
            return Err(Seq2SeqError::shape("target batch", src.nrows(), batch));
        }
        let vocab_size = self.decoder.vocab_size();
        if let Some(&id) = tgt.iter().find(|&&id| id >= vocab_size) {
            return Err(Seq2SeqError::TokenOutOfRange { id, vocab_size });
        }
        let states = self.begin(src, mask)?;

        let mut output = Array3::zeros((batch, tgt_len, self.decoder.vocab_size()));
        let mut prev = Array1::from_elem(batch, SOS_IDX);
        for t in 0..tgt_len {
            let log_probs = self.decoder.step(prev.view(), &states, t, mask)?;
            output.slice_mut(s![.., t, ..]).assign(&log_probs);
            prev = tgt.column(t).to_owned();
        }
        Ok(output)
    }

    /// Sum of target-token log-probabilities per sequence, skipping PAD targets.
    pub fn sequence_log_likelihood(
        &mut self,
        src: &Array2<usize>,
        mask: &SourceMask,
        tgt: &Array2<usize>,
    ) -> Result<Array1<f32>> {
        let log_probs = self.score(src, mask, tgt)?;
        let totals = tgt
            .outer_iter()
            .zip(log_probs.outer_iter())
            .map(|(ids, steps)| {
                ids.iter()
                    .zip(steps.outer_iter())
                    .filter(|&(&id, _)| id != PAD_IDX)
                    .map(|(&id, dist)| dist[id])
                    .sum::<f32>()
            })
            .collect::<Vec<_>>();
        Ok(Array1::from(totals))
    }

    /// Arg-max decoding from `SOS`. Each sequence stops at `EOS` (not
    /// included) or after `max_len` tokens.
    pub fn greedy_decode(&mut self, src: &Array2<usize>, mask: &SourceMask, max_len: usize) -> Result<Vec<Vec<usize>>> {
        let batch = src.nrows();
        let states = self.begin(src, mask)?;

        let mut outputs = vec![Vec::new(); batch];
        let mut finished = vec![false; batch];
        let mut prev = Array1::from_elem(batch, SOS_IDX);
        for t in 0..max_len {
            let log_probs = self.decoder.step(prev.view(), &states, t, mask)?;
            let picks = argmax_rows(&log_probs);
            for (b, &token) in picks.iter().enumerate() {
                if finished[b] {
                    continue;
                }
                if token == EOS_IDX {
                    finished[b] = true;
                } else {
                    outputs[b].push(token);
                }
            }
            if finished.iter().all(|&done| done) {
                debug!(steps = t + 1, "all sequences reached EOS");
                break;
            }
            prev = Array1::from(picks);
        }
        Ok(outputs)
    }
}

/// Highest log-probability in each row of a decoder step
pub fn best_log_probs(log_probs: &Array2<f32>) -> Array1<f32> {
    log_probs.map_axis(Axis(1), |row| row.fold(f32::NEG_INFINITY, |m, &v| m.max(v)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttentionScope;
    use ndarray::array;

    fn model(config: ModelConfig) -> Seq2Seq {
        Seq2Seq::new(config, 15, 11).unwrap()
    }

    #[test]
    fn test_rejects_tiny_vocab() {
        assert!(Seq2Seq::new(ModelConfig::small(), 2, 11).is_err());
    }

    #[test]
    fn test_score_shape() {
        let mut m = model(ModelConfig::small());
        let src = array![[5, 6, 7, 0, 0], [3, 4, 5, 6, 1]];
        let mask = SourceMask::from_tokens(&src).unwrap();
        let tgt = array![[4, 5, 1], [6, 1, 0]];
        let log_probs = m.score(&src, &mask, &tgt).unwrap();
        assert_eq!(log_probs.dim(), (2, 3, 11));
        assert!(log_probs.iter().all(|&v| v <= 0.0));
    }

    #[test]
    fn test_log_likelihood_ignores_padding() {
        let mut m = model(ModelConfig::small().with_scope(AttentionScope::Global));
        let src = array![[5, 6, 7], [3, 4, 5]];
        let mask = SourceMask::from_tokens(&src).unwrap();
        let tgt = array![[4, 1, 0], [4, 1, 0]];
        let ll = m.sequence_log_likelihood(&src, &mask, &tgt).unwrap();
        let log_probs = m.score(&src, &mask, &tgt).unwrap();
        let expected = log_probs[[0, 0, 4]] + log_probs[[0, 1, 1]];
        assert!((ll[0] - expected).abs() < 1e-5);
        assert!(ll.iter().all(|&v| v < 0.0));
    }

    #[test]
    fn test_rejects_out_of_vocab_target() {
        let mut m = model(ModelConfig::small());
        let src = array![[5, 6, 7], [3, 4, 5]];
        let mask = SourceMask::from_tokens(&src).unwrap();
        // last column is never fed back to the decoder
        let tgt = array![[4, 99], [4, 1]];
        let err = m.score(&src, &mask, &tgt).unwrap_err();
        assert!(matches!(err, Seq2SeqError::TokenOutOfRange { id: 99, vocab_size: 11 }));
        let err = m.sequence_log_likelihood(&src, &mask, &tgt).unwrap_err();
        assert!(matches!(err, Seq2SeqError::TokenOutOfRange { id: 99, .. }));
    }

    #[test]
    fn test_greedy_decode_respects_max_len() {
        let mut m = model(ModelConfig::small().with_decoder_init(DecoderInit::EncoderFinal));
        let src = array![[5, 6, 7, 0], [3, 4, 5, 6]];
        let mask = SourceMask::from_tokens(&src).unwrap();
        let out = m.greedy_decode(&src, &mask, 4).unwrap();
        assert_eq!(out.len(), 2);
        for seq in &out {
            assert!(seq.len() <= 4);
            assert!(!seq.contains(&EOS_IDX));
        }
    }

    #[test]
    fn test_best_log_probs() {
        let lp = array![[-0.1f32, -2.0], [-3.0, -0.5]];
        assert_eq!(best_log_probs(&lp), array![-0.1f32, -0.5]);
    }
}

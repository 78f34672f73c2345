//! Luong-style attention over encoder states.
//!
//! The scope (global, local-monotonic, local-predictive) and the score
//! (dot, general) are resolved into [`Windowing`] and [`Scorer`] when the
//! module is built. Local windows are applied as a span mask over the full
//! source axis, so scoring, softmax and the context sum stay batched even
//! though every batch element may get a different window.

use std::ops::Range;

use ndarray::{Array1, Array2, Array3, Axis, Zip};
use rand::rngs::StdRng;
use tracing::{debug, trace};

use crate::config::{AttentionConfig, AttentionScope, ScoreMethod};
use crate::error::{Result, Seq2SeqError};
use crate::layers::{concat_features, sigmoid, softmax, Linear};
use crate::mask::SourceMask;

/// Score given to masked positions before the softmax. Finite so that
/// `exp(MASK_FILL - max)` underflows to zero instead of producing NaN.
pub const MASK_FILL: f32 = -10000.0;

/// Window selection, fixed at construction
#[derive(Debug, Clone)]
pub enum Windowing {
    Global,
    Monotonic {
        window_size: usize,
    },
    Predictive {
        window_size: usize,
        wp: Linear,
        vp: Linear,
    },
}

/// Alignment score, fixed at construction
#[derive(Debug, Clone)]
pub enum Scorer {
    Dot,
    General { wa: Linear },
}

/// Everything one attention step computes
#[derive(Debug, Clone)]
pub struct Attended {
    /// `(batch, hidden)`
    pub context: Array2<f32>,
    /// Alignment weights `(batch, src_len)`, zero outside each element's window
    pub weights: Array2<f32>,
    /// Attentional hidden state `(batch, hidden)`
    pub hidden: Array2<f32>,
    /// Source span each element attended to
    pub windows: Vec<Range<usize>>,
}

/// Window `[p0, p1)` centered on decoding step `t`, clipped to `len`.
///
/// `p0 = min(len - D, max(0, t - D))`, `p1 = min(len, t + 1 + D)`, with the
/// subtractions saturating so the window never starts before zero.
pub fn monotonic_window(t: usize, len: usize, window_size: usize) -> Range<usize> {
    let p1 = len.min(t + 1 + window_size);
    let p0 = len
        .saturating_sub(window_size)
        .min(t.saturating_sub(window_size))
        .min(p1.saturating_sub(1));
    p0..p1
}

/// Window `[max(0, p - D), min(len, p + 1 + D))` around a predicted center.
pub fn predictive_window(center: usize, len: usize, window_size: usize) -> Range<usize> {
    let center = center.min(len.saturating_sub(1));
    center.saturating_sub(window_size)..len.min(center + 1 + window_size)
}

#[derive(Debug, Clone)]
pub struct Attention {
    windowing: Windowing,
    scorer: Scorer,
    wc: Linear,
    hidden_size: usize,
    /// Last attentional hidden state, read back for input feeding
    hidden: Option<Array2<f32>>,
}

impl Attention {
    pub fn new(config: &AttentionConfig, hidden_size: usize, rng: &mut StdRng) -> Result<Self> {
        let scorer = match config.score {
            ScoreMethod::Dot => Scorer::Dot,
            ScoreMethod::General => Scorer::General {
                wa: Linear::new(hidden_size, hidden_size, rng),
            },
            ScoreMethod::Concat => {
                return Err(Seq2SeqError::UnsupportedScore(config.score.to_string()))
            }
        };

        if config.scope.is_local() && config.window_size == 0 {
            return Err(Seq2SeqError::InvalidConfig(format!(
                "{} attention needs a positive window size",
                config.scope
            )));
        }
        let windowing = match config.scope {
            AttentionScope::Global => Windowing::Global,
            AttentionScope::LocalMonotonic => Windowing::Monotonic {
                window_size: config.window_size,
            },
            AttentionScope::LocalPredictive => Windowing::Predictive {
                window_size: config.window_size,
                wp: Linear::new(hidden_size, hidden_size, rng),
                vp: Linear::new(hidden_size, 1, rng),
            },
        };

        debug!(
            scope = %config.scope,
            score = %config.score,
            window_size = config.window_size,
            hidden_size,
            "built attention"
        );

        Ok(Self {
            windowing,
            scorer,
            wc: Linear::new(hidden_size * 2, hidden_size, rng),
            hidden_size,
            hidden: None,
        })
    }

    pub fn windowing(&self) -> &Windowing {
        &self.windowing
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Cached attentional hidden state from the last `forward`
    pub fn hidden(&self) -> Option<&Array2<f32>> {
        self.hidden.as_ref()
    }

    /// Clears the cache to zeros for a new batch of sequences.
    pub fn reset(&mut self, batch_size: usize) {
        self.hidden = Some(Array2::zeros((batch_size, self.hidden_size)));
    }

    /// Seeds the cache with a caller-supplied initial state.
    pub fn set_hidden(&mut self, hidden: Array2<f32>) -> Result<()> {
        if hidden.ncols() != self.hidden_size {
            return Err(Seq2SeqError::shape("attentional hidden", self.hidden_size, hidden.ncols()));
        }
        self.hidden = Some(hidden);
        Ok(())
    }

    /// `p_i = round(len_i * sigmoid(Vp(tanh(Wp ht_i))))`, clamped into `[0, len_i)`.
    ///
    /// Only defined for the local-predictive scope; other scopes return `None`.
    pub fn predict_centers(&self, ht: &Array2<f32>, lengths: &[usize]) -> Option<Vec<usize>> {
        match &self.windowing {
            Windowing::Predictive { wp, vp, .. } => {
                let gate = vp.forward(&wp.forward(ht).mapv(f32::tanh)).mapv(sigmoid);
                let centers = gate
                    .column(0)
                    .iter()
                    .zip(lengths)
                    .map(|(&g, &len)| {
                        let p = (len as f32 * g).round() as usize;
                        p.min(len.saturating_sub(1))
                    })
                    .collect();
                Some(centers)
            }
            _ => None,
        }
    }

    /// Source span each batch element may attend to at step `t`.
    pub fn window(&self, ht: &Array2<f32>, t: usize, mask: &SourceMask) -> Vec<Range<usize>> {
        let lengths = mask.lengths();
        match &self.windowing {
            Windowing::Global => lengths.iter().map(|&len| 0..len).collect(),
            Windowing::Monotonic { window_size } => lengths
                .iter()
                .map(|&len| monotonic_window(t, len, *window_size))
                .collect(),
            Windowing::Predictive { window_size, .. } => self
                .predict_centers(ht, lengths)
                .unwrap_or_default()
                .into_iter()
                .zip(lengths)
                .map(|(p, &len)| predictive_window(p, len, *window_size))
                .collect(),
        }
    }

    /// Normalised alignment weights `(batch, src_len)`.
    ///
    /// Positions where `mask` is false get [`MASK_FILL`] before the softmax.
    pub fn align(&self, ht: &Array2<f32>, hs: &Array3<f32>, mask: &Array2<bool>) -> Result<Array2<f32>> {
        let (batch, src_len, hidden) = hs.dim();
        if ht.dim() != (batch, hidden) {
            return Err(Seq2SeqError::shape("decoder output", (batch, hidden), ht.dim()));
        }
        if mask.dim() != (batch, src_len) {
            return Err(Seq2SeqError::shape("alignment mask", (batch, src_len), mask.dim()));
        }
        let keys;
        let keys = match &self.scorer {
            Scorer::Dot => hs,
            Scorer::General { wa } => {
                keys = wa.forward_3d(hs);
                &keys
            }
        };

        let mut scores = Array2::zeros((batch, src_len));
        for ((mut row, k), q) in scores
            .outer_iter_mut()
            .zip(keys.outer_iter())
            .zip(ht.outer_iter())
        {
            row.assign(&k.dot(&q));
        }
        Zip::from(&mut scores).and(mask).for_each(|s, &valid| {
            if !valid {
                *s = MASK_FILL;
            }
        });
        Ok(softmax(&scores))
    }

    /// Computes context, weights and attentional hidden state without touching
    /// the cache.
    pub fn attend(&self, ht: &Array2<f32>, hs: &Array3<f32>, t: usize, mask: &SourceMask) -> Result<Attended> {
        let (batch, src_len, hidden) = hs.dim();
        if ht.dim() != (batch, self.hidden_size) {
            return Err(Seq2SeqError::shape("decoder output", (batch, self.hidden_size), ht.dim()));
        }
        if hidden != self.hidden_size {
            return Err(Seq2SeqError::shape("encoder states", self.hidden_size, hidden));
        }
        if (mask.batch_size(), mask.max_len()) != (batch, src_len) {
            return Err(Seq2SeqError::shape(
                "source mask",
                (batch, src_len),
                (mask.batch_size(), mask.max_len()),
            ));
        }

        let windows = self.window(ht, t, mask);
        let mut in_window = mask.valid().clone();
        if !matches!(self.windowing, Windowing::Global) {
            for (mut row, span) in in_window.outer_iter_mut().zip(&windows) {
                for (pos, valid) in row.iter_mut().enumerate() {
                    *valid = *valid && span.contains(&pos);
                }
            }
        }
        trace!(t, ?windows, "attention windows");

        let weights = self.align(ht, hs, &in_window)?;

        let mut context = Array2::zeros((batch, hidden));
        for ((mut row, a), h) in context
            .outer_iter_mut()
            .zip(weights.outer_iter())
            .zip(hs.outer_iter())
        {
            row.assign(&a.dot(&h));
        }

        let combined = concat_features(&context, ht)?;
        let attentional = self.wc.forward(&combined).mapv(f32::tanh);

        Ok(Attended {
            context,
            weights,
            hidden: attentional,
            windows,
        })
    }

    /// Attends, caches the attentional hidden state for input feeding and
    /// returns it.
    pub fn forward(&mut self, ht: &Array2<f32>, hs: &Array3<f32>, t: usize, mask: &SourceMask) -> Result<Array2<f32>> {
        let attended = self.attend(ht, hs, t, mask)?;
        self.hidden = Some(attended.hidden.clone());
        Ok(attended.hidden)
    }
}

/// Sum of weights per row, handy for checking normalisation
pub fn weight_totals(weights: &Array2<f32>) -> Array1<f32> {
    weights.sum_axis(Axis(1))
}

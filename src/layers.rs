//! Numeric building blocks shared by the encoder, decoder and attention.

use ndarray::{concatenate, s, Array, Array1, Array2, Array3, ArrayView1, Axis, Dimension};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{StandardNormal, Uniform};

use crate::error::{Result, Seq2SeqError};

// Linear projection
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Linear {
    /// Weights and bias drawn from U(-1/sqrt(in), 1/sqrt(in)).
    pub fn new(in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
        let limit = 1.0 / (in_features.max(1) as f32).sqrt();
        let dist = Uniform::new_inclusive(-limit, limit);
        Self {
            weight: Array2::random_using((in_features, out_features), dist, rng),
            bias: Array1::random_using(out_features, dist, rng),
        }
    }

    pub fn out_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn num_parameters(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    /// `(n, in) -> (n, out)`
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.weight) + &self.bias
    }

    /// `(batch, len, in) -> (batch, len, out)`
    pub fn forward_3d(&self, x: &Array3<f32>) -> Array3<f32> {
        let (batch, len, _) = x.dim();
        let mut output = Array3::zeros((batch, len, self.out_features()));
        for (b, rows) in x.outer_iter().enumerate() {
            let projected = rows.dot(&self.weight) + &self.bias;
            output.slice_mut(s![b, .., ..]).assign(&projected);
        }
        output
    }
}

// Token embedding
#[derive(Debug, Clone)]
pub struct Embedding {
    table: Array2<f32>,
}

impl Embedding {
    /// The row at `padding_idx` is zero and stays zero.
    pub fn new(vocab_size: usize, embed_size: usize, padding_idx: usize, rng: &mut StdRng) -> Self {
        let mut table: Array2<f32> = Array2::random_using((vocab_size, embed_size), StandardNormal, rng);
        if padding_idx < vocab_size {
            table.row_mut(padding_idx).fill(0.0);
        }
        Self { table }
    }

    pub fn vocab_size(&self) -> usize {
        self.table.nrows()
    }

    pub fn embed_size(&self) -> usize {
        self.table.ncols()
    }

    pub fn num_parameters(&self) -> usize {
        self.table.len()
    }

    /// Looks up one token per batch element: `(batch,) -> (batch, embed)`
    pub fn lookup(&self, ids: ArrayView1<usize>) -> Result<Array2<f32>> {
        let mut output = Array2::zeros((ids.len(), self.embed_size()));
        for (mut row, &id) in output.outer_iter_mut().zip(ids.iter()) {
            row.assign(&self.table.row(self.check(id)?));
        }
        Ok(output)
    }

    /// `(batch, len) -> (batch, len, embed)`
    pub fn forward(&self, ids: &Array2<usize>) -> Result<Array3<f32>> {
        let (batch, len) = ids.dim();
        let mut output = Array3::zeros((batch, len, self.embed_size()));
        for ((b, t), &id) in ids.indexed_iter() {
            output
                .slice_mut(s![b, t, ..])
                .assign(&self.table.row(self.check(id)?));
        }
        Ok(output)
    }

    fn check(&self, id: usize) -> Result<usize> {
        if id < self.vocab_size() {
            Ok(id)
        } else {
            Err(Seq2SeqError::TokenOutOfRange {
                id,
                vocab_size: self.vocab_size(),
            })
        }
    }
}

/// Inverted dropout: kept activations are scaled by `1 / (1 - rate)`.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    rate: f32,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        Self { rate }
    }

    pub fn apply<D: Dimension>(&self, x: &Array<f32, D>, rng: &mut StdRng) -> Array<f32, D> {
        if self.rate <= 0.0 {
            return x.clone();
        }
        let scale = 1.0 / (1.0 - self.rate);
        x.mapv(|v| if rng.gen::<f32>() < self.rate { 0.0 } else { v * scale })
    }
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Concatenates two `(n, a)` and `(n, b)` matrices into `(n, a + b)`
pub fn concat_features(left: &Array2<f32>, right: &Array2<f32>) -> Result<Array2<f32>> {
    Ok(concatenate(Axis(1), &[left.view(), right.view()])?)
}

/// Softmax over the last axis, shifted by the row max for stability
pub fn softmax(x: &Array2<f32>) -> Array2<f32> {
    let mut output = x.clone();
    for mut row in output.outer_iter_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    output
}

/// Log-softmax over the last axis
pub fn log_softmax(x: &Array2<f32>) -> Array2<f32> {
    let mut output = x.clone();
    for mut row in output.outer_iter_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let log_sum = row.fold(0.0f32, |acc, &v| acc + (v - max).exp()).ln() + max;
        row.mapv_inplace(|v| v - log_sum);
    }
    output
}

/// Index of the largest value in each row
pub fn argmax_rows(x: &Array2<f32>) -> Vec<usize> {
    x.outer_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                .0
        })
        .collect()
}

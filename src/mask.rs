//! Source padding mask: validity matrix plus true lengths.

use ndarray::Array2;

use crate::config::PAD_IDX;
use crate::error::{Result, Seq2SeqError};

#[derive(Debug, Clone, PartialEq)]
pub struct SourceMask {
    valid: Array2<bool>,
    lengths: Vec<usize>,
}

impl SourceMask {
    /// Builds the mask for right-padded sequences of the given true lengths.
    pub fn from_lengths(lengths: &[usize], max_len: usize) -> Result<Self> {
        if lengths.is_empty() {
            return Err(Seq2SeqError::InvalidMask("empty batch".into()));
        }
        if let Some(&bad) = lengths.iter().find(|&&len| len == 0 || len > max_len) {
            return Err(Seq2SeqError::InvalidMask(format!(
                "length {} outside 1..={}",
                bad, max_len
            )));
        }
        let valid = Array2::from_shape_fn((lengths.len(), max_len), |(b, t)| t < lengths[b]);
        Ok(Self {
            valid,
            lengths: lengths.to_vec(),
        })
    }

    /// Lengths are the number of tokens before the first PAD in each row.
    pub fn from_tokens(tokens: &Array2<usize>) -> Result<Self> {
        let lengths: Vec<usize> = tokens
            .outer_iter()
            .map(|row| row.iter().take_while(|&&id| id != PAD_IDX).count())
            .collect();
        Self::from_lengths(&lengths, tokens.ncols())
    }

    pub fn valid(&self) -> &Array2<bool> {
        &self.valid
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn max_len(&self) -> usize {
        self.valid.ncols()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_from_lengths() {
        let mask = SourceMask::from_lengths(&[3, 5], 5).unwrap();
        assert_eq!(mask.batch_size(), 2);
        assert_eq!(mask.max_len(), 5);
        assert_eq!(
            mask.valid(),
            &array![[true, true, true, false, false], [true, true, true, true, true]]
        );
    }

    #[test]
    fn test_from_tokens_stops_at_first_pad() {
        let tokens = array![[5, 6, 1, 0, 0], [4, 4, 4, 4, 1]];
        let mask = SourceMask::from_tokens(&tokens).unwrap();
        assert_eq!(mask.lengths(), &[3, 5]);
    }

    #[test]
    fn test_rejects_inconsistent_lengths() {
        assert!(SourceMask::from_lengths(&[], 4).is_err());
        assert!(SourceMask::from_lengths(&[0, 2], 4).is_err());
        assert!(matches!(
            SourceMask::from_lengths(&[2, 6], 4),
            Err(Seq2SeqError::InvalidMask(_))
        ));
    }
}

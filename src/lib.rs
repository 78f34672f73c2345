//! Sequence-to-sequence model with Luong attention, forward pass only.
//!
//! - `encoder` - bidirectional recurrent encoder over padded source batches
//! - `attention` - global and local (monotonic / predictive) attention
//! - `decoder` - one-step decoder with input feeding
//! - `seq2seq` - teacher-forced scoring and greedy decoding
//!
//! ```rust,no_run
//! use luong_seq2seq::{ModelConfig, Seq2Seq, SourceMask};
//! use ndarray::array;
//!
//! let mut model = Seq2Seq::new(ModelConfig::small(), 100, 100)?;
//! let src = array![[5, 6, 7, 0, 0], [8, 9, 10, 11, 1]];
//! let mask = SourceMask::from_tokens(&src)?;
//! let translations = model.greedy_decode(&src, &mask, 10)?;
//! # Ok::<(), luong_seq2seq::Seq2SeqError>(())
//! ```

pub mod attention;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod layers;
pub mod mask;
pub mod rnn;
pub mod seq2seq;

pub use attention::{Attended, Attention, MASK_FILL};
pub use config::{
    AttentionConfig, AttentionScope, CellKind, DecoderInit, ModelConfig, ScoreMethod, EOS_IDX, PAD_IDX, SOS_IDX,
};
pub use decoder::Decoder;
pub use encoder::Encoder;
pub use error::{Result, Seq2SeqError};
pub use mask::SourceMask;
pub use rnn::RecurrentState;
pub use seq2seq::Seq2Seq;

//! Autoregressive sequence decoding on top of candle.
//!
//! [`Seq2SeqDecoder`] turns encoder outputs into target token sequences with a LSTM
//! decoder, optional attention over the source, teacher forcing with scheduled sampling
//! during training and beam search at inference time. Predictions are scored with a
//! masked cross-entropy loss and a corpus [`Bleu`] metric.
//!
//! ```no_run
//! use std::sync::Arc;
//! use candle::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use candle_seq2seq::{DecoderConfig, Seq2SeqDecoder, TargetVocabulary};
//!
//! # fn main() -> candle::Result<()> {
//! let vocab = TargetVocabulary::new(["@pad@", "@unk@", "@start@", "@end@", "a", "b"])?;
//! let config = DecoderConfig {
//!     input_dim: 8,
//!     max_decoding_steps: 10,
//!     beam_size: Some(3),
//!     ..Default::default()
//! };
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
//! let mut decoder = Seq2SeqDecoder::new(config, Arc::new(vocab), vb)?;
//! let encoder_outputs = Tensor::randn(0f32, 1., (2, 5, 8), &Device::Cpu)?;
//! let source_mask = Tensor::ones((2, 5), DType::U8, &Device::Cpu)?;
//! let output = decoder.forward_t(
//!     &encoder_outputs,
//!     &source_mask,
//!     None,
//!     false,
//!     &mut rand::thread_rng(),
//! )?;
//! # Ok(())
//! # }
//! ```
pub mod attention;
pub mod beam_search;
pub mod bleu;
pub mod config;
pub mod decoder;
pub mod embedding;
pub mod loss;
pub mod rnn;
pub mod state;
pub mod vocab;

pub use attention::{Attention, AttentionConfig};
pub use beam_search::{BeamSearch, BeamSearchOutput};
pub use bleu::Bleu;
pub use config::{DecoderConfig, SpecialTokens};
pub use decoder::{DecoderOutput, LoopOutput, Seq2SeqDecoder, TargetTokens};
pub use embedding::PaddedEmbedding;
pub use loss::LossAverage;
pub use rnn::{CellState, RecurrentCell};
pub use state::{BeamState, DecoderState};
pub use vocab::{TargetVocabulary, Vocabulary};

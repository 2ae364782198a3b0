//! LSTM decoder producing target sequences from encoded source representations.
//!
//! The decoder is initialized from the final encoder state and predicts one token at a
//! time. It supports three modes:
//! - training, feeding gold tokens or, with scheduled sampling, its own predictions
//!   ([`Seq2SeqDecoder::forward_loop`]),
//! - greedy decoding, the same loop without gold tokens,
//! - beam search ([`Seq2SeqDecoder::forward_beam_search`]).
//!
//! References:
//! - [Scheduled Sampling for Sequence Prediction with Recurrent Neural Networks](https://arxiv.org/abs/1506.03099)
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use candle::{DType, IndexOp, Module, Result, Tensor, D};
use candle_nn::{Linear, VarBuilder};
use rand::Rng;

use crate::attention::{self, Attention};
use crate::beam_search::{BeamSearch, BeamSearchOutput};
use crate::bleu::Bleu;
use crate::config::DecoderConfig;
use crate::embedding::{padded_embedding, PaddedEmbedding};
use crate::loss::shifted_sequence_loss;
use crate::rnn::{recurrent_cell, RecurrentCell};
use crate::state::{final_encoder_states, DecoderState};
use crate::vocab::Vocabulary;

/// Gold target sequences, starting with the start marker.
#[derive(Debug, Clone)]
pub struct TargetTokens {
    /// `(batch, target_len)` token ids.
    pub ids: Tensor,
    /// `(batch, target_len)`, non-zero at valid positions.
    pub mask: Tensor,
}

impl TargetTokens {
    pub fn new(ids: Tensor, mask: Tensor) -> Result<Self> {
        if ids.dims2()? != mask.dims2()? {
            candle::bail!(
                "target ids {:?} and mask {:?} differ in shape",
                ids.shape(),
                mask.shape()
            )
        }
        let ids = ids.to_dtype(DType::U32)?;
        Ok(Self { ids, mask })
    }

    /// Targets whose mask is set wherever the id differs from `pad_index`.
    pub fn from_ids(ids: Tensor, pad_index: u32) -> Result<Self> {
        let ids = ids.to_dtype(DType::U32)?;
        let padding = Tensor::full(pad_index, ids.dims(), ids.device())?;
        let mask = ids.ne(&padding)?;
        Self::new(ids, mask)
    }
}

/// Result of [`Seq2SeqDecoder::forward_loop`].
#[derive(Debug, Clone)]
pub struct LoopOutput {
    /// Greedy predictions, `(batch, steps)`.
    pub predictions: Tensor,
    /// Raw scores, `(batch, steps, num_classes)`.
    pub logits: Tensor,
    /// Only set when gold targets were provided.
    pub loss: Option<Tensor>,
}

/// Result of [`Seq2SeqDecoder::forward_t`].
#[derive(Debug, Clone, Default)]
pub struct DecoderOutput {
    /// Scalar loss, set when gold targets were provided.
    pub loss: Option<Tensor>,
    /// `(batch, beam, steps)` when decoding, `(batch, steps)` greedy predictions of the
    /// training loop otherwise.
    pub predictions: Option<Tensor>,
    /// `(batch, beam)`, set when decoding.
    pub class_log_probabilities: Option<Tensor>,
    /// Whether each beam hypothesis ended with the end marker, set when decoding.
    pub terminated: Option<Vec<Vec<bool>>>,
}

/// Drops the end marker and everything after it.
pub fn trim_at_end(ids: &[u32], end_index: u32) -> &[u32] {
    match ids.iter().position(|&id| id == end_index) {
        Some(end) => &ids[..end],
        None => ids,
    }
}

#[derive(Debug)]
pub struct Seq2SeqDecoder {
    target_embedder: PaddedEmbedding,
    attention: Option<Box<dyn Attention>>,
    decoder_cell: Box<dyn RecurrentCell>,
    output_projection: Linear,
    beam_search: BeamSearch,
    bleu: Option<Bleu>,
    vocab: Arc<dyn Vocabulary>,
    config: DecoderConfig,
    num_classes: usize,
    span: tracing::Span,
}

impl Seq2SeqDecoder {
    pub fn new(config: DecoderConfig, vocab: Arc<dyn Vocabulary>, vb: VarBuilder) -> Result<Self> {
        let num_classes = vocab.size();
        config.validate(num_classes)?;
        let tokens = config.special_tokens;

        let target_embedding_dim = config.target_embedding_dim();
        let encoder_output_dim = config.encoder_output_dim();
        let decoder_output_dim = config.decoder_output_dim();

        let target_embedder = padded_embedding(
            num_classes,
            target_embedding_dim,
            tokens.pad_index,
            vb.pp("target_embedder"),
        )?;
        let attention = config
            .attention
            .as_ref()
            .map(|cfg| {
                attention::attention(
                    cfg,
                    decoder_output_dim,
                    encoder_output_dim,
                    vb.pp("attention"),
                )
            })
            .transpose()?;
        // With attention, the attended encoder outputs are concatenated to the embedding.
        let decoder_input_dim = match attention {
            Some(_) => encoder_output_dim + target_embedding_dim,
            None => target_embedding_dim,
        };
        let decoder_cell = recurrent_cell(
            decoder_input_dim,
            decoder_output_dim,
            config.target_decoder_layers,
            vb.pp("decoder_cell"),
        )?;
        let output_projection = candle_nn::linear(
            decoder_output_dim,
            num_classes,
            vb.pp("output_projection_layer"),
        )?;

        let mut beam_search = BeamSearch::new(
            tokens.end_index,
            config.max_decoding_steps,
            config.beam_size(),
        )?;
        if let Some(per_node_beam_size) = config.per_node_beam_size {
            beam_search = beam_search.with_per_node_beam_size(per_node_beam_size)?;
        }

        let bleu = if config.use_bleu {
            let exclude: HashSet<u32> = [tokens.pad_index, tokens.start_index, tokens.end_index]
                .into_iter()
                .collect();
            Some(Bleu::new(config.bleu_ngram_weights.clone(), exclude)?)
        } else {
            None
        };

        let span = tracing::span!(tracing::Level::TRACE, "seq2seq-decoder");
        Ok(Self {
            target_embedder,
            attention,
            decoder_cell,
            output_projection,
            beam_search,
            bleu,
            vocab,
            config,
            num_classes,
            span,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn vocab(&self) -> &Arc<dyn Vocabulary> {
        &self.vocab
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn beam_search(&self) -> &BeamSearch {
        &self.beam_search
    }

    pub fn target_embedder(&self) -> &PaddedEmbedding {
        &self.target_embedder
    }

    /// Builds the initial state: the hidden state is the encoder output at the last valid
    /// source position, the cell state is zero.
    pub fn init_decoder_state(
        &self,
        encoder_outputs: &Tensor,
        source_mask: &Tensor,
    ) -> Result<DecoderState> {
        let (_, _, encoder_dim) = encoder_outputs.dims3()?;
        if encoder_dim != self.config.encoder_output_dim() {
            candle::bail!(
                "expected encoder outputs of dim {}, got {encoder_dim}",
                self.config.encoder_output_dim()
            )
        }
        let encoder_outputs = encoder_outputs.to_dtype(DType::F32)?;
        let source_mask = source_mask.ne(&source_mask.zeros_like()?)?;
        let final_encoder_output = final_encoder_states(&encoder_outputs, &source_mask)?;
        let cell = self.decoder_cell.initial_state(&final_encoder_output)?;
        Ok(DecoderState {
            encoder_outputs,
            source_mask,
            cell,
        })
    }

    /// Scores of shape `(group, num_classes)` for the token following `last_predictions`,
    /// together with the advanced state.
    fn output_projections(
        &self,
        last_predictions: &Tensor,
        state: &DecoderState,
    ) -> Result<(Tensor, DecoderState)> {
        let embedded_input = self
            .target_embedder
            .forward(last_predictions)?
            .to_dtype(DType::F32)?;
        let decoder_input = match &self.attention {
            Some(attention) => {
                let query = self.decoder_cell.output(&state.cell)?;
                let attended_input =
                    attention.attend(&query, &state.encoder_outputs, &state.source_mask)?;
                Tensor::cat(&[&attended_input, &embedded_input], D::Minus1)?
            }
            None => embedded_input,
        };
        let cell = self.decoder_cell.advance(&decoder_input, &state.cell)?;
        let hidden = self
            .decoder_cell
            .output(&cell)?
            .to_dtype(self.output_projection.weight().dtype())?;
        let logits = self.output_projection.forward(&hidden)?.to_dtype(DType::F32)?;
        Ok((logits, state.with_cell(cell)))
    }

    /// One decoding step: log-probabilities of shape `(group, num_classes)` and the next
    /// state. This is the step function driven by the beam search.
    pub fn take_step(
        &self,
        last_predictions: &Tensor,
        state: &DecoderState,
        _timestep: usize,
    ) -> Result<(Tensor, DecoderState)> {
        let (logits, state) = self.output_projections(last_predictions, state)?;
        let class_log_probabilities = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
        Ok((class_log_probabilities, state))
    }

    fn loss(&self, logits: &Tensor, targets: &TargetTokens) -> Result<Tensor> {
        let loss = shifted_sequence_loss(
            logits,
            &targets.ids,
            &targets.mask,
            self.config.loss_average,
        )?;
        let mut scale = self.config.loss_weight;
        if self.config.normalize_loss_by_vocab {
            scale /= (self.num_classes as f64).ln();
        }
        loss.affine(scale, 0.)
    }

    /// Runs the decoder step by step, feeding gold tokens or previous predictions.
    ///
    /// With `targets` the loop runs `target_len - 1` steps and computes the loss, without it
    /// runs `max_decoding_steps` steps feeding its own greedy predictions. In training mode a
    /// single draw from `rng` per step decides for the whole batch whether the previous
    /// predictions replace the gold tokens, see `DecoderConfig::scheduled_sampling_ratio`.
    pub fn forward_loop<R: Rng + ?Sized>(
        &self,
        state: DecoderState,
        targets: Option<&TargetTokens>,
        train: bool,
        rng: &mut R,
    ) -> Result<LoopOutput> {
        let batch_size = state.group_size()?;
        let device = state.source_mask.device().clone();
        let num_decoding_steps = match targets {
            Some(targets) => {
                let (target_b_sz, target_len) = targets.ids.dims2()?;
                if target_b_sz != batch_size {
                    candle::bail!("{target_b_sz} target sequences for a batch of {batch_size}")
                }
                if target_len < 2 {
                    candle::bail!("target sequences need at least two positions, got {target_len}")
                }
                // The last target position is only ever used as a label.
                let num_steps = target_len - 1;
                if num_steps > self.config.max_decoding_steps {
                    candle::bail!(
                        "{num_steps} decoding steps exceed max_decoding_steps ({})",
                        self.config.max_decoding_steps
                    )
                }
                num_steps
            }
            None => self.config.max_decoding_steps,
        };

        let mut state = state;
        let mut last_predictions = Tensor::full(
            self.config.special_tokens.start_index,
            batch_size,
            &device,
        )?;
        let mut step_logits = Vec::with_capacity(num_decoding_steps);
        let mut step_predictions = Vec::with_capacity(num_decoding_steps);
        for timestep in 0..num_decoding_steps {
            let use_predictions =
                train && rng.gen::<f64>() < self.config.scheduled_sampling_ratio;
            let input_choices = match targets {
                Some(targets) if !use_predictions => targets.ids.i((.., timestep))?,
                _ => last_predictions.clone(),
            };
            let (logits, next_state) = self.output_projections(&input_choices, &state)?;
            state = next_state;
            let class_log_probabilities = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
            last_predictions = class_log_probabilities.argmax(D::Minus1)?;
            step_logits.push(logits.unsqueeze(1)?);
            step_predictions.push(last_predictions.unsqueeze(1)?);
        }

        let predictions = Tensor::cat(&step_predictions, 1)?;
        let logits = Tensor::cat(&step_logits, 1)?;
        let loss = match targets {
            Some(targets) => Some(self.loss(&logits, targets)?),
            None => None,
        };
        Ok(LoopOutput {
            predictions,
            logits,
            loss,
        })
    }

    /// Beam search from the start marker.
    pub fn forward_beam_search(&self, state: DecoderState) -> Result<BeamSearchOutput> {
        let batch_size = state.group_size()?;
        let start_predictions = Tensor::full(
            self.config.special_tokens.start_index,
            batch_size,
            state.source_mask.device(),
        )?;
        self.beam_search
            .search(&start_predictions, state, |last_predictions, state, timestep| {
                self.take_step(last_predictions, state, timestep)
            })
    }

    /// Full forward pass.
    ///
    /// `encoder_outputs` has shape `(batch, src_len, encoder_dim)` and `source_mask`
    /// `(batch, src_len)`. The loss is computed whenever `targets` are given. Outside of
    /// training, the beam search predictions are returned and, when `targets` are given, the
    /// BLEU statistics are updated with the best hypothesis of each batch element.
    pub fn forward_t<R: Rng + ?Sized>(
        &mut self,
        encoder_outputs: &Tensor,
        source_mask: &Tensor,
        targets: Option<&TargetTokens>,
        train: bool,
        rng: &mut R,
    ) -> Result<DecoderOutput> {
        let _enter = self.span.enter();
        if train && targets.is_none() {
            candle::bail!("training requires target tokens")
        }
        let mut output = DecoderOutput::default();
        if let Some(targets) = targets {
            let state = self.init_decoder_state(encoder_outputs, source_mask)?;
            let loop_output = self.forward_loop(state, Some(targets), train, rng)?;
            output.loss = loop_output.loss;
            output.predictions = Some(loop_output.predictions);
        }
        if !train {
            let state = self.init_decoder_state(encoder_outputs, source_mask)?;
            let beam_output = self.forward_beam_search(state)?;
            if let (Some(targets), Some(bleu)) = (targets, self.bleu.as_mut()) {
                bleu.update(&beam_output.best()?, &targets.ids)?;
            }
            output.predictions = Some(beam_output.predictions);
            output.class_log_probabilities = Some(beam_output.log_probabilities);
            output.terminated = Some(beam_output.terminated);
        }
        Ok(output)
    }

    /// The current metric values, keyed by `"{task}/{metric}"`.
    pub fn metrics(&mut self, reset: bool) -> HashMap<String, f64> {
        let mut metrics = HashMap::new();
        if let Some(bleu) = self.bleu.as_mut() {
            metrics.insert(format!("{}/bleu", self.config.task), bleu.get_metric(reset));
        }
        metrics
    }

    /// Converts predicted ids into tokens, trimming each sequence at its first end marker.
    ///
    /// `predictions` has shape `(batch, beam, steps)` or `(batch, steps)`, the result is
    /// indexed by batch element, then by hypothesis rank.
    pub fn make_output_human_readable(&self, predictions: &Tensor) -> Result<Vec<Vec<Vec<String>>>> {
        let predictions = predictions.to_dtype(DType::U32)?;
        let predictions: Vec<Vec<Vec<u32>>> = match predictions.rank() {
            3 => predictions.to_vec3::<u32>()?,
            2 => predictions
                .to_vec2::<u32>()?
                .into_iter()
                .map(|ids| vec![ids])
                .collect(),
            rank => candle::bail!("expected predictions of rank 2 or 3, got {rank}"),
        };
        predictions
            .iter()
            .map(|top_k| {
                top_k
                    .iter()
                    .map(|ids| self.ids_to_tokens(ids))
                    .collect::<Result<Vec<_>>>()
            })
            .collect()
    }

    fn ids_to_tokens(&self, ids: &[u32]) -> Result<Vec<String>> {
        trim_at_end(ids, self.config.special_tokens.end_index)
            .iter()
            .map(|&id| match self.vocab.token(id) {
                Some(token) => Ok(token.to_string()),
                None => candle::bail!("id {id} is not in the target vocabulary"),
            })
            .collect()
    }
}

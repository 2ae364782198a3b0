//! Beam search over an arbitrary step function.
//!
//! The search keeps `beam_size` hypotheses per batch element. Each of them is expanded with
//! the log-probabilities returned by the step function, and the best `beam_size` of all the
//! expansions are kept. A hypothesis that produced the end marker is frozen: it can only be
//! continued with the end marker again, at no cost, so its score never changes afterwards.
use candle::{DType, IndexOp, Result, Tensor, D};

use crate::state::BeamState;

/// The result of [`BeamSearch::search`].
#[derive(Debug, Clone)]
pub struct BeamSearchOutput {
    /// Token ids of shape `(batch, beam, steps)`, best hypothesis first.
    pub predictions: Tensor,
    /// Cumulative log-probabilities of shape `(batch, beam)`, in decreasing order.
    pub log_probabilities: Tensor,
    /// Whether each hypothesis emitted the end marker before the step budget ran out.
    pub terminated: Vec<Vec<bool>>,
}

impl BeamSearchOutput {
    /// The top ranked hypothesis of each batch element, `(batch, steps)`.
    pub fn best(&self) -> Result<Tensor> {
        self.predictions.i((.., 0, ..))
    }

    pub fn all_terminated(&self) -> bool {
        self.terminated.iter().flatten().all(|&t| t)
    }
}

#[derive(Debug, Clone)]
pub struct BeamSearch {
    end_index: u32,
    max_steps: usize,
    beam_size: usize,
    per_node_beam_size: usize,
    span: tracing::Span,
}

/// The `k` largest values along the last dimension and their `u32` indexes, in decreasing
/// order. On cpu the sort is stable, equal values keep their enumeration order.
fn top_k(xs: &Tensor, k: usize) -> Result<(Tensor, Tensor)> {
    let xs = xs.contiguous()?;
    let indexes = xs
        .arg_sort_last_dim(false)?
        .narrow(D::Minus1, 0, k)?
        .contiguous()?;
    let values = xs.gather(&indexes, D::Minus1)?;
    Ok((values, indexes))
}

impl BeamSearch {
    pub fn new(end_index: u32, max_steps: usize, beam_size: usize) -> Result<Self> {
        if max_steps == 0 {
            candle::bail!("beam search needs at least one step")
        }
        if beam_size == 0 {
            candle::bail!("beam size must be positive")
        }
        let span = tracing::span!(tracing::Level::TRACE, "beam-search");
        Ok(Self {
            end_index,
            max_steps,
            beam_size,
            per_node_beam_size: beam_size,
            span,
        })
    }

    /// Limits the number of classes each hypothesis can propose at a step.
    pub fn with_per_node_beam_size(mut self, per_node_beam_size: usize) -> Result<Self> {
        if per_node_beam_size == 0 {
            candle::bail!("per node beam size must be positive")
        }
        self.per_node_beam_size = per_node_beam_size;
        Ok(self)
    }

    pub fn beam_size(&self) -> usize {
        self.beam_size
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn end_index(&self) -> u32 {
        self.end_index
    }

    /// Runs the search.
    ///
    /// `start_predictions` holds one `u32` start token per batch element and `start_state`
    /// has one row per batch element. `step` is called with the previous tokens of shape
    /// `(group,)`, the current state and the timestep, and returns log-probabilities of shape
    /// `(group, num_classes)` together with the next state. The group is the batch size on the
    /// first call and `batch * beam_size` afterwards.
    pub fn search<S, F>(
        &self,
        start_predictions: &Tensor,
        start_state: S,
        mut step: F,
    ) -> Result<BeamSearchOutput>
    where
        S: BeamState,
        F: FnMut(&Tensor, &S, usize) -> Result<(Tensor, S)>,
    {
        let _enter = self.span.enter();
        let batch_size = start_predictions.dims1()?;
        let device = start_predictions.device().clone();
        let beam_size = self.beam_size;
        let group_size = batch_size * beam_size;

        let start_predictions = start_predictions.to_dtype(DType::U32)?;
        let (start_log_probs, state) = step(&start_predictions, &start_state, 0)?;
        let start_log_probs = start_log_probs.to_dtype(DType::F32)?;
        let (rows, num_classes) = start_log_probs.dims2()?;
        if rows != batch_size {
            candle::bail!("step returned {rows} rows for a batch of {batch_size}")
        }
        if beam_size > num_classes {
            candle::bail!("beam size {beam_size} is larger than the {num_classes} classes")
        }
        if self.end_index as usize >= num_classes {
            candle::bail!(
                "end index {} is outside of the {num_classes} classes",
                self.end_index
            )
        }
        let per_node_beam_size = self.per_node_beam_size.min(num_classes);
        let num_candidates = beam_size * per_node_beam_size;

        // (batch, beam)
        let (start_top_log_probs, start_tokens) = top_k(&start_log_probs, beam_size)?;
        let source_rows: Vec<u32> = (0..group_size as u32)
            .map(|row| row / beam_size as u32)
            .collect();
        let mut state = state.reorder(&Tensor::new(source_rows.as_slice(), &device)?)?;
        let mut log_probabilities = start_top_log_probs.flatten_all()?;
        let mut predictions = vec![start_tokens.flatten_all()?];
        let mut backpointers: Vec<Tensor> = Vec::new();

        // Candidate `i` of a batch element extends hypothesis `i / per_node_beam_size` of that
        // element, whose first row is `batch_idx * beam_size`.
        let candidate_rows: Vec<u32> = (0..num_candidates as u32)
            .map(|i| i / per_node_beam_size as u32)
            .collect();
        let candidate_rows = Tensor::new(candidate_rows.as_slice(), &device)?;
        let row_offsets: Vec<u32> = (0..group_size as u32)
            .map(|row| row / beam_size as u32 * beam_size as u32)
            .collect();
        let row_offsets = Tensor::new(row_offsets.as_slice(), &device)?;
        // Finished hypotheses can only be continued with the end marker, at no cost.
        let mut frozen = vec![f32::NEG_INFINITY; num_classes];
        frozen[self.end_index as usize] = 0.;
        let frozen = Tensor::new(frozen.as_slice(), &device)?
            .unsqueeze(0)?
            .broadcast_as((group_size, num_classes))?;
        let end_tokens = Tensor::full(self.end_index, group_size, &device)?;

        for timestep in 1..self.max_steps {
            let last_predictions = &predictions[predictions.len() - 1];
            let ended = last_predictions.eq(&end_tokens)?;
            let num_ended = ended.to_dtype(DType::U32)?.sum_all()?.to_scalar::<u32>()?;
            if num_ended as usize == group_size {
                tracing::debug!(timestep, "all hypotheses ended");
                break;
            }
            let (class_log_probs, next_state) = step(last_predictions, &state, timestep)?;
            let class_log_probs = class_log_probs.to_dtype(DType::F32)?;
            if class_log_probs.dims2()? != (group_size, num_classes) {
                candle::bail!(
                    "step returned {:?}, expected ({group_size}, {num_classes})",
                    class_log_probs.shape()
                )
            }
            let class_log_probs = ended
                .unsqueeze(1)?
                .broadcast_as((group_size, num_classes))?
                .where_cond(&frozen, &class_log_probs)?;

            // (group, per_node_beam_size)
            let (top_log_probs, top_classes) = top_k(&class_log_probs, per_node_beam_size)?;
            let totals = top_log_probs
                .broadcast_add(&log_probabilities.unsqueeze(1)?)?
                .reshape((batch_size, num_candidates))?;
            let top_classes = top_classes.reshape((batch_size, num_candidates))?;

            // (batch, beam)
            let (next_log_probs, selected) = top_k(&totals, beam_size)?;
            let next_tokens = top_classes.gather(&selected, 1)?;
            let rows = candidate_rows
                .index_select(&selected.flatten_all()?, 0)?
                .add(&row_offsets)?;

            state = next_state.reorder(&rows)?;
            predictions.push(next_tokens.flatten_all()?);
            backpointers.push(rows);
            log_probabilities = next_log_probs.flatten_all()?;
        }

        let num_steps = predictions.len();
        let mut rows = Tensor::arange(0u32, group_size as u32, &device)?;
        let mut sequences = Vec::with_capacity(num_steps);
        for t in (0..num_steps).rev() {
            sequences.push(predictions[t].index_select(&rows, 0)?);
            if t > 0 {
                rows = backpointers[t - 1].index_select(&rows, 0)?;
            }
        }
        sequences.reverse();
        let predictions =
            Tensor::stack(&sequences, 1)?.reshape((batch_size, beam_size, num_steps))?;
        let ends = Tensor::full(self.end_index, predictions.dims(), &device)?;
        let terminated: Vec<Vec<bool>> = predictions
            .eq(&ends)?
            .max(D::Minus1)?
            .to_vec2::<u8>()?
            .into_iter()
            .map(|row| row.into_iter().map(|t| t > 0).collect())
            .collect();
        let unterminated = terminated.iter().flatten().filter(|&&t| !t).count();
        if unterminated > 0 {
            tracing::warn!(
                unterminated,
                max_steps = self.max_steps,
                "hypotheses reached the step budget without the end marker"
            );
        }

        let log_probabilities = log_probabilities.reshape((batch_size, beam_size))?;
        Ok(BeamSearchOutput {
            predictions,
            log_probabilities,
            terminated,
        })
    }
}

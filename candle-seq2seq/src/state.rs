use candle::{DType, Result, Tensor};

use crate::rnn::CellState;

/// A state whose rows can be selected and reordered, as needed when beam search prunes or
/// duplicates hypotheses.
pub trait BeamState: Sized {
    /// Returns a new state made of the rows listed in `indexes` (a `u32` tensor), in order.
    fn reorder(&self, indexes: &Tensor) -> Result<Self>;
}

impl BeamState for Tensor {
    fn reorder(&self, indexes: &Tensor) -> Result<Self> {
        self.index_select(indexes, 0)
    }
}

/// Everything the step function needs besides the previous tokens.
///
/// Values are never mutated, every decoding step produces a new state.
#[derive(Debug, Clone)]
pub struct DecoderState {
    /// `(group, src_len, encoder_dim)`
    pub encoder_outputs: Tensor,
    /// `(group, src_len)`, non-zero at valid positions.
    pub source_mask: Tensor,
    pub cell: CellState,
}

impl DecoderState {
    pub fn group_size(&self) -> Result<usize> {
        self.source_mask.dim(0)
    }

    /// Same source side, new recurrent state.
    pub fn with_cell(&self, cell: CellState) -> Self {
        Self {
            encoder_outputs: self.encoder_outputs.clone(),
            source_mask: self.source_mask.clone(),
            cell,
        }
    }
}

impl BeamState for DecoderState {
    fn reorder(&self, indexes: &Tensor) -> Result<Self> {
        Ok(Self {
            encoder_outputs: self.encoder_outputs.index_select(indexes, 0)?,
            source_mask: self.source_mask.index_select(indexes, 0)?,
            cell: self.cell.index_select(indexes)?,
        })
    }
}

/// Number of valid positions of each row of a `(batch, len)` mask.
pub fn mask_lengths(mask: &Tensor) -> Result<Vec<u32>> {
    let _ = mask.dims2()?;
    let mask = mask.ne(&mask.zeros_like()?)?;
    mask.to_dtype(DType::U32)?.sum(1)?.to_vec1::<u32>()
}

/// The encoder output at the last valid position of each sequence.
///
/// `encoder_outputs` has shape `(batch, src_len, dim)` and `mask` `(batch, src_len)`, the
/// valid positions being a prefix of each row. Empty rows are rejected.
pub fn final_encoder_states(encoder_outputs: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (b_sz, src_len, dim) = encoder_outputs.dims3()?;
    let (m_b_sz, m_len) = mask.dims2()?;
    if (b_sz, src_len) != (m_b_sz, m_len) {
        candle::bail!(
            "source mask {:?} does not match encoder outputs {:?}",
            mask.shape(),
            encoder_outputs.shape()
        )
    }
    let lengths = mask_lengths(mask)?;
    let mut last_indexes = Vec::with_capacity(b_sz);
    for (row, &length) in lengths.iter().enumerate() {
        if length == 0 {
            candle::bail!("source sequence {row} has no valid position")
        }
        last_indexes.push(length - 1);
    }
    let last_indexes = Tensor::from_vec(last_indexes, (b_sz, 1, 1), encoder_outputs.device())?
        .broadcast_as((b_sz, 1, dim))?
        .contiguous()?;
    encoder_outputs
        .contiguous()?
        .gather(&last_indexes, 1)?
        .squeeze(1)
}

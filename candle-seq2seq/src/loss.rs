//! Masked sequence losses.
use candle::{DType, Result, Tensor, D};

/// How the masked per-token losses are reduced to a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossAverage {
    /// Sum over the unmasked positions of the whole batch divided by their count.
    #[default]
    Token,
    /// Mean over each sequence, then mean over the sequences with at least one valid
    /// position.
    Sequence,
}

/// The cross-entropy between a batch of logit sequences and target ids.
///
/// Arguments
///
/// * [logits]: The raw scores, of dimensions `B, T, C` where `C` is the number of classes.
/// * [targets]: The ground truth ids as a tensor of dimension `B, T`.
/// * [weights]: A `B, T` mask, masked positions do not contribute to the loss.
///
/// A batch where every position is masked yields NaN.
pub fn sequence_cross_entropy_with_logits(
    logits: &Tensor,
    targets: &Tensor,
    weights: &Tensor,
    average: LossAverage,
) -> Result<Tensor> {
    let (b_sz, seq_len, _) = logits.dims3()?;
    if targets.dims2()? != (b_sz, seq_len) {
        candle::bail!(
            "targets {:?} do not match logits {:?}",
            targets.shape(),
            logits.shape()
        )
    }
    if weights.dims2()? != (b_sz, seq_len) {
        candle::bail!(
            "weights {:?} do not match logits {:?}",
            weights.shape(),
            logits.shape()
        )
    }
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let targets = targets.to_dtype(DType::U32)?.contiguous()?.unsqueeze(2)?;
    let weights = weights.to_dtype(DType::F32)?;
    let nll = log_probs.gather(&targets, 2)?.squeeze(2)?.neg()?;
    let nll = (nll * &weights)?;
    match average {
        LossAverage::Token => nll.sum_all()? / weights.sum_all()?,
        LossAverage::Sequence => {
            let per_sequence = (nll.sum(1)? / (weights.sum(1)? + 1e-13)?)?;
            let non_empty = weights
                .sum(1)?
                .to_vec1::<f32>()?
                .into_iter()
                .filter(|&w| w > 0.)
                .count();
            per_sequence
                .sum_all()?
                .affine(1. / (non_empty as f64 + 1e-13), 0.)
        }
    }
}

/// Loss of a decoding loop fed with `targets[:, t]` at step `t`.
///
/// `logits` has shape `B, T, C` while `targets` and `target_mask` cover the full target
/// sequences, `B, T + 1`, including the leading start marker. The logits at step `t` are
/// scored against the token at position `t + 1`:
///
/// ```text
/// full sequence      <S> w1  w2  w3  <E> <P> <P>
/// full mask           1   1   1   1   1   0   0
/// logits              l1  l2  l3  l4  l5  l6
/// compared against    w1  w2  w3  <E> <P> <P>
/// with mask           1   1   1   1   0   0
/// ```
pub fn shifted_sequence_loss(
    logits: &Tensor,
    targets: &Tensor,
    target_mask: &Tensor,
    average: LossAverage,
) -> Result<Tensor> {
    let (_, num_steps, _) = logits.dims3()?;
    let (_, target_len) = targets.dims2()?;
    if target_len != num_steps + 1 {
        candle::bail!(
            "expected targets of length {} for {num_steps} decoding steps, got {target_len}",
            num_steps + 1
        )
    }
    let relevant_targets = targets.narrow(1, 1, num_steps)?;
    let relevant_mask = target_mask.narrow(1, 1, num_steps)?;
    sequence_cross_entropy_with_logits(logits, &relevant_targets, &relevant_mask, average)
}

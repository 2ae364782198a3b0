use candle::{DType, Device, IndexOp, Result, Tensor};
use candle_seq2seq::rnn::CellState;
use candle_seq2seq::state::{final_encoder_states, mask_lengths, BeamState, DecoderState};

#[test]
fn final_states_follow_the_mask() -> Result<()> {
    let cpu = Device::Cpu;
    let encoder_outputs = Tensor::arange(0f32, 12., &cpu)?.reshape((2, 3, 2))?;
    let mask = Tensor::new(&[[1u8, 1, 0], [1, 1, 1]], &cpu)?;
    assert_eq!(mask_lengths(&mask)?, [2, 3]);
    let last = final_encoder_states(&encoder_outputs, &mask)?;
    assert_eq!(last.to_vec2::<f32>()?, &[[2., 3.], [10., 11.]]);
    Ok(())
}

#[test]
fn final_states_reject_empty_sources() -> Result<()> {
    let cpu = Device::Cpu;
    let encoder_outputs = Tensor::zeros((2, 3, 2), DType::F32, &cpu)?;
    let mask = Tensor::new(&[[1u8, 1, 0], [0, 0, 0]], &cpu)?;
    assert!(final_encoder_states(&encoder_outputs, &mask).is_err());
    let mask = Tensor::new(&[[1u8, 1], [1, 0]], &cpu)?;
    assert!(final_encoder_states(&encoder_outputs, &mask).is_err());
    Ok(())
}

#[test]
fn reorder_decoder_state() -> Result<()> {
    let cpu = Device::Cpu;
    let encoder_outputs = Tensor::arange(0f32, 12., &cpu)?.reshape((2, 3, 2))?;
    let source_mask = Tensor::new(&[[1u8, 1, 0], [1, 1, 1]], &cpu)?;
    let h = Tensor::new(&[[1f32, 1.], [2., 2.]], &cpu)?;
    let cell = CellState::new(h.clone(), h.zeros_like()?)?;
    let state = DecoderState {
        encoder_outputs,
        source_mask,
        cell,
    };
    assert_eq!(state.group_size()?, 2);
    let state = state.reorder(&Tensor::new(&[1u32, 1, 0, 0], &cpu)?)?;
    assert_eq!(state.group_size()?, 4);
    assert_eq!(state.source_mask.to_vec2::<u8>()?[0], [1, 1, 1]);
    assert_eq!(state.source_mask.to_vec2::<u8>()?[3], [1, 1, 0]);
    assert_eq!(state.encoder_outputs.i(1)?.to_vec2::<f32>()?[0], [6., 7.]);
    assert_eq!(
        state.cell.h().to_vec2::<f32>()?,
        &[[2., 2.], [2., 2.], [1., 1.], [1., 1.]]
    );
    Ok(())
}

#[test]
fn cell_state_shapes_must_agree() -> Result<()> {
    let cpu = Device::Cpu;
    let h = Tensor::zeros((2, 3), DType::F32, &cpu)?;
    let c = Tensor::zeros((2, 4), DType::F32, &cpu)?;
    assert!(CellState::new(h, c).is_err());
    Ok(())
}

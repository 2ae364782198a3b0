use std::collections::HashMap;

use candle::{test_utils::to_vec2_round, DType, Device, Result, Tensor};
use candle_seq2seq::rnn::{recurrent_cell, LstmCell, RecurrentCell, StackedLstm};

fn layer_tensors(layer_idx: usize, in_dim: usize, cpu: &Device) -> Result<Vec<(String, Tensor)>> {
    let tensors = cell_tensors(layer_idx, in_dim, cpu)?;
    Ok(tensors
        .into_iter()
        .map(|(name, t)| (format!("{name}_l{layer_idx}"), t))
        .collect())
}

// The `layer_idx` only shifts the weight values so that layers differ.
fn cell_tensors(layer_idx: usize, in_dim: usize, cpu: &Device) -> Result<Vec<(String, Tensor)>> {
    let offset = (layer_idx * 100) as f32;
    let w_ih = Tensor::arange(offset, offset + (12 * in_dim) as f32, cpu)?
        .reshape((12, in_dim))?
        .cos()?;
    let w_hh = Tensor::arange(offset, offset + 36f32, cpu)?
        .reshape((12, 3))?
        .sin()?;
    let b_ih = Tensor::new(
        &[-1f32, 1., -0.5, 2., -1., 1., -0.5, 2., -1., 1., -0.5, 2.],
        cpu,
    )?;
    let b_hh = b_ih.cos()?;
    Ok(vec![
        ("weight_ih".to_string(), w_ih),
        ("weight_hh".to_string(), w_hh),
        ("bias_ih".to_string(), b_ih),
        ("bias_hh".to_string(), b_hh),
    ])
}

/* The following test can be verified against PyTorch using the following snippet.
import torch
from torch import nn
lstm = nn.LSTMCell(2, 3)
lstm.weight_ih = torch.nn.Parameter(torch.arange(0., 24.).reshape(12, 2).cos())
lstm.weight_hh = torch.nn.Parameter(torch.arange(0., 36.).reshape(12, 3).sin())
lstm.bias_ih = torch.nn.Parameter(torch.tensor([-1., 1., -0.5, 2, -1, 1, -0.5, 2, -1, 1, -0.5, 2]))
lstm.bias_hh = torch.nn.Parameter(torch.tensor([-1., 1., -0.5, 2, -1, 1, -0.5, 2, -1, 1, -0.5, 2]).cos())
state = torch.zeros((1, 3)), torch.zeros((1, 3))
for inp in [3., 1., 4., 1., 5., 9., 2.]:
    inp = torch.tensor([[inp, inp * 0.5]])
    state = lstm(inp, state)
print(state)
# (tensor([[ 0.9919,  0.1738, -0.1451]], grad_fn=...), tensor([[ 5.7250,  0.4458, -0.2908]], grad_fn=...))
*/
#[test]
fn lstm_cell() -> Result<()> {
    let cpu = &Device::Cpu;
    let tensors: HashMap<_, _> = cell_tensors(0, 2, cpu)?.into_iter().collect();
    let vb = candle_nn::VarBuilder::from_tensors(tensors, DType::F32, cpu);
    let lstm = LstmCell::load(2, 3, vb)?;
    assert_eq!(lstm.hidden_dim(), 3);
    let mut state = lstm.initial_state(&Tensor::zeros((1, 3), DType::F32, cpu)?)?;
    for inp in [3f32, 1., 4., 1., 5., 9., 2.] {
        let inp = Tensor::new(&[[inp, inp * 0.5]], cpu)?;
        state = lstm.advance(&inp, &state)?
    }
    assert_eq!(to_vec2_round(state.h(), 4)?, &[[0.9919, 0.1738, -0.1451]]);
    assert_eq!(to_vec2_round(state.c(), 4)?, &[[5.725, 0.4458, -0.2908]]);
    assert_eq!(
        to_vec2_round(&lstm.output(&state)?, 4)?,
        &[[0.9919, 0.1738, -0.1451]]
    );
    Ok(())
}

#[test]
fn initial_state_has_zero_cell() -> Result<()> {
    let cpu = &Device::Cpu;
    let tensors: HashMap<_, _> = cell_tensors(0, 2, cpu)?.into_iter().collect();
    let vb = candle_nn::VarBuilder::from_tensors(tensors, DType::F32, cpu);
    let lstm = LstmCell::load(2, 3, vb)?;
    let init = Tensor::new(&[[0.5f32, -1., 2.], [1., 1., 1.]], cpu)?;
    let state = lstm.initial_state(&init)?;
    assert_eq!(state.h().to_vec2::<f32>()?, init.to_vec2::<f32>()?);
    assert_eq!(state.c().to_vec2::<f32>()?, vec![vec![0f32; 3]; 2]);
    Ok(())
}

#[test]
fn stacked_lstm_chains_layers() -> Result<()> {
    let cpu = &Device::Cpu;
    let mut tensors = layer_tensors(0, 2, cpu)?;
    tensors.extend(layer_tensors(1, 3, cpu)?);
    let tensors: HashMap<_, _> = tensors.into_iter().collect();
    let vb = candle_nn::VarBuilder::from_tensors(tensors, DType::F32, cpu);

    let stacked = StackedLstm::load(2, 3, 2, vb.clone())?;
    assert_eq!(stacked.num_layers(), 2);
    let bottom = LstmCell::load_layer(2, 3, 0, vb.clone())?;
    let top = LstmCell::load_layer(3, 3, 1, vb)?;

    let init = Tensor::new(&[[0.1f32, -0.2, 0.3]], cpu)?;
    let mut stacked_state = stacked.initial_state(&init)?;
    assert_eq!(stacked_state.h().dims(), &[2, 1, 3]);
    let mut bottom_state = bottom.initial_state(&init)?;
    let mut top_state = top.initial_state(&init)?;
    for inp in [3f32, 1., 4., 1., 5.] {
        let inp = Tensor::new(&[[inp, inp * 0.5]], cpu)?;
        stacked_state = stacked.advance(&inp, &stacked_state)?;
        bottom_state = bottom.advance(&inp, &bottom_state)?;
        top_state = top.advance(bottom_state.h(), &top_state)?;
    }
    assert_eq!(
        to_vec2_round(&stacked_state.h().get(0)?, 4)?,
        to_vec2_round(bottom_state.h(), 4)?
    );
    assert_eq!(
        to_vec2_round(&stacked_state.c().get(1)?, 4)?,
        to_vec2_round(top_state.c(), 4)?
    );
    assert_eq!(
        to_vec2_round(&stacked.output(&stacked_state)?, 4)?,
        to_vec2_round(top_state.h(), 4)?
    );
    Ok(())
}

#[test]
fn cell_state_selects_batch_rows() -> Result<()> {
    let cpu = &Device::Cpu;
    let varmap = candle_nn::VarMap::new();
    let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, cpu);
    let cell = recurrent_cell(2, 3, 2, vb)?;
    let init = Tensor::new(&[[1f32, 1., 1.], [2., 2., 2.]], cpu)?;
    let state = cell.initial_state(&init)?;
    assert_eq!(state.batch_dim(), 1);
    let state = state.index_select(&Tensor::new(&[1u32, 1, 0], cpu)?)?;
    assert_eq!(state.h().dims(), &[2, 3, 3]);
    assert_eq!(
        state.h().get(1)?.to_vec2::<f32>()?,
        &[[2., 2., 2.], [2., 2., 2.], [1., 1., 1.]]
    );
    Ok(())
}

#[test]
fn recurrent_cell_rejects_zero_layers() -> Result<()> {
    let varmap = candle_nn::VarMap::new();
    let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    assert!(recurrent_cell(2, 3, 0, vb).is_err());
    Ok(())
}

#[test]
fn single_layer_uses_lstm_cell_names() -> Result<()> {
    let cpu = &Device::Cpu;
    let tensors: HashMap<_, _> = cell_tensors(0, 2, cpu)?.into_iter().collect();
    let vb = candle_nn::VarBuilder::from_tensors(tensors, DType::F32, cpu);
    let cell = recurrent_cell(2, 3, 1, vb.clone())?;
    let state = cell.initial_state(&Tensor::zeros((1, 3), DType::F32, cpu)?)?;
    let state = cell.advance(&Tensor::new(&[[3f32, 1.5]], cpu)?, &state)?;
    assert_eq!(state.h().dims(), &[1, 3]);
    // The stacked naming is not accepted for a single cell.
    let tensors: HashMap<_, _> = layer_tensors(0, 2, cpu)?.into_iter().collect();
    let vb = candle_nn::VarBuilder::from_tensors(tensors, DType::F32, cpu);
    assert!(recurrent_cell(2, 3, 1, vb).is_err());
    Ok(())
}

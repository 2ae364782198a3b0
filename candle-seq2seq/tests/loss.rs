use candle::test_utils::to_vec0_round;
use candle::{Device, Result, Tensor};
use candle_seq2seq::loss::{sequence_cross_entropy_with_logits, shifted_sequence_loss, LossAverage};

fn logits(cpu: &Device) -> Result<Tensor> {
    Tensor::new(
        &[[
            [1.1050f32, 0.3013, -1.5394, -2.1528, -0.8634],
            [1.0730, -0.9419, -0.1670, -0.6582, 0.5061],
            [0.8318, 1.1154, -0.3610, 0.5351, 1.0830],
        ]],
        cpu,
    )
}

/* Equivalent python code:
import torch
import torch.nn.functional as F
input = torch.tensor([
    [ 1.1050,  0.3013, -1.5394, -2.1528, -0.8634],
    [ 1.0730, -0.9419, -0.1670, -0.6582,  0.5061],
    [ 0.8318,  1.1154, -0.3610,  0.5351,  1.0830]])

target = torch.tensor([1, 0, 4])
print(F.cross_entropy(input, target))
# tensor(1.1312)
print(F.cross_entropy(input[:2], target[:2]))
# tensor(1.0529)
*/
#[test]
fn shifted_loss_skips_start_marker() -> Result<()> {
    let cpu = Device::Cpu;
    let logits = logits(&cpu)?;
    let targets = Tensor::new(&[[2u32, 1, 0, 4]], &cpu)?;
    let mask = Tensor::new(&[[1u8, 1, 1, 1]], &cpu)?;
    let loss = shifted_sequence_loss(&logits, &targets, &mask, LossAverage::Token)?;
    assert_eq!(to_vec0_round(&loss, 4)?, 1.1312);

    // The last position is padding.
    let mask = Tensor::new(&[[1u8, 1, 1, 0]], &cpu)?;
    let loss = shifted_sequence_loss(&logits, &targets, &mask, LossAverage::Token)?;
    assert_eq!(to_vec0_round(&loss, 4)?, 1.0529);
    Ok(())
}

#[test]
fn shifted_loss_checks_lengths() -> Result<()> {
    let cpu = Device::Cpu;
    let logits = logits(&cpu)?;
    let targets = Tensor::new(&[[1u32, 0, 4]], &cpu)?;
    let mask = Tensor::new(&[[1u8, 1, 1]], &cpu)?;
    assert!(shifted_sequence_loss(&logits, &targets, &mask, LossAverage::Token).is_err());
    Ok(())
}

#[test]
fn token_and_sequence_averages() -> Result<()> {
    let cpu = Device::Cpu;
    let logits = Tensor::cat(&[logits(&cpu)?, logits(&cpu)?], 0)?;
    let targets = Tensor::new(&[[1u32, 0, 4], [1, 0, 4]], &cpu)?;
    let weights = Tensor::new(&[[1f32, 1., 1.], [1., 1., 0.]], &cpu)?;
    // Five valid tokens in total.
    let loss = sequence_cross_entropy_with_logits(&logits, &targets, &weights, LossAverage::Token)?;
    assert_eq!(to_vec0_round(&loss, 4)?, 1.0999);
    // Mean of 1.1312 and 1.0529.
    let loss =
        sequence_cross_entropy_with_logits(&logits, &targets, &weights, LossAverage::Sequence)?;
    assert_eq!(to_vec0_round(&loss, 4)?, 1.0921);
    Ok(())
}

#[test]
fn sequence_average_ignores_empty_sequences() -> Result<()> {
    let cpu = Device::Cpu;
    let logits = Tensor::cat(&[logits(&cpu)?, logits(&cpu)?], 0)?;
    let targets = Tensor::new(&[[1u32, 0, 4], [3, 3, 3]], &cpu)?;
    let weights = Tensor::new(&[[1f32, 1., 1.], [0., 0., 0.]], &cpu)?;
    let loss =
        sequence_cross_entropy_with_logits(&logits, &targets, &weights, LossAverage::Sequence)?;
    assert_eq!(to_vec0_round(&loss, 4)?, 1.1312);
    Ok(())
}

#[test]
fn fully_masked_token_loss_is_nan() -> Result<()> {
    let cpu = Device::Cpu;
    let logits = logits(&cpu)?;
    let targets = Tensor::new(&[[1u32, 0, 4]], &cpu)?;
    let weights = Tensor::zeros((1, 3), candle::DType::F32, &cpu)?;
    let loss = sequence_cross_entropy_with_logits(&logits, &targets, &weights, LossAverage::Token)?;
    assert!(loss.to_scalar::<f32>()?.is_nan());
    Ok(())
}

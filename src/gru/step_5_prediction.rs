// External imports
use anyhow::{anyhow, bail, Context, Result};
use burn::tensor::{backend::Backend, Tensor};

// Internal imports
use super::step_1_tensor_preparation::sequences_to_tensor;
use super::step_3_feedforward_gru::{FeedForwardGru, RecurrentState, StepInput};

fn tensor_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("Failed to read tensor data: {:?}", e))
}

/// Run the layer over variable-length sequences
///
/// # Arguments
///
/// * `model` - Built layer
/// * `sequences` - Batch of sequences of feature vectors; lengths may differ
/// * `device` - Device to place tensors on
///
/// # Returns
///
/// For every sequence, one published output vector per input step in
/// processing order (padding steps are dropped)
pub fn predict_sequence<B: Backend>(
    model: &FeedForwardGru<B>,
    sequences: &[Vec<Vec<f32>>],
    device: &B::Device,
) -> Result<Vec<Vec<Vec<f32>>>> {
    let (x, mask) = sequences_to_tensor::<B>(sequences, device)?;
    let [_, max_time, _] = x.dims();
    let output_dim = model.output_dim();

    let outputs = model
        .forward_sequence(x, Some(mask))
        .context("Forward pass failed during prediction")?;
    let values = tensor_values(outputs)?;

    // Outputs are in processing order; backwards layers see the padding first
    let go_backwards = model.config().go_backwards;
    let per_sequence = max_time * output_dim;
    let predictions = sequences
        .iter()
        .zip(values.chunks(per_sequence))
        .map(|(seq, chunk)| {
            let skip = if go_backwards { max_time - seq.len() } else { 0 };
            chunk
                .chunks(output_dim)
                .skip(skip)
                .take(seq.len())
                .map(<[f32]>::to_vec)
                .collect()
        })
        .collect();

    Ok(predictions)
}

/// Last published output of every sequence, `[batch][output_dim]`
pub fn predict_last<B: Backend>(model: &FeedForwardGru<B>, x: Tensor<B, 3>) -> Result<Vec<Vec<f32>>> {
    let (_, state) = model
        .forward_sequence_with_state(x, None, None)
        .context("Forward pass failed during prediction")?;
    let output_dim = model.output_dim();
    let values = tensor_values(state.previous_output)?;
    Ok(values.chunks(output_dim).map(<[f32]>::to_vec).collect())
}

/// Continue a sequence for `horizon` steps without further input
///
/// Each step is driven only by the previous published output, so the
/// layer must take [`StepInput::PreviousOutput`].
///
/// # Returns
///
/// The generated outputs `[batch, horizon, output_dim]` and the final state
pub fn forecast<B: Backend>(
    model: &FeedForwardGru<B>,
    state: RecurrentState<B>,
    horizon: usize,
) -> Result<(Tensor<B, 3>, RecurrentState<B>)> {
    if model.config().step_input != StepInput::PreviousOutput {
        bail!("Free-running forecasts need a layer that only reads its previous output");
    }
    if horizon == 0 {
        bail!("Forecast horizon must be positive");
    }
    let device = state.hidden.device();
    let drive = Tensor::zeros([state.batch_size(), horizon, model.input_dim()], &device);
    let (outputs, state) = model
        .forward_sequence_with_state(drive, None, Some(state))
        .context("Forward pass failed during forecast")?;
    Ok((outputs, state))
}

/// Run `history` through the layer, then forecast `horizon` further steps
/// from the resulting state.
pub fn warm_up_and_forecast<B: Backend>(
    model: &FeedForwardGru<B>,
    history: Tensor<B, 3>,
    horizon: usize,
) -> Result<Tensor<B, 3>> {
    let (_, state) = model
        .forward_sequence_with_state(history, None, None)
        .context("Forward pass failed while warming up")?;
    let (outputs, _) = forecast(model, state, horizon)?;
    Ok(outputs)
}

// External imports
use anyhow::{anyhow, bail, Result};
use burn::tensor::backend::Backend;
use burn::tensor::{Bool, Shape, Tensor, TensorData};
use ndarray::Array3;
use rayon::prelude::*;

// Internal imports
use crate::error::{GruError, GruResult};

/// Checks that `x` is a `[batch, time, features]` tensor with the feature
/// count the layer was built for.
///
/// # Returns
///
/// The validated `[batch, time, features]` dimensions
pub fn validate_input<B: Backend>(x: &Tensor<B, 3>, input_dim: usize) -> GruResult<[usize; 3]> {
    let [batch, time, features] = x.dims();
    if batch == 0 {
        return Err(GruError::InvalidInputShape(vec![batch, time, features]));
    }
    if time == 0 {
        return Err(GruError::EmptySequence);
    }
    if features != input_dim {
        return Err(GruError::FeatureMismatch {
            expected: input_dim,
            actual: features,
        });
    }
    Ok([batch, time, features])
}

/// Checks that a step mask covers exactly the `[batch, time]` plane of the input.
pub fn validate_mask<B: Backend>(
    mask: &Tensor<B, 2, Bool>,
    batch: usize,
    time: usize,
) -> GruResult<()> {
    let actual = mask.dims();
    if actual != [batch, time] {
        return Err(GruError::MaskMismatch {
            expected: [batch, time],
            actual,
        });
    }
    Ok(())
}

/// Builds a `[batch, max_time]` mask that is `true` for the first
/// `lengths[i]` steps of row `i`.
pub fn sequence_mask<B: Backend>(
    lengths: &[usize],
    max_time: usize,
    device: &B::Device,
) -> Tensor<B, 2, Bool> {
    let values: Vec<bool> = lengths
        .iter()
        .flat_map(|&len| (0..max_time).map(move |t| t < len))
        .collect();
    let data = TensorData::new(values, Shape::new([lengths.len(), max_time]));
    Tensor::<B, 2, Bool>::from_data(data, device)
}

/// Pads variable-length sequences into a dense batch
///
/// Every sequence is a list of time steps, every time step a feature vector.
/// Shorter sequences are zero-padded at the end.
///
/// # Arguments
///
/// * `sequences` - Batch of sequences, all with the same feature count
/// * `device` - Device to allocate tensors on
///
/// # Returns
///
/// The padded `[batch, max_time, features]` tensor and the matching step mask
pub fn sequences_to_tensor<B: Backend>(
    sequences: &[Vec<Vec<f32>>],
    device: &B::Device,
) -> GruResult<(Tensor<B, 3>, Tensor<B, 2, Bool>)> {
    let max_time = sequences.iter().map(Vec::len).max().unwrap_or(0);
    if sequences.is_empty() || max_time == 0 {
        return Err(GruError::EmptySequence);
    }
    let features = sequences
        .iter()
        .find_map(|seq| seq.first().map(Vec::len))
        .unwrap_or(0);

    if let Some(bad) = sequences
        .iter()
        .flatten()
        .map(Vec::len)
        .find(|&len| len != features)
    {
        return Err(GruError::FeatureMismatch {
            expected: features,
            actual: bad,
        });
    }

    let rows: Vec<Vec<f32>> = sequences
        .par_iter()
        .map(|seq| {
            let mut row = vec![0.0f32; max_time * features];
            for (t, step) in seq.iter().enumerate() {
                row[t * features..(t + 1) * features].copy_from_slice(step);
            }
            row
        })
        .collect();

    let batch = sequences.len();
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    let data = TensorData::new(flat, Shape::new([batch, max_time, features]));
    let tensor = Tensor::<B, 3>::from_data(data, device);

    let lengths: Vec<usize> = sequences.iter().map(Vec::len).collect();
    let mask = sequence_mask::<B>(&lengths, max_time, device);

    Ok((tensor, mask))
}

/// Converts a host-side `[batch, time, features]` array into a tensor.
pub fn array_to_tensor<B: Backend>(array: &Array3<f32>, device: &B::Device) -> Tensor<B, 3> {
    let (batch, time, features) = array.dim();
    let values: Vec<f32> = array.iter().copied().collect();
    let data = TensorData::new(values, Shape::new([batch, time, features]));
    Tensor::<B, 3>::from_data(data, device)
}

/// Copies a `[batch, time, features]` tensor back into an `ndarray` array.
pub fn tensor_to_array<B: Backend>(tensor: Tensor<B, 3>) -> Result<Array3<f32>> {
    let [batch, time, features] = tensor.dims();
    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("Failed to read tensor data: {:?}", e))?;
    let array = Array3::from_shape_vec((batch, time, features), values)?;
    Ok(array)
}

/// Splits a batch along its first dimension into training and validation parts
///
/// # Arguments
///
/// * `data` - Tensor whose first dimension indexes samples
/// * `validation_split` - Ratio of samples to hold out (0.0 to 1.0)
///
/// # Returns
///
/// Returns a tuple of (training_data, validation_data); the validation part
/// is `None` when the split leaves no samples for it
pub fn split_data<B: Backend, const D: usize>(
    data: Tensor<B, D>,
    validation_split: f64,
) -> Result<(Tensor<B, D>, Option<Tensor<B, D>>)> {
    if !(0.0..1.0).contains(&validation_split) {
        bail!("Validation split must be in [0.0, 1.0), got {}", validation_split);
    }
    let n_samples = data.dims()[0];
    if n_samples == 0 {
        bail!("Cannot split an empty batch");
    }

    let val_size = (n_samples as f64 * validation_split).round() as usize;
    let train_size = n_samples - val_size;
    if train_size == 0 {
        bail!("Validation split {} leaves no training samples", validation_split);
    }

    let train = data.clone().narrow(0, 0, train_size);
    let val = (val_size > 0).then(|| data.narrow(0, train_size, val_size));
    Ok((train, val))
}

// External imports
use anyhow::{bail, Context, Result};
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Int, Shape, Tensor, TensorData};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::PathBuf;

// Internal imports
use super::step_1_tensor_preparation::split_data;
use super::step_3_feedforward_gru::FeedForwardGru;
use super::step_6_model_serialization::save_model_checkpoint;
use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_EPOCHS, DEFAULT_LEARNING_RATE, MODEL_FILE_NAME,
    VALIDATION_SPLIT_RATIO,
};

/// Configuration for training the layer
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub epochs: usize,
    pub validation_split: f64,
    pub patience: usize,
    pub min_delta: f64,
    pub shuffle: bool,
    /// Seeds batch shuffling; `None` draws a fresh seed
    pub seed: Option<u64>,
    /// Directory for periodic checkpoints; `None` disables them
    pub checkpoint_dir: Option<PathBuf>,
    pub checkpoint_epochs: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: DEFAULT_LEARNING_RATE,
            batch_size: DEFAULT_BATCH_SIZE,
            epochs: DEFAULT_EPOCHS,
            validation_split: VALIDATION_SPLIT_RATIO,
            patience: 5,      // Early stopping patience
            min_delta: 1e-5,  // Minimum improvement threshold
            shuffle: true,
            seed: None,
            checkpoint_dir: None,
            checkpoint_epochs: 10,
        }
    }
}

/// Loss curves and early-stopping outcome of a training run
#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    pub loss_history: Vec<f64>,
    pub validation_history: Vec<f64>,
    pub best_validation_rmse: Option<f64>,
    pub epochs_run: usize,
    pub stopped_early: bool,
}

/// Mean squared error over every element
pub fn mse_loss<B: Backend, const D: usize>(
    predictions: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> Tensor<B, 1> {
    let diff = predictions - targets;
    (diff.clone() * diff).mean()
}

/// Splits `[0, num_samples)` into index batches, shuffled when `rng` is given.
fn batch_indices(num_samples: usize, batch_size: usize, rng: Option<&mut StdRng>) -> Vec<Vec<i32>> {
    let mut indices: Vec<i32> = (0..num_samples as i32).collect();
    if let Some(rng) = rng {
        indices.shuffle(rng);
    }
    indices
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Train the layer to reproduce `targets` from `features`
///
/// Every published output is supervised: `targets` has shape
/// `[batch, time, output_dim]`.
///
/// # Arguments
///
/// * `model` - A built layer on an autodiff backend
/// * `features` - Input sequences `[batch, time, input_dim]`
/// * `targets` - Expected outputs `[batch, time, output_dim]`
/// * `config` - Optimizer, batching and early-stopping settings
///
/// # Returns
///
/// The best model seen (by validation RMSE when a validation split exists,
/// training loss otherwise) and the training report
pub fn train_model<B: AutodiffBackend>(
    mut model: FeedForwardGru<B>,
    features: Tensor<B, 3>,
    targets: Tensor<B, 3>,
    config: &TrainingConfig,
) -> Result<(FeedForwardGru<B>, TrainingReport)> {
    let [batch, time, _] = features.dims();
    let expected_targets = [batch, time, model.output_dim()];
    if targets.dims() != expected_targets {
        bail!(
            "Targets have shape {:?}, expected {:?}",
            targets.dims(),
            expected_targets
        );
    }
    let device = features.device();

    let (train_features, val_features) = split_data(features, config.validation_split)?;
    let (train_targets, val_targets) = split_data(targets, config.validation_split)?;
    let validation = val_features.zip(val_targets);
    let num_samples = train_features.dims()[0];

    info!(
        "Starting training: {} training sequences, {} validation sequences, {} epochs",
        num_samples,
        validation.as_ref().map_or(0, |(f, _)| f.dims()[0]),
        config.epochs
    );

    let mut rng = StdRng::seed_from_u64(config.seed.unwrap_or_else(rand::random));
    let mut optimizer = AdamConfig::new().init::<B, FeedForwardGru<B>>();

    let mut report = TrainingReport::default();
    let mut best_model = model.clone();
    let mut best_score = f64::INFINITY;
    let mut epochs_no_improve = 0;

    for epoch in 1..=config.epochs {
        let batches = batch_indices(num_samples, config.batch_size, config.shuffle.then_some(&mut rng));

        let mut epoch_loss = 0.0;
        for indices in &batches {
            let indices_data = TensorData::new(indices.clone(), Shape::new([indices.len()]));
            let indices_tensor = Tensor::<B, 1, Int>::from_data(indices_data, &device);
            let batch_features = train_features.clone().select(0, indices_tensor.clone());
            let batch_targets = train_targets.clone().select(0, indices_tensor);

            // Forward pass
            let predictions = model
                .forward_sequence(batch_features, None)
                .context("Forward pass failed")?;
            let loss = mse_loss(predictions, batch_targets);
            epoch_loss += loss.clone().into_scalar().elem::<f64>();

            // Backward pass and optimizer step
            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(config.learning_rate, model, grads);
        }
        let avg_loss = epoch_loss / batches.len() as f64;
        report.loss_history.push(avg_loss);
        report.epochs_run = epoch;

        let score = match &validation {
            Some((val_features, val_targets)) => {
                let val_rmse = evaluate_model(
                    &model.valid(),
                    val_features.clone().inner(),
                    val_targets.clone().inner(),
                )?;
                report.validation_history.push(val_rmse);
                debug!("Epoch {} - loss {:.6}, validation RMSE {:.6}", epoch, avg_loss, val_rmse);
                val_rmse
            }
            None => {
                debug!("Epoch {} - loss {:.6}", epoch, avg_loss);
                avg_loss
            }
        };

        // Early stopping logic
        if best_score - score > config.min_delta {
            best_score = score;
            best_model = model.clone();
            epochs_no_improve = 0;
        } else {
            epochs_no_improve += 1;
            if epochs_no_improve >= config.patience {
                info!("Early stopping triggered at epoch {} (best score {:.6})", epoch, best_score);
                report.stopped_early = true;
                break;
            }
        }

        if let Some(dir) = &config.checkpoint_dir {
            if config.checkpoint_epochs > 0 && epoch % config.checkpoint_epochs == 0 {
                save_model_checkpoint(&model, dir, MODEL_FILE_NAME, epoch)?;
            }
        }
    }

    if validation.is_some() && best_score.is_finite() {
        report.best_validation_rmse = Some(best_score);
    }
    info!(
        "Training completed after {} epochs (final loss {:.6})",
        report.epochs_run,
        report.loss_history.last().copied().unwrap_or(f64::NAN)
    );

    Ok((best_model, report))
}

/// Root mean squared error of the layer's output sequence against `targets`
pub fn evaluate_model<B: Backend>(
    model: &FeedForwardGru<B>,
    features: Tensor<B, 3>,
    targets: Tensor<B, 3>,
) -> Result<f64> {
    let predictions = model
        .forward_sequence(features, None)
        .context("Forward pass failed during evaluation")?;
    if predictions.dims() != targets.dims() {
        bail!(
            "Predictions have shape {:?} but targets have shape {:?}",
            predictions.dims(),
            targets.dims()
        );
    }
    let mse = mse_loss(predictions, targets).into_scalar().elem::<f64>();
    Ok(mse.sqrt())
}

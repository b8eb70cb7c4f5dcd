// External crates
use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::tensor::Tensor;
use burn_ndarray::{NdArray, NdArrayDevice};
use ndarray::Array3;
use std::env;
use std::path::Path;
use std::time::Instant;

// Local modules
use feedforward_gru::constants::{
    DEFAULT_HIDDEN_DIM, DEFAULT_OUTPUT_DIM, MODEL_FILE_NAME, MODEL_PATH,
};
use feedforward_gru::gru::step_1_tensor_preparation::array_to_tensor;
use feedforward_gru::gru::step_4_train_model::{evaluate_model, train_model, TrainingConfig};
use feedforward_gru::gru::step_5_prediction::predict_sequence;
use feedforward_gru::gru::step_6_model_serialization::save_model;
use feedforward_gru::util::model_logger::{create_experiment_dir, ModelExperiment};
use feedforward_gru::{FeedForwardGruConfig, StepInput};

type TrainBackend = Autodiff<NdArray<f32>>;

const SEQUENCE_LENGTH: usize = 20;
const NUM_SEQUENCES: usize = 64;
const STEP: f32 = 0.3;

/// Sine waves with random phases; the target at every step is the next value.
fn sine_dataset(device: &NdArrayDevice) -> (Tensor<TrainBackend, 3>, Tensor<TrainBackend, 3>) {
    let phases: Vec<f32> = (0..NUM_SEQUENCES).map(|_| rand::random::<f32>() * std::f32::consts::TAU).collect();
    let features = Array3::from_shape_fn((NUM_SEQUENCES, SEQUENCE_LENGTH, 1), |(b, t, _)| {
        (phases[b] + t as f32 * STEP).sin()
    });
    let targets = Array3::from_shape_fn(
        (NUM_SEQUENCES, SEQUENCE_LENGTH, DEFAULT_OUTPUT_DIM),
        |(b, t, _)| (phases[b] + (t + 1) as f32 * STEP).sin(),
    );
    (
        array_to_tensor::<TrainBackend>(&features, device),
        array_to_tensor::<TrainBackend>(&targets, device),
    )
}

fn main() -> Result<()> {
    // Accept hidden size and epoch count as command-line arguments
    let args: Vec<String> = env::args().collect();
    let hidden_dim = match args.get(1) {
        Some(arg) => arg.parse().context("hidden_dim must be a positive integer")?,
        None => DEFAULT_HIDDEN_DIM,
    };
    let epochs = match args.get(2) {
        Some(arg) => arg.parse().context("epochs must be a positive integer")?,
        None => 30,
    };
    println!("Using hidden_dim: {} | epochs: {}", hidden_dim, epochs);

    let device = NdArrayDevice::Cpu;
    let (features, targets) = sine_dataset(&device);

    let model = FeedForwardGruConfig::new(hidden_dim, DEFAULT_OUTPUT_DIM)
        .with_step_input(StepInput::Concatenated)
        .with_return_sequences(true)
        .build::<TrainBackend>(&features.dims(), &device)?;

    let training_config = TrainingConfig {
        epochs,
        ..TrainingConfig::default()
    };
    let mut experiment = ModelExperiment::new(
        "feedforward_gru",
        model.input_dim(),
        hidden_dim,
        model.output_dim(),
        epochs,
        training_config.batch_size,
        training_config.learning_rate,
    );

    let started = Instant::now();
    let (trained, report) = train_model(model, features.clone(), targets.clone(), &training_config)?;
    experiment.set_training_time(started.elapsed().as_secs_f64());

    let train_rmse = evaluate_model(&trained, features, targets)?;
    experiment.set_train_rmse(train_rmse);
    if let Some(val_rmse) = report.best_validation_rmse {
        experiment.set_validation_rmse(val_rmse);
    }
    if report.stopped_early {
        experiment.add_note(&format!("stopped early after {} epochs", report.epochs_run));
    }
    println!("Training RMSE: {:.4}", train_rmse);

    let model_path = save_model(
        &trained,
        &Path::new(MODEL_PATH).join(MODEL_FILE_NAME),
        "next-value sine predictor",
    )?;
    println!("Model saved at: {}", model_path.display());

    let experiment_path = experiment.save(&create_experiment_dir(Path::new("experiments"))?)?;
    println!("Experiment recorded at: {}", experiment_path.display());

    // Predict one fresh wave with the inference model
    let inference = trained.valid();
    let wave: Vec<Vec<f32>> = (0..SEQUENCE_LENGTH)
        .map(|t| vec![(t as f32 * STEP).sin()])
        .collect();
    let predictions = predict_sequence(&inference, &[wave.clone()], &device)?;
    for (t, (input, output)) in wave.iter().zip(predictions[0].iter()).enumerate() {
        println!(
            "t={:2} input {:+.3} -> predicted next {:+.3} (true {:+.3})",
            t,
            input[0],
            output[0],
            ((t + 1) as f32 * STEP).sin()
        );
    }

    Ok(())
}

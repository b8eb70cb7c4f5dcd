// External imports
use burn::backend::Autodiff;
use burn::module::Module;
use burn::nn::Initializer;
use burn::tensor::{Bool, Shape, Tensor, TensorData};
use burn_ndarray::{NdArray, NdArrayDevice};
use std::collections::HashSet;

// Internal imports
use crate::error::GruError;
use crate::gru::step_1_tensor_preparation::sequence_mask;
use crate::gru::step_2_gru_cell::Activation;
use crate::gru::step_3_feedforward_gru::{FeedForwardGruConfig, LayerOutput, StepInput};

type TestBackend = NdArray<f32>;

fn values<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
    tensor.into_data().to_vec::<f32>().unwrap()
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert!((a - e).abs() < 1e-5, "got {a}, expected {e}");
    }
}

/// `[batch, time, features]` input whose values change along every axis
fn ramp_input(batch: usize, time: usize, features: usize) -> Vec<f32> {
    (0..batch * time * features)
        .map(|i| ((i % 7) as f32 - 3.0) * 0.25)
        .collect()
}

fn tensor3(values: Vec<f32>, shape: [usize; 3]) -> Tensor<TestBackend, 3> {
    Tensor::from_data(TensorData::new(values, Shape::new(shape)), &NdArrayDevice::Cpu)
}

#[test]
fn test_build_allocates_projection_weights() {
    let device = NdArrayDevice::Cpu;
    let layer = FeedForwardGruConfig::new(5, 3)
        .build::<TestBackend>(&[2, 4, 7], &device)
        .unwrap();

    assert_eq!(layer.w_y().dims(), [5, 3], "W_y is [hidden_dim, output_dim]");
    assert_eq!(layer.b_y().dims(), [3], "b_y is [output_dim]");
    assert!(values(layer.b_y()).iter().all(|v| *v == 0.0), "b_y starts at zero");
    assert_eq!(layer.input_dim(), 7);
}

#[test]
fn test_projection_weights_are_trainable_exactly_once() {
    let device = NdArrayDevice::Cpu;
    let layer = FeedForwardGruConfig::new(5, 3)
        .with_name(Some("ffgru".to_string()))
        .build::<TestBackend>(&[0, 0, 7], &device)
        .unwrap();

    let weights = layer.trainable_weights();
    let count = |name: &str| weights.iter().filter(|w| w.name == name).count();
    assert_eq!(count("ffgru_W_y"), 1);
    assert_eq!(count("ffgru_b_y"), 1);

    let w_y = weights.iter().find(|w| w.name == "ffgru_W_y").unwrap();
    let b_y = weights.iter().find(|w| w.name == "ffgru_b_y").unwrap();
    assert_eq!(w_y.shape, vec![5, 3]);
    assert_eq!(b_y.shape, vec![3]);

    let ids: HashSet<_> = weights.iter().map(|w| w.id).collect();
    assert_eq!(ids.len(), weights.len(), "no parameter is listed twice");

    // The listing covers every parameter the module owns
    let listed: usize = weights.iter().map(|w| w.shape.iter().product::<usize>()).sum();
    assert_eq!(listed, layer.num_params());
}

#[test]
fn test_concatenated_mode_adds_input_kernel() {
    let device = NdArrayDevice::Cpu;
    let layer = FeedForwardGruConfig::new(4, 2)
        .with_step_input(StepInput::Concatenated)
        .build::<TestBackend>(&[0, 0, 3], &device)
        .unwrap();

    let weights = layer.trainable_weights();
    let input_kernel = weights
        .iter()
        .find(|w| w.name == "feedforward_gru_W_x")
        .expect("input kernel is listed");
    assert_eq!(input_kernel.shape, vec![3, 12]);

    let listed: usize = weights.iter().map(|w| w.shape.iter().product::<usize>()).sum();
    assert_eq!(listed, layer.num_params());
}

#[test]
fn test_rebuilding_yields_identical_shapes() {
    let device = NdArrayDevice::Cpu;
    let config = FeedForwardGruConfig::new(6, 2);
    let first = config.build::<TestBackend>(&[1, 3, 4], &device).unwrap();
    let second = config.build::<TestBackend>(&[1, 3, 4], &device).unwrap();

    let shapes = |layer: &crate::gru::step_3_feedforward_gru::FeedForwardGru<TestBackend>| {
        layer
            .trainable_weights()
            .into_iter()
            .map(|w| (w.name, w.shape))
            .collect::<Vec<_>>()
    };
    assert_eq!(shapes(&first), shapes(&second));
}

#[test]
fn test_step_shapes() {
    let device = NdArrayDevice::Cpu;
    let layer = FeedForwardGruConfig::new(7, 3)
        .build::<TestBackend>(&[0, 0, 5], &device)
        .unwrap();

    let batch = 2;
    let state = layer.initial_state(batch, &device);
    let constants = layer.get_constants(batch, &device);
    let x_t = Tensor::<TestBackend, 2>::ones([batch, 5], &device);

    let (hidden, next) = layer.step(x_t, state, &constants);
    assert_eq!(hidden.dims(), [batch, 7], "hidden state stays at hidden_dim");
    assert_eq!(next.hidden.dims(), [batch, 7]);
    assert_eq!(
        next.previous_output.dims(),
        [batch, 3],
        "the published output replaces y_pre"
    );
    assert_close(&values(next.hidden), &values(hidden));
}

#[test]
fn test_step_publishes_projection_of_hidden_state() {
    let device = NdArrayDevice::Cpu;
    let layer = FeedForwardGruConfig::new(4, 2)
        .with_activation(Activation::Linear)
        .with_projection_initializer(Some(Initializer::Ones))
        .build::<TestBackend>(&[0, 0, 1], &device)
        .unwrap();

    let mut state = layer.initial_state(1, &device);
    state.hidden = Tensor::<TestBackend, 2>::from_floats([[0.5, -0.25, 1.0, 0.0]], &device);
    let constants = layer.get_constants(1, &device);
    let x_t = Tensor::<TestBackend, 2>::zeros([1, 1], &device);

    let (hidden, next) = layer.step(x_t, state, &constants);

    // With W_y all ones and b_y zero every output equals the sum of h_t
    let sum: f32 = values(hidden).iter().sum();
    assert_close(&values(next.previous_output), &[sum, sum]);
}

#[test]
fn test_call_output_shapes() {
    let device = NdArrayDevice::Cpu;
    let x = Tensor::<TestBackend, 3>::ones([3, 5, 4], &device);

    let last = FeedForwardGruConfig::new(8, 2)
        .build::<TestBackend>(&[3, 5, 4], &device)
        .unwrap()
        .call(x.clone(), None)
        .unwrap();
    assert_eq!(last.dims(), vec![3, 2]);
    assert!(matches!(last, LayerOutput::Last(_)));

    let sequence = FeedForwardGruConfig::new(8, 2)
        .with_return_sequences(true)
        .build::<TestBackend>(&[3, 5, 4], &device)
        .unwrap()
        .call(x, None)
        .unwrap();
    assert_eq!(sequence.dims(), vec![3, 5, 2]);
    assert!(sequence.into_sequence().is_some());
}

#[test]
fn test_zero_projection_with_identity_activation_outputs_zeros() {
    let device = NdArrayDevice::Cpu;
    let layer = FeedForwardGruConfig::new(4, 2)
        .with_activation(Activation::Linear)
        .with_projection_initializer(Some(Initializer::Zeros))
        .with_return_sequences(true)
        .build::<TestBackend>(&[1, 3, 4], &device)
        .unwrap();

    let x = Tensor::<TestBackend, 3>::zeros([1, 3, 4], &device);
    let output = layer.call(x, None).unwrap().into_sequence().unwrap();

    assert_eq!(output.dims(), [1, 3, 2]);
    assert!(values(output).iter().all(|v| *v == 0.0));
}

#[test]
fn test_last_output_matches_final_sequence_step() {
    let device = NdArrayDevice::Cpu;
    let config = FeedForwardGruConfig::new(6, 3).with_step_input(StepInput::Concatenated);
    let layer = config.build::<TestBackend>(&[2, 4, 3], &device).unwrap();
    let x = tensor3(ramp_input(2, 4, 3), [2, 4, 3]);

    let sequence = layer.forward_sequence(x.clone(), None).unwrap();
    let last = layer.call(x, None).unwrap().into_last().unwrap();

    let final_step = sequence.narrow(1, 3, 1).reshape([2, 3]);
    assert_close(&values(last), &values(final_step));
}

#[test]
fn test_masked_steps_carry_state_forward() {
    let device = NdArrayDevice::Cpu;
    let layer = FeedForwardGruConfig::new(5, 2)
        .with_step_input(StepInput::Concatenated)
        .with_return_sequences(true)
        .build::<TestBackend>(&[2, 4, 3], &device)
        .unwrap();

    let x = tensor3(ramp_input(2, 4, 3), [2, 4, 3]);
    let mask = sequence_mask::<TestBackend>(&[4, 1], 4, &device);
    let output = values(layer.call(x.clone(), Some(mask)).unwrap().into_sequence().unwrap());
    let unmasked = values(layer.forward_sequence(x, None).unwrap());

    // Row 0 is fully valid and matches the unmasked run
    assert_close(&output[0..8], &unmasked[0..8]);
    // Row 1 only has its first step; later steps repeat that output
    let first = &output[8..10];
    assert_close(first, &unmasked[8..10]);
    assert_close(&output[10..12], first);
    assert_close(&output[12..14], first);
    assert_close(&output[14..16], first);
}

#[test]
fn test_fully_masked_sequence_keeps_initial_state() {
    let device = NdArrayDevice::Cpu;
    let layer = FeedForwardGruConfig::new(5, 2)
        .with_step_input(StepInput::Concatenated)
        .build::<TestBackend>(&[1, 3, 3], &device)
        .unwrap();

    let x = Tensor::<TestBackend, 3>::ones([1, 3, 3], &device);
    let mask = Tensor::<TestBackend, 2, Bool>::from_data(
        TensorData::new(vec![false, false, false], Shape::new([1, 3])),
        &device,
    );
    let (output, state) = layer.call_with_state(x, Some(mask), None).unwrap();

    assert!(values(output.into_last().unwrap()).iter().all(|v| *v == 0.0));
    assert!(values(state.hidden).iter().all(|v| *v == 0.0));
}

#[test]
fn test_go_backwards_processes_reversed_sequence() {
    let device = NdArrayDevice::Cpu;
    let config = FeedForwardGruConfig::new(5, 2).with_step_input(StepInput::Concatenated);
    let forward = config.build::<TestBackend>(&[1, 4, 3], &device).unwrap();
    let backward = config
        .clone()
        .with_go_backwards(true)
        .build::<TestBackend>(&[1, 4, 3], &device)
        .unwrap()
        .load_record(forward.clone().into_record());

    let input = ramp_input(1, 4, 3);
    let reversed: Vec<f32> = input.chunks(3).rev().flatten().copied().collect();

    let backward_out = values(backward.forward_sequence(tensor3(input, [1, 4, 3]), None).unwrap());
    let forward_out = values(forward.forward_sequence(tensor3(reversed, [1, 4, 3]), None).unwrap());
    assert_close(&backward_out, &forward_out);
}

#[test]
fn test_previous_output_mode_ignores_input_values() {
    let device = NdArrayDevice::Cpu;
    let layer = FeedForwardGruConfig::new(4, 2)
        .build::<TestBackend>(&[1, 3, 2], &device)
        .unwrap();

    let mut state = layer.initial_state(1, &device);
    state.previous_output = Tensor::<TestBackend, 2>::from_floats([[0.7, -0.3]], &device);

    let zeros = Tensor::<TestBackend, 3>::zeros([1, 3, 2], &device);
    let ones = Tensor::<TestBackend, 3>::ones([1, 3, 2], &device);
    let (a, _) = layer
        .forward_sequence_with_state(zeros, None, Some(state.clone()))
        .unwrap();
    let (b, _) = layer.forward_sequence_with_state(ones, None, Some(state)).unwrap();
    assert_close(&values(a), &values(b));
}

#[test]
fn test_stateful_calls_continue_the_sequence() {
    let device = NdArrayDevice::Cpu;
    let layer = FeedForwardGruConfig::new(5, 2)
        .with_step_input(StepInput::Concatenated)
        .with_return_sequences(true)
        .with_stateful(true)
        .build::<TestBackend>(&[2, 4, 3], &device)
        .unwrap();

    let x = tensor3(ramp_input(2, 4, 3), [2, 4, 3]);
    let whole = layer.forward_sequence(x.clone(), None).unwrap();

    let mut stateful = layer.into_stateful(2, &device).unwrap();
    let first = stateful
        .call(x.clone().narrow(1, 0, 2), None)
        .unwrap()
        .into_sequence()
        .unwrap();
    let second = stateful
        .call(x.narrow(1, 2, 2), None)
        .unwrap()
        .into_sequence()
        .unwrap();

    let joined = Tensor::cat(vec![first, second], 1);
    assert_close(&values(joined), &values(whole));

    stateful.reset_states();
    assert!(values(stateful.states().hidden.clone()).iter().all(|v| *v == 0.0));
    assert!(values(stateful.states().previous_output.clone())
        .iter()
        .all(|v| *v == 0.0));
}

#[test]
fn test_stateful_requires_configuration_and_batch() {
    let device = NdArrayDevice::Cpu;
    let plain = FeedForwardGruConfig::new(3, 1)
        .build::<TestBackend>(&[1, 2, 1], &device)
        .unwrap();
    assert!(matches!(
        plain.into_stateful(1, &device),
        Err(GruError::InvalidConfig(_))
    ));

    let mut stateful = FeedForwardGruConfig::new(3, 1)
        .with_stateful(true)
        .build::<TestBackend>(&[1, 2, 1], &device)
        .unwrap()
        .into_stateful(1, &device)
        .unwrap();
    let wrong_batch = Tensor::<TestBackend, 3>::zeros([2, 2, 1], &device);
    assert!(matches!(
        stateful.call(wrong_batch, None),
        Err(GruError::StateMismatch { .. })
    ));
}

#[test]
fn test_invalid_shapes_are_rejected() {
    let device = NdArrayDevice::Cpu;
    let config = FeedForwardGruConfig::new(4, 2);

    assert_eq!(
        config.build::<TestBackend>(&[2, 3], &device).unwrap_err(),
        GruError::InvalidInputShape(vec![2, 3])
    );
    assert_eq!(
        config.build::<TestBackend>(&[2, 3, 0], &device).unwrap_err(),
        GruError::InvalidInputShape(vec![2, 3, 0])
    );

    let layer = config.build::<TestBackend>(&[2, 3, 4], &device).unwrap();
    let wrong_features = Tensor::<TestBackend, 3>::zeros([2, 3, 5], &device);
    assert_eq!(
        layer.call(wrong_features, None).unwrap_err(),
        GruError::FeatureMismatch {
            expected: 4,
            actual: 5
        }
    );

    let x = Tensor::<TestBackend, 3>::zeros([2, 3, 4], &device);
    let wrong_mask = sequence_mask::<TestBackend>(&[3, 3], 2, &device);
    assert_eq!(
        layer.call(x.clone(), Some(wrong_mask)).unwrap_err(),
        GruError::MaskMismatch {
            expected: [2, 3],
            actual: [2, 2]
        }
    );

    let mut bad_state = layer.initial_state(2, &device);
    bad_state.previous_output = Tensor::zeros([2, 3], &device);
    assert!(matches!(
        layer.call_with_state(x, None, Some(bad_state)),
        Err(GruError::StateMismatch {
            name: "previous_output",
            ..
        })
    ));

    let empty = Tensor::<TestBackend, 3>::zeros([2, 0, 4], &device);
    assert_eq!(layer.call(empty, None).unwrap_err(), GruError::EmptySequence);
}

#[test]
fn test_invalid_configuration_is_rejected() {
    let device = NdArrayDevice::Cpu;
    assert!(matches!(
        FeedForwardGruConfig::new(0, 2).build::<TestBackend>(&[1, 1, 1], &device),
        Err(GruError::InvalidConfig(_))
    ));
    assert!(matches!(
        FeedForwardGruConfig::new(4, 2)
            .with_dropout_recurrent(1.0)
            .build::<TestBackend>(&[1, 1, 1], &device),
        Err(GruError::InvalidConfig(_))
    ));
}

#[test]
fn test_dropout_masks_only_drawn_when_training() {
    let device = NdArrayDevice::Cpu;
    let config = FeedForwardGruConfig::new(4, 2)
        .with_step_input(StepInput::Concatenated)
        .with_dropout_input(0.5)
        .with_dropout_recurrent(0.5);

    let inference = config.build::<TestBackend>(&[3, 2, 5], &device).unwrap();
    let constants = inference.get_constants(3, &device);
    assert!(constants.feedback_mask.is_none());
    assert!(constants.input_mask.is_none());
    assert!(constants.recurrent_masks.is_none());

    let training = config
        .build::<Autodiff<TestBackend>>(&[3, 2, 5], &device)
        .unwrap();
    let constants = training.get_constants(3, &device);
    let input_mask = constants.input_mask.expect("input mask while training");
    assert_eq!(input_mask.dims(), [3, 5]);
    assert_eq!(constants.feedback_mask.map(|m| m.dims()), Some([3, 2]));
    let masks = constants.recurrent_masks.expect("recurrent masks while training");
    for mask in masks {
        assert_eq!(mask.dims(), [3, 4]);
    }

    // Kept units are rescaled by 1 / (1 - rate)
    for v in input_mask.inner().into_data().to_vec::<f32>().unwrap() {
        assert!(v == 0.0 || (v - 2.0).abs() < 1e-6, "unexpected mask value {v}");
    }
}

#[test]
fn test_stateful_layer_rejects_stateless_calls() {
    let device = NdArrayDevice::Cpu;
    let layer = FeedForwardGruConfig::new(5, 2)
        .with_step_input(StepInput::Concatenated)
        .with_return_sequences(true)
        .with_stateful(true)
        .build::<TestBackend>(&[2, 4, 3], &device)
        .unwrap();
    let x = tensor3(ramp_input(2, 4, 3), [2, 4, 3]);

    // A bare call would silently restart from zeros
    assert!(matches!(
        layer.call(x.clone().narrow(1, 0, 2), None),
        Err(GruError::InvalidConfig(_))
    ));
    assert!(matches!(
        layer.call_with_state(x.clone().narrow(1, 0, 2), None, None),
        Err(GruError::InvalidConfig(_))
    ));

    // Passing the carried state explicitly continues the sequence
    let whole = layer.forward_sequence(x.clone(), None).unwrap();
    let (first, state) = layer
        .call_with_state(x.clone().narrow(1, 0, 2), None, Some(layer.initial_state(2, &device)))
        .unwrap();
    let (second, _) = layer
        .call_with_state(x.narrow(1, 2, 2), None, Some(state))
        .unwrap();
    let joined = Tensor::cat(
        vec![first.into_sequence().unwrap(), second.into_sequence().unwrap()],
        1,
    );
    assert_close(&values(joined), &values(whole));
}

#[test]
fn test_masked_steps_survive_overflowing_updates() {
    let device = NdArrayDevice::Cpu;
    let layer = FeedForwardGruConfig::new(3, 2)
        .with_activation(Activation::Linear)
        .with_inner_activation(Activation::Linear)
        .build::<TestBackend>(&[1, 2, 1], &device)
        .unwrap();

    // Unbounded activations on a huge state overflow inside the step
    let mut state = layer.initial_state(1, &device);
    state.hidden = Tensor::<TestBackend, 2>::ones([1, 3], &device) * 1e30;
    state.previous_output = Tensor::<TestBackend, 2>::ones([1, 2], &device) * 1e30;

    let x = Tensor::<TestBackend, 3>::zeros([1, 2, 1], &device);
    let mask = Tensor::<TestBackend, 2, Bool>::from_data(
        TensorData::new(vec![false, false], Shape::new([1, 2])),
        &device,
    );
    let (outputs, final_state) = layer
        .forward_sequence_with_state(x, Some(mask), Some(state))
        .unwrap();

    assert!(values(outputs).iter().all(|v| *v == 1e30));
    assert!(values(final_state.hidden).iter().all(|v| *v == 1e30));
    assert!(values(final_state.previous_output).iter().all(|v| *v == 1e30));
}

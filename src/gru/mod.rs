/// # FeedForwardGRU Implementation Module
///
/// A gated recurrent unit whose recurrent memory runs at `hidden_dim` while
/// every step publishes a projected output at `output_dim`. The published
/// output is fed back as the gate input of the next step.
///
/// ## Module Structure:
///
/// 1. **step_1_tensor_preparation**: Padding, masks, `ndarray` interchange and input validation
/// 2. **step_2_gru_cell**: Base GRU cell (gate math) and activations
/// 3. **step_3_feedforward_gru**: The layer, its configuration, the scan and statefulness
/// 4. **step_4_train_model**: Training loop with Adam and early stopping
/// 5. **step_5_prediction**: Sequence prediction and free-running forecasts
/// 6. **step_6_model_serialization**: Model saving and loading
///
pub mod step_1_tensor_preparation;
pub mod step_2_gru_cell;
pub mod step_3_feedforward_gru;
pub mod step_4_train_model;
pub mod step_5_prediction;
pub mod step_6_model_serialization;

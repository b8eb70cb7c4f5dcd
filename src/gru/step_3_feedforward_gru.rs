// External imports
use burn::config::Config;
use burn::module::{Ignored, Module, Param, ParamId};
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::tensor::{backend::Backend, Bool, Distribution, Tensor};
use log::{debug, info};
use serde::{Deserialize, Serialize};

// Internal imports
use super::step_1_tensor_preparation::{validate_input, validate_mask};
use super::step_2_gru_cell::{Activation, GruCell, RecurrentMasks};
use crate::constants::GATE_COUNT;
use crate::error::{GruError, GruResult};

/// What the gates consume at every step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepInput {
    /// Only the previous published output `y_(t-1)`; the layer input
    /// supplies the time axis and the mask.
    PreviousOutput,
    /// The layer input `x_t` alongside `y_(t-1)`.
    Concatenated,
}

/// # FeedForwardGru Configuration
///
/// Unbuilt form of the layer. Holds everything the base recurrent layer is
/// configured with plus `output_dim`; no weights exist until [`build`] is
/// called with the input shape.
///
/// [`build`]: FeedForwardGruConfig::build
#[derive(Config, Debug)]
pub struct FeedForwardGruConfig {
    /// Width of the recurrent memory
    pub hidden_dim: usize,
    /// Width of the published per-step output
    pub output_dim: usize,
    /// Candidate state and output activation
    #[config(default = "Activation::Tanh")]
    pub activation: Activation,
    /// Gate activation
    #[config(default = "Activation::HardSigmoid")]
    pub inner_activation: Activation,
    #[config(default = "Initializer::XavierUniform{gain:1.0}")]
    pub kernel_initializer: Initializer,
    #[config(default = "Initializer::XavierUniform{gain:1.0}")]
    pub recurrent_initializer: Initializer,
    /// Initializer for `W_y`; falls back to `kernel_initializer`
    pub projection_initializer: Option<Initializer>,
    #[config(default = "StepInput::PreviousOutput")]
    pub step_input: StepInput,
    /// Dropout rate on the step input (training only)
    #[config(default = 0.0)]
    pub dropout_input: f64,
    /// Dropout rate on the recurrent connections (training only)
    #[config(default = 0.0)]
    pub dropout_recurrent: f64,
    #[config(default = false)]
    pub go_backwards: bool,
    #[config(default = false)]
    pub return_sequences: bool,
    #[config(default = false)]
    pub stateful: bool,
    /// Prefix for weight names
    pub name: Option<String>,
}

impl FeedForwardGruConfig {
    /// Checks the configuration values without allocating anything.
    pub fn validate(&self) -> GruResult<()> {
        if self.hidden_dim == 0 || self.output_dim == 0 {
            return Err(GruError::InvalidConfig(format!(
                "hidden_dim and output_dim must be positive, got {} and {}",
                self.hidden_dim, self.output_dim
            )));
        }
        for (label, rate) in [
            ("dropout_input", self.dropout_input),
            ("dropout_recurrent", self.dropout_recurrent),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return Err(GruError::InvalidConfig(format!(
                    "{label} must be in [0, 1), got {rate}"
                )));
            }
        }
        Ok(())
    }

    /// Builds the layer for a given input shape
    ///
    /// Allocates the base GRU weights, then `W_y` `[hidden_dim, output_dim]`
    /// from the projection initializer and `b_y` `[output_dim]` as zeros.
    ///
    /// # Arguments
    ///
    /// * `input_shape` - `[batch, time, features]`; batch and time may be 0 when unknown
    /// * `device` - The device to allocate tensors on
    pub fn build<B: Backend>(
        &self,
        input_shape: &[usize],
        device: &B::Device,
    ) -> GruResult<FeedForwardGru<B>> {
        self.validate()?;
        let input_dim = match input_shape {
            [_, _, features] if *features > 0 => *features,
            _ => return Err(GruError::InvalidInputShape(input_shape.to_vec())),
        };

        // The gates always read y_(t-1), so the cell input is output_dim wide
        let cell = GruCell::new(
            self.output_dim,
            self.hidden_dim,
            self.activation,
            self.inner_activation,
            self.kernel_initializer.clone(),
            self.recurrent_initializer.clone(),
            device,
        );

        let input_kernel = match self.step_input {
            StepInput::PreviousOutput => None,
            StepInput::Concatenated => Some(
                LinearConfig::new(input_dim, GATE_COUNT * self.hidden_dim)
                    .with_bias(false)
                    .with_initializer(self.kernel_initializer.clone())
                    .init(device),
            ),
        };

        let projection_initializer = self
            .projection_initializer
            .clone()
            .unwrap_or_else(|| self.kernel_initializer.clone());
        let w_y = LinearConfig::new(self.hidden_dim, self.output_dim)
            .with_bias(false)
            .with_initializer(projection_initializer)
            .init::<B>(device)
            .weight;
        let b_y = Param::from_tensor(Tensor::zeros([self.output_dim], device));

        debug!(
            "Built {} with input_dim={}, hidden_dim={}, output_dim={}, step_input={:?}",
            self.layer_name(),
            input_dim,
            self.hidden_dim,
            self.output_dim,
            self.step_input
        );

        Ok(FeedForwardGru {
            input_dim,
            cell,
            input_kernel,
            w_y,
            b_y,
            config: Ignored(self.clone()),
        })
    }

    pub fn layer_name(&self) -> &str {
        self.name.as_deref().unwrap_or("feedforward_gru")
    }
}

/// Per-step recurrence state.
///
/// `previous_output` is the `y_pre` slot: consumed by each step as the gate
/// input and replaced with that step's published output.
#[derive(Clone, Debug)]
pub struct RecurrentState<B: Backend> {
    /// `[batch, hidden_dim]`
    pub hidden: Tensor<B, 2>,
    /// `[batch, output_dim]`
    pub previous_output: Tensor<B, 2>,
}

impl<B: Backend> RecurrentState<B> {
    pub fn batch_size(&self) -> usize {
        self.hidden.dims()[0]
    }

    /// Keeps `self` where `keep` is true and `fallback` elsewhere; `keep` is `[batch, 1]`.
    fn blend(self, fallback: Self, keep: Tensor<B, 2, Bool>) -> Self {
        let [batch, hidden_dim] = self.hidden.dims();
        let [_, output_dim] = self.previous_output.dims();
        let skip = keep.bool_not();
        let skip_hidden: Tensor<B, 2, Bool> = skip.clone().expand([batch, hidden_dim]);
        let skip_output: Tensor<B, 2, Bool> = skip.expand([batch, output_dim]);
        Self {
            hidden: self.hidden.mask_where(skip_hidden, fallback.hidden),
            previous_output: self
                .previous_output
                .mask_where(skip_output, fallback.previous_output),
        }
    }
}

/// Dropout masks drawn once per call and shared by every step.
#[derive(Clone, Debug)]
pub struct StepConstants<B: Backend> {
    /// Applied to `y_(t-1)` before the gate projection, `[batch, output_dim]`
    pub feedback_mask: Option<Tensor<B, 2>>,
    /// Applied to `x` before preprocessing, `[batch, input_dim]`
    pub input_mask: Option<Tensor<B, 2>>,
    /// Applied to `h_(t-1)` per gate, `[batch, hidden_dim]` each
    pub recurrent_masks: Option<RecurrentMasks<B>>,
}

/// What `call` returns, depending on `return_sequences`.
#[derive(Clone, Debug)]
pub enum LayerOutput<B: Backend> {
    /// Every published output, `[batch, time, output_dim]`
    Sequence(Tensor<B, 3>),
    /// The last published output, `[batch, output_dim]`
    Last(Tensor<B, 2>),
}

impl<B: Backend> LayerOutput<B> {
    pub fn dims(&self) -> Vec<usize> {
        match self {
            LayerOutput::Sequence(t) => t.dims().to_vec(),
            LayerOutput::Last(t) => t.dims().to_vec(),
        }
    }

    pub fn into_sequence(self) -> Option<Tensor<B, 3>> {
        match self {
            LayerOutput::Sequence(t) => Some(t),
            LayerOutput::Last(_) => None,
        }
    }

    pub fn into_last(self) -> Option<Tensor<B, 2>> {
        match self {
            LayerOutput::Last(t) => Some(t),
            LayerOutput::Sequence(_) => None,
        }
    }
}

/// A trainable parameter as listed by [`FeedForwardGru::trainable_weights`].
#[derive(Clone, Debug, PartialEq)]
pub struct TrainableWeight {
    pub name: String,
    pub id: ParamId,
    pub shape: Vec<usize>,
}

/// # FeedForwardGru Layer
///
/// A GRU whose recurrent core runs at `hidden_dim` while every step also
/// publishes `y_t = activation(h_t · W_y + b_y)` at `output_dim`. The
/// published output is fed back as the gate input of the next step.
///
/// ## Step
///
/// 1. Take `y_(t-1)` out of the recurrence state
/// 2. Run the base GRU update with `y_(t-1)` as input: `h_t = GRU(y_(t-1), h_(t-1))`
/// 3. Publish `y_t = activation(h_t · W_y + b_y)`
/// 4. Put `y_t` into the state for the next step
#[derive(Module, Debug)]
pub struct FeedForwardGru<B: Backend> {
    input_dim: usize,
    cell: GruCell<B>,
    input_kernel: Option<Linear<B>>,
    w_y: Param<Tensor<B, 2>>,
    b_y: Param<Tensor<B, 1>>,
    config: Ignored<FeedForwardGruConfig>,
}

impl<B: Backend> FeedForwardGru<B> {
    pub fn config(&self) -> &FeedForwardGruConfig {
        &self.config
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn hidden_dim(&self) -> usize {
        self.config.hidden_dim
    }

    pub fn output_dim(&self) -> usize {
        self.config.output_dim
    }

    /// Output projection weight `W_y`, `[hidden_dim, output_dim]`
    pub fn w_y(&self) -> Tensor<B, 2> {
        self.w_y.val()
    }

    /// Output projection bias `b_y`, `[output_dim]`
    pub fn b_y(&self) -> Tensor<B, 1> {
        self.b_y.val()
    }

    /// Lists every trainable parameter once, base GRU weights first.
    pub fn trainable_weights(&self) -> Vec<TrainableWeight> {
        let name = self.config.layer_name();
        let mut weights = Vec::new();

        let kernel = self.cell.kernel();
        weights.push(TrainableWeight {
            name: format!("{name}_W"),
            id: kernel.weight.id,
            shape: kernel.weight.val().dims().to_vec(),
        });
        if let Some(bias) = &kernel.bias {
            weights.push(TrainableWeight {
                name: format!("{name}_b"),
                id: bias.id,
                shape: bias.val().dims().to_vec(),
            });
        }
        for (gate, recurrent) in ["z", "r", "h"].iter().zip(self.cell.recurrent_kernels()) {
            weights.push(TrainableWeight {
                name: format!("{name}_U_{gate}"),
                id: recurrent.weight.id,
                shape: recurrent.weight.val().dims().to_vec(),
            });
        }
        if let Some(input_kernel) = &self.input_kernel {
            weights.push(TrainableWeight {
                name: format!("{name}_W_x"),
                id: input_kernel.weight.id,
                shape: input_kernel.weight.val().dims().to_vec(),
            });
        }
        weights.push(TrainableWeight {
            name: format!("{name}_W_y"),
            id: self.w_y.id,
            shape: self.w_y.val().dims().to_vec(),
        });
        weights.push(TrainableWeight {
            name: format!("{name}_b_y"),
            id: self.b_y.id,
            shape: self.b_y.val().dims().to_vec(),
        });

        weights
    }

    /// Zero hidden state and zero previous output for `batch_size` sequences.
    pub fn initial_state(&self, batch_size: usize, device: &B::Device) -> RecurrentState<B> {
        RecurrentState {
            hidden: Tensor::zeros([batch_size, self.hidden_dim()], device),
            previous_output: Tensor::zeros([batch_size, self.output_dim()], device),
        }
    }

    /// Draws the per-call dropout masks
    ///
    /// Masks are only drawn when the backend tracks gradients and the
    /// matching rate is positive; inference runs without them.
    pub fn get_constants(&self, batch_size: usize, device: &B::Device) -> StepConstants<B> {
        let config = self.config();
        let training = B::ad_enabled();
        let mask = |dim: usize, rate: f64| -> Option<Tensor<B, 2>> {
            (training && rate > 0.0).then(|| {
                Tensor::<B, 2>::random(
                    [batch_size, dim],
                    Distribution::Bernoulli(1.0 - rate),
                    device,
                ) / (1.0 - rate)
            })
        };

        let feedback_mask = mask(config.output_dim, config.dropout_input);
        let input_mask = match self.input_kernel {
            Some(_) => mask(self.input_dim, config.dropout_input),
            None => None,
        };
        let recurrent_masks = match (
            mask(config.hidden_dim, config.dropout_recurrent),
            mask(config.hidden_dim, config.dropout_recurrent),
            mask(config.hidden_dim, config.dropout_recurrent),
        ) {
            (Some(z), Some(r), Some(h)) => Some([z, r, h]),
            _ => None,
        };

        StepConstants {
            feedback_mask,
            input_mask,
            recurrent_masks,
        }
    }

    /// Prepares the layer input for the scan
    ///
    /// In [`StepInput::Concatenated`] mode every timestep of `x` is projected
    /// through the input-side gate weights at once, giving
    /// `[batch, time, 3 * hidden_dim]`. In [`StepInput::PreviousOutput`] mode
    /// the input is returned unchanged.
    pub fn preprocess_input(&self, x: Tensor<B, 3>, constants: &StepConstants<B>) -> Tensor<B, 3> {
        match &self.input_kernel {
            Some(kernel) => {
                let x = match &constants.input_mask {
                    Some(mask) => x * mask.clone().unsqueeze_dim(1),
                    None => x,
                };
                kernel.forward(x)
            }
            None => x,
        }
    }

    /// Runs one recurrence step
    ///
    /// # Arguments
    ///
    /// * `x_t` - Preprocessed input for this step; only read in [`StepInput::Concatenated`] mode
    /// * `state` - State from the previous step
    /// * `constants` - Masks from [`get_constants`](Self::get_constants)
    ///
    /// # Returns
    ///
    /// The new hidden state `[batch, hidden_dim]` and the state for the next
    /// step, whose `previous_output` is this step's published output
    pub fn step(
        &self,
        x_t: Tensor<B, 2>,
        state: RecurrentState<B>,
        constants: &StepConstants<B>,
    ) -> (Tensor<B, 2>, RecurrentState<B>) {
        let RecurrentState {
            hidden: h_prev,
            previous_output: y_pre,
        } = state;

        let y_pre = match &constants.feedback_mask {
            Some(mask) => y_pre * mask.clone(),
            None => y_pre,
        };
        let projected = match self.config.step_input {
            StepInput::PreviousOutput => self.cell.project_input(y_pre),
            StepInput::Concatenated => self.cell.project_input(y_pre) + x_t,
        };

        let h_t = self
            .cell
            .step(projected, h_prev, constants.recurrent_masks.as_ref());
        let y_t = self.publish(h_t.clone());

        let next = RecurrentState {
            hidden: h_t.clone(),
            previous_output: y_t,
        };
        (h_t, next)
    }

    /// `activation(h · W_y + b_y)`
    fn publish(&self, hidden: Tensor<B, 2>) -> Tensor<B, 2> {
        let affine = hidden.matmul(self.w_y.val()) + self.b_y.val().unsqueeze();
        self.config.activation.apply(affine)
    }

    fn check_state(&self, state: &RecurrentState<B>, batch: usize) -> GruResult<()> {
        let expected_hidden = [batch, self.hidden_dim()];
        let expected_output = [batch, self.output_dim()];
        if state.hidden.dims() != expected_hidden {
            return Err(GruError::StateMismatch {
                name: "hidden",
                expected: expected_hidden,
                actual: state.hidden.dims(),
            });
        }
        if state.previous_output.dims() != expected_output {
            return Err(GruError::StateMismatch {
                name: "previous_output",
                expected: expected_output,
                actual: state.previous_output.dims(),
            });
        }
        Ok(())
    }

    /// Drives `step` over the time axis and collects the published outputs
    /// in processing order.
    fn scan(
        &self,
        x: Tensor<B, 3>,
        mask: Option<Tensor<B, 2, Bool>>,
        initial_state: Option<RecurrentState<B>>,
    ) -> GruResult<(Vec<Tensor<B, 2>>, RecurrentState<B>)> {
        let [batch, time, _] = validate_input(&x, self.input_dim)?;
        if let Some(mask) = &mask {
            validate_mask(mask, batch, time)?;
        }
        let device = x.device();

        let mut state = match initial_state {
            Some(state) => {
                self.check_state(&state, batch)?;
                state
            }
            None => self.initial_state(batch, &device),
        };

        let constants = self.get_constants(batch, &device);
        let preprocessed = self.preprocess_input(x, &constants);
        let step_width = preprocessed.dims()[2];

        let mut outputs = Vec::with_capacity(time);
        for t in 0..time {
            let time_idx = if self.config.go_backwards {
                time - 1 - t
            } else {
                t
            };
            let x_t = preprocessed
                .clone()
                .narrow(1, time_idx, 1)
                .reshape([batch, step_width]);

            let (_, next) = self.step(x_t, state.clone(), &constants);
            state = match &mask {
                Some(keep) => next.blend(state, keep.clone().narrow(1, time_idx, 1)),
                None => next,
            };
            outputs.push(state.previous_output.clone());
        }

        Ok((outputs, state))
    }

    /// Runs the layer over a batch
    ///
    /// Starts from zero state. Masked steps (`false` in the `[batch, time]`
    /// mask) carry the previous state and output forward unchanged. Stateful
    /// layers are rejected here; use [`into_stateful`](Self::into_stateful).
    ///
    /// # Returns
    ///
    /// `[batch, time, output_dim]` when `return_sequences` is set, otherwise
    /// the last output `[batch, output_dim]`
    pub fn call(
        &self,
        x: Tensor<B, 3>,
        mask: Option<Tensor<B, 2, Bool>>,
    ) -> GruResult<LayerOutput<B>> {
        self.call_with_state(x, mask, None).map(|(output, _)| output)
    }

    /// Like [`call`](Self::call) but starts from `initial_state` when given
    /// and also returns the final state.
    ///
    /// A layer configured as `stateful` has no state of its own to carry
    /// over, so it must either be given one here or be wrapped with
    /// [`into_stateful`](Self::into_stateful).
    pub fn call_with_state(
        &self,
        x: Tensor<B, 3>,
        mask: Option<Tensor<B, 2, Bool>>,
        initial_state: Option<RecurrentState<B>>,
    ) -> GruResult<(LayerOutput<B>, RecurrentState<B>)> {
        if self.config.stateful && initial_state.is_none() {
            return Err(GruError::InvalidConfig(format!(
                "{} is stateful; call it through into_stateful or pass the carried state",
                self.config.layer_name()
            )));
        }
        let (outputs, state) = self.scan(x, mask, initial_state)?;
        let output = if self.config.return_sequences {
            LayerOutput::Sequence(Tensor::stack(outputs, 1))
        } else {
            LayerOutput::Last(state.previous_output.clone())
        };
        Ok((output, state))
    }

    /// Every published output `[batch, time, output_dim]`, whatever
    /// `return_sequences` says.
    pub fn forward_sequence(
        &self,
        x: Tensor<B, 3>,
        mask: Option<Tensor<B, 2, Bool>>,
    ) -> GruResult<Tensor<B, 3>> {
        self.forward_sequence_with_state(x, mask, None)
            .map(|(outputs, _)| outputs)
    }

    pub fn forward_sequence_with_state(
        &self,
        x: Tensor<B, 3>,
        mask: Option<Tensor<B, 2, Bool>>,
        initial_state: Option<RecurrentState<B>>,
    ) -> GruResult<(Tensor<B, 3>, RecurrentState<B>)> {
        let (outputs, state) = self.scan(x, mask, initial_state)?;
        Ok((Tensor::stack(outputs, 1), state))
    }

    /// Wraps the layer so its state persists across calls.
    pub fn into_stateful(
        self,
        batch_size: usize,
        device: &B::Device,
    ) -> GruResult<StatefulFeedForwardGru<B>> {
        if !self.config.stateful {
            return Err(GruError::InvalidConfig(
                "layer was not configured as stateful".to_string(),
            ));
        }
        if batch_size == 0 {
            return Err(GruError::InvalidConfig(
                "stateful layers need a fixed, positive batch size".to_string(),
            ));
        }
        let states = self.initial_state(batch_size, device);
        Ok(StatefulFeedForwardGru {
            layer: self,
            batch_size,
            states,
            device: device.clone(),
        })
    }
}

/// # Stateful FeedForwardGru
///
/// Carries the final recurrence state of one call into the next one. The
/// batch size is fixed at construction so row `i` of every call continues
/// sequence `i`.
#[derive(Debug)]
pub struct StatefulFeedForwardGru<B: Backend> {
    layer: FeedForwardGru<B>,
    batch_size: usize,
    states: RecurrentState<B>,
    device: B::Device,
}

impl<B: Backend> StatefulFeedForwardGru<B> {
    pub fn layer(&self) -> &FeedForwardGru<B> {
        &self.layer
    }

    pub fn states(&self) -> &RecurrentState<B> {
        &self.states
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Runs the layer from the persisted state and stores the final state.
    pub fn call(
        &mut self,
        x: Tensor<B, 3>,
        mask: Option<Tensor<B, 2, Bool>>,
    ) -> GruResult<LayerOutput<B>> {
        let [batch, _, _] = x.dims();
        if batch != self.batch_size {
            return Err(GruError::StateMismatch {
                name: "hidden",
                expected: [self.batch_size, self.layer.hidden_dim()],
                actual: [batch, self.layer.hidden_dim()],
            });
        }
        let (output, states) = self
            .layer
            .call_with_state(x, mask, Some(self.states.clone()))?;
        self.states = states;
        Ok(output)
    }

    /// Zeroes the persisted state.
    pub fn reset_states(&mut self) {
        info!("Resetting states of {}", self.layer.config().layer_name());
        self.states = self.layer.initial_state(self.batch_size, &self.device);
    }

    pub fn into_inner(self) -> FeedForwardGru<B> {
        self.layer
    }
}

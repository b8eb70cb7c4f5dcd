// External imports
use burn::module::{Ignored, Module, Param};
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::tensor::{activation, backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

// Internal imports
use crate::constants::{GATE_COUNT, HARD_SIGMOID_OFFSET, HARD_SIGMOID_SLOPE};

/// Elementwise activation applied by the gates, the candidate state and the
/// output projection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    /// Identity
    Linear,
    Tanh,
    Sigmoid,
    /// `clamp(0.2 * x + 0.5, 0, 1)`, the cheap piecewise sigmoid
    HardSigmoid,
    Relu,
}

impl Activation {
    pub fn apply<B: Backend, const D: usize>(self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Linear => x,
            Activation::Tanh => activation::tanh(x),
            Activation::Sigmoid => activation::sigmoid(x),
            Activation::HardSigmoid => (x * HARD_SIGMOID_SLOPE + HARD_SIGMOID_OFFSET).clamp(0.0, 1.0),
            Activation::Relu => activation::relu(x),
        }
    }
}

/// Per-gate recurrent dropout masks `[batch, hidden_dim]` for the update,
/// reset and candidate paths.
pub type RecurrentMasks<B> = [Tensor<B, 2>; GATE_COUNT];

/// Builds a linear map whose weight uses `initializer` and whose bias starts at zero.
pub(crate) fn linear_with_zero_bias<B: Backend>(
    d_input: usize,
    d_output: usize,
    initializer: Initializer,
    device: &B::Device,
) -> Linear<B> {
    let mut linear = LinearConfig::new(d_input, d_output)
        .with_initializer(initializer)
        .init(device);
    linear.bias = Some(Param::from_tensor(Tensor::zeros([d_output], device)));
    linear
}

fn linear_without_bias<B: Backend>(
    d_input: usize,
    d_output: usize,
    initializer: Initializer,
    device: &B::Device,
) -> Linear<B> {
    LinearConfig::new(d_input, d_output)
        .with_bias(false)
        .with_initializer(initializer)
        .init(device)
}

/// # GRU Cell Implementation
///
/// The base gated recurrent unit. The cell only knows two sizes, the width
/// of its step input and the width of its hidden state; callers that want
/// the hidden update at a different width build the cell for that width
/// instead of reconfiguring it between steps.
///
/// ## Mathematical Representation
///
/// For step input x_t and previous hidden state h_(t-1):
///
/// 1. Update gate: z_t = σ(W_z · x_t + U_z · h_(t-1) + b_z)
/// 2. Reset gate: r_t = σ(W_r · x_t + U_r · h_(t-1) + b_r)
/// 3. Candidate: n_t = φ(W_h · x_t + U_h · (r_t ∘ h_(t-1)) + b_h)
/// 4. New hidden state: h_t = z_t ∘ h_(t-1) + (1 - z_t) ∘ n_t
///
/// σ is the inner (gate) activation and φ the cell activation.
/// The reset gate is applied to the hidden state before the recurrent
/// candidate projection.
#[derive(Module, Debug)]
pub struct GruCell<B: Backend> {
    input_dim: usize,
    hidden_dim: usize,

    // Input-side projection for all three gates [W_z | W_r | W_h] with bias
    kernel: Linear<B>,

    // Recurrent projections
    recurrent_update: Linear<B>,
    recurrent_reset: Linear<B>,
    recurrent_candidate: Linear<B>,

    activation: Ignored<Activation>,
    inner_activation: Ignored<Activation>,
}

impl<B: Backend> GruCell<B> {
    /// Create a new GRU cell
    ///
    /// # Arguments
    ///
    /// * `input_dim` - Width of the per-step input fed to the gates
    /// * `hidden_dim` - Width of the hidden state
    /// * `activation` - Candidate state activation
    /// * `inner_activation` - Gate activation
    /// * `kernel_initializer` - Initializer for the input-side weights
    /// * `recurrent_initializer` - Initializer for the hidden-side weights
    /// * `device` - The device to allocate tensors on
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input_dim: usize,
        hidden_dim: usize,
        activation: Activation,
        inner_activation: Activation,
        kernel_initializer: Initializer,
        recurrent_initializer: Initializer,
        device: &B::Device,
    ) -> Self {
        let kernel = linear_with_zero_bias(
            input_dim,
            GATE_COUNT * hidden_dim,
            kernel_initializer,
            device,
        );
        let recurrent_update =
            linear_without_bias(hidden_dim, hidden_dim, recurrent_initializer.clone(), device);
        let recurrent_reset =
            linear_without_bias(hidden_dim, hidden_dim, recurrent_initializer.clone(), device);
        let recurrent_candidate =
            linear_without_bias(hidden_dim, hidden_dim, recurrent_initializer, device);

        Self {
            input_dim,
            hidden_dim,
            kernel,
            recurrent_update,
            recurrent_reset,
            recurrent_candidate,
            activation: Ignored(activation),
            inner_activation: Ignored(inner_activation),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Input-side gate weights `[input_dim, 3 * hidden_dim]` and their bias.
    pub fn kernel(&self) -> &Linear<B> {
        &self.kernel
    }

    /// Recurrent weights in gate order (update, reset, candidate).
    pub fn recurrent_kernels(&self) -> [&Linear<B>; GATE_COUNT] {
        [
            &self.recurrent_update,
            &self.recurrent_reset,
            &self.recurrent_candidate,
        ]
    }

    /// Projects step inputs through the input-side gate weights.
    ///
    /// Works on a single step `[batch, input_dim]` or on a whole sequence
    /// `[batch, time, input_dim]`; the last dimension becomes `3 * hidden_dim`.
    pub fn project_input<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        self.kernel.forward(x)
    }

    /// Computes one hidden-state update
    ///
    /// # Arguments
    ///
    /// * `projected` - Gate pre-activations from the input side, `[batch, 3 * hidden_dim]`
    /// * `h_prev` - Previous hidden state, `[batch, hidden_dim]`
    /// * `recurrent_masks` - Optional per-gate dropout masks for `h_prev`
    ///
    /// # Returns
    ///
    /// The new hidden state `[batch, hidden_dim]`
    pub fn step(
        &self,
        projected: Tensor<B, 2>,
        h_prev: Tensor<B, 2>,
        recurrent_masks: Option<&RecurrentMasks<B>>,
    ) -> Tensor<B, 2> {
        let hidden = self.hidden_dim;

        let x_z = projected.clone().narrow(1, 0, hidden);
        let x_r = projected.clone().narrow(1, hidden, hidden);
        let x_h = projected.narrow(1, 2 * hidden, hidden);

        let (h_z, h_r, h_h) = match recurrent_masks {
            Some([m_z, m_r, m_h]) => (
                h_prev.clone() * m_z.clone(),
                h_prev.clone() * m_r.clone(),
                h_prev.clone() * m_h.clone(),
            ),
            None => (h_prev.clone(), h_prev.clone(), h_prev.clone()),
        };

        let z = self
            .inner_activation
            .apply(x_z + self.recurrent_update.forward(h_z));
        let r = self
            .inner_activation
            .apply(x_r + self.recurrent_reset.forward(h_r));
        let candidate = self
            .activation
            .apply(x_h + self.recurrent_candidate.forward(r * h_h));

        z.clone() * h_prev + (Tensor::ones_like(&z) - z) * candidate
    }
}

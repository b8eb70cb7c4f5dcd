// Layer defaults
pub const DEFAULT_HIDDEN_DIM: usize = 32;
pub const DEFAULT_OUTPUT_DIM: usize = 1;

// Gate layout: update (z), reset (r), candidate (h)
pub const GATE_COUNT: usize = 3;

// Hard sigmoid used by the gates: clamp(slope * x + offset, 0, 1)
pub const HARD_SIGMOID_SLOPE: f64 = 0.2;
pub const HARD_SIGMOID_OFFSET: f64 = 0.5;

// Training defaults
pub const DEFAULT_LEARNING_RATE: f64 = 0.01;
pub const DEFAULT_EPOCHS: usize = 50;
pub const DEFAULT_BATCH_SIZE: usize = 16;
pub const VALIDATION_SPLIT_RATIO: f64 = 0.2; // 20% of sequences held out

// Model paths
pub const MODEL_PATH: &str = "models";
pub const MODEL_FILE_NAME: &str = "feedforward_gru";
pub const METADATA_SUFFIX: &str = "_meta.json";

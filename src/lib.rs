pub mod constants;
pub mod error;
pub mod gru;
pub mod util {
    pub mod model_logger;
}

/// Package metadata captured at build time
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub use error::{GruError, GruResult};
pub use gru::step_2_gru_cell::{Activation, GruCell};
pub use gru::step_3_feedforward_gru::{
    FeedForwardGru, FeedForwardGruConfig, LayerOutput, RecurrentState, StatefulFeedForwardGru,
    StepConstants, StepInput, TrainableWeight,
};

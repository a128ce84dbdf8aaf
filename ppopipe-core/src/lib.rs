pub mod buffers;
pub mod config;
pub mod error;
pub mod gae;
pub mod pipeline;
pub mod report;
pub mod rng;
pub mod stats;
pub mod tensors;
pub mod terminal;
pub mod trajectory;

pub use error::{PipelineError, Result};

pub mod experience_buffer;

pub use experience_buffer::{ExperienceBuffer, batch_ranges};

pub mod inference;
pub mod model;
pub mod model_set;
pub mod optimizer;
pub mod sequential;
pub mod tensors;

pub use model::{Model, ModelKey};
pub use model_set::{ModelSet, build_models};

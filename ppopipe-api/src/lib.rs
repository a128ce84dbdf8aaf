pub mod env;
pub mod learner;
pub mod logging;
pub mod metrics;

pub use env::{Env, EnvState, EnvStep, ParallelVecEnv, StepResult, VecEnv};
pub use learner::{Learner, resolve_device};
pub use metrics::{CollectingSink, MetricSink, TracingSink};

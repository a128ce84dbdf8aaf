pub mod ppo;

pub use ppo::{LearnOutcome, PPOLearner};

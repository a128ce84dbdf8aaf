use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Activation {
    #[default]
    Relu,
    LeakyRelu,
    Sigmoid,
    Tanh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptimizerType {
    Adam,
    #[default]
    AdamW,
    Sgd,
}

/// Shape of one network in the model set.
///
/// An empty `layer_sizes` means the model is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub layer_sizes: Vec<usize>,
    pub activation: Activation,
    pub optimizer: OptimizerType,
    pub add_output_layer: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            layer_sizes: vec![],
            activation: Activation::Relu,
            optimizer: OptimizerType::AdamW,
            add_output_layer: true,
        }
    }
}

impl ModelConfig {
    pub fn new(layer_sizes: Vec<usize>) -> Self {
        Self {
            layer_sizes,
            ..Default::default()
        }
    }

    pub fn without_output_layer(mut self) -> Self {
        self.add_output_layer = false;
        self
    }

    pub fn is_valid(&self) -> bool {
        !self.layer_sizes.is_empty() && self.layer_sizes.iter().all(|&size| size > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PPOLearnerConfig {
    /// Rows collected per iteration.
    pub ts_per_itr: usize,
    pub batch_size: usize,
    /// Zero means one minibatch per batch.
    pub mini_batch_size: usize,
    /// Let the final batch absorb a trailing remainder instead of emitting it on its own.
    pub overbatching: bool,
    pub epochs: usize,
    pub policy_lr: f64,
    pub critic_lr: f64,
    pub entropy_scale: f32,
    /// Normalize entropy by the number of valid actions instead of all actions.
    pub mask_entropy: bool,
    pub clip_range: f32,
    pub policy_temperature: f32,
    pub gae_lambda: f32,
    pub gae_gamma: f32,
    pub reward_clip_range: f32,
    pub deterministic: bool,
    pub use_guiding_policy: bool,
    pub guiding_policy_path: String,
    pub guiding_strength: f32,
    pub max_grad_norm: f32,
    pub policy: ModelConfig,
    pub critic: ModelConfig,
    pub shared_head: ModelConfig,
}

impl Default for PPOLearnerConfig {
    fn default() -> Self {
        Self {
            ts_per_itr: 50_000,
            batch_size: 50_000,
            mini_batch_size: 0,
            overbatching: true,
            epochs: 2,
            policy_lr: 3e-4,
            critic_lr: 3e-4,
            entropy_scale: 0.018,
            mask_entropy: false,
            clip_range: 0.2,
            policy_temperature: 1.,
            gae_lambda: 0.95,
            gae_gamma: 0.99,
            reward_clip_range: 200.,
            deterministic: false,
            use_guiding_policy: false,
            guiding_policy_path: "guiding_policy/".to_owned(),
            guiding_strength: 0.03,
            max_grad_norm: 0.5,
            policy: ModelConfig::new(vec![256, 256, 256]),
            critic: ModelConfig::new(vec![256, 256, 256]),
            shared_head: ModelConfig::new(vec![256]).without_output_layer(),
        }
    }
}

impl PPOLearnerConfig {
    /// Checks the configuration and resolves a zero minibatch size to the batch size.
    pub fn validate(&mut self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::config("batch_size must be positive"));
        }
        if self.epochs == 0 {
            return Err(PipelineError::config("epochs must be positive"));
        }
        if self.mini_batch_size == 0 {
            self.mini_batch_size = self.batch_size;
        }
        if self.batch_size % self.mini_batch_size != 0 {
            return Err(PipelineError::config(format!(
                "mini_batch_size ({}) must evenly divide batch_size ({})",
                self.mini_batch_size, self.batch_size
            )));
        }
        if self.clip_range < 0. {
            return Err(PipelineError::config("clip_range cannot be negative"));
        }
        if self.policy_temperature <= 0. {
            return Err(PipelineError::config("policy_temperature must be positive"));
        }
        if !self.policy.is_valid() {
            return Err(PipelineError::config("policy model needs at least one layer"));
        }
        if !self.critic.is_valid() {
            return Err(PipelineError::config("critic model needs at least one layer"));
        }
        if self.shared_head.is_valid() && self.shared_head.add_output_layer {
            return Err(PipelineError::config(
                "shared head must not have an output layer",
            ));
        }
        Ok(())
    }

    /// The shared trunk trains at the slower of the two learning rates.
    pub fn shared_head_lr(&self) -> f64 {
        self.policy_lr.min(self.critic_lr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceKind {
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    pub ppo: PPOLearnerConfig,
    /// `None` seeds from the clock.
    pub random_seed: Option<u64>,
    pub device: DeviceKind,
    /// Steps after which an episode is cut off as truncated. Zero disables the limit.
    pub max_episode_length: usize,
    pub standardize_returns: bool,
    pub max_return_samples: usize,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            ppo: PPOLearnerConfig::default(),
            random_seed: None,
            device: DeviceKind::Auto,
            max_episode_length: 1800,
            standardize_returns: true,
            max_return_samples: 150,
        }
    }
}

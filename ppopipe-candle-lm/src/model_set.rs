use crate::model::{Model, ModelKey};
use candle_core::{Device, Tensor, Var};
use ppopipe_core::config::PPOLearnerConfig;
use ppopipe_core::{PipelineError, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Networks addressed by role. The shared head, when present, feeds both the policy and the critic.
#[derive(Debug, Default)]
pub struct ModelSet {
    models: BTreeMap<ModelKey, Model>,
}

impl ModelSet {
    pub fn insert(&mut self, model: Model) -> Option<Model> {
        self.models.insert(model.key, model)
    }

    pub fn get(&self, key: ModelKey) -> Option<&Model> {
        self.models.get(&key)
    }

    pub fn get_mut(&mut self, key: ModelKey) -> Option<&mut Model> {
        self.models.get_mut(&key)
    }

    pub fn require(&self, key: ModelKey) -> Result<&Model> {
        self.get(key).ok_or(PipelineError::MissingModel(key.name()))
    }

    pub fn require_mut(&mut self, key: ModelKey) -> Result<&mut Model> {
        self.get_mut(key)
            .ok_or(PipelineError::MissingModel(key.name()))
    }

    pub fn contains(&self, key: ModelKey) -> bool {
        self.models.contains_key(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModelKey, &Model)> {
        self.models.iter().map(|(key, model)| (*key, model))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Observations run through the shared head, or unchanged when there is none.
    pub fn trunk(&self, observations: &Tensor) -> Result<Tensor> {
        match self.get(ModelKey::SharedHead) {
            Some(head) => head.forward(observations),
            None => Ok(observations.clone()),
        }
    }

    pub fn vars(&self, keys: &[ModelKey]) -> Vec<Var> {
        keys.iter()
            .filter_map(|key| self.get(*key))
            .flat_map(|model| model.vars().iter().cloned())
            .collect()
    }

    pub fn param_count(&self) -> usize {
        self.models.values().map(Model::param_count).sum()
    }

    pub fn log_param_counts(&self) {
        for (key, model) in &self.models {
            info!(model = key.name(), params = model.param_count(), "model parameters");
        }
        info!(params = self.param_count(), "total parameters");
    }

    /// Writes every model to `<dir>/<NAME>.safetensors`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for model in self.models.values() {
            model.save(dir)?;
        }
        info!(dir = %dir.display(), "saved models");
        Ok(())
    }

    /// Loads every model in the set from `dir`. Files for models outside the set are ignored.
    /// With `allow_missing` a model without a file keeps its current parameters.
    pub fn load(&mut self, dir: &Path, allow_missing: bool) -> Result<()> {
        for model in self.models.values_mut() {
            if allow_missing && !model.path_in(dir).exists() {
                warn!(model = model.key.name(), dir = %dir.display(), "no saved parameters, keeping initialization");
                continue;
            }
            model.load(dir)?;
        }
        info!(dir = %dir.display(), "loaded models");
        Ok(())
    }
}

/// Builds the shared head (if configured), the policy and optionally the critic.
pub fn build_models(
    config: &PPOLearnerConfig,
    obs_size: usize,
    num_actions: usize,
    with_critic: bool,
    device: &Device,
) -> Result<ModelSet> {
    let mut models = ModelSet::default();
    let mut trunk_outputs = obs_size;
    if config.shared_head.is_valid() {
        let head = Model::new(
            ModelKey::SharedHead,
            config.shared_head.clone(),
            obs_size,
            0,
            config.shared_head_lr(),
            device,
        )?;
        trunk_outputs = head.num_outputs;
        models.insert(head);
    }
    models.insert(Model::new(
        ModelKey::Policy,
        config.policy.clone(),
        trunk_outputs,
        num_actions,
        config.policy_lr,
        device,
    )?);
    if with_critic {
        models.insert(Model::new(
            ModelKey::Critic,
            config.critic.clone(),
            trunk_outputs,
            1,
            config.critic_lr,
            device,
        )?);
    }
    Ok(models)
}

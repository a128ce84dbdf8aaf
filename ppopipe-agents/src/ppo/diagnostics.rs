use candle_core::Tensor;
use ppopipe_candle_lm::{ModelKey, ModelSet};
use ppopipe_core::Result;
use ppopipe_core::report::Report;
use ppopipe_core::stats::AvgTracker;

/// Scalars read back from one minibatch. `None` when the head producing them did not train.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinibatchStats {
    pub entropy: Option<f32>,
    pub kl: Option<f32>,
    pub clip_fraction: Option<f32>,
    pub policy_loss: Option<f32>,
    pub critic_loss: Option<f32>,
    pub guiding_loss: Option<f32>,
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    entropy: AvgTracker,
    kl: AvgTracker,
    clip_fraction: AvgTracker,
    policy_loss: AvgTracker,
    critic_loss: AvgTracker,
    guiding_loss: AvgTracker,
    pub completed_minibatches: usize,
    pub faulted_minibatches: usize,
}

fn track(avg: &mut AvgTracker, value: Option<f32>) {
    if let Some(value) = value {
        avg.add(value as f64);
    }
}

impl Diagnostics {
    pub fn record(&mut self, stats: &MinibatchStats) {
        self.completed_minibatches += 1;
        track(&mut self.entropy, stats.entropy);
        track(&mut self.kl, stats.kl);
        track(&mut self.clip_fraction, stats.clip_fraction);
        track(&mut self.policy_loss, stats.policy_loss);
        track(&mut self.critic_loss, stats.critic_loss);
        track(&mut self.guiding_loss, stats.guiding_loss);
    }
}

pub fn magnitude_key(key: ModelKey) -> &'static str {
    match key {
        ModelKey::SharedHead => "Shared Head Update Magnitude",
        ModelKey::Policy => "Policy Update Magnitude",
        ModelKey::Critic => "Critic Update Magnitude",
    }
}

/// Flattened parameters of the trained models taken before an update.
pub struct ParamSnapshot {
    params: Vec<(ModelKey, Tensor)>,
}

impl ParamSnapshot {
    pub fn capture(models: &ModelSet, keys: &[ModelKey]) -> Result<Self> {
        let params = keys
            .iter()
            .map(|&key| -> Result<(ModelKey, Tensor)> {
                Ok((key, models.require(key)?.copy_params()?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { params })
    }

    /// L2 norm of the parameter change of every captured model.
    pub fn update_magnitudes(&self, models: &ModelSet) -> Result<Vec<(ModelKey, f32)>> {
        self.params
            .iter()
            .map(|(key, before)| -> Result<(ModelKey, f32)> {
                let after = models.require(*key)?.copy_params()?;
                let magnitude = (before - after)?.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
                Ok((*key, magnitude))
            })
            .collect()
    }
}

pub struct LearnSummary {
    pub diagnostics: Diagnostics,
    pub update_magnitudes: Vec<(ModelKey, f32)>,
}

impl LearnSummary {
    pub fn write_to(&self, report: &mut Report, is_first_iteration: bool) {
        let d = &self.diagnostics;
        let mut put = |key: &str, avg: &AvgTracker| {
            if let Some(value) = avg.get() {
                report.set(key, value);
            }
        };
        put("Policy Entropy", &d.entropy);
        put("Mean KL Divergence", &d.kl);
        if is_first_iteration {
            return;
        }
        put("Policy Loss", &d.policy_loss);
        put("Critic Loss", &d.critic_loss);
        put("Guiding Loss", &d.guiding_loss);
        put("SB3 Clip Fraction", &d.clip_fraction);
        for (key, magnitude) in &self.update_magnitudes {
            report.set(magnitude_key(*key), *magnitude as f64);
        }
    }
}

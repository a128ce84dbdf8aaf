use super::PPOLearner;
use super::diagnostics::MinibatchStats;
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor};
use ppopipe_candle_lm::ModelKey;
use ppopipe_candle_lm::inference::{masked_probs, mean_entropy, policy_probs};
use ppopipe_candle_lm::tensors::{Logp, LogpDiff, PolicyLoss, ValueLoss, ValuesPred};
use ppopipe_core::tensors::ExperienceTensors;
use ppopipe_core::{PipelineError, Result};
use std::ops::Deref;

#[derive(Debug, Clone, Copy)]
pub struct TrainFlags {
    pub policy: bool,
    pub critic: bool,
    pub shared_head: bool,
}

impl TrainFlags {
    pub fn trained_keys(&self) -> Vec<ModelKey> {
        let mut keys = Vec::with_capacity(3);
        if self.shared_head {
            keys.push(ModelKey::SharedHead);
        }
        if self.policy {
            keys.push(ModelKey::Policy);
        }
        if self.critic {
            keys.push(ModelKey::Critic);
        }
        keys
    }
}

pub struct MinibatchStep {
    pub grads: Option<GradStore>,
    pub stats: MinibatchStats,
}

pub enum MinibatchOutcome {
    Completed(MinibatchStep),
    Faulted(PipelineError),
}

struct PolicyTerms {
    objective: Tensor,
    stats: MinibatchStats,
}

impl PPOLearner {
    pub(super) fn run_minibatch(
        &self,
        batch: &ExperienceTensors,
        start: usize,
        len: usize,
        flags: TrainFlags,
    ) -> MinibatchOutcome {
        match self.minibatch_step(batch, start, len, flags) {
            Ok(step) => MinibatchOutcome::Completed(step),
            Err(err) => MinibatchOutcome::Faulted(err),
        }
    }

    fn minibatch_step(
        &self,
        batch: &ExperienceTensors,
        start: usize,
        len: usize,
        flags: TrainFlags,
    ) -> Result<MinibatchStep> {
        let minibatch = batch.narrow(start, len)?;
        let batch_ratio = len as f64 / self.config.batch_size as f64;
        let states = ExperienceTensors::require("states", &minibatch.states)?;
        let trunk = self.models.trunk(states)?;

        let mut stats = MinibatchStats::default();
        let policy_objective = if flags.policy {
            let terms = self.policy_terms(&minibatch, &trunk, batch_ratio)?;
            stats = terms.stats;
            Some(terms.objective)
        } else {
            None
        };

        let critic_loss = if flags.critic {
            let targets = ExperienceTensors::require("target_values", &minibatch.target_values)?;
            let values = ValuesPred(
                self.models
                    .require(ModelKey::Critic)?
                    .forward(&trunk)?
                    .flatten_all()?,
            );
            let value_loss = ValueLoss((values.deref() - targets)?.sqr()?.mean_all()?);
            stats.critic_loss = Some(value_loss.to_scalar::<f32>()?);
            Some((value_loss.deref() * batch_ratio)?)
        } else {
            None
        };

        // single backward over the combined loss
        let loss = match (policy_objective, critic_loss) {
            (Some(policy), Some(critic)) => (policy + critic)?,
            (Some(policy), None) => policy,
            (None, Some(critic)) => critic,
            (None, None) => {
                return Ok(MinibatchStep {
                    grads: None,
                    stats,
                });
            }
        };
        let value = loss.to_scalar::<f32>()?;
        if !value.is_finite() {
            return Err(PipelineError::NumericalFault(format!(
                "minibatch loss is {value}"
            )));
        }
        Ok(MinibatchStep {
            grads: Some(loss.backward()?),
            stats,
        })
    }

    fn policy_terms(
        &self,
        minibatch: &ExperienceTensors,
        trunk: &Tensor,
        batch_ratio: f64,
    ) -> Result<PolicyTerms> {
        let actions = ExperienceTensors::require("actions", &minibatch.actions)?;
        let masks = ExperienceTensors::require("action_masks", &minibatch.action_masks)?;
        let old_log_probs = ExperienceTensors::require("log_probs", &minibatch.log_probs)?;
        let advantages = ExperienceTensors::require("advantages", &minibatch.advantages)?;
        let clip_range = self.config.clip_range as f64;

        let logits = self.models.require(ModelKey::Policy)?.forward(trunk)?;
        let probs = masked_probs(&logits, masks, self.config.policy_temperature)?;
        let logp = Logp(probs.gather(&actions.unsqueeze(1)?, 1)?.squeeze(1)?.log()?);
        let entropy = mean_entropy(&probs, masks, self.config.mask_entropy)?;

        let logp_diff = LogpDiff((logp.deref() - old_log_probs)?);
        let ratio = logp_diff.exp()?;
        let clip_adv = (ratio.clamp(1. - clip_range, 1. + clip_range)? * advantages)?;
        let policy_loss = PolicyLoss(
            Tensor::minimum(&(&ratio * advantages)?, &clip_adv)?
                .mean_all()?
                .neg()?,
        );
        let entropy_bonus = (&entropy * self.config.entropy_scale as f64)?;
        let mut objective = ((policy_loss.deref() - entropy_bonus)? * batch_ratio)?;

        let mut stats = MinibatchStats::default();
        if let Some(guiding) = &self.guiding_models {
            let states = ExperienceTensors::require("states", &minibatch.states)?;
            let guiding_probs =
                policy_probs(guiding, states, masks, self.config.policy_temperature)?.detach();
            let guiding_loss = (guiding_probs - probs.deref())?.abs()?.mean_all()?;
            stats.guiding_loss = Some(guiding_loss.to_scalar::<f32>()?);
            objective = (objective + (guiding_loss * self.config.guiding_strength as f64)?)?;
        }

        let log_ratio = logp_diff.detach();
        let kl = ((log_ratio.exp()? - 1.)? - &log_ratio)?.mean_all()?;
        let clip_fraction = (ratio.detach() - 1.)?
            .abs()?
            .gt(clip_range)?
            .to_dtype(DType::F32)?
            .mean_all()?;

        stats.entropy = Some(entropy.to_scalar::<f32>()?);
        stats.kl = Some(kl.to_scalar::<f32>()?);
        stats.clip_fraction = Some(clip_fraction.to_scalar::<f32>()?);
        stats.policy_loss = Some(policy_loss.to_scalar::<f32>()?);
        Ok(PolicyTerms { objective, stats })
    }
}

mod diagnostics;
mod minibatch;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor};
use derive_more::Display;
use diagnostics::{Diagnostics, LearnSummary, ParamSnapshot};
use minibatch::{MinibatchOutcome, TrainFlags};
use ppopipe_candle_lm::optimizer::accumulate_grads;
use ppopipe_candle_lm::{ModelKey, ModelSet, build_models};
use ppopipe_core::buffers::ExperienceBuffer;
use ppopipe_core::config::PPOLearnerConfig;
use ppopipe_core::pipeline::DoubleBufferedBatches;
use ppopipe_core::report::Report;
use ppopipe_core::tensors::ExperienceTensors;
use ppopipe_core::{PipelineError, Result};
use std::path::Path;
use tracing::{debug, error, info, warn};

pub use diagnostics::magnitude_key;

/// Whether `learn` ran to completion or gave up on the iteration after a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnOutcome {
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, Copy, Default, Display)]
enum LearnStage {
    #[default]
    #[display("snapshot")]
    Snapshot,
    #[display("get_batches")]
    GetBatches,
    #[display("batch_loop")]
    BatchLoop,
    #[display("optimizer_step")]
    OptimizerStep,
    #[display("report")]
    Report,
}

#[derive(Debug, Default)]
struct FaultContext {
    stage: LearnStage,
    action_min: u32,
    action_max: u32,
    batch_rows: usize,
}

fn action_bounds(actions: Option<&Tensor>) -> Option<(u32, u32)> {
    let actions = actions?;
    if actions.elem_count() == 0 {
        return None;
    }
    let min = actions.min(0).ok()?.to_scalar::<u32>().ok()?;
    let max = actions.max(0).ok()?.to_scalar::<u32>().ok()?;
    Some((min, max))
}

fn normalize_advantages(advantages: &Tensor) -> Result<Tensor> {
    let rows = advantages.elem_count();
    let mean = advantages.mean_all()?;
    let centered = advantages.broadcast_sub(&mean)?;
    let std = (centered.sqr()?.sum_all()? / (rows - 1) as f64)?.sqrt()?;
    Ok(centered.broadcast_div(&(std + 1e-8)?)?)
}

/// Clipped-surrogate PPO over a shared head, a policy and a critic.
pub struct PPOLearner {
    pub config: PPOLearnerConfig,
    pub models: ModelSet,
    /// Frozen policy whose action distribution regularizes training.
    pub guiding_models: Option<ModelSet>,
    pub device: Device,
    pub obs_size: usize,
    pub num_actions: usize,
}

impl PPOLearner {
    pub fn new(
        obs_size: usize,
        num_actions: usize,
        mut config: PPOLearnerConfig,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        if num_actions == 0 {
            return Err(PipelineError::Config("at least one action is required".into()));
        }
        let models = build_models(&config, obs_size, num_actions, true, &device)?;
        models.log_param_counts();

        let guiding_models = if config.use_guiding_policy {
            info!(path = %config.guiding_policy_path, "loading guiding policy");
            let mut guiding = build_models(&config, obs_size, num_actions, false, &device)?;
            guiding.load(Path::new(&config.guiding_policy_path), false)?;
            Some(guiding)
        } else {
            None
        };

        Ok(Self {
            config,
            models,
            guiding_models,
            device,
            obs_size,
            num_actions,
        })
    }

    pub fn max_action_index(&self) -> u32 {
        self.num_actions.saturating_sub(1) as u32
    }

    /// The shared head follows the slower of the two rates. A rate of zero freezes its model.
    pub fn set_learning_rates(&mut self, policy_lr: f64, critic_lr: f64) -> Result<()> {
        self.config.policy_lr = policy_lr;
        self.config.critic_lr = critic_lr;
        self.models
            .require_mut(ModelKey::Policy)?
            .set_learning_rate(policy_lr);
        self.models
            .require_mut(ModelKey::Critic)?
            .set_learning_rate(critic_lr);
        let shared_head_lr = self.config.shared_head_lr();
        if let Some(head) = self.models.get_mut(ModelKey::SharedHead) {
            head.set_learning_rate(shared_head_lr);
        }
        info!(policy_lr, critic_lr, shared_head_lr, "learning rates updated");
        Ok(())
    }

    fn train_flags(&self) -> TrainFlags {
        let policy = self.config.policy_lr != 0.;
        let critic = self.config.critic_lr != 0.;
        TrainFlags {
            policy,
            critic,
            shared_head: self.models.contains(ModelKey::SharedHead)
                && (policy || critic)
                && self.config.shared_head_lr() != 0.,
        }
    }

    /// Runs `epochs` passes over the buffered experience and writes diagnostics to `report`.
    ///
    /// Refuses to train a deterministic policy. Any other fault abandons the iteration: it is
    /// logged, `report` is left untouched and parameters keep whatever updates already landed.
    pub fn learn(
        &mut self,
        experience: &mut ExperienceBuffer,
        report: &mut Report,
        is_first_iteration: bool,
    ) -> Result<LearnOutcome> {
        if self.config.deterministic {
            return Err(PipelineError::Config(
                "cannot train while the policy is deterministic".into(),
            ));
        }
        let mut ctx = FaultContext::default();
        match self.try_learn(experience, is_first_iteration, &mut ctx) {
            Ok(summary) => {
                summary.write_to(report, is_first_iteration);
                Ok(LearnOutcome::Completed)
            }
            Err(err) => {
                error!(
                    stage = %ctx.stage,
                    action_min = ctx.action_min,
                    action_max = ctx.action_max,
                    batch_rows = ctx.batch_rows,
                    %err,
                    "abandoning PPO iteration"
                );
                Ok(LearnOutcome::Abandoned)
            }
        }
    }

    fn try_learn(
        &mut self,
        experience: &mut ExperienceBuffer,
        is_first_iteration: bool,
        ctx: &mut FaultContext,
    ) -> Result<LearnSummary> {
        let flags = self.train_flags();
        let trained = flags.trained_keys();
        ctx.stage = LearnStage::Snapshot;
        let snapshot = if is_first_iteration {
            None
        } else {
            Some(ParamSnapshot::capture(&self.models, &trained)?)
        };

        let max_action_index = self.max_action_index();
        let mut diagnostics = Diagnostics::default();
        let mut pipeline = DoubleBufferedBatches::new(self.device.clone())?;
        for epoch in 0..self.config.epochs {
            ctx.stage = LearnStage::GetBatches;
            let batches =
                experience.all_batches_shuffled(self.config.batch_size, self.config.overbatching)?;
            debug!(epoch, batches = batches.len(), "starting epoch");
            pipeline.set_batches(batches)?;
            pipeline.start_prefetch(0)?;

            for batch_idx in 0..pipeline.len() {
                ctx.stage = LearnStage::BatchLoop;
                pipeline.prefetch_next(batch_idx)?;
                let batch = self.prepare_batch(pipeline.get_batch(batch_idx)?, max_action_index)?;
                ctx.batch_rows = batch.row_count();
                if let Some((min, max)) = action_bounds(batch.actions.as_ref()) {
                    ctx.action_min = min;
                    ctx.action_max = max;
                }

                let Some(mut grads) = self.run_batch(&batch, flags, &mut diagnostics, ctx)? else {
                    continue;
                };
                ctx.stage = LearnStage::OptimizerStep;
                self.apply_gradients(&mut grads, &trained)?;
            }
            pipeline.wait_pending_prefetch()?;
        }

        ctx.stage = LearnStage::Report;
        if diagnostics.faulted_minibatches > 0 {
            warn!(
                faulted = diagnostics.faulted_minibatches,
                completed = diagnostics.completed_minibatches,
                "some minibatches were skipped"
            );
        }
        let update_magnitudes = match snapshot {
            Some(snapshot) => snapshot.update_magnitudes(&self.models)?,
            None => vec![],
        };
        Ok(LearnSummary {
            diagnostics,
            update_magnitudes,
        })
    }

    /// Clamps actions into range and standardizes advantages over the batch. A non-empty
    /// batch without actions or advantages is malformed and fails the iteration.
    fn prepare_batch(
        &self,
        mut batch: ExperienceTensors,
        max_action_index: u32,
    ) -> Result<ExperienceTensors> {
        if batch.is_empty() {
            return Ok(batch);
        }
        let actions = ExperienceTensors::require("actions", &batch.actions)?;
        batch.actions = Some(actions.clamp(0u32, max_action_index)?);
        let advantages = ExperienceTensors::require("advantages", &batch.advantages)?;
        if advantages.elem_count() > 1 {
            batch.advantages = Some(normalize_advantages(advantages)?);
        }
        Ok(batch)
    }

    /// Runs every minibatch of `batch` and sums their gradients. Faulted minibatches are skipped.
    fn run_batch(
        &self,
        batch: &ExperienceTensors,
        flags: TrainFlags,
        diagnostics: &mut Diagnostics,
        ctx: &FaultContext,
    ) -> Result<Option<GradStore>> {
        let rows = batch.row_count();
        if rows == 0 {
            return Ok(None);
        }
        let mini_batch_size = if self.device.is_cpu() {
            rows
        } else {
            self.config.mini_batch_size.max(1)
        };
        let vars = self.models.vars(&flags.trained_keys());

        let mut accumulated = None;
        for start in (0..rows).step_by(mini_batch_size) {
            let len = mini_batch_size.min(rows - start);
            match self.run_minibatch(batch, start, len, flags) {
                MinibatchOutcome::Completed(step) => {
                    diagnostics.record(&step.stats);
                    if let Some(grads) = step.grads {
                        accumulate_grads(&mut accumulated, grads, &vars)?;
                    }
                }
                MinibatchOutcome::Faulted(err) => {
                    diagnostics.faulted_minibatches += 1;
                    warn!(
                        start,
                        rows = len,
                        action_min = ctx.action_min,
                        action_max = ctx.action_max,
                        %err,
                        "skipping PPO minibatch"
                    );
                }
            }
        }
        Ok(accumulated)
    }

    fn apply_gradients(&mut self, grads: &mut GradStore, trained: &[ModelKey]) -> Result<()> {
        let max_grad_norm = self.config.max_grad_norm;
        for &key in trained {
            let model = self.models.require_mut(key)?;
            if max_grad_norm > 0. {
                let norm = model.clip_grad_norm(grads, max_grad_norm)?;
                debug!(model = key.name(), norm, "gradient norm");
            }
            model.step(grads)?;
        }
        Ok(())
    }
}

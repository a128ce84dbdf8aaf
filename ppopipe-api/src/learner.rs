use crate::env::{EnvState, StepResult, VecEnv};
use crate::metrics::MetricSink;
use candle_core::{Device, Tensor};
use ppopipe_agents::{LearnOutcome, PPOLearner};
use ppopipe_candle_lm::inference::{infer_actions, infer_critic_batched};
use ppopipe_core::buffers::ExperienceBuffer;
use ppopipe_core::config::{DeviceKind, LearnerConfig};
use ppopipe_core::gae::{self, GaeParams};
use ppopipe_core::report::Report;
use ppopipe_core::rng::{self, derive_seed, worker_rng};
use ppopipe_core::stats::WelfordStat;
use ppopipe_core::tensors::ExperienceTensors;
use ppopipe_core::terminal::TerminalType;
use ppopipe_core::trajectory::Trajectory;
use ppopipe_core::{PipelineError, Result};
use rand::{Rng, rngs::StdRng};
use std::time::Instant;
use tracing::{debug, info, warn};

const ENV_SEED_STREAM: u64 = 0;
const BUFFER_SEED_STREAM: u64 = 1;
const ACTION_SEED_STREAM: u64 = 2;

pub fn resolve_device(kind: DeviceKind) -> Result<Device> {
    Ok(match kind {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Cuda(ordinal) => Device::new_cuda(ordinal)?,
        DeviceKind::Auto => Device::cuda_if_available(0)?,
    })
}

fn mean(values: &[f32]) -> f64 {
    if values.is_empty() {
        return 0.;
    }
    values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64
}

fn rate(steps: usize, seconds: f64) -> f64 {
    if seconds > 0. { steps as f64 / seconds } else { 0. }
}

/// Drives collect, estimate and update iterations against a vectorized environment.
pub struct Learner<V: VecEnv> {
    pub config: LearnerConfig,
    pub env: V,
    pub ppo: PPOLearner,
    pub experience: ExperienceBuffer,
    pub return_stat: WelfordStat,
    pub total_timesteps: u64,
    pub total_iterations: u64,
    /// Episodes in progress, one per agent.
    trajectories: Vec<Trajectory>,
    state: EnvState,
    action_rng: StdRng,
    seed: u64,
}

impl<V: VecEnv> Learner<V> {
    pub fn new(mut env: V, config: LearnerConfig) -> Result<Self> {
        if config.ppo.ts_per_itr == 0 {
            return Err(PipelineError::Config("ts_per_itr must be positive".into()));
        }
        let agents = env.num_agents();
        if agents == 0 {
            return Err(PipelineError::Config("the environment has no agents".into()));
        }
        let seed = config.random_seed.unwrap_or_else(rng::seed_from_time);
        let device = resolve_device(config.device)?;
        let (obs_size, num_actions) = (env.obs_size(), env.num_actions());
        let ppo = PPOLearner::new(obs_size, num_actions, config.ppo.clone(), device.clone())?;
        let experience = ExperienceBuffer::new(derive_seed(seed, BUFFER_SEED_STREAM), Device::Cpu)
            .with_max_action_index(ppo.max_action_index());
        let state = env.reset(derive_seed(seed, ENV_SEED_STREAM))?;
        info!(seed, ?device, obs_size, num_actions, agents, "learner ready");

        let mut learner = Self {
            // The engine holds the resolved minibatch size.
            config: LearnerConfig {
                ppo: ppo.config.clone(),
                ..config
            },
            env,
            ppo,
            experience,
            return_stat: WelfordStat::default(),
            total_timesteps: 0,
            total_iterations: 0,
            trajectories: vec![Trajectory::default(); agents],
            state: EnvState::default(),
            action_rng: worker_rng(seed, ACTION_SEED_STREAM),
            seed,
        };
        learner.check_state(&state)?;
        learner.state = state;
        Ok(learner)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn device(&self) -> &Device {
        &self.ppo.device
    }

    fn check_len(field: &'static str, expected: usize, found: usize) -> Result<()> {
        if expected != found {
            return Err(PipelineError::ShapeMismatch {
                field,
                expected,
                found,
            });
        }
        Ok(())
    }

    fn check_state(&self, state: &EnvState) -> Result<()> {
        let agents = self.env.num_agents();
        Self::check_len("obs", agents * self.env.obs_size(), state.obs.len())?;
        Self::check_len(
            "action_masks",
            agents * self.env.num_actions(),
            state.action_masks.len(),
        )
    }

    fn check_step(&self, step: &StepResult) -> Result<()> {
        let agents = self.env.num_agents();
        self.check_state(&step.state)?;
        Self::check_len("rewards", agents, step.rewards.len())?;
        Self::check_len("terminals", agents, step.terminals.len())?;
        if let Some(final_obs) = &step.final_obs {
            Self::check_len("final_obs", agents * self.env.obs_size(), final_obs.len())?;
        }
        Ok(())
    }

    /// Steps the environment until at least `ts_per_itr` finished rows are gathered.
    ///
    /// Rows only leave an agent's trajectory once its episode ends, either by the
    /// environment or by reaching `max_episode_length`. A length cutoff does not reset
    /// the environment; the following rows start a fresh trajectory from where it left off.
    fn collect(&mut self) -> Result<Trajectory> {
        let agents = self.env.num_agents();
        let obs_size = self.env.obs_size();
        let num_actions = self.env.num_actions();
        let max_len = self.config.max_episode_length;
        let device = self.ppo.device.clone();
        let mut rollout = Trajectory::default();

        while rollout.len() < self.config.ppo.ts_per_itr {
            let obs = Tensor::from_slice(&self.state.obs, (agents, obs_size), &Device::Cpu)?
                .to_device(&device)?;
            let masks = Tensor::from_slice(
                &self.state.action_masks,
                (agents, num_actions),
                &Device::Cpu,
            )?
            .to_device(&device)?;
            let sample = infer_actions(
                &self.ppo.models,
                &obs,
                &masks,
                false,
                self.config.ppo.policy_temperature,
                &mut self.action_rng,
            )?;
            let log_probs = sample.log_probs.unwrap_or_else(|| vec![0.; agents]);

            let step = self.env.step(&sample.actions)?;
            self.check_step(&step)?;
            let final_obs = step.final_obs.as_deref().unwrap_or(&step.state.obs);

            for (agent, trajectory) in self.trajectories.iter_mut().enumerate() {
                let obs_row = agent * obs_size..(agent + 1) * obs_size;
                let mask_row = agent * num_actions..(agent + 1) * num_actions;
                trajectory.push_observation(
                    &self.state.obs[obs_row.clone()],
                    &self.state.action_masks[mask_row],
                );
                trajectory.push_outcome(sample.actions[agent], step.rewards[agent], log_probs[agent]);

                let mut terminal = TerminalType::try_from(step.terminals[agent])?;
                if !terminal.is_terminal() && max_len > 0 && trajectory.len() >= max_len {
                    terminal = TerminalType::Truncated;
                }
                trajectory.push_terminal(terminal, Some(&final_obs[obs_row]));
                if terminal.is_terminal() {
                    rollout.append(trajectory);
                    trajectory.clear();
                }
            }
            self.state = step.state;
        }
        Ok(rollout)
    }

    /// Runs one full iteration and returns its report.
    pub fn run_iteration(&mut self) -> Result<Report> {
        let mut report = Report::default();
        let iteration_start = Instant::now();
        let obs_size = self.env.obs_size();
        let num_actions = self.env.num_actions();

        let rollout = self.collect()?;
        let collection_time = iteration_start.elapsed().as_secs_f64();
        let consumption_start = Instant::now();

        let rows = rollout.len();
        let episodes = rollout.terminals.iter().filter(|t| t.is_terminal()).count();
        let tensors = rollout.to_tensors(obs_size, num_actions)?;

        let device = self.ppo.device.clone();
        let max_batch = self.config.ppo.mini_batch_size;
        let values = infer_critic_batched(&self.ppo.models, &tensors.states, max_batch, &device)?;
        let trunc_values = match &tensors.next_states {
            Some(next_states) => {
                infer_critic_batched(&self.ppo.models, next_states, max_batch, &device)?
            }
            None => vec![],
        };

        let reward_scale = if self.config.standardize_returns {
            self.return_stat.std() as f32
        } else {
            1.
        };
        let params = GaeParams {
            gamma: self.config.ppo.gae_gamma,
            lambda: self.config.ppo.gae_lambda,
            reward_scale,
            clip_range: self.config.ppo.reward_clip_range,
        };
        let estimate = gae::compute(
            &tensors.rewards,
            &tensors.terminals,
            &values,
            &trunc_values,
            &params,
        )?;

        if self.config.standardize_returns && rows > 0 {
            let samples: Vec<f32> = (0..self.config.max_return_samples.min(rows))
                .map(|_| estimate.returns[self.action_rng.random_range(0..rows)])
                .collect();
            self.return_stat.increment(&samples);
        }

        report.set("Average Step Reward", mean(&tensors.rewards));
        report.set("Collected Timesteps", rows as f64);
        report.set("Clipped Reward Portion", estimate.clipped_portion as f64);
        report.set("GAE/Returns STD", reward_scale as f64);
        report.set("GAE/Avg Return", mean(&estimate.returns));
        report.set("GAE/Avg Advantage", mean(&estimate.advantages));
        report.set("GAE/Avg Val Target", mean(&estimate.target_values));
        if episodes > 0 {
            report.set("Episode Length", rows as f64 / episodes as f64);
        }

        let data = ExperienceTensors {
            states: Some(tensors.states),
            actions: Some(tensors.actions),
            log_probs: Some(tensors.log_probs),
            target_values: Some(Tensor::from_vec(estimate.target_values, rows, &Device::Cpu)?),
            action_masks: Some(tensors.action_masks),
            advantages: Some(Tensor::from_vec(estimate.advantages, rows, &Device::Cpu)?),
        };
        self.experience.set_data(data)?;

        let is_first_iteration = self.total_timesteps == 0;
        let learn_start = Instant::now();
        if self.ppo.learn(&mut self.experience, &mut report, is_first_iteration)?
            == LearnOutcome::Abandoned
        {
            warn!(iteration = self.total_iterations, "PPO update abandoned");
        }
        let learn_time = learn_start.elapsed().as_secs_f64();
        self.experience.log_profile();
        self.experience.reset_profile();

        let consumption_time = consumption_start.elapsed().as_secs_f64();
        let overall_time = iteration_start.elapsed().as_secs_f64();
        self.total_timesteps += rows as u64;
        self.total_iterations += 1;

        report.set("PPO Learn Time", learn_time);
        report.set("Collection Time", collection_time);
        report.set("Consumption Time", consumption_time);
        report.set("Collection Steps/Second", rate(rows, collection_time));
        report.set("Consumption Steps/Second", rate(rows, consumption_time));
        report.set("Overall Steps/Second", rate(rows, overall_time));
        report.set("Total Timesteps", self.total_timesteps as f64);
        report.set("Total Iterations", self.total_iterations as f64);
        debug!(iteration = self.total_iterations, rows, "iteration done");
        Ok(report)
    }

    /// Runs `iterations` iterations, handing every report to `sink`.
    pub fn train(&mut self, iterations: usize, sink: &mut dyn MetricSink) -> Result<()> {
        for _ in 0..iterations {
            let report = self.run_iteration()?;
            sink.send(&report)?;
        }
        Ok(())
    }
}

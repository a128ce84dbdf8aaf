use ppopipe_core::rng::worker_rng;
use ppopipe_core::terminal::TerminalType;
use ppopipe_core::{PipelineError, Result};
use rand::{Rng, rngs::StdRng};
use rayon::prelude::*;

/// Observations and action masks for every agent, flattened row-major.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvState {
    /// `[num_agents * obs_size]`
    pub obs: Vec<f32>,
    /// `[num_agents * num_actions]`, nonzero marks a valid action.
    pub action_masks: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResult {
    /// State for the next decision. Agents whose episode ended have already been reset.
    pub state: EnvState,
    pub rewards: Vec<f32>,
    /// Raw [`TerminalType`] codes, one per agent.
    pub terminals: Vec<u8>,
    /// Observation each agent reached before any reset, `[num_agents * obs_size]`.
    /// Required whenever an agent was reset during the step.
    pub final_obs: Option<Vec<f32>>,
}

/// A batch of agents stepped in lockstep.
pub trait VecEnv {
    fn obs_size(&self) -> usize;
    fn num_actions(&self) -> usize;
    fn num_agents(&self) -> usize;
    fn reset(&mut self, seed: u64) -> Result<EnvState>;
    fn step(&mut self, actions: &[u32]) -> Result<StepResult>;
}

/// Outcome of one single-agent step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvStep {
    pub obs: Vec<f32>,
    pub action_mask: Vec<u8>,
    pub reward: f32,
    pub terminal: TerminalType,
}

/// A single-agent environment.
pub trait Env: Send {
    fn obs_size(&self) -> usize;
    fn num_actions(&self) -> usize;
    /// Returns the initial observation and action mask.
    fn reset(&mut self, seed: u64) -> Result<(Vec<f32>, Vec<u8>)>;
    fn step(&mut self, action: u32) -> Result<EnvStep>;
}

struct EnvSlot<E> {
    env: E,
    rng: StdRng,
}

impl<E: Env> EnvSlot<E> {
    fn step(&mut self, action: u32) -> Result<(EnvStep, Vec<f32>)> {
        let mut step = self.env.step(action)?;
        let final_obs = step.obs.clone();
        if step.terminal.is_terminal() {
            let (obs, action_mask) = self.env.reset(self.rng.random())?;
            step.obs = obs;
            step.action_mask = action_mask;
        }
        Ok((step, final_obs))
    }
}

/// Steps independent single-agent environments on the rayon pool, resetting finished episodes.
/// Each environment owns a generator derived from the reset seed for its own reseeding.
pub struct ParallelVecEnv<E> {
    slots: Vec<EnvSlot<E>>,
    obs_size: usize,
    num_actions: usize,
}

impl<E: Env> ParallelVecEnv<E> {
    pub fn new(envs: Vec<E>) -> Result<Self> {
        let Some(first) = envs.first() else {
            return Err(PipelineError::Config("at least one environment is required".into()));
        };
        let (obs_size, num_actions) = (first.obs_size(), first.num_actions());
        if envs
            .iter()
            .any(|env| env.obs_size() != obs_size || env.num_actions() != num_actions)
        {
            return Err(PipelineError::Config(
                "all environments must share observation and action sizes".into(),
            ));
        }
        let slots = envs
            .into_iter()
            .enumerate()
            .map(|(idx, env)| EnvSlot {
                env,
                rng: worker_rng(0, idx as u64),
            })
            .collect();
        Ok(Self {
            slots,
            obs_size,
            num_actions,
        })
    }

    fn check_state(&self, obs: &[f32], action_mask: &[u8]) -> Result<()> {
        if obs.len() != self.obs_size {
            return Err(PipelineError::ShapeMismatch {
                field: "obs",
                expected: self.obs_size,
                found: obs.len(),
            });
        }
        if action_mask.len() != self.num_actions {
            return Err(PipelineError::ShapeMismatch {
                field: "action_masks",
                expected: self.num_actions,
                found: action_mask.len(),
            });
        }
        Ok(())
    }
}

impl<E: Env> VecEnv for ParallelVecEnv<E> {
    fn obs_size(&self) -> usize {
        self.obs_size
    }

    fn num_actions(&self) -> usize {
        self.num_actions
    }

    fn num_agents(&self) -> usize {
        self.slots.len()
    }

    fn reset(&mut self, seed: u64) -> Result<EnvState> {
        let mut state = EnvState::default();
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            slot.rng = worker_rng(seed, idx as u64);
            let (obs, action_mask) = slot.env.reset(slot.rng.random())?;
            state.obs.extend(obs);
            state.action_masks.extend(action_mask);
        }
        let agents = self.slots.len();
        if state.obs.len() != agents * self.obs_size
            || state.action_masks.len() != agents * self.num_actions
        {
            return Err(PipelineError::ShapeMismatch {
                field: "obs",
                expected: agents * self.obs_size,
                found: state.obs.len(),
            });
        }
        Ok(state)
    }

    fn step(&mut self, actions: &[u32]) -> Result<StepResult> {
        if actions.len() != self.slots.len() {
            return Err(PipelineError::ShapeMismatch {
                field: "actions",
                expected: self.slots.len(),
                found: actions.len(),
            });
        }
        let steps = self
            .slots
            .par_iter_mut()
            .zip(actions.par_iter())
            .map(|(slot, &action)| slot.step(action))
            .collect::<Result<Vec<_>>>()?;

        let agents = steps.len();
        let mut result = StepResult {
            state: EnvState {
                obs: Vec::with_capacity(agents * self.obs_size),
                action_masks: Vec::with_capacity(agents * self.num_actions),
            },
            rewards: Vec::with_capacity(agents),
            terminals: Vec::with_capacity(agents),
            final_obs: None,
        };
        let mut final_obs = Vec::with_capacity(agents * self.obs_size);
        let mut any_reset = false;
        for (step, last_obs) in steps {
            self.check_state(&step.obs, &step.action_mask)?;
            self.check_state(&last_obs, &step.action_mask)?;
            any_reset |= step.terminal.is_terminal();
            result.state.obs.extend(step.obs);
            result.state.action_masks.extend(step.action_mask);
            result.rewards.push(step.reward);
            result.terminals.push(step.terminal.into());
            final_obs.extend(last_obs);
        }
        if any_reset {
            result.final_obs = Some(final_obs);
        }
        Ok(result)
    }
}

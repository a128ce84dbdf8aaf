use crate::error::{PipelineError, Result};
use crate::terminal::{TerminalType, count_truncated};
use candle_core::{Device, Tensor};

/// Host-side steps of one agent, or several agents' finished episodes appended together.
///
/// Row `i` of every per-step vector belongs to the same step. `next_states` only holds
/// the observation that followed each truncated step, in row order.
#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    pub states: Vec<f32>,
    pub next_states: Vec<f32>,
    pub rewards: Vec<f32>,
    pub log_probs: Vec<f32>,
    pub action_masks: Vec<u8>,
    pub terminals: Vec<TerminalType>,
    pub actions: Vec<u32>,
}

/// A trajectory converted for the update engine. Rewards and terminals stay on the host
/// because advantage estimation runs there.
#[derive(Debug, Clone)]
pub struct RolloutTensors {
    pub states: Tensor,
    pub action_masks: Tensor,
    pub actions: Tensor,
    pub log_probs: Tensor,
    pub next_states: Option<Tensor>,
    pub rewards: Vec<f32>,
    pub terminals: Vec<TerminalType>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn push_observation(&mut self, state: &[f32], action_mask: &[u8]) {
        self.states.extend_from_slice(state);
        self.action_masks.extend_from_slice(action_mask);
    }

    pub fn push_outcome(&mut self, action: u32, reward: f32, log_prob: f32) {
        self.actions.push(action);
        self.rewards.push(reward);
        self.log_probs.push(log_prob);
    }

    /// Closes the current step. A truncated step must carry the observation that followed it.
    pub fn push_terminal(&mut self, terminal: TerminalType, next_state: Option<&[f32]>) {
        self.terminals.push(terminal);
        if terminal.is_truncated() {
            if let Some(next_state) = next_state {
                self.next_states.extend_from_slice(next_state);
            }
        }
    }

    pub fn append(&mut self, other: &Trajectory) {
        self.states.extend_from_slice(&other.states);
        self.next_states.extend_from_slice(&other.next_states);
        self.rewards.extend_from_slice(&other.rewards);
        self.log_probs.extend_from_slice(&other.log_probs);
        self.action_masks.extend_from_slice(&other.action_masks);
        self.terminals.extend_from_slice(&other.terminals);
        self.actions.extend_from_slice(&other.actions);
    }

    pub fn clear(&mut self) {
        self.states.clear();
        self.next_states.clear();
        self.rewards.clear();
        self.log_probs.clear();
        self.action_masks.clear();
        self.terminals.clear();
        self.actions.clear();
    }

    pub fn num_truncated(&self) -> usize {
        count_truncated(&self.terminals)
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

    pub fn check_alignment(&self, obs_size: usize, num_actions: usize) -> Result<()> {
        let rows = self.len();
        Self::check_len("states", rows * obs_size, self.states.len())?;
        Self::check_len("rewards", rows, self.rewards.len())?;
        Self::check_len("log_probs", rows, self.log_probs.len())?;
        Self::check_len("terminals", rows, self.terminals.len())?;
        Self::check_len("action_masks", rows * num_actions, self.action_masks.len())?;
        Self::check_len(
            "next_states",
            self.num_truncated() * obs_size,
            self.next_states.len(),
        )
    }

    /// Builds host tensors for every column, converting columns in parallel.
    pub fn to_tensors(&self, obs_size: usize, num_actions: usize) -> Result<RolloutTensors> {
        self.check_alignment(obs_size, num_actions)?;
        let rows = self.len();
        let device = Device::Cpu;
        let truncated = self.num_truncated();
        let ((states, next_states), ((action_masks, actions), log_probs)) = rayon::join(
            || {
                rayon::join(
                    || Tensor::from_slice(&self.states, (rows, obs_size), &device),
                    || {
                        (truncated > 0)
                            .then(|| {
                                Tensor::from_slice(&self.next_states, (truncated, obs_size), &device)
                            })
                            .transpose()
                    },
                )
            },
            || {
                rayon::join(
                    || {
                        rayon::join(
                            || Tensor::from_slice(&self.action_masks, (rows, num_actions), &device),
                            || Tensor::from_slice(&self.actions, rows, &device),
                        )
                    },
                    || Tensor::from_slice(&self.log_probs, rows, &device),
                )
            },
        );
        Ok(RolloutTensors {
            states: states?,
            action_masks: action_masks?,
            actions: actions?,
            log_probs: log_probs?,
            next_states: next_states?,
            rewards: self.rewards.clone(),
            terminals: self.terminals.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_steps_keep_their_next_state() {
        let mut trajectory = Trajectory::default();
        trajectory.push_observation(&[0., 1.], &[1, 1]);
        trajectory.push_outcome(1, 0.5, -0.7);
        trajectory.push_terminal(TerminalType::NotTerminal, Some(&[9., 9.]));
        trajectory.push_observation(&[2., 3.], &[1, 0]);
        trajectory.push_outcome(0, 1.0, -0.1);
        trajectory.push_terminal(TerminalType::Truncated, Some(&[4., 5.]));

        assert_eq!(trajectory.len(), 2);
        assert_eq!(trajectory.next_states, vec![4., 5.]);
        let tensors = trajectory.to_tensors(2, 2).unwrap();
        assert_eq!(tensors.states.dims(), &[2, 2]);
        assert_eq!(tensors.next_states.unwrap().dims(), &[1, 2]);
        assert_eq!(tensors.actions.to_vec1::<u32>().unwrap(), vec![1, 0]);
    }

    #[test]
    fn misaligned_columns_are_rejected() {
        let mut trajectory = Trajectory::default();
        trajectory.push_observation(&[0., 1., 2.], &[1, 1]);
        trajectory.push_outcome(1, 0.5, -0.7);
        trajectory.push_terminal(TerminalType::Normal, None);
        assert!(matches!(
            trajectory.to_tensors(2, 2),
            Err(PipelineError::ShapeMismatch { field: "states", .. })
        ));
    }
}

//! Generalized advantage estimation over a flat rollout.
//!
//! The rollout is a concatenation of episodes. Row boundaries are read from the terminal
//! column: a `Normal` row ends an episode with no future value, a `Truncated` row ends one
//! that bootstraps from the value of the state that followed it.

use crate::error::{PipelineError, Result};
use crate::terminal::{TerminalType, count_truncated};
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaeParams {
    pub gamma: f32,
    pub lambda: f32,
    /// Rewards are divided by this scale unless it is 0 or 1.
    pub reward_scale: f32,
    /// Scaled rewards are clipped to `[-clip_range, clip_range]` when positive. Unscaled
    /// rewards are never clipped.
    pub clip_range: f32,
}

impl Default for GaeParams {
    fn default() -> Self {
        Self {
            gamma: 0.99,
            lambda: 0.95,
            reward_scale: 1.,
            clip_range: 10.,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GaeOutput {
    pub advantages: Vec<f32>,
    pub target_values: Vec<f32>,
    /// Discounted sums of the raw, unscaled rewards.
    pub returns: Vec<f32>,
    /// Share of absolute scaled reward mass removed by clipping.
    pub clipped_portion: f32,
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

/// Scales and clips rewards, returning the processed rewards and the clipped portion.
/// Clipping only applies to scaled rewards.
fn process_rewards(rewards: &[f32], params: &GaeParams) -> (Vec<f32>, f32) {
    let scale = params.reward_scale;
    if scale == 0. || scale == 1. {
        return (rewards.to_vec(), 0.);
    }

    let clip = params.clip_range > 0.;
    let processed: Vec<(f32, f32, f32)> = rewards
        .par_iter()
        .map(|&reward| {
            let scaled = reward / scale;
            let clipped = if clip {
                scaled.clamp(-params.clip_range, params.clip_range)
            } else {
                scaled
            };
            (clipped, scaled.abs(), clipped.abs())
        })
        .collect();

    let (total, kept) = processed
        .iter()
        .fold((0f32, 0f32), |(total, kept), &(_, scaled, clipped)| {
            (total + scaled, kept + clipped)
        });
    let clipped_portion = (total - kept) / total.max(1e-7);
    (
        processed.into_iter().map(|(reward, _, _)| reward).collect(),
        clipped_portion,
    )
}

/// Value of the state after each row, with the episode-continuation flag.
fn next_values(
    terminals: &[TerminalType],
    value_preds: &[f32],
    trunc_value_preds: &[f32],
) -> (Vec<f32>, Vec<f32>) {
    let rows = terminals.len();
    let mut next_value = Vec::with_capacity(rows);
    let mut not_done = Vec::with_capacity(rows);
    let mut trunc_values = trunc_value_preds.iter();
    for (step, terminal) in terminals.iter().enumerate() {
        let value = match terminal {
            TerminalType::Normal => 0.,
            TerminalType::Truncated => trunc_values.next().copied().unwrap_or(0.),
            TerminalType::NotTerminal => value_preds.get(step + 1).copied().unwrap_or(0.),
        };
        next_value.push(value);
        not_done.push(if terminal.is_terminal() { 0. } else { 1. });
    }
    (next_value, not_done)
}

/// Computes advantages, value targets and raw returns.
///
/// `trunc_value_preds` holds one value per truncated row, in row order.
pub fn compute(
    rewards: &[f32],
    terminals: &[TerminalType],
    value_preds: &[f32],
    trunc_value_preds: &[f32],
    params: &GaeParams,
) -> Result<GaeOutput> {
    let rows = rewards.len();
    if rows == 0 {
        return Ok(GaeOutput::default());
    }
    check_len("terminals", rows, terminals.len())?;
    check_len("value_preds", rows, value_preds.len())?;
    let truncated_rows = count_truncated(terminals);
    if truncated_rows != trunc_value_preds.len() {
        return Err(PipelineError::TruncationMismatch {
            truncated_rows,
            bootstrap_values: trunc_value_preds.len(),
        });
    }

    let (processed, clipped_portion) = process_rewards(rewards, params);
    let (next_value, not_done) = next_values(terminals, value_preds, trunc_value_preds);

    let discount = params.gamma * params.lambda;
    let mut advantages = vec![0f32; rows];
    let mut returns = vec![0f32; rows];
    let mut last_advantage = 0f32;
    let mut last_return = 0f32;
    for step in (0..rows).rev() {
        let delta = processed[step] + params.gamma * next_value[step] - value_preds[step];
        last_advantage = delta + discount * not_done[step] * last_advantage;
        last_return = rewards[step] + params.gamma * not_done[step] * last_return;
        advantages[step] = last_advantage;
        returns[step] = last_return;
    }

    let target_values = value_preds
        .par_iter()
        .zip(advantages.par_iter())
        .map(|(value, advantage)| value + advantage)
        .collect();

    Ok(GaeOutput {
        advantages,
        target_values,
        returns,
        clipped_portion,
    })
}

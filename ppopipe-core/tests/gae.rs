use anyhow::Result;
use ppopipe_core::PipelineError;
use ppopipe_core::gae::{GaeParams, compute};
use ppopipe_core::terminal::TerminalType::{self, *};

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < 1e-5, "row {idx}: {a} != {e}");
    }
}

fn plain(gamma: f32, lambda: f32) -> GaeParams {
    GaeParams {
        gamma,
        lambda,
        reward_scale: 1.,
        clip_range: 0.,
    }
}

#[test]
fn every_row_terminal() -> Result<()> {
    let out = compute(
        &[1., 0., 0., 1.],
        &[Normal; 4],
        &[1., 1., 1., 1.],
        &[],
        &plain(0.99, 0.95),
    )?;
    assert_close(&out.advantages, &[0., -1., -1., 0.]);
    assert_close(&out.returns, &[1., 0., 0., 1.]);
    assert_close(&out.target_values, &[1., 0., 0., 1.]);
    assert_eq!(out.clipped_portion, 0.);
    Ok(())
}

#[test]
fn single_episode_with_discounting() -> Result<()> {
    let out = compute(
        &[1., 0., 0., 1.],
        &[NotTerminal, NotTerminal, NotTerminal, Normal],
        &[1., 1., 1., 1.],
        &[],
        &plain(0.99, 0.95),
    )?;
    assert_close(&out.advantages, &[0.971_749_6, -0.019_405, -0.01, 0.]);
    assert_close(&out.returns, &[1.970_299, 0.9801, 0.99, 1.]);
    assert_close(&out.target_values, &[1.971_749_6, 0.980_595, 0.99, 1.]);
    Ok(())
}

#[test]
fn undiscounted_returns_are_future_reward_sums() -> Result<()> {
    let rewards = [0.5, -1., 2., 0.25, 3.];
    let values = [0.1, 0.2, -0.3, 0.4, 0.5];
    let mut terminals = [NotTerminal; 5];
    terminals[4] = Normal;
    let out = compute(&rewards, &terminals, &values, &[], &plain(1., 1.))?;

    let expected: Vec<f32> = (0..rewards.len())
        .map(|t| rewards[t..].iter().sum())
        .collect();
    assert_close(&out.returns, &expected);
    for t in 0..rewards.len() {
        assert_eq!(out.target_values[t], values[t] + out.advantages[t]);
    }
    // with gamma = lambda = 1 the advantage telescopes to return minus value
    let telescoped: Vec<f32> = (0..rewards.len()).map(|t| expected[t] - values[t]).collect();
    assert_close(&out.advantages, &telescoped);
    Ok(())
}

#[test]
fn truncated_rows_bootstrap_in_order() -> Result<()> {
    let terminals = [NotTerminal, Truncated, NotTerminal, Truncated];
    let out = compute(
        &[0., 1., 0., 1.],
        &terminals,
        &[0., 0., 0., 0.],
        &[10., 20.],
        &plain(0.5, 1.),
    )?;
    // row 1 ends its episode and bootstraps from 10, row 3 from 20
    assert_close(&out.advantages, &[3., 6., 5.5, 11.]);
    // raw returns do not include the bootstrap
    assert_close(&out.returns, &[0.5, 1., 0.5, 1.]);
    Ok(())
}

#[test]
fn truncation_mismatch_is_an_error() {
    let terminals: [TerminalType; 2] = [Truncated, Truncated];
    let err = compute(&[0., 0.], &terminals, &[0., 0.], &[1.], &plain(0.99, 0.95)).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::TruncationMismatch {
            truncated_rows: 2,
            bootstrap_values: 1
        }
    ));
}

#[test]
fn empty_rollout() -> Result<()> {
    let out = compute(&[], &[], &[], &[], &GaeParams::default())?;
    assert!(out.advantages.is_empty());
    assert!(out.target_values.is_empty());
    assert!(out.returns.is_empty());
    assert_eq!(out.clipped_portion, 0.);
    Ok(())
}

#[test]
fn reward_scaling_and_clipping() -> Result<()> {
    let params = GaeParams {
        gamma: 0.,
        lambda: 0.,
        reward_scale: 2.,
        clip_range: 1.,
    };
    let out = compute(&[1., -6., 4.], &[Normal; 3], &[0., 0., 0.], &[], &params)?;
    // scaled rewards are 0.5, -3, 2 and clip to 0.5, -1, 1
    assert_close(&out.advantages, &[0.5, -1., 1.]);
    assert_close(&out.returns, &[1., -6., 4.]);
    assert!((out.clipped_portion - 3. / 5.5).abs() < 1e-6);
    Ok(())
}

#[test]
fn unit_scale_leaves_rewards_alone() -> Result<()> {
    let params = GaeParams {
        gamma: 0.,
        lambda: 0.,
        reward_scale: 1.,
        clip_range: 0.,
    };
    let out = compute(&[150., -3.], &[Normal; 2], &[0., 0.], &[], &params)?;
    assert_close(&out.advantages, &[150., -3.]);
    Ok(())
}

#[test]
fn unscaled_rewards_are_not_clipped() -> Result<()> {
    let params = GaeParams {
        gamma: 0.,
        lambda: 0.,
        reward_scale: 1.,
        clip_range: 10.,
    };
    let out = compute(&[50., -3.], &[Normal; 2], &[0., 0.], &[], &params)?;
    assert_close(&out.advantages, &[50., -3.]);
    assert_eq!(out.clipped_portion, 0.);

    let params = GaeParams {
        reward_scale: 0.,
        ..params
    };
    let out = compute(&[50., -3.], &[Normal; 2], &[0., 0.], &[], &params)?;
    assert_close(&out.advantages, &[50., -3.]);
    assert_eq!(out.clipped_portion, 0.);
    Ok(())
}

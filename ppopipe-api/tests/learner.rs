use anyhow::Result;
use ppopipe_api::logging::init_tracing;
use ppopipe_api::{
    CollectingSink, Env, EnvState, EnvStep, Learner, MetricSink, ParallelVecEnv, StepResult,
    TracingSink, VecEnv,
};
use ppopipe_core::config::{DeviceKind, LearnerConfig, ModelConfig, PPOLearnerConfig};
use ppopipe_core::report::Report;
use ppopipe_core::terminal::TerminalType;
use ppopipe_core::PipelineError;

const OBS_SIZE: usize = 2;
const NUM_ACTIONS: usize = 3;

/// Counts steps and ends the episode after `episode_len` of them. Action 0 is masked out.
struct CounterEnv {
    episode_len: usize,
    t: usize,
    offset: f32,
}

impl CounterEnv {
    fn new(episode_len: usize) -> Self {
        Self {
            episode_len,
            t: 0,
            offset: 0.,
        }
    }

    fn obs(&self) -> Vec<f32> {
        vec![self.t as f32 / 10., self.offset]
    }
}

impl Env for CounterEnv {
    fn obs_size(&self) -> usize {
        OBS_SIZE
    }

    fn num_actions(&self) -> usize {
        NUM_ACTIONS
    }

    fn reset(&mut self, seed: u64) -> ppopipe_core::Result<(Vec<f32>, Vec<u8>)> {
        self.t = 0;
        self.offset = (seed % 1000) as f32 / 1000.;
        Ok((self.obs(), vec![0, 1, 1]))
    }

    fn step(&mut self, action: u32) -> ppopipe_core::Result<EnvStep> {
        assert_ne!(action, 0, "masked action was taken");
        self.t += 1;
        let terminal = if self.episode_len > 0 && self.t >= self.episode_len {
            TerminalType::Normal
        } else {
            TerminalType::NotTerminal
        };
        Ok(EnvStep {
            obs: self.obs(),
            action_mask: vec![0, 1, 1],
            reward: 1.,
            terminal,
        })
    }
}

fn counter_envs(agents: usize, episode_len: usize) -> Result<ParallelVecEnv<CounterEnv>> {
    Ok(ParallelVecEnv::new(
        (0..agents).map(|_| CounterEnv::new(episode_len)).collect(),
    )?)
}

fn config(ts_per_itr: usize) -> LearnerConfig {
    LearnerConfig {
        ppo: PPOLearnerConfig {
            ts_per_itr,
            batch_size: 16,
            mini_batch_size: 8,
            epochs: 1,
            policy_lr: 1e-3,
            critic_lr: 1e-3,
            policy: ModelConfig::new(vec![8]),
            critic: ModelConfig::new(vec![8]),
            shared_head: ModelConfig::default(),
            ..Default::default()
        },
        random_seed: Some(3),
        device: DeviceKind::Cpu,
        max_episode_length: 0,
        ..Default::default()
    }
}

const DRIVER_KEYS: [&str; 16] = [
    "Average Step Reward",
    "Collected Timesteps",
    "Clipped Reward Portion",
    "GAE/Returns STD",
    "GAE/Avg Return",
    "GAE/Avg Advantage",
    "GAE/Avg Val Target",
    "Episode Length",
    "PPO Learn Time",
    "Collection Time",
    "Consumption Time",
    "Collection Steps/Second",
    "Consumption Steps/Second",
    "Overall Steps/Second",
    "Total Timesteps",
    "Total Iterations",
];

fn value(report: &Report, key: &str) -> f64 {
    report
        .get(key)
        .unwrap_or_else(|| panic!("missing report key {key}"))
}

#[test]
fn iterations_report_driver_and_engine_metrics() -> Result<()> {
    let mut learner = Learner::new(counter_envs(2, 4)?, config(32))?;
    assert_eq!(learner.seed(), 3);
    assert!(learner.device().is_cpu());
    let mut sink = CollectingSink::default();
    learner.train(2, &mut sink)?;
    assert_eq!(sink.reports.len(), 2);

    let first = &sink.reports[0];
    for key in DRIVER_KEYS {
        assert!(first.contains(key), "first report lacks {key}");
    }
    assert!(first.contains("Policy Entropy"));
    assert!(first.contains("Mean KL Divergence"));
    assert!(!first.contains("Policy Loss"));
    assert!(!first.contains("Policy Update Magnitude"));

    assert_eq!(value(first, "Collected Timesteps"), 32.);
    assert_eq!(value(first, "Episode Length"), 4.);
    assert_eq!(value(first, "Average Step Reward"), 1.);
    assert_eq!(value(first, "GAE/Returns STD"), 1.);
    assert_eq!(value(first, "Total Iterations"), 1.);

    let second = &sink.reports[1];
    for key in [
        "Policy Loss",
        "Critic Loss",
        "SB3 Clip Fraction",
        "Policy Update Magnitude",
        "Critic Update Magnitude",
    ] {
        assert!(second.contains(key), "second report lacks {key}");
    }
    assert_eq!(value(second, "Total Timesteps"), 64.);
    assert_eq!(value(second, "Total Iterations"), 2.);
    assert_eq!(learner.total_timesteps, 64);
    assert!(learner.return_stat.mean() > 0.);
    Ok(())
}

#[test]
fn long_episodes_are_cut_at_max_length() -> Result<()> {
    let mut config = config(20);
    config.max_episode_length = 5;
    let mut learner = Learner::new(counter_envs(2, 0)?, config)?;
    let report = learner.run_iteration()?;
    assert_eq!(value(&report, "Collected Timesteps"), 20.);
    assert_eq!(value(&report, "Episode Length"), 5.);
    Ok(())
}

#[test]
fn unfinished_episodes_wait_for_later_iterations() -> Result<()> {
    // Episodes of 6 steps across 2 agents flush 12 rows at a time.
    let mut learner = Learner::new(counter_envs(2, 6)?, config(16))?;
    let report = learner.run_iteration()?;
    assert_eq!(value(&report, "Collected Timesteps"), 24.);
    Ok(())
}

#[test]
fn closures_work_as_metric_sinks() -> Result<()> {
    let mut learner = Learner::new(counter_envs(2, 4)?, config(16))?;
    let mut seen = Vec::new();
    let mut sink = |report: &Report| -> ppopipe_core::Result<()> {
        seen.push(report.get("Total Iterations").unwrap_or_default());
        Ok(())
    };
    learner.train(2, &mut sink)?;
    assert_eq!(seen, vec![1., 2.]);
    Ok(())
}

#[test]
fn tracing_sink_logs_reports() -> Result<()> {
    init_tracing("info");
    init_tracing("debug");
    let mut learner = Learner::new(counter_envs(2, 4)?, config(16))?;
    learner.train(1, &mut TracingSink)?;
    let mut report = Report::default();
    report.set("Policy Entropy", 0.5);
    TracingSink.send(&report)?;
    assert_eq!(learner.total_iterations, 1);
    Ok(())
}

#[test]
fn deterministic_config_fails_the_iteration() -> Result<()> {
    let mut config = config(16);
    config.ppo.deterministic = true;
    let mut learner = Learner::new(counter_envs(2, 4)?, config)?;
    let err = learner.run_iteration().err().unwrap();
    assert!(err.is_config());
    Ok(())
}

#[test]
fn zero_timesteps_per_iteration_is_rejected() -> Result<()> {
    let err = Learner::new(counter_envs(1, 4)?, config(0)).err().unwrap();
    assert!(err.is_config());
    Ok(())
}

#[test]
fn parallel_env_resets_finished_agents() -> Result<()> {
    let mut env = ParallelVecEnv::new(vec![CounterEnv::new(1), CounterEnv::new(3)])?;
    let state = env.reset(11)?;
    assert_eq!(state.obs.len(), 2 * OBS_SIZE);
    assert_eq!(state.action_masks, vec![0, 1, 1, 0, 1, 1]);

    let step = env.step(&[1, 2])?;
    assert_eq!(step.rewards, vec![1., 1.]);
    assert_eq!(step.terminals, vec![1, 0]);
    let final_obs = step.final_obs.expect("final observations after a reset");
    // Agent 0 ended at t=1 and restarted at t=0; agent 1 kept going.
    assert_eq!(final_obs[0], 0.1);
    assert_eq!(step.state.obs[0], 0.);
    assert_eq!(final_obs[2], 0.1);
    assert_eq!(step.state.obs[2], 0.1);

    let mut env = counter_envs(2, 3)?;
    env.reset(11)?;
    assert!(env.step(&[1, 1])?.final_obs.is_none());
    Ok(())
}

#[test]
fn parallel_env_resets_are_seeded() -> Result<()> {
    let mut a = counter_envs(3, 2)?;
    let mut b = counter_envs(3, 2)?;
    assert_eq!(a.reset(5)?, b.reset(5)?);
    for _ in 0..4 {
        assert_eq!(a.step(&[1, 2, 1])?, b.step(&[1, 2, 1])?);
    }
    Ok(())
}

/// Reports one reward too few.
struct ShortRewardEnv;

impl VecEnv for ShortRewardEnv {
    fn obs_size(&self) -> usize {
        OBS_SIZE
    }

    fn num_actions(&self) -> usize {
        NUM_ACTIONS
    }

    fn num_agents(&self) -> usize {
        2
    }

    fn reset(&mut self, _seed: u64) -> ppopipe_core::Result<EnvState> {
        Ok(EnvState {
            obs: vec![0.; 2 * OBS_SIZE],
            action_masks: vec![1; 2 * NUM_ACTIONS],
        })
    }

    fn step(&mut self, _actions: &[u32]) -> ppopipe_core::Result<StepResult> {
        Ok(StepResult {
            state: self.reset(0)?,
            rewards: vec![0.],
            terminals: vec![0, 0],
            final_obs: None,
        })
    }
}

#[test]
fn malformed_steps_are_rejected() -> Result<()> {
    let mut learner = Learner::new(ShortRewardEnv, config(16))?;
    let err = learner.run_iteration().err().unwrap();
    assert!(matches!(
        err,
        PipelineError::ShapeMismatch {
            field: "rewards",
            ..
        }
    ));
    Ok(())
}

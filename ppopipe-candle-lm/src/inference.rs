use crate::model::ModelKey;
use crate::model_set::ModelSet;
use crate::tensors::{Probs, ValuesPred};
use candle_core::{D, DType, Device, Tensor};
use candle_nn::ops::softmax;
use ppopipe_core::pipeline::DoubleBufferedBatches;
use ppopipe_core::tensors::ExperienceTensors;
use ppopipe_core::{PipelineError, Result};
use rand::Rng;
use rand::distr::Distribution as RandDistribution;
use rand::distr::weighted::WeightedIndex;

pub const ACTION_MIN_PROB: f32 = 1e-11;
/// Added to the logits of disabled actions.
pub const ACTION_DISABLED_LOGIT: f64 = -1e10;

/// Softmax over temperature-scaled logits with disabled actions pushed to (almost) zero.
pub fn masked_probs(logits: &Tensor, action_masks: &Tensor, temperature: f32) -> Result<Probs> {
    let logits = logits.affine(1. / temperature as f64, 0.)?;
    // 1 -> 0, 0 -> ACTION_DISABLED_LOGIT
    let bias = action_masks
        .to_dtype(DType::F32)?
        .affine(-ACTION_DISABLED_LOGIT, ACTION_DISABLED_LOGIT)?;
    let probs = softmax(&(logits + bias)?, D::Minus1)?;
    Ok(Probs(probs.clamp(ACTION_MIN_PROB, 1f32)?))
}

pub fn policy_probs(
    models: &ModelSet,
    observations: &Tensor,
    action_masks: &Tensor,
    temperature: f32,
) -> Result<Probs> {
    let trunk = models.trunk(observations)?;
    let logits = models.require(ModelKey::Policy)?.forward(&trunk)?;
    masked_probs(&logits, action_masks, temperature)
}

/// Mean per-row entropy, normalized to `[0, 1]`.
///
/// With `mask_entropy` each row is normalized by the log of its valid action count, otherwise
/// by the log of the full action count. Counts below two are treated as two.
pub fn mean_entropy(probs: &Tensor, action_masks: &Tensor, mask_entropy: bool) -> Result<Tensor> {
    let row_entropy = (probs * probs.log()?)?.sum(D::Minus1)?.neg()?;
    let normalized = if mask_entropy {
        let norm = action_masks
            .to_dtype(DType::F32)?
            .sum(D::Minus1)?
            .clamp(2f32, f32::MAX)?
            .log()?;
        (row_entropy / norm)?
    } else {
        let num_actions = probs.dim(D::Minus1)?.max(2);
        row_entropy.affine(1. / (num_actions as f64).ln(), 0.)?
    };
    Ok(normalized.mean_all()?)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionSample {
    pub actions: Vec<u32>,
    /// Absent in deterministic mode.
    pub log_probs: Option<Vec<f32>>,
}

/// Picks one action per row. Sampling happens on the host with the caller's generator.
pub fn infer_actions<R: Rng + ?Sized>(
    models: &ModelSet,
    observations: &Tensor,
    action_masks: &Tensor,
    deterministic: bool,
    temperature: f32,
    rng: &mut R,
) -> Result<ActionSample> {
    let probs = policy_probs(models, observations, action_masks, temperature)?;
    let probs: Vec<Vec<f32>> = probs.detach().to_device(&Device::Cpu)?.to_vec2()?;
    if deterministic {
        let actions = probs
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::MIN), |best, (idx, &p)| if p > best.1 { (idx, p) } else { best })
                    .0 as u32
            })
            .collect();
        return Ok(ActionSample {
            actions,
            log_probs: None,
        });
    }

    let mut actions = Vec::with_capacity(probs.len());
    let mut log_probs = Vec::with_capacity(probs.len());
    for row in &probs {
        let distribution = WeightedIndex::new(row)
            .map_err(|err| PipelineError::NumericalFault(format!("action sampling: {err}")))?;
        let action = distribution.sample(rng);
        actions.push(action as u32);
        log_probs.push(row[action].max(1e-12).ln());
    }
    Ok(ActionSample {
        actions,
        log_probs: Some(log_probs),
    })
}

/// Value predictions `[N]` for `observations` on their current device.
pub fn infer_critic(models: &ModelSet, observations: &Tensor) -> Result<ValuesPred> {
    let trunk = models.trunk(observations)?;
    let values = models.require(ModelKey::Critic)?.forward(&trunk)?;
    Ok(ValuesPred(values.flatten_all()?))
}

/// Value predictions for host observations, evaluated in chunks of `max_batch` rows on `device`.
/// Chunk uploads overlap with critic evaluation.
pub fn infer_critic_batched(
    models: &ModelSet,
    observations: &Tensor,
    max_batch: usize,
    device: &Device,
) -> Result<Vec<f32>> {
    let rows = observations.dim(0)?;
    if rows == 0 {
        return Ok(vec![]);
    }
    let max_batch = if max_batch == 0 { rows } else { max_batch };

    let chunks = (0..rows)
        .step_by(max_batch)
        .map(|start| -> Result<ExperienceTensors> {
            Ok(ExperienceTensors {
                states: Some(observations.narrow(0, start, max_batch.min(rows - start))?),
                ..Default::default()
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut pipeline = DoubleBufferedBatches::new(device.clone())?;
    pipeline.set_batches(chunks)?;
    pipeline.start_prefetch(0)?;
    let mut values = Vec::with_capacity(rows);
    for idx in 0..pipeline.len() {
        pipeline.prefetch_next(idx)?;
        let chunk = pipeline.get_batch(idx)?;
        let states = ExperienceTensors::require("states", &chunk.states)?;
        let preds = infer_critic(models, states)?;
        values.extend(preds.detach().to_device(&Device::Cpu)?.to_vec1::<f32>()?);
    }
    Ok(values)
}

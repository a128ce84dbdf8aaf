use crate::error::{PipelineError, Result};
use crate::tensors::ExperienceTensors;
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::{SeedableRng, rngs::StdRng};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Row ranges covering `0..rows` in order.
///
/// Without overbatching every chunk holds `batch_size` rows except possibly the last.
/// With overbatching the last chunk absorbs any remainder smaller than a full batch, so it
/// holds between `batch_size` and `2 * batch_size - 1` rows. When `rows < batch_size` the
/// single chunk holds all `rows`.
pub fn batch_ranges(rows: usize, batch_size: usize, overbatching: bool) -> Vec<Range<usize>> {
    if rows == 0 || batch_size == 0 {
        return vec![];
    }
    let mut ranges = Vec::with_capacity(rows.div_ceil(batch_size));
    let mut start = 0;
    while start < rows {
        let mut end = (start + batch_size).min(rows);
        if overbatching && end + batch_size > rows {
            end = rows;
        }
        ranges.push(start..end);
        start = end;
    }
    ranges
}

#[derive(Debug, Default)]
struct SampleProfile {
    micros: AtomicU64,
    calls: AtomicU64,
}

/// Owns one iteration of training tensors and hands out shuffled row batches.
#[derive(Debug)]
pub struct ExperienceBuffer {
    pub device: Device,
    /// Gathered actions are clamped to `0..=max_action_index` when set.
    pub max_action_index: Option<u32>,
    data: ExperienceTensors,
    rng: StdRng,
    shuffled_indices: Vec<u32>,
    profile: SampleProfile,
}

impl ExperienceBuffer {
    pub fn new(seed: u64, device: Device) -> Self {
        Self {
            device,
            max_action_index: None,
            data: ExperienceTensors::default(),
            rng: StdRng::seed_from_u64(seed),
            shuffled_indices: vec![],
            profile: SampleProfile::default(),
        }
    }

    pub fn with_max_action_index(mut self, max_action_index: u32) -> Self {
        self.max_action_index = Some(max_action_index);
        self
    }

    /// Replaces the stored experience. The shuffle generator keeps its state across calls.
    pub fn set_data(&mut self, data: ExperienceTensors) -> Result<()> {
        let rows = data.validate()?;
        self.data = if data.is_on_device(&self.device) {
            data
        } else {
            data.to_device(&self.device)?
        };
        debug!(rows, "experience buffer filled");
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.data.row_count()
    }

    /// Gathers the rows at `indices`. Out-of-range indices are clamped to the last row.
    pub fn sample_rows(&self, indices: &[u32]) -> Result<ExperienceTensors> {
        let started = Instant::now();
        let row_limit = self.data.row_limit();
        if row_limit == 0 || indices.is_empty() {
            return Ok(ExperienceTensors::default());
        }

        let last_row = u32::try_from(row_limit - 1).map_err(|_| {
            PipelineError::Config(format!("{row_limit} rows exceed the u32 index range"))
        })?;
        let out_of_range = indices.iter().filter(|&&idx| idx > last_row).count();
        let ids = if out_of_range > 0 {
            warn!(out_of_range, row_limit, "clamping out-of-range sample indices");
            let clamped: Vec<u32> = indices.iter().map(|&idx| idx.min(last_row)).collect();
            Tensor::from_vec(clamped, indices.len(), &self.device)?
        } else {
            Tensor::from_slice(indices, indices.len(), &self.device)?
        };

        let mut sampled = self.data.index_select(&ids)?;
        if let (Some(max_action), Some(actions)) = (self.max_action_index, sampled.actions.as_ref())
        {
            sampled.actions = Some(actions.clamp(0u32, max_action)?);
        }

        self.profile
            .micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.profile.calls.fetch_add(1, Ordering::Relaxed);
        Ok(sampled)
    }

    /// Shuffles all rows and splits them into batches, see [`batch_ranges`].
    pub fn all_batches_shuffled(
        &mut self,
        batch_size: usize,
        overbatching: bool,
    ) -> Result<Vec<ExperienceTensors>> {
        if batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be positive".into()));
        }
        let rows = self.data.row_limit();
        if rows == 0 {
            return Ok(vec![]);
        }

        if self.shuffled_indices.len() != rows {
            let rows = u32::try_from(rows).map_err(|_| {
                PipelineError::Config(format!("{rows} rows exceed the u32 index range"))
            })?;
            self.shuffled_indices = (0..rows).collect();
        }
        self.shuffled_indices.shuffle(&mut self.rng);

        batch_ranges(rows, batch_size, overbatching)
            .into_iter()
            .map(|range| self.sample_rows(&self.shuffled_indices[range]))
            .collect()
    }

    /// Total gather time in microseconds and the number of gathers since the last reset.
    pub fn profile(&self) -> (u64, u64) {
        (
            self.profile.micros.load(Ordering::Relaxed),
            self.profile.calls.load(Ordering::Relaxed),
        )
    }

    pub fn reset_profile(&self) {
        self.profile.micros.store(0, Ordering::Relaxed);
        self.profile.calls.store(0, Ordering::Relaxed);
    }

    pub fn log_profile(&self) {
        let (micros, calls) = self.profile();
        if calls == 0 {
            return;
        }
        info!(
            total_ms = micros as f64 / 1000.,
            calls,
            avg_us = micros as f64 / calls as f64,
            "experience gather profile"
        );
    }
}

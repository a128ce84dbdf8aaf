//! Overlaps host-to-device batch copies with training.
//!
//! Batch `i + 1` is copied on a background thread while batch `i` trains. At most one copy
//! is in flight; starting another waits for the previous one first.

use super::transfer_worker::TransferWorker;
use crate::error::{PipelineError, Result};
use crate::tensors::ExperienceTensors;
use candle_core::Device;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSlotState {
    NotPrefetched,
    PrefetchInFlight,
    Ready,
    /// Handed out by `get_batch`; the pipeline no longer holds a device copy.
    Consumed,
}

#[derive(Debug)]
enum Slot {
    NotPrefetched,
    InFlight,
    Ready(ExperienceTensors),
    Consumed,
}

pub struct DoubleBufferedBatches {
    target_device: Device,
    host_batches: Vec<ExperienceTensors>,
    slots: Vec<Slot>,
    /// `None` when batches already live on the target device.
    worker: Option<TransferWorker>,
    force_transfer: bool,
    pending: Option<usize>,
}

impl DoubleBufferedBatches {
    /// Batches already on `target_device` pass through untouched. A CPU target never
    /// starts a transfer thread.
    pub fn new(target_device: Device) -> Result<Self> {
        let worker = if target_device.is_cpu() {
            None
        } else {
            Some(TransferWorker::spawn(target_device.clone())?)
        };
        Ok(Self {
            target_device,
            host_batches: vec![],
            slots: vec![],
            worker,
            force_transfer: false,
            pending: None,
        })
    }

    /// Always routes batches through the transfer thread, even when they are already in place.
    pub fn forced(target_device: Device) -> Result<Self> {
        let worker = Some(TransferWorker::spawn(target_device.clone())?);
        Ok(Self {
            target_device,
            host_batches: vec![],
            slots: vec![],
            worker,
            force_transfer: true,
            pending: None,
        })
    }

    /// Replaces the batch list. Any copy still in flight is drained first.
    pub fn set_batches(&mut self, batches: Vec<ExperienceTensors>) -> Result<()> {
        self.wait_pending_prefetch()?;
        self.slots = batches.iter().map(|_| Slot::NotPrefetched).collect();
        self.host_batches = batches;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.host_batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host_batches.is_empty()
    }

    pub fn state(&self, idx: usize) -> Option<BatchSlotState> {
        self.slots.get(idx).map(|slot| match slot {
            Slot::NotPrefetched => BatchSlotState::NotPrefetched,
            Slot::InFlight => BatchSlotState::PrefetchInFlight,
            Slot::Ready(_) => BatchSlotState::Ready,
            Slot::Consumed => BatchSlotState::Consumed,
        })
    }

    fn passes_through(&self, idx: usize) -> bool {
        match &self.worker {
            None => true,
            Some(_) => {
                !self.force_transfer && self.host_batches[idx].is_on_device(&self.target_device)
            }
        }
    }

    /// Starts copying batch `idx`. Out-of-range, pass-through and already started batches
    /// are ignored.
    pub fn start_prefetch(&mut self, idx: usize) -> Result<()> {
        if idx >= self.host_batches.len() || self.passes_through(idx) {
            return Ok(());
        }
        if !matches!(self.slots[idx], Slot::NotPrefetched) {
            return Ok(());
        }
        self.wait_pending_prefetch()?;
        let Some(worker) = &self.worker else {
            return Ok(());
        };
        worker.submit(idx, self.host_batches[idx].clone())?;
        self.slots[idx] = Slot::InFlight;
        self.pending = Some(idx);
        trace!(idx, "prefetch started");
        Ok(())
    }

    pub fn prefetch_next(&mut self, idx: usize) -> Result<()> {
        self.start_prefetch(idx + 1)
    }

    /// Blocks until the in-flight copy, if any, has landed.
    ///
    /// A failed copy leaves its slot unprefetched so the batch is copied again on demand.
    pub fn wait_pending_prefetch(&mut self) -> Result<()> {
        let Some(idx) = self.pending.take() else {
            return Ok(());
        };
        let Some(worker) = &self.worker else {
            return Ok(());
        };
        let result = worker.wait()?;
        debug_assert_eq!(result.slot, idx);
        self.slots[result.slot] = match result.batch {
            Ok(batch) => Slot::Ready(batch),
            Err(err) => {
                warn!(idx = result.slot, %err, "batch prefetch failed");
                Slot::NotPrefetched
            }
        };
        Ok(())
    }

    /// Returns batch `idx` on the target device, copying it now if it was not prefetched.
    /// The device copy moves to the caller, so at most the current and the next batch stay
    /// resident.
    pub fn get_batch(&mut self, idx: usize) -> Result<ExperienceTensors> {
        if idx >= self.host_batches.len() {
            return Err(PipelineError::BatchIndex {
                idx,
                len: self.host_batches.len(),
            });
        }
        if self.passes_through(idx) {
            return Ok(self.host_batches[idx].clone());
        }
        if matches!(self.slots[idx], Slot::InFlight) && self.pending == Some(idx) {
            self.wait_pending_prefetch()?;
        }
        if let Slot::Ready(batch) = std::mem::replace(&mut self.slots[idx], Slot::Consumed) {
            return Ok(batch);
        }
        self.host_batches[idx].to_device(&self.target_device)
    }
}

impl Drop for DoubleBufferedBatches {
    fn drop(&mut self) {
        if let Err(err) = self.wait_pending_prefetch() {
            warn!(%err, "dropping batch pipeline with a failed prefetch");
        }
    }
}

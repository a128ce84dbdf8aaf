use crate::error::{PipelineError, Result};
use crate::tensors::ExperienceTensors;
use candle_core::Device;
use crossbeam::channel::{Receiver, Sender, unbounded};
use std::thread::JoinHandle;
use tracing::debug;

pub enum TransferTask {
    Copy {
        slot: usize,
        batch: ExperienceTensors,
    },
    Shutdown,
}

pub struct TransferResult {
    pub slot: usize,
    pub batch: Result<ExperienceTensors>,
}

struct WorkerThread {
    device: Device,
    task_rx: Receiver<TransferTask>,
    result_tx: Sender<TransferResult>,
}

impl WorkerThread {
    fn work(&self) {
        while let Ok(task) = self.task_rx.recv() {
            match task {
                TransferTask::Copy { slot, batch } => {
                    let batch = batch.to_device(&self.device);
                    if self.result_tx.send(TransferResult { slot, batch }).is_err() {
                        break;
                    }
                }
                TransferTask::Shutdown => break,
            }
        }
        debug!("batch transfer worker stopped");
    }
}

/// Background thread copying batches to a device, one at a time.
pub struct TransferWorker {
    task_tx: Sender<TransferTask>,
    result_rx: Receiver<TransferResult>,
    handle: Option<JoinHandle<()>>,
}

impl TransferWorker {
    pub fn spawn(device: Device) -> Result<Self> {
        let (task_tx, task_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();
        let worker = WorkerThread {
            device,
            task_rx,
            result_tx,
        };
        let handle = std::thread::Builder::new()
            .name("batch-transfer".to_owned())
            .spawn(move || worker.work())?;
        Ok(Self {
            task_tx,
            result_rx,
            handle: Some(handle),
        })
    }

    pub fn submit(&self, slot: usize, batch: ExperienceTensors) -> Result<()> {
        self.task_tx
            .send(TransferTask::Copy { slot, batch })
            .map_err(|err| PipelineError::TransferWorker(err.to_string()))
    }

    /// Blocks until the oldest submitted transfer finishes.
    pub fn wait(&self) -> Result<TransferResult> {
        self.result_rx
            .recv()
            .map_err(|err| PipelineError::TransferWorker(err.to_string()))
    }
}

impl Drop for TransferWorker {
    fn drop(&mut self) {
        let _ = self.task_tx.send(TransferTask::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

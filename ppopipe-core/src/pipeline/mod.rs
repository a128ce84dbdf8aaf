pub mod double_buffer;
pub mod transfer_worker;

pub use double_buffer::{BatchSlotState, DoubleBufferedBatches};
pub use transfer_worker::TransferWorker;

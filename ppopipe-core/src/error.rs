use thiserror::Error;

/// Errors raised by the experience pipeline and the update engine.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(
        "truncated rows and bootstrap values disagree: {truncated_rows} truncated rows, {bootstrap_values} values"
    )]
    TruncationMismatch {
        truncated_rows: usize,
        bootstrap_values: usize,
    },

    #[error("shape mismatch for {field}: expected {expected}, found {found}")]
    ShapeMismatch {
        field: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("experience batch is missing the `{0}` field")]
    MissingField(&'static str),

    #[error("batch {idx} requested but only {len} batches are staged")]
    BatchIndex { idx: usize, len: usize },

    #[error("model `{0}` is not part of the model set")]
    MissingModel(&'static str),

    #[error("non-finite value during {0}")]
    NumericalFault(String),

    #[error("batch transfer worker failed: {0}")]
    TransferWorker(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};

/// How a step ended. Stored as a `u8` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum TerminalType {
    #[default]
    NotTerminal = 0,
    /// Natural episode end, nothing to bootstrap from.
    Normal = 1,
    /// Cut off by a time limit, bootstrapped from the next state's value.
    Truncated = 2,
}

impl TerminalType {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::NotTerminal)
    }

    pub fn is_truncated(self) -> bool {
        matches!(self, Self::Truncated)
    }
}

impl TryFrom<u8> for TerminalType {
    type Error = PipelineError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::NotTerminal),
            1 => Ok(Self::Normal),
            2 => Ok(Self::Truncated),
            other => Err(PipelineError::config(format!(
                "unknown terminal type {other}"
            ))),
        }
    }
}

impl From<TerminalType> for u8 {
    fn from(value: TerminalType) -> Self {
        value as u8
    }
}

/// Counts the rows that need a bootstrap value.
pub fn count_truncated(terminals: &[TerminalType]) -> usize {
    terminals.iter().filter(|t| t.is_truncated()).count()
}

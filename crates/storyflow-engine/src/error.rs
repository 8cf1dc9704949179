use std::fmt;
use std::path::PathBuf;

use storyflow_contracts::runs::CANCELLED_MESSAGE;

/// Why an instruction failed. Rendered verbatim into the failed outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    NotFound { path: PathBuf },
    DecodeFailure { path: PathBuf, message: String },
    EncodeFailure { path: PathBuf, message: String },
    NoPrompt,
    LoopState(String),
    ProviderFailure(String),
    Cancelled,
}

impl ExecutionError {
    pub fn loop_state(message: impl Into<String>) -> Self {
        Self::LoopState(message.into())
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::ProviderFailure(message.into())
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { path } => write!(f, "File not found: {}", path.display()),
            Self::DecodeFailure { path, message } => {
                write!(f, "Failed to decode image {}: {message}", path.display())
            }
            Self::EncodeFailure { path, message } => {
                write!(f, "Failed to write image {}: {message}", path.display())
            }
            Self::NoPrompt => f.write_str("No prompt or canvas to save"),
            Self::LoopState(message) | Self::ProviderFailure(message) => f.write_str(message),
            Self::Cancelled => f.write_str(CANCELLED_MESSAGE),
        }
    }
}

impl std::error::Error for ExecutionError {}

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced anywhere in a pipeline run.
///
/// The type is `Clone` because a [`Job`](crate::pipeline::job::Job) stores
/// the first error in a write-once cell and hands out copies from `error()`,
/// `wait()` and the abort result stream. IO errors are captured as their
/// display string for the same reason.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("pipeline error: {context}")]
    Pipeline { context: &'static str },

    #[error("stage {stage}: {message}")]
    Stage { stage: String, message: String },

    #[error("done hook for stage {stage}: {message}")]
    Hook { stage: String, message: String },

    #[error("stage {stage} did not accept abort within {timeout:?}")]
    NotAbortable { stage: String, timeout: Duration },

    #[error("stage {stage} did not acknowledge abort within {timeout:?}")]
    AbortAckTimeout { stage: String, timeout: Duration },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(String),
}

impl Error {
    pub fn pipeline(context: &'static str) -> Self {
        Self::Pipeline { context }
    }

    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn hook(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hook {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

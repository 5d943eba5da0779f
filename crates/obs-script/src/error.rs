//! Error types for script building and process launching

use obs_core::TargetError;
use thiserror::Error;

/// Result type for parsing
pub type ParseResult<T> = Result<T, ParseError>;

/// Result type for script building
pub type ScriptResult<T> = Result<T, ScriptError>;

/// Malformed script text
///
/// `offset` is the byte offset of the first unparsable token in the
/// whole-script text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at offset {offset}")]
pub struct ParseError {
    pub offset: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }

    /// Move the offset by `base` bytes
    pub(crate) fn shifted(mut self, base: usize) -> Self {
        self.offset += base;
        self
    }
}

/// Errors building a script for a target and device
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Target(#[from] TargetError),
}

/// An external helper program could not be started
#[derive(Debug, Clone, Error)]
#[error("cannot launch {path}: {reason}")]
pub struct LaunchError {
    pub path: String,
    pub reason: String,
}

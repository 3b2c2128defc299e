//! Error taxonomy for the viewer core.
//!
//! Errors are recovered at the smallest sensible boundary (per group, per
//! channel, per update). Only [`ViewerError::Input`] is meant to abort a load.

use thiserror::Error;

use crate::state::channels::ChannelKind;

pub type Result<T> = std::result::Result<T, ViewerError>;

#[derive(Error, Debug)]
pub enum ViewerError {
    #[error("Invalid state path: {0}")]
    InvalidPath(String),

    #[error("Unknown channel id: {0}")]
    UnknownChannel(String),

    #[error("Index {index} out of bounds for {kind} channels (len {len})")]
    IndexOutOfBounds {
        kind: ChannelKind,
        index: usize,
        len: usize,
    },

    #[error("Unknown channel kind: {0}")]
    UnknownKind(String),

    #[error("Field {field} does not apply to {kind} channels")]
    UnknownField { kind: ChannelKind, field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Input error: {0}")]
    Input(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Render error in group {group}: {reason}")]
    Render { group: String, reason: String },

    #[error("Chart id {0} is already registered")]
    DuplicateChart(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ViewerError {
    /// True for errors that should abort a file load and be shown to the user.
    pub fn is_input_error(&self) -> bool {
        matches!(self, ViewerError::Input(_))
    }
}

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A single parameter whose snapshot value does not fit the model's slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeMismatch {
    pub name: String,
    pub expected: Vec<usize>,
    pub found: Vec<usize>,
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: model expects {:?}, snapshot has {:?}",
            self.name, self.expected, self.found
        )
    }
}

#[derive(Error, Debug)]
pub enum SegTraceError {
    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Json deser error: {0}")]
    JsonDeserError(#[from] serde_json::Error),
    #[error("Hugging Face Hub error: {0}")]
    ApiError(#[from] hf_hub::api::sync::ApiError),
    #[error("cannot read weights snapshot {path:?}: {reason}")]
    SnapshotUnreadable { path: PathBuf, reason: String },
    #[error("size mismatch for {} parameter(s): {}", .0.len(), format_mismatches(.0))]
    ShapeMismatch(Vec<ShapeMismatch>),
    #[error("invalid model config: {0}")]
    InvalidConfig(String),
    #[error("parameter store error: {0}")]
    ParameterStore(String),
}

fn format_mismatches(mismatches: &[ShapeMismatch]) -> String {
    mismatches
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, SegTraceError>;

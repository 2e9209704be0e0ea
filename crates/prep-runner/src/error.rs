use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Fatal conditions of a normalization run. Data-quality problems are
/// repaired in place and never show up here.
#[derive(Debug, Error)]
pub enum PrepError {
    #[error("input file not found: {}", path.display())]
    InputMissing { path: PathBuf },
    #[error("no usable participant identifier column and positional fallback is disabled")]
    NoParticipantSource,
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PrepError {
    /// Stable code used in `--json` error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            PrepError::InputMissing { .. } => "input_missing",
            PrepError::NoParticipantSource => "no_participant_source",
            PrepError::Config(_) => "invalid_profile",
            PrepError::Csv(_) => "csv_error",
            PrepError::Io(_) => "io_error",
            PrepError::Yaml(_) => "yaml_error",
            PrepError::Json(_) => "json_error",
        }
    }
}

pub type PrepResult<T> = std::result::Result<T, PrepError>;

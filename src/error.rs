use std::{
    io,
    path::{Path, PathBuf},
};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};

/// Failures of a single conversion, from parameter parsing to encoder exit.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Input file not found: {0:?}")]
    InputNotFound(PathBuf),
    #[error("Input file parameter required")]
    MissingInput,
    #[error("{field}: {reason}")]
    InvalidParameter { field: &'static str, reason: String },
    #[error("{}", start_failure(.program, .source))]
    ProcessStartFailed { program: PathBuf, source: io::Error },
    #[error("FFmpeg failed with code {}: {}", exit_code(.code), .stderr)]
    EncodingFailed { code: Option<i32>, stderr: String },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

fn start_failure(program: &Path, source: &io::Error) -> String {
    match source.kind() {
        io::ErrorKind::NotFound => {
            format!("FFmpeg binary not found ({}): {}", program.display(), source)
        }
        _ => format!("failed to start {}: {}", program.display(), source),
    }
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        // killed by a signal
        None => "none".to_string(),
    }
}

/// Error returned by handlers; every variant maps to a JSON body.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Convert(#[from] ConvertError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Convert(ConvertError::InputNotFound(path)) => {
                debug!("input {} does not exist", path.display());
                (
                    StatusCode::NOT_FOUND,
                    json!({ "error": "Input file not found" }),
                )
            }
            Self::Convert(ConvertError::MissingInput) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "Input file parameter required" }),
            ),
            Self::Convert(err @ ConvertError::InvalidParameter { .. }) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "Invalid parameter", "details": err.to_string() }),
            ),
            Self::Convert(err) => {
                error!("Video conversion error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Video conversion failed", "details": err.to_string() }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

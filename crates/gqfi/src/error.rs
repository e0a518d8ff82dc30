//! Domain error taxonomy.
//!
//! Library code returns `Result<T, GqfiError>`; binaries collapse into
//! `anyhow::Result` at the CLI boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GqfiError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("emulator error: {0}")]
    Emulator(String),

    #[error("analysis error: {0}")]
    Analysis(String),

    #[error("injection error: {0}")]
    Injection(String),

    #[error("scheduling error: {0}")]
    Scheduling(String),

    #[error("result store error: {0}")]
    ResultStore(String),

    #[error("experiment {run_id} timed out after {elapsed_secs}s")]
    Timeout { run_id: String, elapsed_secs: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GqfiError>;

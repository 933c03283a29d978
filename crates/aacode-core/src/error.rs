use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AacodeErr>;

/// Errors that can escape the orchestration core.
///
/// Most of the error *kinds* spec.md §7 enumerates (parse failures, unknown
/// tools, validation failures, safety rejections, tool timeouts, ...) never
/// reach this type: the Driver turns them into observation text and keeps
/// iterating. `AacodeErr` is reserved for the two fatal conditions spec.md
/// §7 names — a failing model call, and unrecoverable log I/O — plus the
/// setup-time errors the ambient stores raise (bad workspace path, disk
/// full, malformed on-disk session file).
#[derive(Error, Debug)]
pub enum AacodeErr {
    #[error("model call failed: {0}")]
    ModelCall(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

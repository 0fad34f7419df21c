//! Unified error handling for the AudioScribe core.
//!
//! All crates in the workspace return [`ScribeError`] through the
//! [`ScribeResult`] alias. Retry decisions live in [`classify`]: a worker
//! failure carries a [`FailureKind`] when the worker could tell what went
//! wrong, and the queue falls back to message heuristics for kindless
//! errors coming out of older workers or raw process crashes.

mod classify;

pub use classify::{classify_failure, Retryability};

/// Result type alias used across the workspace.
pub type ScribeResult<T> = Result<T, ScribeError>;

/// Error type shared by every AudioScribe crate.
#[derive(Debug, thiserror::Error)]
pub enum ScribeError {
    /// Configuration loading or validation failed
    #[error("configuration error: {0}")]
    Config(String),

    /// GPU enumeration or driver query failed
    #[error("gpu error: {0}")]
    Gpu(String),

    /// Memory pool bookkeeping failed (lock timeout, unknown pool)
    #[error("memory pool error: {0}")]
    MemoryPool(String),

    /// Queue operation rejected (duplicate id, unknown task, invalid state)
    #[error("queue error: {0}")]
    Queue(String),

    /// Worker process could not be spawned or spoke a broken protocol
    #[error("worker error: {0}")]
    Worker(String),

    /// Speech engine failure inside the worker
    #[error("engine error: {0}")]
    Engine(String),

    /// Audio probing or decoding failed
    #[error("audio error: {0}")]
    Audio(String),

    /// Model download failed
    #[error("download error: {0}")]
    Download(String),

    /// A bounded wait elapsed
    #[error("timeout: {0}")]
    Timeout(String),

    /// Submission or request validation failed
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No device can run the task
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Task was cancelled by the user
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ScribeError {
    /// Short stable tag used in logs and event payloads.
    pub fn tag(&self) -> &'static str {
        match self {
            ScribeError::Config(_) => "config",
            ScribeError::Gpu(_) => "gpu",
            ScribeError::MemoryPool(_) => "memory_pool",
            ScribeError::Queue(_) => "queue",
            ScribeError::Worker(_) => "worker",
            ScribeError::Engine(_) => "engine",
            ScribeError::Audio(_) => "audio",
            ScribeError::Download(_) => "download",
            ScribeError::Timeout(_) => "timeout",
            ScribeError::InvalidInput(_) => "invalid_input",
            ScribeError::Unavailable(_) => "unavailable",
            ScribeError::Cancelled(_) => "cancelled",
            ScribeError::Serialization(_) => "serialization",
            ScribeError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        fn read() -> ScribeResult<String> {
            Ok(std::fs::read_to_string("/definitely/not/here")?)
        }
        let err = read().unwrap_err();
        assert_eq!(err.tag(), "io");
    }

    #[test]
    fn display_includes_context() {
        let err = ScribeError::MemoryPool("pool lock timed out on GPU 0".into());
        assert!(err.to_string().contains("GPU 0"));
    }
}

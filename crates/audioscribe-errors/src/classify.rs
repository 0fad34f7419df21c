//! Retry classification for worker failures.
//!
//! Workers report a [`FailureKind`] next to the human-readable message.
//! When the kind is present it decides retryability outright. Kindless
//! failures (raw crashes, legacy workers) fall back to keyword matching
//! against the message, with non-retryable markers checked first so that a
//! message like "cannot allocate memory for missing file" is not retried.

use audioscribe_types::FailureKind;

/// Whether a failed task should be re-enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Retry,
    Terminal,
}

/// Markers of transient transcription trouble; these are worth retrying.
const TRANSIENT_MARKERS: &[&str] = &[
    "cuda",
    "gpu",
    "out of memory",
    "memory",
    "timeout",
    "timed out",
    "connection",
    "transcribe",
    "whisper",
    "model",
    "audio",
    "download",
];

/// Markers of failures that would repeat identically on retry. Checked
/// before the transient markers.
const TERMINAL_MARKERS: &[&str] = &[
    "file not found",
    "no such file",
    "unsupported",
    "invalid",
    "oversized",
    "too large",
    "processor not set",
    "not configured",
    "without a speech engine",
    "cancelled",
];

/// Classify a worker failure.
pub fn classify_failure(kind: Option<FailureKind>, message: &str) -> Retryability {
    if let Some(kind) = kind {
        return match kind {
            FailureKind::Transient => Retryability::Retry,
            FailureKind::InvalidInput
            | FailureKind::Configuration
            | FailureKind::Fatal
            | FailureKind::Cancelled => Retryability::Terminal,
        };
    }

    let lowered = message.to_ascii_lowercase();
    if TERMINAL_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Retryability::Terminal;
    }
    if TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Retryability::Retry;
    }
    // Unrecognized failures are not retried.
    Retryability::Terminal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wins_over_message() {
        // The message looks transient but the worker said the input is bad.
        let r = classify_failure(Some(FailureKind::InvalidInput), "CUDA out of memory");
        assert_eq!(r, Retryability::Terminal);

        let r = classify_failure(Some(FailureKind::Transient), "file not found: a.wav");
        assert_eq!(r, Retryability::Retry);
    }

    #[test]
    fn transient_messages_retry() {
        for msg in [
            "CUDA out of memory",
            "gpu reset during transcribe",
            "connection dropped while fetching model",
        ] {
            assert_eq!(classify_failure(None, msg), Retryability::Retry, "{msg}");
        }
    }

    #[test]
    fn terminal_markers_beat_transient_markers() {
        let r = classify_failure(None, "model file not found in cache");
        assert_eq!(r, Retryability::Terminal);
    }

    #[test]
    fn unknown_messages_do_not_retry() {
        assert_eq!(
            classify_failure(None, "something inexplicable"),
            Retryability::Terminal
        );
    }
}

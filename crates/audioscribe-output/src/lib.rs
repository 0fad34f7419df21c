//! Transcript persistence.
//!
//! The scheduler hands a completed task and its transcript to a
//! [`ResultSink`]; the default [`TranscriptSaver`] writes one file per
//! requested format into the output directory. Existing files are never
//! overwritten — a timestamp suffix disambiguates. Text can be normalized
//! on the way out through a pluggable [`TextTransform`].

mod saver;
mod timecode;

use std::path::PathBuf;

use audioscribe_errors::ScribeResult;
use audioscribe_types::{Task, Transcript};

pub use saver::TranscriptSaver;

/// Consumer of completed transcriptions.
pub trait ResultSink: Send + Sync {
    /// Persist the transcript in every format the task requested, returning
    /// the written paths.
    fn save(&self, task: &Task, transcript: &Transcript) -> ScribeResult<Vec<PathBuf>>;
}

/// Text normalization applied to the full text and to every segment before
/// writing. The default is a no-op; deployments that need e.g. a
/// traditional-to-simplified Chinese pass plug their converter in here.
pub trait TextTransform: Send + Sync {
    fn apply(&self, text: &str) -> String;
}

/// Identity transform.
pub struct NoopTransform;

impl TextTransform for NoopTransform {
    fn apply(&self, text: &str) -> String {
        text.to_string()
    }
}

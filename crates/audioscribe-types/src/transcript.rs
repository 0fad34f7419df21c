//! Transcript types returned by the speech engine.

use serde::{Deserialize, Serialize};

/// One recognized span of speech with its timing in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub id: usize,
    pub start_secs: f64,
    pub end_secs: f64,
    pub text: String,
}

/// Complete transcription of one audio file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub language: Option<String>,
    pub duration_secs: f64,
    pub segments: Vec<TranscriptSegment>,
}

impl Transcript {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.segments.is_empty()
    }
}

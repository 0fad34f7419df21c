//! Speech engine boundary.
//!
//! The engine is a black box to the rest of the system: it takes decoded
//! audio and returns a [`Transcript`]. The shipped implementation wraps
//! whisper.cpp through `whisper-rs` behind the `whisper` feature; builds
//! without it get a worker that fails tasks with a configuration error, so
//! the scheduling core stays testable on machines with no native
//! toolchain.

use std::path::Path;

use audioscribe_errors::{ScribeError, ScribeResult};
use audioscribe_types::Transcript;

use crate::audio::DecodedAudio;

pub trait SpeechEngine: Send + std::fmt::Debug {
    fn transcribe(&mut self, audio: &DecodedAudio) -> ScribeResult<Transcript>;
}

/// Load the compiled-in engine for a model weight file.
#[cfg(feature = "whisper")]
pub fn load_engine(model_path: &Path) -> ScribeResult<Box<dyn SpeechEngine>> {
    Ok(Box::new(whisper_cpp::WhisperCppEngine::load(
        model_path, true,
    )?))
}

/// Load the compiled-in engine for a model weight file.
#[cfg(not(feature = "whisper"))]
pub fn load_engine(model_path: &Path) -> ScribeResult<Box<dyn SpeechEngine>> {
    let _ = model_path;
    Err(ScribeError::Engine(
        "worker built without a speech engine (enable the `whisper` feature)".into(),
    ))
}

#[cfg(feature = "whisper")]
mod whisper_cpp {
    use super::*;

    use audioscribe_types::TranscriptSegment;
    use tracing::{info, warn};
    use whisper_rs::{
        FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters,
    };

    pub struct WhisperCppEngine {
        context: WhisperContext,
    }

    impl std::fmt::Debug for WhisperCppEngine {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("WhisperCppEngine").finish_non_exhaustive()
        }
    }

    impl WhisperCppEngine {
        pub fn load(model_path: &Path, use_gpu: bool) -> ScribeResult<Self> {
            let path = model_path.to_str().ok_or_else(|| {
                ScribeError::Engine(format!(
                    "model path is not valid UTF-8: {}",
                    model_path.display()
                ))
            })?;
            let mut params = WhisperContextParameters::default();
            params.use_gpu(use_gpu);
            let context = WhisperContext::new_with_params(path, params)
                .map_err(|err| ScribeError::Engine(format!("loading model: {err}")))?;
            info!(model = path, use_gpu, "whisper context ready");
            Ok(Self { context })
        }
    }

    impl SpeechEngine for WhisperCppEngine {
        fn transcribe(&mut self, audio: &DecodedAudio) -> ScribeResult<Transcript> {
            if audio.samples.is_empty() {
                return Err(ScribeError::Engine("no audio samples to transcribe".into()));
            }

            let mut state = self
                .context
                .create_state()
                .map_err(|err| ScribeError::Engine(format!("creating state: {err}")))?;

            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_language(Some("auto"));
            let threads = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4);
            params.set_n_threads(threads as i32);
            params.set_print_special(false);
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_print_timestamps(false);

            state
                .full(params, &audio.samples)
                .map_err(|err| ScribeError::Engine(format!("transcription: {err}")))?;

            let segment_count = state
                .full_n_segments()
                .map_err(|err| ScribeError::Engine(format!("reading segments: {err}")))?;

            let mut segments = Vec::with_capacity(segment_count as usize);
            let mut text = String::new();
            for index in 0..segment_count {
                let segment_text = state
                    .full_get_segment_text(index)
                    .map_err(|err| ScribeError::Engine(format!("segment {index}: {err}")))?;
                let trimmed = segment_text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                // Timestamps arrive in centiseconds.
                let start = state.full_get_segment_t0(index).unwrap_or(0) as f64 / 100.0;
                let end = state.full_get_segment_t1(index).unwrap_or(0) as f64 / 100.0;
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(trimmed);
                segments.push(TranscriptSegment {
                    id: segments.len(),
                    start_secs: start,
                    end_secs: end,
                    text: trimmed.to_string(),
                });
            }

            let language = state
                .full_lang_id()
                .ok()
                .and_then(whisper_rs::get_lang_str)
                .map(str::to_string);
            if language.is_none() {
                warn!("language detection unavailable for this run");
            }

            Ok(Transcript {
                text,
                language,
                duration_secs: audio.duration_secs,
                segments,
            })
        }
    }
}

#[cfg(all(test, not(feature = "whisper")))]
mod tests {
    use super::*;

    #[test]
    fn engineless_build_reports_configuration_problem() {
        let err = load_engine(Path::new("/models/ggml-tiny.bin")).unwrap_err();
        assert!(err.to_string().contains("without a speech engine"));
    }
}

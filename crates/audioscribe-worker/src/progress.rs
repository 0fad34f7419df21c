//! Time-extrapolated progress reporting.
//!
//! The engine call is one opaque blocking operation, so reported progress
//! is a linear extrapolation over the expected wall-clock: audio duration
//! times the model's speed factor. The ticker advances from 20 to 90 and
//! holds at 90 until the real call returns; the stages above 90 belong to
//! the parent. Reported values never regress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use audioscribe_config::speed_factor_for;

use crate::emit::Emit;
use crate::memwatch::MemoryWatch;

/// Progress reported when transcription begins.
pub const TRANSCRIBE_START: f32 = 20.0;
/// Ceiling held until the engine returns.
pub const TRANSCRIBE_CAP: f32 = 90.0;

/// Background thread emitting smoothed progress while the engine runs.
pub struct ProgressTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressTicker {
    pub fn start(
        task_id: String,
        model: String,
        audio_duration_secs: f64,
        emitter: Arc<dyn Emit>,
        watch: Option<Arc<MemoryWatch>>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            let expected_secs =
                (audio_duration_secs * speed_factor_for(&model)).max(1.0);
            let mut rng = rand::rng();
            let mut current = TRANSCRIBE_START;
            emitter.progress(&task_id, current, &stage_message(current));

            while !stop_flag.load(Ordering::Relaxed) && current < TRANSCRIBE_CAP {
                // Slight jitter keeps concurrent tasks from updating in
                // lockstep.
                let interval = 0.8 + rng.random_range(0.0..0.4);
                std::thread::sleep(Duration::from_secs_f64(interval));
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                let step =
                    ((TRANSCRIBE_CAP - TRANSCRIBE_START) as f64 * interval / expected_secs) as f32;
                current = (current + step).min(TRANSCRIBE_CAP);
                emitter.progress(&task_id, current, &stage_message(current));
                if let Some(watch) = &watch {
                    watch.sample();
                }
            }
            debug!(task_id = %task_id, "progress ticker stopped");
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the ticker and wait for its thread.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn stage_message(progress: f32) -> String {
    let stage = if progress < 40.0 {
        "initializing transcription engine"
    } else if progress < 70.0 {
        "analyzing audio"
    } else {
        "generating transcript"
    };
    format!("{stage}... ({progress:.0}%)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::CollectingEmitter;

    #[test]
    fn progress_is_monotonic_and_capped() {
        let emitter = Arc::new(CollectingEmitter::default());
        // Short expected duration so the ticker moves quickly.
        let ticker = ProgressTicker::start(
            "t1".into(),
            "tiny".into(),
            10.0,
            Arc::clone(&emitter) as Arc<dyn Emit>,
            None,
        );
        std::thread::sleep(Duration::from_millis(3200));
        ticker.stop();

        let values = emitter.progress_values();
        assert!(values.len() >= 2, "expected several updates, got {values:?}");
        assert_eq!(values[0], TRANSCRIBE_START);
        for pair in values.windows(2) {
            assert!(pair[1] >= pair[0], "progress regressed: {values:?}");
        }
        assert!(values.iter().all(|v| *v <= TRANSCRIBE_CAP));
    }

    #[test]
    fn stage_messages_follow_progress() {
        assert!(stage_message(25.0).contains("initializing"));
        assert!(stage_message(55.0).contains("analyzing"));
        assert!(stage_message(85.0).contains("generating"));
    }
}

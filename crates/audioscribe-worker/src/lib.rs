//! Per-task transcription worker.
//!
//! One worker process handles exactly one task. The parent restricts its
//! device visibility with `CUDA_VISIBLE_DEVICES` before spawn, so the
//! single visible device is always index zero here, and the parent never
//! initializes a GPU runtime itself. The worker ensures the model file is
//! cached (downloading with progress if not), decodes the audio, runs the
//! speech engine, and reports everything as line-delimited JSON on stdout.

pub mod audio;
pub mod emit;
pub mod engine;
pub mod memwatch;
pub mod model_cache;
pub mod progress;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use audioscribe_config::SystemConfig;
use audioscribe_errors::ScribeError;
use audioscribe_types::{FailureKind, WorkerReply, WorkerRequest};

use crate::emit::Emit;
use crate::memwatch::MemoryWatch;

/// Map an internal error onto the failure kind reported to the parent.
fn kind_for(err: &ScribeError) -> FailureKind {
    match err {
        ScribeError::Engine(msg) if msg.contains("without a speech engine") => {
            FailureKind::Configuration
        }
        ScribeError::Engine(_) | ScribeError::Download(_) | ScribeError::Gpu(_) => {
            FailureKind::Transient
        }
        ScribeError::Audio(_) | ScribeError::InvalidInput(_) | ScribeError::Io(_) => {
            FailureKind::InvalidInput
        }
        ScribeError::Config(_) => FailureKind::Configuration,
        ScribeError::Timeout(_) => FailureKind::Fatal,
        _ => FailureKind::Fatal,
    }
}

/// Execute one task end to end. Never panics on expected failure paths;
/// every error becomes a structured reply.
pub async fn run(
    request: WorkerRequest,
    config: &SystemConfig,
    emitter: Arc<dyn Emit>,
) -> WorkerReply {
    match run_inner(&request, config, Arc::clone(&emitter)).await {
        Ok(reply) => reply,
        Err(err) => {
            warn!(task_id = %request.task_id, %err, "worker run failed");
            WorkerReply::failure(
                request.task_id.clone(),
                request.file.clone(),
                kind_for(&err),
                err.to_string(),
            )
        }
    }
}

async fn run_inner(
    request: &WorkerRequest,
    config: &SystemConfig,
    emitter: Arc<dyn Emit>,
) -> Result<WorkerReply, ScribeError> {
    let full_path = resolve_input(request);
    if !full_path.exists() {
        return Err(ScribeError::InvalidInput(format!(
            "file not found: {}",
            full_path.display()
        )));
    }

    // Model weights first; this is the slow cold-start path and reports its
    // own download progress.
    let model_path =
        model_cache::ensure_model(config, &request.model, &request.task_id, emitter.as_ref())
            .await?;

    emitter.progress(&request.task_id, 10.0, "preparing audio");
    let decode_path = full_path.clone();
    let decoded = tokio::task::spawn_blocking(move || audio::decode_file(&decode_path))
        .await
        .map_err(|err| ScribeError::Worker(format!("decode task panicked: {err}")))??;
    info!(
        task_id = %request.task_id,
        duration = decoded.duration_secs,
        samples = decoded.samples.len(),
        "audio decoded"
    );

    let watch = Arc::new(MemoryWatch::new());
    let ticker = progress::ProgressTicker::start(
        request.task_id.clone(),
        request.model.clone(),
        decoded.duration_secs,
        Arc::clone(&emitter),
        Some(Arc::clone(&watch)),
    );

    let engine_model_path = model_path.clone();
    let transcript = tokio::task::spawn_blocking(move || {
        let mut engine = engine::load_engine(&engine_model_path)?;
        engine.transcribe(&decoded)
    })
    .await
    .map_err(|err| ScribeError::Worker(format!("engine task panicked: {err}")))?;

    ticker.stop();
    watch.sample();

    let transcript = transcript?;
    info!(
        task_id = %request.task_id,
        text_len = transcript.text.len(),
        segments = transcript.segments.len(),
        "transcription finished"
    );

    let mut reply = WorkerReply::success(
        request.task_id.clone(),
        request.file.clone(),
        transcript,
    );
    reply.observed_memory_gb = watch.peak_delta_gb();
    Ok(reply)
}

fn resolve_input(request: &WorkerRequest) -> PathBuf {
    if request.file.is_absolute() {
        request.file.clone()
    } else {
        request.upload_root.join(&request.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::CollectingEmitter;
    use audioscribe_types::OutputFormat;

    fn request(file: &str) -> WorkerRequest {
        WorkerRequest {
            task_id: "t1".into(),
            gpu_id: 0,
            model: "tiny".into(),
            file: PathBuf::from(file),
            upload_root: PathBuf::from("/nonexistent-root"),
            output_formats: vec![OutputFormat::Txt],
        }
    }

    #[tokio::test]
    async fn missing_file_is_invalid_input() {
        let emitter = Arc::new(CollectingEmitter::default());
        let config = SystemConfig::default();
        let reply = run(request("missing.wav"), &config, emitter).await;
        assert!(!reply.success);
        assert_eq!(reply.error_kind, Some(FailureKind::InvalidInput));
        assert!(reply.error.unwrap().contains("file not found"));
    }

    #[test]
    fn kinds_map_sensibly() {
        assert_eq!(
            kind_for(&ScribeError::Engine(
                "worker built without a speech engine".into()
            )),
            FailureKind::Configuration
        );
        assert_eq!(
            kind_for(&ScribeError::Engine("cuda launch failed".into())),
            FailureKind::Transient
        );
        assert_eq!(
            kind_for(&ScribeError::Download("connection reset".into())),
            FailureKind::Transient
        );
        assert_eq!(
            kind_for(&ScribeError::Audio("unsupported container".into())),
            FailureKind::InvalidInput
        );
    }
}

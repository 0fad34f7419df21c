//! Model weight cache.
//!
//! A model is "present" when its weight file exists with a plausible size.
//! Absent models are downloaded to a temporary sibling and renamed into
//! place, so a crashed download never leaves a half-written file that
//! passes the presence check.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use audioscribe_config::SystemConfig;
use audioscribe_errors::{ScribeError, ScribeResult};

use crate::emit::Emit;

/// Weight files smaller than this are treated as corrupt leftovers.
pub const MIN_VALID_MODEL_BYTES: u64 = 1024 * 1024;

/// Whether a cached weight file is usable.
pub fn is_cached(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() >= MIN_VALID_MODEL_BYTES)
        .unwrap_or(false)
}

/// Ensure the model's weights are cached, downloading with progress if not.
/// Returns the path to the validated weight file.
pub async fn ensure_model(
    config: &SystemConfig,
    model: &str,
    task_id: &str,
    emitter: &dyn Emit,
) -> ScribeResult<PathBuf> {
    let path = config.model_path(model);
    if is_cached(&path) {
        return Ok(path);
    }

    info!(model, path = %path.display(), "model not cached, downloading");
    match download(config, model, task_id, &path, emitter).await {
        Ok(()) => {
            emitter.download_progress(task_id, model, 100.0, "model ready");
            Ok(path)
        }
        Err(err) => {
            emitter.download_progress(
                task_id,
                model,
                -1.0,
                &format!("model download failed: {err}"),
            );
            Err(err)
        }
    }
}

async fn download(
    config: &SystemConfig,
    model: &str,
    task_id: &str,
    path: &Path,
    emitter: &dyn Emit,
) -> ScribeResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let url = config.model_url(model);
    emitter.download_progress(task_id, model, 0.0, "starting model download");

    let response = reqwest::get(&url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|err| ScribeError::Download(format!("GET {url}: {err}")))?;
    let total_bytes = response.content_length();

    let tmp_path = path.with_extension("bin.tmp");
    let mut tmp = tokio::fs::File::create(&tmp_path).await?;
    let mut downloaded: u64 = 0;
    let mut last_reported: f32 = 0.0;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|err| ScribeError::Download(format!("stream from {url}: {err}")))?;
        tmp.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        if let Some(total) = total_bytes {
            let percent = downloaded as f32 / total as f32 * 100.0;
            if percent - last_reported >= 1.0 {
                last_reported = percent;
                emitter.download_progress(
                    task_id,
                    model,
                    percent.min(99.0),
                    &format!("downloading model ({downloaded}/{total} bytes)"),
                );
            }
        }
    }
    tmp.flush().await?;
    drop(tmp);

    if downloaded < MIN_VALID_MODEL_BYTES {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(ScribeError::Download(format!(
            "downloaded file for {model} is implausibly small ({downloaded} bytes)"
        )));
    }

    tokio::fs::rename(&tmp_path, path).await.map_err(|err| {
        warn!(%err, "atomic rename of downloaded model failed");
        ScribeError::Download(format!("finalizing {}: {err}", path.display()))
    })?;
    info!(model, bytes = downloaded, "model downloaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::CollectingEmitter;
    use tempfile::tempdir;

    #[test]
    fn cache_check_requires_plausible_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ggml-tiny.bin");
        assert!(!is_cached(&path));

        std::fs::write(&path, vec![0u8; 16]).unwrap();
        assert!(!is_cached(&path), "tiny files are corrupt leftovers");

        std::fs::write(&path, vec![0u8; MIN_VALID_MODEL_BYTES as usize]).unwrap();
        assert!(is_cached(&path));
    }

    #[tokio::test]
    async fn cached_model_short_circuits() {
        let dir = tempdir().unwrap();
        let config = SystemConfig {
            model_base_path: dir.path().to_path_buf(),
            ..SystemConfig::default()
        };
        let path = config.model_path("tiny");
        std::fs::write(&path, vec![0u8; MIN_VALID_MODEL_BYTES as usize]).unwrap();

        let emitter = CollectingEmitter::default();
        let resolved = ensure_model(&config, "tiny", "t1", &emitter).await.unwrap();
        assert_eq!(resolved, path);
        // No download events for a warm cache.
        assert!(emitter.messages().is_empty());
    }
}

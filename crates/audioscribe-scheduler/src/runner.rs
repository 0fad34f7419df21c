//! The worker process boundary.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use audioscribe_config::SystemConfig;
use audioscribe_errors::{ScribeError, ScribeResult};
use audioscribe_types::{WorkerMessage, WorkerReply, WorkerRequest};

/// Receives progress-bearing protocol messages while a worker runs.
pub type ProgressSink = Arc<dyn Fn(WorkerMessage) + Send + Sync>;

/// Executes one task in an isolated context and returns its reply.
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    async fn run(&self, request: WorkerRequest, progress: ProgressSink)
        -> ScribeResult<WorkerReply>;
}

/// Spawns the `audioscribe-worker` binary per task.
///
/// Device visibility is narrowed with `CUDA_VISIBLE_DEVICES` before the
/// child starts, so each worker sees exactly one device at index zero and
/// concurrent workers on different GPUs cannot corrupt each other's
/// context. The parent never initializes a GPU runtime itself.
pub struct ProcessWorkerRunner {
    binary: std::path::PathBuf,
    timeout: Duration,
}

impl ProcessWorkerRunner {
    pub fn new(config: &SystemConfig) -> Self {
        Self {
            binary: config.worker_binary.clone(),
            timeout: config.transcription_timeout,
        }
    }
}

#[async_trait]
impl WorkerRunner for ProcessWorkerRunner {
    async fn run(
        &self,
        request: WorkerRequest,
        progress: ProgressSink,
    ) -> ScribeResult<WorkerReply> {
        let formats = request
            .output_formats
            .iter()
            .map(|f| f.extension())
            .collect::<Vec<_>>()
            .join(",");

        let mut child = Command::new(&self.binary)
            .arg("--task-id")
            .arg(&request.task_id)
            .arg("--gpu-id")
            .arg(request.gpu_id.to_string())
            .arg("--model")
            .arg(&request.model)
            .arg("--file")
            .arg(&request.file)
            .arg("--upload-root")
            .arg(&request.upload_root)
            .arg("--formats")
            .arg(&formats)
            .env("CUDA_VISIBLE_DEVICES", request.gpu_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ScribeError::Worker(format!(
                    "spawning {}: {err}",
                    self.binary.display()
                ))
            })?;

        let task_id = request.task_id.clone();
        match tokio::time::timeout(self.timeout, drive(&mut child, &task_id, progress)).await {
            Ok(result) => result,
            Err(_) => {
                let _ = child.kill().await;
                Err(ScribeError::Timeout(format!(
                    "task {task_id} exceeded the transcription timeout of {:?}",
                    self.timeout
                )))
            }
        }
    }
}

/// Read the child's protocol stream to completion and reap it.
async fn drive(
    child: &mut Child,
    task_id: &str,
    progress: ProgressSink,
) -> ScribeResult<WorkerReply> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ScribeError::Worker("worker stdout was not captured".into()))?;

    if let Some(stderr) = child.stderr.take() {
        let id = task_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task_id = %id, "worker: {line}");
            }
        });
    }

    let mut reply = None;
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|err| ScribeError::Worker(format!("reading worker stdout: {err}")))?
    {
        match serde_json::from_str::<WorkerMessage>(&line) {
            Ok(WorkerMessage::Done { reply: done }) => {
                reply = Some(done);
            }
            Ok(message) => progress(message),
            Err(err) => warn!(task_id, %err, "unparseable worker output: {line}"),
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|err| ScribeError::Worker(format!("waiting for worker: {err}")))?;

    match reply {
        Some(reply) => Ok(reply),
        None => Err(ScribeError::Worker(format!(
            "worker exited ({status}) without reporting a result"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audioscribe_types::OutputFormat;
    use std::path::PathBuf;

    fn request() -> WorkerRequest {
        WorkerRequest {
            task_id: "t1".into(),
            gpu_id: 0,
            model: "tiny".into(),
            file: PathBuf::from("a.wav"),
            upload_root: PathBuf::from("/uploads"),
            output_formats: vec![OutputFormat::Txt],
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_worker_error() {
        let runner = ProcessWorkerRunner {
            binary: PathBuf::from("/definitely/not/a/worker"),
            timeout: Duration::from_secs(5),
        };
        let err = runner
            .run(request(), Arc::new(|_| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, ScribeError::Worker(_)));
    }

    #[tokio::test]
    async fn protocol_round_trip_through_a_real_process() {
        // A stand-in worker that emits one progress line and a done line.
        let reply = WorkerReply::success("t1", PathBuf::from("a.wav"), Default::default());
        let done = serde_json::to_string(&WorkerMessage::Done { reply }).unwrap();
        let progress_line = serde_json::to_string(&WorkerMessage::Progress {
            task_id: "t1".into(),
            progress: 50.0,
            message: "halfway".into(),
        })
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-worker.sh");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho '{progress_line}'\necho '{done}'\n"),
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let runner = ProcessWorkerRunner {
            binary: script,
            timeout: Duration::from_secs(5),
        };
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let reply = runner
            .run(
                request(),
                Arc::new(move |msg| sink_seen.lock().push(msg)),
            )
            .await
            .unwrap();

        assert!(reply.success);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            WorkerMessage::Progress { progress, .. } => assert_eq!(*progress, 50.0),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("sleepy-worker.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let runner = ProcessWorkerRunner {
            binary: script,
            timeout: Duration::from_millis(200),
        };
        let started = std::time::Instant::now();
        let err = runner
            .run(request(), Arc::new(|_| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, ScribeError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

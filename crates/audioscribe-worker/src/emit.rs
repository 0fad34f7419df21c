//! Protocol emission to the parent process.

use std::io::Write;

use audioscribe_types::WorkerMessage;
use tracing::error;

/// Sink for protocol messages. The worker only ever appends; the parent
/// reads stdout line by line.
pub trait Emit: Send + Sync {
    fn emit(&self, message: &WorkerMessage);

    fn progress(&self, task_id: &str, progress: f32, message: &str) {
        self.emit(&WorkerMessage::Progress {
            task_id: task_id.to_string(),
            progress,
            message: message.to_string(),
        });
    }

    fn download_progress(&self, task_id: &str, model: &str, progress: f32, message: &str) {
        self.emit(&WorkerMessage::DownloadProgress {
            task_id: task_id.to_string(),
            model: model.to_string(),
            progress,
            message: message.to_string(),
        });
    }
}

/// Writes one JSON document per line to stdout and flushes immediately so
/// the parent sees progress as it happens.
#[derive(Default)]
pub struct StdoutEmitter;

impl Emit for StdoutEmitter {
    fn emit(&self, message: &WorkerMessage) {
        match serde_json::to_string(message) {
            Ok(line) => {
                let stdout = std::io::stdout();
                let mut handle = stdout.lock();
                if writeln!(handle, "{line}").and_then(|_| handle.flush()).is_err() {
                    // Parent is gone; nothing sensible left to do.
                    error!("failed to write protocol message to stdout");
                }
            }
            Err(err) => error!(%err, "failed to serialize protocol message"),
        }
    }
}

/// Test emitter collecting everything it sees.
#[derive(Default)]
pub struct CollectingEmitter {
    messages: parking_lot::Mutex<Vec<WorkerMessage>>,
}

impl CollectingEmitter {
    pub fn messages(&self) -> Vec<WorkerMessage> {
        self.messages.lock().clone()
    }

    /// The progress values seen so far, in order.
    pub fn progress_values(&self) -> Vec<f32> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect()
    }
}

impl Emit for CollectingEmitter {
    fn emit(&self, message: &WorkerMessage) {
        self.messages.lock().push(message.clone());
    }
}

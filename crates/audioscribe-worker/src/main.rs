//! Worker process entrypoint.
//!
//! Spawned by the scheduler with `CUDA_VISIBLE_DEVICES` already narrowed to
//! the target GPU. Protocol messages go to stdout; logs go to stderr so
//! they never corrupt the protocol stream. The process exits 0 whenever it
//! managed to emit a final `done` message, success or not.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use audioscribe_config::SystemConfig;
use audioscribe_types::{OutputFormat, WorkerMessage, WorkerRequest};
use audioscribe_worker::emit::{Emit, StdoutEmitter};

#[derive(Debug, Parser)]
#[command(name = "audioscribe-worker", about = "Transcribe one audio file")]
struct WorkerArgs {
    /// Task id this worker is responsible for.
    #[arg(long)]
    task_id: String,

    /// GPU id as seen by the parent (informational; the visible device
    /// here is always index zero).
    #[arg(long)]
    gpu_id: u32,

    /// Model name, e.g. "small".
    #[arg(long)]
    model: String,

    /// Audio file, absolute or relative to the upload root.
    #[arg(long)]
    file: PathBuf,

    /// Root directory for relative audio paths.
    #[arg(long)]
    upload_root: PathBuf,

    /// Comma-separated output formats (txt,srt,vtt,json).
    #[arg(long, default_value = "txt")]
    formats: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = WorkerArgs::parse();
    let config = SystemConfig::from_env()?;

    let output_formats: Vec<OutputFormat> = args
        .formats
        .split(',')
        .filter_map(OutputFormat::parse)
        .collect();

    let request = WorkerRequest {
        task_id: args.task_id,
        gpu_id: args.gpu_id,
        model: args.model,
        file: args.file,
        upload_root: args.upload_root,
        output_formats,
    };

    let emitter: Arc<dyn Emit> = Arc::new(StdoutEmitter);
    let reply = audioscribe_worker::run(request, &config, Arc::clone(&emitter)).await;
    emitter.emit(&WorkerMessage::Done { reply });
    Ok(())
}

//! Default filesystem sink.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use audioscribe_errors::ScribeResult;
use audioscribe_types::{OutputFormat, Task, Transcript, TranscriptSegment};

use crate::timecode;
use crate::{NoopTransform, ResultSink, TextTransform};

/// Writes transcripts into a flat output directory, one file per format.
pub struct TranscriptSaver {
    output_folder: PathBuf,
    transform: Arc<dyn TextTransform>,
}

impl TranscriptSaver {
    pub fn new(output_folder: impl Into<PathBuf>) -> Self {
        Self {
            output_folder: output_folder.into(),
            transform: Arc::new(NoopTransform),
        }
    }

    pub fn with_transform(mut self, transform: Arc<dyn TextTransform>) -> Self {
        self.transform = transform;
        self
    }

    /// Target path for `base.ext`, with a timestamp suffix when the plain
    /// name is taken.
    fn target_path(&self, base: &str, extension: &str) -> PathBuf {
        let plain = self.output_folder.join(format!("{base}.{extension}"));
        if !plain.exists() {
            return plain;
        }
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        self.output_folder.join(format!("{base}_{stamp}.{extension}"))
    }

    fn normalized_segments(&self, transcript: &Transcript) -> Vec<TranscriptSegment> {
        transcript
            .segments
            .iter()
            .map(|segment| TranscriptSegment {
                id: segment.id,
                start_secs: segment.start_secs,
                end_secs: segment.end_secs,
                text: self.transform.apply(&segment.text),
            })
            .collect()
    }

    fn write_txt(&self, path: &Path, text: &str) -> ScribeResult<()> {
        fs::write(path, text)?;
        Ok(())
    }

    fn write_srt(&self, path: &Path, segments: &[TranscriptSegment]) -> ScribeResult<()> {
        let mut file = fs::File::create(path)?;
        for (index, segment) in segments.iter().enumerate() {
            writeln!(file, "{}", index + 1)?;
            writeln!(
                file,
                "{} --> {}",
                timecode::format_srt(segment.start_secs),
                timecode::format_srt(segment.end_secs)
            )?;
            writeln!(file, "{}\n", segment.text.trim())?;
        }
        Ok(())
    }

    fn write_vtt(&self, path: &Path, segments: &[TranscriptSegment]) -> ScribeResult<()> {
        let mut file = fs::File::create(path)?;
        writeln!(file, "WEBVTT\n")?;
        for segment in segments {
            writeln!(
                file,
                "{} --> {}",
                timecode::format_vtt(segment.start_secs),
                timecode::format_vtt(segment.end_secs)
            )?;
            writeln!(file, "{}\n", segment.text.trim())?;
        }
        Ok(())
    }

    fn write_json(
        &self,
        path: &Path,
        task: &Task,
        text: &str,
        segments: &[TranscriptSegment],
        transcript: &Transcript,
    ) -> ScribeResult<()> {
        let document = json!({
            "metadata": {
                "task_id": task.id,
                "created_at": Utc::now().to_rfc3339(),
                "filename": task.file_name(),
                "model": task.model,
            },
            "transcription": {
                "text": text,
                "language": transcript.language,
                "duration_secs": transcript.duration_secs,
                "segments": segments,
            },
        });
        fs::write(path, serde_json::to_vec_pretty(&document)?)?;
        Ok(())
    }
}

impl ResultSink for TranscriptSaver {
    fn save(&self, task: &Task, transcript: &Transcript) -> ScribeResult<Vec<PathBuf>> {
        fs::create_dir_all(&self.output_folder)?;

        let base = Path::new(&task.file_name())
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| task.id.clone());
        let text = self.transform.apply(&transcript.text);
        let segments = self.normalized_segments(transcript);

        let mut saved = Vec::new();
        for format in &task.output_formats {
            let path = self.target_path(&base, format.extension());
            match format {
                OutputFormat::Txt => self.write_txt(&path, &text)?,
                OutputFormat::Srt => self.write_srt(&path, &segments)?,
                OutputFormat::Vtt => self.write_vtt(&path, &segments)?,
                OutputFormat::Json => {
                    self.write_json(&path, task, &text, &segments, transcript)?
                }
            }
            info!(task_id = %task.id, path = %path.display(), "transcript saved");
            saved.push(path);
        }

        if saved.is_empty() {
            warn!(task_id = %task.id, "task requested no output formats");
        }
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audioscribe_types::TaskPriority;
    use tempfile::tempdir;

    fn sample_task(dir: &Path, formats: Vec<OutputFormat>) -> Task {
        let mut task = Task::new(
            Some("t1".into()),
            "user",
            PathBuf::from("meeting.wav"),
            "small",
            TaskPriority::Normal,
            formats,
            3,
        );
        task.file = dir.join("meeting.wav");
        task
    }

    fn sample_transcript() -> Transcript {
        Transcript {
            text: "hello world".into(),
            language: Some("en".into()),
            duration_secs: 3.5,
            segments: vec![
                TranscriptSegment {
                    id: 0,
                    start_secs: 0.0,
                    end_secs: 1.5,
                    text: "hello".into(),
                },
                TranscriptSegment {
                    id: 1,
                    start_secs: 1.5,
                    end_secs: 3.5,
                    text: "world".into(),
                },
            ],
        }
    }

    #[test]
    fn writes_every_requested_format() {
        let dir = tempdir().unwrap();
        let saver = TranscriptSaver::new(dir.path());
        let task = sample_task(
            dir.path(),
            vec![
                OutputFormat::Txt,
                OutputFormat::Srt,
                OutputFormat::Vtt,
                OutputFormat::Json,
            ],
        );
        let saved = saver.save(&task, &sample_transcript()).unwrap();
        assert_eq!(saved.len(), 4);

        let txt = fs::read_to_string(dir.path().join("meeting.txt")).unwrap();
        assert_eq!(txt, "hello world");

        let srt = fs::read_to_string(dir.path().join("meeting.srt")).unwrap();
        assert!(srt.contains("00:00:00,000 --> 00:00:01,500"));
        assert!(srt.starts_with("1\n"));

        let vtt = fs::read_to_string(dir.path().join("meeting.vtt")).unwrap();
        assert!(vtt.starts_with("WEBVTT"));
        assert!(vtt.contains("00:00:01.500 --> 00:00:03.500"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("meeting.json")).unwrap())
                .unwrap();
        assert_eq!(json["metadata"]["task_id"], "t1");
        assert_eq!(json["transcription"]["text"], "hello world");
    }

    #[test]
    fn existing_files_get_a_timestamp_suffix() {
        let dir = tempdir().unwrap();
        let saver = TranscriptSaver::new(dir.path());
        let task = sample_task(dir.path(), vec![OutputFormat::Txt]);

        let first = saver.save(&task, &sample_transcript()).unwrap();
        let second = saver.save(&task, &sample_transcript()).unwrap();
        assert_eq!(first[0], dir.path().join("meeting.txt"));
        assert_ne!(first[0], second[0]);
        assert!(second[0].exists());
    }

    #[test]
    fn transform_applies_to_text_and_segments() {
        struct Upper;
        impl TextTransform for Upper {
            fn apply(&self, text: &str) -> String {
                text.to_uppercase()
            }
        }

        let dir = tempdir().unwrap();
        let saver =
            TranscriptSaver::new(dir.path()).with_transform(Arc::new(Upper));
        let task = sample_task(dir.path(), vec![OutputFormat::Txt, OutputFormat::Srt]);
        saver.save(&task, &sample_transcript()).unwrap();

        let txt = fs::read_to_string(dir.path().join("meeting.txt")).unwrap();
        assert_eq!(txt, "HELLO WORLD");
        let srt = fs::read_to_string(dir.path().join("meeting.srt")).unwrap();
        assert!(srt.contains("HELLO"));
    }
}

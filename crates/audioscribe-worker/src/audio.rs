//! Audio decoding for the speech engine.
//!
//! Whatever the upload container is, the engine wants mono f32 at 16 kHz.
//! Decoding runs through symphonia; channel folding and the linear
//! resampler keep the hot path allocation-light.

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

use audioscribe_errors::{ScribeError, ScribeResult};

/// Sample rate the engine expects.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Decoded, engine-ready audio.
#[derive(Debug)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub duration_secs: f64,
}

/// Decode a file to mono f32 at [`TARGET_SAMPLE_RATE`].
pub fn decode_file(path: &Path) -> ScribeResult<DecodedAudio> {
    let file = File::open(path).map_err(|err| {
        ScribeError::Audio(format!("cannot open {}: {err}", path.display()))
    })?;
    let stream = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|err| {
            ScribeError::Audio(format!("unsupported format {}: {err}", path.display()))
        })?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| ScribeError::Audio(format!("no audio track in {}", path.display())))?;
    let track_id = track.id;
    let source_rate = track.codec_params.sample_rate.unwrap_or(TARGET_SAMPLE_RATE);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|err| ScribeError::Audio(format!("cannot decode audio: {err}")))?;

    let mut interleaved: Vec<f32> = Vec::new();
    let mut channels: usize = 1;
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(err) => {
                return Err(ScribeError::Audio(format!("error reading audio: {err}")))
            }
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // Isolated corrupt packets are skipped, not fatal.
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(err) => {
                return Err(ScribeError::Audio(format!("error decoding audio: {err}")))
            }
        };
        let spec = *decoded.spec();
        channels = spec.channels.count().max(1);
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        interleaved.extend_from_slice(buffer.samples());
    }

    if interleaved.is_empty() {
        return Err(ScribeError::Audio(format!(
            "no decodable audio in {}",
            path.display()
        )));
    }

    let mono = to_mono(&interleaved, channels);
    let samples = if source_rate != TARGET_SAMPLE_RATE {
        resample_linear(&mono, source_rate, TARGET_SAMPLE_RATE)
    } else {
        mono
    };
    let duration_secs = samples.len() as f64 / TARGET_SAMPLE_RATE as f64;
    debug!(
        path = %path.display(),
        source_rate,
        channels,
        duration_secs,
        "audio decoded"
    );

    Ok(DecodedAudio {
        samples,
        sample_rate: TARGET_SAMPLE_RATE,
        duration_secs,
    })
}

/// Average interleaved channels down to one.
pub fn to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    let channels = channels.max(1);
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Cheap linear-interpolation resampler. Speech recognition tolerates this
/// well and it avoids pulling a DSP dependency for one conversion.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let position = i as f64 * ratio;
        let index = position as usize;
        let fraction = (position - index as f64) as f32;
        let a = samples[index];
        let b = samples.get(index + 1).copied().unwrap_or(a);
        out.push(a + (b - a) * fraction);
    }
    out
}

//! Conversion of synthesized audio into canonical PCM.

use std::io::Cursor;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use hound::{SampleFormat, WavReader};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use voicebot_core::config::ConverterConfig;
use voicebot_core::error::{Result, VoicebotError};

use crate::codec::{BYTES_PER_SAMPLE, SAMPLE_RATE};

/// Resamples and re-encodes audio into signed 16-bit LE PCM, 8 kHz, mono.
#[async_trait]
pub trait AudioFormatConverter: Send + Sync {
    async fn convert_to_canonical_pcm(&self, audio: &[u8]) -> Result<Vec<u8>>;
}

/// Converter that pipes audio through an `ffmpeg` child process.
///
/// The child is killed if the conversion future is dropped, so wrapping
/// the call in a timeout also bounds the process lifetime.
pub struct FfmpegConverter {
    binary: String,
}

impl FfmpegConverter {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn args() -> [&'static str; 16] {
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            "pipe:0",
            "-f",
            "s16le",
            "-acodec",
            "pcm_s16le",
            "-ar",
            "8000",
            "-ac",
            "1",
            "-y",
            "-vn",
            "pipe:1",
        ]
    }
}

#[async_trait]
impl AudioFormatConverter for FfmpegConverter {
    async fn convert_to_canonical_pcm(&self, audio: &[u8]) -> Result<Vec<u8>> {
        if audio.is_empty() {
            return Err(VoicebotError::Conversion("input audio is empty".into()));
        }

        let mut child = Command::new(&self.binary)
            .args(Self::args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                VoicebotError::Conversion(format!("failed to spawn {}: {e}", self.binary))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoicebotError::Conversion("ffmpeg stdin unavailable".into()))?;

        let feed = async move {
            let result = stdin.write_all(audio).await;
            drop(stdin);
            result
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoicebotError::Conversion(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        fed.map_err(|e| VoicebotError::Conversion(format!("writing to ffmpeg failed: {e}")))?;

        if output.stdout.is_empty() {
            return Err(VoicebotError::Conversion("ffmpeg produced no audio".into()));
        }
        debug!(
            input_bytes = audio.len(),
            pcm_bytes = output.stdout.len(),
            "Converted audio to PCM"
        );
        Ok(output.stdout)
    }
}

/// Converter for providers that already return canonical PCM, bare or in a
/// WAV container.
pub struct PassthroughConverter;

#[async_trait]
impl AudioFormatConverter for PassthroughConverter {
    async fn convert_to_canonical_pcm(&self, audio: &[u8]) -> Result<Vec<u8>> {
        let pcm = if audio.starts_with(b"RIFF") {
            wav_samples(audio)?
        } else {
            audio.to_vec()
        };
        if pcm.is_empty() {
            return Err(VoicebotError::Conversion("no PCM samples".into()));
        }
        if pcm.len() % BYTES_PER_SAMPLE != 0 {
            return Err(VoicebotError::Conversion(format!(
                "PCM length {} is not a whole number of samples",
                pcm.len()
            )));
        }
        Ok(pcm)
    }
}

/// Decode a WAV buffer that must already be 16-bit mono PCM at the
/// canonical rate, returning its samples as little-endian bytes.
fn wav_samples(wav: &[u8]) -> Result<Vec<u8>> {
    let bad = |msg: String| VoicebotError::Conversion(format!("invalid WAV: {msg}"));
    let mut reader = WavReader::new(Cursor::new(wav)).map_err(|e| bad(e.to_string()))?;

    let spec = reader.spec();
    if spec.channels != 1
        || spec.sample_rate != SAMPLE_RATE
        || spec.bits_per_sample != 16
        || spec.sample_format != SampleFormat::Int
    {
        return Err(bad(format!(
            "expected 16-bit mono PCM at {SAMPLE_RATE} Hz, got {:?} channels={} rate={} bits={}",
            spec.sample_format, spec.channels, spec.sample_rate, spec.bits_per_sample
        )));
    }

    let mut pcm = Vec::with_capacity(reader.len() as usize * BYTES_PER_SAMPLE);
    for sample in reader.samples::<i16>() {
        let sample = sample.map_err(|e| bad(e.to_string()))?;
        pcm.extend_from_slice(&sample.to_le_bytes());
    }
    Ok(pcm)
}

/// Build the configured converter.
pub fn from_config(config: &ConverterConfig) -> Result<Arc<dyn AudioFormatConverter>> {
    match config.kind.as_str() {
        "ffmpeg" => Ok(Arc::new(FfmpegConverter::new(config.ffmpeg_binary()))),
        "passthrough" => Ok(Arc::new(PassthroughConverter)),
        other => Err(VoicebotError::Config(format!(
            "Unknown converter kind '{other}'"
        ))),
    }
}

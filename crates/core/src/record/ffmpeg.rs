//! Compressed delivery through a system `ffmpeg` binary.
//!
//! The recording itself is captured as AVI; `finish` hands that file to
//! `ffmpeg` for transcoding. A missing binary or a failed transcode yields the
//! AVI recording instead of an error.

use std::{
    process::{Command, Stdio},
    sync::OnceLock,
};

use super::{
    avi::AviWriter, EncoderBackend, EncoderFormat, Recording, RecordingEncoder, StreamSpec,
};
use crate::{render::RasterSurface, MotifError, Result};

#[derive(Debug)]
pub struct FfmpegBackend {
    program: String,
    encoders: OnceLock<Vec<String>>,
}

impl FfmpegBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            encoders: OnceLock::new(),
        }
    }

    /// Backend whose encoder list is taken from `listing` instead of probing
    /// the binary.
    pub fn from_listing(program: impl Into<String>, listing: &str) -> Self {
        let backend = Self::new(program);
        let _ = backend.encoders.set(parse_encoders(listing));
        backend
    }

    /// Encoder names reported by `ffmpeg -encoders`, queried on first use.
    pub fn encoders(&self) -> &[String] {
        self.encoders.get_or_init(|| self.list_encoders())
    }

    fn list_encoders(&self) -> Vec<String> {
        let output = Command::new(&self.program)
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .output();
        match output {
            Ok(output) if output.status.success() => {
                let encoders = parse_encoders(&String::from_utf8_lossy(&output.stdout));
                tracing::debug!(program = %self.program, count = encoders.len(), "listed ffmpeg encoders");
                encoders
            }
            Ok(output) => {
                tracing::warn!(program = %self.program, status = %output.status, "ffmpeg -encoders failed");
                Vec::new()
            }
            Err(err) => {
                tracing::debug!(program = %self.program, error = %err, "ffmpeg not available");
                Vec::new()
            }
        }
    }

    fn has(&self, name: &str) -> bool {
        self.encoders().iter().any(|encoder| encoder == name)
    }
}

impl EncoderBackend for FfmpegBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn supports(&self, format: EncoderFormat) -> bool {
        match codec_args(format) {
            Some((video, audio, _)) => self.has(video) && self.has(audio),
            None => false,
        }
    }

    fn open(&self, format: EncoderFormat, spec: &StreamSpec) -> Result<Box<dyn RecordingEncoder>> {
        if !self.supports(format) {
            return Err(MotifError::Encode(format!("ffmpeg cannot produce {format}")));
        }
        Ok(Box::new(FfmpegEncoder {
            program: self.program.clone(),
            format,
            capture: AviWriter::new(*spec),
        }))
    }
}

struct FfmpegEncoder {
    program: String,
    format: EncoderFormat,
    capture: AviWriter,
}

fn transcode(program: &str, format: EncoderFormat, avi: &[u8]) -> Result<Vec<u8>> {
    let (video, audio, extra) = codec_args(format)
        .ok_or_else(|| MotifError::Encode(format!("no codecs for {format}")))?;
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("capture.avi");
    let output = dir.path().join(format!("export.{}", format.extension()));
    std::fs::write(&input, avi)?;

    let status = Command::new(program)
        .args(["-y", "-hide_banner", "-loglevel", "error", "-i"])
        .arg(&input)
        .args(["-c:v", video, "-c:a", audio])
        .args(extra)
        .arg(&output)
        .stdin(Stdio::null())
        .status()?;
    if !status.success() {
        return Err(MotifError::Encode(format!("ffmpeg exited with {status}")));
    }

    let bytes = std::fs::read(&output)?;
    if bytes.is_empty() {
        return Err(MotifError::Encode("ffmpeg produced an empty file".into()));
    }
    Ok(bytes)
}

impl RecordingEncoder for FfmpegEncoder {
    fn push_frame(&mut self, frame: &RasterSurface) -> Result<()> {
        self.capture.push_frame(frame)
    }

    fn push_audio(&mut self, samples: &[f32]) -> Result<()> {
        self.capture.push_audio(samples)
    }

    fn finish(self: Box<Self>) -> Result<Recording> {
        let FfmpegEncoder {
            program,
            format,
            capture,
        } = *self;
        let raw = Box::new(capture).finish()?;
        match transcode(&program, format, &raw.bytes) {
            Ok(bytes) => {
                tracing::info!(%format, bytes = bytes.len(), "ffmpeg transcode finished");
                Ok(Recording {
                    bytes,
                    format,
                    ..raw
                })
            }
            Err(err) => {
                tracing::warn!(%format, error = %err, "ffmpeg transcode failed, keeping avi capture");
                Ok(raw)
            }
        }
    }
}

fn codec_args(format: EncoderFormat) -> Option<(&'static str, &'static str, &'static [&'static str])> {
    match format {
        EncoderFormat::Mp4H264Aac => Some((
            "libx264",
            "aac",
            &["-pix_fmt", "yuv420p", "-movflags", "+faststart"],
        )),
        EncoderFormat::WebmVp9Opus => Some(("libvpx-vp9", "libopus", &["-pix_fmt", "yuv420p"])),
        EncoderFormat::AviRaw => None,
    }
}

/// Pulls encoder names out of `ffmpeg -encoders` output. Every entry line
/// starts with a six-character capability field followed by the name.
fn parse_encoders(listing: &str) -> Vec<String> {
    listing
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let flags = fields.next()?;
            let name = fields.next()?;
            (flags.len() == 6).then(|| name.to_string())
        })
        .collect()
}

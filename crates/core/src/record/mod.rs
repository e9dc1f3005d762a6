//! Offline export: re-drives a plan into a recorded audio/video artifact.
//!
//! Export never touches live playback. It owns a private [`AudioEngine`] and
//! [`VisualSync`], shares only the asset cache, and paces itself by the
//! number of samples rendered rather than by wall-clock time, so the artifact
//! is the same length however slowly frames are produced.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    assets::{PitchAssetCache, PreloadReport},
    audio::{AudioClock, AudioEngine, PlaybackSession},
    config::{AppConfig, AudioConfig, ExportConfig, VisualConfig},
    render::RasterSurface,
    timeline::TimelinePlan,
    visual::{VisualSnapshot, VisualSync},
    MotifError, Result,
};

mod avi;
mod ffmpeg;
mod normalize;

pub use avi::{AviBackend, AviWriter};
pub use ffmpeg::FfmpegBackend;
pub use normalize::{ContainerNormalizer, HttpNormalizer};

const NANOS_PER_SECOND: u128 = 1_000_000_000;
const MAX_STEM_LEN: usize = 40;

/// Lifecycle of one export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExportState {
    Idle,
    Priming,
    Recording,
    Finalizing,
    Done,
    /// Finished, but the artifact is not in the delivery format.
    Failed,
}

impl ExportState {
    pub fn can_transition(self, to: ExportState) -> bool {
        use ExportState::*;
        matches!(
            (self, to),
            (Idle, Priming)
                | (Priming, Recording)
                | (Recording, Finalizing)
                | (Finalizing, Done)
                | (Finalizing, Failed)
        )
    }

    pub fn transition(&mut self, to: ExportState) -> Result<()> {
        if !self.can_transition(to) {
            return Err(MotifError::InvalidTransition { from: *self, to });
        }
        tracing::debug!(from = ?*self, ?to, "export state");
        *self = to;
        Ok(())
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExportState::Done | ExportState::Failed)
    }
}

/// Container and codec combination an encoder can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncoderFormat {
    Mp4H264Aac,
    WebmVp9Opus,
    AviRaw,
}

impl EncoderFormat {
    pub const ALL: [EncoderFormat; 3] = [
        EncoderFormat::Mp4H264Aac,
        EncoderFormat::WebmVp9Opus,
        EncoderFormat::AviRaw,
    ];

    /// Full MIME type including codecs.
    pub fn mime(self) -> &'static str {
        match self {
            EncoderFormat::Mp4H264Aac => "video/mp4;codecs=avc1,mp4a",
            EncoderFormat::WebmVp9Opus => "video/webm;codecs=vp9,opus",
            EncoderFormat::AviRaw => "video/x-msvideo",
        }
    }

    pub fn container_mime(self) -> &'static str {
        match self {
            EncoderFormat::Mp4H264Aac => "video/mp4",
            EncoderFormat::WebmVp9Opus => "video/webm",
            EncoderFormat::AviRaw => "video/x-msvideo",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            EncoderFormat::Mp4H264Aac => "mp4",
            EncoderFormat::WebmVp9Opus => "webm",
            EncoderFormat::AviRaw => "avi",
        }
    }

    fn name(self) -> &'static str {
        match self {
            EncoderFormat::Mp4H264Aac => "mp4-h264-aac",
            EncoderFormat::WebmVp9Opus => "webm-vp9-opus",
            EncoderFormat::AviRaw => "avi-raw",
        }
    }
}

impl fmt::Display for EncoderFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EncoderFormat {
    type Err = MotifError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        EncoderFormat::ALL
            .into_iter()
            .find(|format| format.name() == wanted || format.extension() == wanted)
            .ok_or_else(|| MotifError::msg(format!("unknown export format `{s}`")))
    }
}

/// Geometry and rates of the streams handed to an encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub sample_rate: u32,
}

/// Encoded output of one recording.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub bytes: Vec<u8>,
    pub format: EncoderFormat,
    pub video_frames: u64,
    pub audio_samples: u64,
}

/// Sink for the composited frames and the mixed audio.
pub trait RecordingEncoder: Send {
    fn push_frame(&mut self, frame: &RasterSurface) -> Result<()>;
    /// Mono samples in `-1.0..=1.0`.
    fn push_audio(&mut self, samples: &[f32]) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<Recording>;
}

/// Something able to open encoders for a set of formats.
pub trait EncoderBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn supports(&self, format: EncoderFormat) -> bool;
    fn open(&self, format: EncoderFormat, spec: &StreamSpec) -> Result<Box<dyn RecordingEncoder>>;
}

/// Result of matching format preferences against the available backends.
#[derive(Debug)]
pub struct Negotiation<'a> {
    pub format: EncoderFormat,
    pub backend: &'a dyn EncoderBackend,
    /// Preferred formats no backend could produce, in preference order.
    pub rejected: Vec<EncoderFormat>,
}

/// Picks the first preferred format some backend supports. Backends are
/// consulted in order, so earlier backends win ties.
pub fn negotiate<'a>(
    preferences: &[EncoderFormat],
    backends: &'a [Box<dyn EncoderBackend>],
) -> Result<Negotiation<'a>> {
    let mut rejected = Vec::new();
    for &format in preferences {
        if let Some(backend) = backends.iter().find(|backend| backend.supports(format)) {
            tracing::info!(%format, backend = backend.name(), ?rejected, "encoder negotiated");
            return Ok(Negotiation {
                format,
                backend: backend.as_ref(),
                rejected,
            });
        }
        rejected.push(format);
    }
    Err(MotifError::NoEncoder)
}

/// The downloadable file.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub artifact: Artifact,
    /// `Done` when the artifact is in the delivery format, `Failed` when the
    /// raw recording was kept instead.
    pub state: ExportState,
    pub format: EncoderFormat,
    pub recorded_format: EncoderFormat,
    pub normalized: bool,
    pub video_frames: u64,
    pub audio_samples: u64,
    pub fps: u32,
    pub sample_rate: u32,
    pub preload: PreloadReport,
    /// Visual state on the last frame, frozen like the end of live playback.
    pub visual: VisualSnapshot,
}

impl ExportOutcome {
    pub fn audio_seconds(&self) -> f64 {
        self.audio_samples as f64 / self.sample_rate.max(1) as f64
    }

    pub fn video_seconds(&self) -> f64 {
        self.video_frames as f64 / self.fps.max(1) as f64
    }

    /// Writes the artifact into `dir` and returns its path.
    pub fn write_to(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let path = dir.as_ref().join(&self.artifact.file_name);
        std::fs::write(&path, &self.artifact.bytes)?;
        tracing::info!(path = %path.display(), bytes = self.artifact.bytes.len(), "artifact written");
        Ok(path)
    }
}

/// Download name for an input: lower-cased, runs of anything other than
/// ASCII letters and digits collapsed to `-`, at most 40 characters.
pub fn artifact_file_name(input: &str, format: EncoderFormat) -> String {
    let mut stem = String::new();
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            stem.push(ch.to_ascii_lowercase());
        } else if !stem.is_empty() && !stem.ends_with('-') {
            stem.push('-');
        }
    }
    stem.truncate(MAX_STEM_LEN);
    let stem = stem.trim_end_matches('-');
    let stem = if stem.is_empty() { "motif" } else { stem };
    format!("{stem}.{}", format.extension())
}

/// Offline renderer for plans.
pub struct ExportPipeline {
    audio: AudioConfig,
    visual: VisualConfig,
    export: ExportConfig,
    assets: Arc<PitchAssetCache>,
    backends: Vec<Box<dyn EncoderBackend>>,
    normalizer: Option<Box<dyn ContainerNormalizer>>,
}

impl ExportPipeline {
    /// Pipeline with the `ffmpeg` backend followed by the built-in AVI one
    /// and no normalizer.
    pub fn new(
        audio: AudioConfig,
        visual: VisualConfig,
        export: ExportConfig,
        assets: Arc<PitchAssetCache>,
    ) -> Self {
        let backends: Vec<Box<dyn EncoderBackend>> = vec![
            Box::new(FfmpegBackend::new(export.ffmpeg.clone())),
            Box::new(AviBackend),
        ];
        Self {
            audio,
            visual,
            export,
            assets,
            backends,
            normalizer: None,
        }
    }

    /// Like [`ExportPipeline::new`], adding an [`HttpNormalizer`] when a
    /// normalizer URL is configured.
    pub fn from_config(config: &AppConfig, assets: Arc<PitchAssetCache>) -> Result<Self> {
        let normalizer = match &config.export.normalizer_url {
            Some(url) => Some(Box::new(HttpNormalizer::new(url)?) as Box<dyn ContainerNormalizer>),
            None => None,
        };
        Ok(Self::new(
            config.audio.clone(),
            config.visual.clone(),
            config.export.clone(),
            assets,
        )
        .with_normalizer(normalizer))
    }

    pub fn with_backends(mut self, backends: Vec<Box<dyn EncoderBackend>>) -> Self {
        self.backends = backends;
        self
    }

    pub fn with_normalizer(mut self, normalizer: Option<Box<dyn ContainerNormalizer>>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn backends(&self) -> &[Box<dyn EncoderBackend>] {
        &self.backends
    }

    /// Samples and frames an export of `plan` spans: the plan plus the
    /// release tail, the frame count rounded up.
    pub fn stream_length(&self, plan: &TimelinePlan) -> (u64, u64) {
        let length = (plan.total_duration() + self.audio.release_tail()).as_nanos();
        let rate = self.audio.sample_rate.max(1) as u128;
        let fps = self.export.fps.max(1) as u128;
        let samples = (length * rate + NANOS_PER_SECOND / 2) / NANOS_PER_SECOND;
        let frames = (length * fps).div_ceil(NANOS_PER_SECOND).max(1);
        (samples as u64, frames as u64)
    }

    pub fn export(&self, plan: &Arc<TimelinePlan>, input: &str) -> Result<ExportOutcome> {
        self.export_with(plan, input, |_| {})
    }

    /// Same as [`ExportPipeline::export`], calling `on_state` with every
    /// state the export enters.
    pub fn export_with(
        &self,
        plan: &Arc<TimelinePlan>,
        input: &str,
        mut on_state: impl FnMut(ExportState),
    ) -> Result<ExportOutcome> {
        let mut state = ExportState::Idle;
        let mut enter = |state: &mut ExportState, next: ExportState| -> Result<()> {
            state.transition(next)?;
            tracing::debug!(state = ?next, "export state");
            on_state(next);
            Ok(())
        };
        enter(&mut state, ExportState::Priming)?;
        tracing::info!(digest = %plan.source_digest(), "export started");

        let preload = self.assets.preload(plan);
        let negotiation = negotiate(&self.export.preferences, &self.backends)?;
        let spec = StreamSpec {
            width: self.export.width,
            height: self.export.height,
            fps: self.export.fps.max(1),
            sample_rate: self.audio.sample_rate,
        };
        let mut encoder = negotiation.backend.open(negotiation.format, &spec)?;

        let engine = AudioEngine::new(self.audio.clone(), self.assets.clone());
        let session = engine.begin_session_at(0.0)?;
        engine.schedule(plan, &session)?;

        enter(&mut state, ExportState::Recording)?;
        let visual = self.record(plan, &engine, &session, encoder.as_mut(), spec)?;

        // Muxing happens while finishing the encoder.
        enter(&mut state, ExportState::Finalizing)?;
        let recording = encoder.finish()?;
        let delivery = self.export.delivery;
        let (bytes, format, normalized) = if recording.format == delivery {
            (recording.bytes, recording.format, false)
        } else {
            match self.normalize(&recording, delivery) {
                Some(bytes) => (bytes, delivery, true),
                None => (recording.bytes, recording.format, false),
            }
        };
        enter(
            &mut state,
            if format == delivery {
                ExportState::Done
            } else {
                ExportState::Failed
            },
        )?;

        let outcome = ExportOutcome {
            artifact: Artifact {
                file_name: artifact_file_name(input, format),
                bytes,
                content_type: format.container_mime().to_string(),
            },
            state,
            format,
            recorded_format: recording.format,
            normalized,
            video_frames: recording.video_frames,
            audio_samples: recording.audio_samples,
            fps: spec.fps,
            sample_rate: spec.sample_rate,
            preload,
            visual,
        };
        tracing::info!(
            state = ?outcome.state,
            %format,
            file = %outcome.artifact.file_name,
            audio_seconds = outcome.audio_seconds(),
            video_seconds = outcome.video_seconds(),
            "export finished"
        );
        Ok(outcome)
    }

    /// Frame loop. Each frame is drawn at the audio position reached so far,
    /// then audio is rendered up to the next frame boundary. The last frame
    /// shows the finished, frozen state.
    fn record(
        &self,
        plan: &Arc<TimelinePlan>,
        engine: &AudioEngine,
        session: &PlaybackSession,
        encoder: &mut dyn RecordingEncoder,
        spec: StreamSpec,
    ) -> Result<VisualSnapshot> {
        let (total_samples, frames) = self.stream_length(plan);
        let clock = engine.clock();
        let background = RasterSurface::background(spec.width, spec.height);
        let mut surface = background.clone();
        let mut sync = VisualSync::new(plan.clone(), &self.visual, self.audio.release_tail());
        let mut block = vec![0.0f32; self.audio.block_size.max(1)];
        let rate = spec.sample_rate as u64;
        let fps = spec.fps as u64;

        for frame in 0..frames {
            let last = frame + 1 == frames;
            surface.composite(&background);
            sync.advance(if last {
                sync.finish_seconds()
            } else {
                session.elapsed(clock.now())
            });
            sync.draw(&mut surface);
            encoder.push_frame(&surface)?;

            let boundary = if last {
                total_samples
            } else {
                ((frame + 1) * rate + fps / 2) / fps
            }
            .min(total_samples);
            while clock.position() < boundary {
                let n = (boundary - clock.position()).min(block.len() as u64) as usize;
                engine.render(&mut block[..n])?;
                encoder.push_audio(&block[..n])?;
            }
        }
        Ok(sync.snapshot())
    }

    /// Returns the delivery bytes, or `None` when normalization is
    /// unavailable, fails or produces nothing.
    fn normalize(&self, recording: &Recording, delivery: EncoderFormat) -> Option<Vec<u8>> {
        let Some(normalizer) = &self.normalizer else {
            tracing::warn!(recorded = %recording.format, %delivery, "no normalizer configured, keeping recording");
            return None;
        };
        match normalizer.normalize(&recording.bytes, recording.format.container_mime(), delivery) {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => {
                tracing::warn!(%delivery, "normalizer returned no data, keeping recording");
                None
            }
            Err(err) => {
                tracing::warn!(%delivery, error = %err, "normalization failed, keeping recording");
                None
            }
        }
    }
}

impl fmt::Debug for ExportPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportPipeline")
            .field("export", &self.export)
            .field("backends", &self.backends)
            .field("normalizer", &self.normalizer.is_some())
            .finish()
    }
}

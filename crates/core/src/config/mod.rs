use std::{path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{record::EncoderFormat, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub visual: VisualConfig,
    pub export: ExportConfig,
    pub assets: AssetConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing sections and fields keep their
    /// defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&raw)?;
        tracing::debug!(path = %path.as_ref().display(), "loaded configuration");
        Ok(config)
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    pub attack_ms: u64,
    pub release_ms: u64,
    /// Time after the last event during which releases ring out.
    pub release_tail_ms: u64,
    /// Distance between "start" and the session epoch, leaving room to
    /// pre-schedule the first voices.
    pub lead_in_ms: u64,
    pub master_gain: f32,
}

impl AudioConfig {
    pub fn attack(&self) -> Duration {
        Duration::from_millis(self.attack_ms)
    }

    pub fn release(&self) -> Duration {
        Duration::from_millis(self.release_ms)
    }

    pub fn release_tail(&self) -> Duration {
        Duration::from_millis(self.release_tail_ms)
    }

    pub fn lead_in(&self) -> Duration {
        Duration::from_millis(self.lead_in_ms)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 1024,
            attack_ms: 12,
            release_ms: 350,
            release_tail_ms: 600,
            lead_in_ms: 100,
            master_gain: 0.8,
        }
    }
}

/// Frame loop and trail behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualConfig {
    pub fps: u32,
    /// Maximum number of nodes a trail remembers.
    pub trail_length: usize,
    pub trail_lifetime_ms: u64,
}

impl VisualConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }

    pub fn trail_lifetime(&self) -> Duration {
        Duration::from_millis(self.trail_lifetime_ms)
    }
}

impl Default for VisualConfig {
    fn default() -> Self {
        Self {
            fps: 60,
            trail_length: 6,
            trail_lifetime_ms: 1200,
        }
    }
}

/// Settings for offline export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Container the downloaded artifact should end up in.
    pub delivery: EncoderFormat,
    /// Formats tried in order during encoder negotiation.
    pub preferences: Vec<EncoderFormat>,
    pub normalizer_url: Option<String>,
    pub ffmpeg: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            width: 360,
            height: 360,
            fps: 30,
            delivery: EncoderFormat::Mp4H264Aac,
            preferences: vec![
                EncoderFormat::Mp4H264Aac,
                EncoderFormat::WebmVp9Opus,
                EncoderFormat::AviRaw,
            ],
            normalizer_url: None,
            ffmpeg: "ffmpeg".to_string(),
        }
    }
}

/// Where pitch samples come from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    /// Directory holding `<pitch>.wav` files. Synthesised tones are used when
    /// unset.
    pub directory: Option<PathBuf>,
}

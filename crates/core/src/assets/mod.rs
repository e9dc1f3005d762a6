use std::{
    collections::HashMap,
    f32::consts::TAU,
    fmt,
    io::Cursor,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::{config::AssetConfig, mapping::PitchId, timeline::TimelinePlan, MotifError, Result};

/// A pitch sample that could not be fetched or decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("pitch asset `{pitch}` unavailable: {reason}")]
pub struct AssetError {
    pub pitch: PitchId,
    pub reason: String,
}

/// Supplies raw WAV bytes for a pitch.
pub trait PitchAssetSource: Send + Sync {
    fn fetch(&self, pitch: PitchId) -> Result<Vec<u8>>;
}

/// Reads `<root>/<pitch>.wav`, e.g. `samples/Cs4.wav`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, pitch: PitchId) -> PathBuf {
        self.root.join(format!("{pitch}.wav"))
    }
}

impl PitchAssetSource for DirectorySource {
    fn fetch(&self, pitch: PitchId) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.path_for(pitch))?)
    }
}

/// Synthesises a plucked, decaying tone per pitch. Used when no sample
/// library is configured.
#[derive(Debug, Clone)]
pub struct ToneSource {
    sample_rate: u32,
    seconds: f32,
}

impl ToneSource {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            seconds: 2.0,
        }
    }
}

impl PitchAssetSource for ToneSource {
    fn fetch(&self, pitch: PitchId) -> Result<Vec<u8>> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let frequency = pitch.frequency();
        let length = (self.seconds * self.sample_rate as f32) as usize;

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec)?;
            for n in 0..length {
                let t = n as f32 / self.sample_rate as f32;
                let decay = (-3.0 * t).exp();
                let tone = (TAU * frequency * t).sin()
                    + 0.4 * (TAU * 2.0 * frequency * t).sin()
                    + 0.15 * (TAU * 3.0 * frequency * t).sin();
                let value = 0.5 * decay * tone / 1.55;
                writer.write_sample((value * i16::MAX as f32) as i16)?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }
}

/// Decoded mono sample data for one pitch.
#[derive(Debug, Clone, PartialEq)]
pub struct PitchAsset {
    pub id: PitchId,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl PitchAsset {
    /// Decodes WAV bytes of any bit depth, averaging channels down to mono.
    pub fn decode(id: PitchId, bytes: &[u8]) -> Result<Self> {
        let mut reader = WavReader::new(Cursor::new(bytes))?;
        let spec = reader.spec();
        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
            SampleFormat::Int => {
                let scale = 1.0 / (1_i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|sample| sample.map(|s| s as f32 * scale))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        let channels = usize::from(spec.channels.max(1));
        let samples: Vec<f32> = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();
        if samples.is_empty() {
            return Err(MotifError::msg("sample contains no audio"));
        }

        Ok(Self {
            id,
            sample_rate: spec.sample_rate,
            samples,
        })
    }

    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Linearly interpolated sample at `seconds` into the asset; silence past
    /// the end.
    pub fn sample_at(&self, seconds: f64) -> f32 {
        if seconds < 0.0 {
            return 0.0;
        }
        let position = seconds * self.sample_rate as f64;
        let index = position as usize;
        let frac = (position - index as f64) as f32;
        match (self.samples.get(index), self.samples.get(index + 1)) {
            (Some(a), Some(b)) => a + (b - a) * frac,
            (Some(a), None) => *a * (1.0 - frac),
            _ => 0.0,
        }
    }
}

type Slot = Arc<OnceLock<std::result::Result<Arc<PitchAsset>, AssetError>>>;

/// Append-only, memoised store of decoded pitch assets shared by every
/// session.
pub struct PitchAssetCache {
    source: Box<dyn PitchAssetSource>,
    slots: Mutex<HashMap<PitchId, Slot>>,
    fetches: AtomicUsize,
}

/// Outcome of warming the cache for a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadReport {
    pub loaded: usize,
    pub failed: Vec<PitchId>,
}

impl PitchAssetCache {
    pub fn new(source: impl PitchAssetSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            slots: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Sample directory when configured, synthesised tones otherwise.
    pub fn from_config(config: &AssetConfig, sample_rate: u32) -> Self {
        match &config.directory {
            Some(root) => Self::new(DirectorySource::new(root)),
            None => Self::new(ToneSource::new(sample_rate)),
        }
    }

    /// Returns the decoded asset, loading it on first use. Concurrent callers
    /// for the same pitch wait on a single load. Failures are handed to every
    /// waiter and then forgotten so a later call retries.
    pub fn get(&self, pitch: PitchId) -> Result<Arc<PitchAsset>> {
        let slot = {
            let mut slots = self.lock()?;
            slots.entry(pitch).or_default().clone()
        };

        let result = slot.get_or_init(|| self.load(pitch)).clone();
        if result.is_err() {
            let mut slots = self.lock()?;
            if slots.get(&pitch).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                slots.remove(&pitch);
            }
        }
        result.map_err(MotifError::from)
    }

    /// Loads every pitch of `plan`, collecting failures instead of stopping.
    pub fn preload(&self, plan: &TimelinePlan) -> PreloadReport {
        let mut report = PreloadReport::default();
        for pitch in plan.pitches() {
            match self.get(pitch) {
                Ok(_) => report.loaded += 1,
                Err(err) => {
                    tracing::warn!(%pitch, error = %err, "pitch asset failed to preload");
                    report.failed.push(pitch);
                }
            }
        }
        report
    }

    /// Number of fetches issued to the source so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn cached(&self) -> usize {
        self.slots
            .lock()
            .map(|slots| {
                slots
                    .values()
                    .filter(|slot| matches!(slot.get(), Some(Ok(_))))
                    .count()
            })
            .unwrap_or(0)
    }

    fn load(&self, pitch: PitchId) -> std::result::Result<Arc<PitchAsset>, AssetError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let asset = self
            .source
            .fetch(pitch)
            .and_then(|bytes| PitchAsset::decode(pitch, &bytes))
            .map_err(|err| AssetError {
                pitch,
                reason: err.to_string(),
            })?;
        tracing::debug!(%pitch, samples = asset.samples.len(), "decoded pitch asset");
        Ok(Arc::new(asset))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<PitchId, Slot>>> {
        self.slots
            .lock()
            .map_err(|_| MotifError::Poisoned("pitch asset cache"))
    }
}

impl fmt::Debug for PitchAssetCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PitchAssetCache")
            .field("cached", &self.cached())
            .field("fetches", &self.fetch_count())
            .finish()
    }
}

//! Sound card output through `cpal`. The device callback renders straight
//! from the engine, so the sample clock follows the hardware.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::{AudioOutput, OutputFeed};
use crate::{audio::AudioEngine, MotifError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

type StreamFailure = Arc<Mutex<Option<MotifError>>>;

/// Plays through the host's default output device at the engine's sample
/// rate. The mono mix is copied to every device channel.
#[derive(Debug, Clone)]
pub struct DeviceOutput {
    sample_rate: u32,
    config: Option<cpal::SupportedStreamConfig>,
}

impl DeviceOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            config: None,
        }
    }

    /// Sample rate the default output device prefers, if there is one.
    pub fn preferred_sample_rate() -> Option<u32> {
        let device = cpal::default_host().default_output_device()?;
        let config = device.default_output_config().ok()?;
        Some(config.sample_rate().0)
    }
}

impl AudioOutput for DeviceOutput {
    fn resume(&mut self) -> Result<()> {
        let host = cpal::default_host();
        let device = default_device(&host)?;
        let config = stream_config(&device, self.sample_rate)?;
        tracing::info!(
            host = ?host.id(),
            device = %device.name().unwrap_or_default(),
            channels = config.channels(),
            format = ?config.sample_format(),
            sample_rate = self.sample_rate,
            "audio device ready"
        );
        self.config = Some(config);
        Ok(())
    }

    fn write(&mut self, _block: &[f32]) -> Result<()> {
        Err(MotifError::msg("the audio device pulls samples from its own callback"))
    }

    fn drive(&mut self, feed: &OutputFeed) -> Result<()> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| MotifError::msg("audio device has not been resumed"))?;
        let device = default_device(&cpal::default_host())?;
        let failure: StreamFailure = Arc::new(Mutex::new(None));
        let engine = feed.engine().clone();

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, engine, failure.clone()),
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, engine, failure.clone()),
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, engine, failure.clone()),
            other => Err(MotifError::msg(format!("unsupported sample format {other:?}"))),
        }?;
        stream.play().map_err(device_error)?;
        feed.started();

        while !feed.is_stopped() {
            let failed = failure
                .lock()
                .map_err(|_| MotifError::Poisoned("stream failure"))?
                .take();
            if let Some(err) = failed {
                return Err(err);
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }
}

fn default_device(host: &cpal::Host) -> Result<cpal::Device> {
    host.default_output_device()
        .ok_or_else(|| MotifError::msg("no audio output device found"))
}

/// Picks a device configuration running at exactly `sample_rate`,
/// preferring float samples.
fn stream_config(device: &cpal::Device, sample_rate: u32) -> Result<cpal::SupportedStreamConfig> {
    let wanted = cpal::SampleRate(sample_rate);
    device
        .supported_output_configs()
        .map_err(device_error)?
        .filter(|range| range.min_sample_rate() <= wanted && wanted <= range.max_sample_rate())
        .max_by_key(|range| range.sample_format() == cpal::SampleFormat::F32)
        .map(|range| range.with_sample_rate(wanted))
        .ok_or_else(|| MotifError::msg(format!("output device cannot play at {sample_rate} Hz")))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::SupportedStreamConfig,
    engine: Arc<AudioEngine>,
    failure: StreamFailure,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = usize::from(config.channels().max(1));
    let report = failure.clone();
    let mut mono = Vec::new();

    device
        .build_output_stream(
            &config.config(),
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mono.resize(data.len() / channels, 0.0);
                if let Err(err) = engine.render(&mut mono) {
                    mono.fill(0.0);
                    record(&failure, err);
                }
                for (frame, sample) in data.chunks_mut(channels).zip(&mono) {
                    frame.fill(T::from_sample(*sample));
                }
            },
            move |err| record(&report, MotifError::msg(format!("audio stream error: {err}"))),
            None,
        )
        .map_err(device_error)
}

/// Keeps the first error raised from the device thread.
fn record(slot: &Mutex<Option<MotifError>>, err: MotifError) {
    if let Ok(mut slot) = slot.lock() {
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

fn device_error(err: impl std::fmt::Display) -> MotifError {
    MotifError::msg(format!("audio device error: {err}"))
}

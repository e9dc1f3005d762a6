use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
};

use crate::{
    assets::{PitchAsset, PitchAssetCache},
    config::AudioConfig,
    mapping::PitchId,
    timeline::TimelinePlan,
    MotifError, Result,
};

/// Monotonic time source of the audio subsystem. Every musically meaningful
/// time is measured against it; frame loops only read it.
pub trait AudioClock: Send + Sync {
    /// Seconds since the clock started.
    fn now(&self) -> f64;
    fn sample_rate(&self) -> u32;
}

/// Clock that advances by the number of frames the engine has rendered.
#[derive(Debug)]
pub struct SampleClock {
    sample_rate: u32,
    frames: AtomicU64,
}

impl SampleClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            frames: AtomicU64::new(0),
        }
    }

    /// Frames rendered so far.
    pub fn position(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::AcqRel);
    }

    /// Nearest frame for a time in seconds.
    pub fn frame_at(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.sample_rate as f64).round() as u64
    }
}

impl AudioClock for SampleClock {
    fn now(&self) -> f64 {
        self.position() as f64 / self.sample_rate as f64
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// One run of a plan against the audio clock. Clones observe the same
/// cancellation flag and run counter.
#[derive(Debug, Clone)]
pub struct PlaybackSession {
    epoch: f64,
    run_id: u64,
    runs: Arc<AtomicU64>,
    cancelled: Arc<AtomicBool>,
}

impl PlaybackSession {
    /// Audio-clock time at which the plan's t = 0 sounds.
    pub fn epoch(&self) -> f64 {
        self.epoch
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// False once the session was cancelled or superseded by a newer run.
    pub fn is_current(&self) -> bool {
        !self.is_cancelled() && self.runs.load(Ordering::Acquire) == self.run_id
    }

    /// Position within the plan for an audio-clock reading.
    pub fn elapsed(&self, now: f64) -> f64 {
        now - self.epoch
    }
}

#[derive(Debug, Clone, Copy)]
struct Envelope {
    attack: u64,
    release: u64,
}

/// A voice placed at absolute frames on the audio clock.
struct ScheduledVoice {
    run_id: u64,
    pitch: PitchId,
    asset: Arc<PitchAsset>,
    start: u64,
    release_at: u64,
    end: u64,
    gain: f32,
    envelope: Envelope,
}

impl ScheduledVoice {
    fn attack_level(&self, frame: u64) -> f32 {
        let into = frame.saturating_sub(self.start);
        if self.envelope.attack == 0 {
            1.0
        } else {
            (into as f32 / self.envelope.attack as f32).min(1.0)
        }
    }

    /// Linear attack, flat sustain, linear release from the level reached at
    /// note end.
    fn amplitude(&self, frame: u64) -> f32 {
        if frame < self.start || frame >= self.end {
            return 0.0;
        }
        if frame < self.release_at {
            return self.attack_level(frame);
        }
        let held = self.attack_level(self.release_at);
        let into = (frame - self.release_at) as f32;
        held * (1.0 - into / self.envelope.release.max(1) as f32).max(0.0)
    }
}

/// What a scheduling pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub scheduled: usize,
    /// Voices dropped because their asset failed to load.
    pub skipped: usize,
    /// Scheduling stopped because the session went stale.
    pub stale: bool,
}

/// Schedules plan voices against the sample clock and mixes them.
pub struct AudioEngine {
    config: AudioConfig,
    clock: Arc<SampleClock>,
    assets: Arc<PitchAssetCache>,
    voices: Arc<Mutex<Vec<ScheduledVoice>>>,
    runs: Arc<AtomicU64>,
}

impl AudioEngine {
    pub fn new(config: AudioConfig, assets: Arc<PitchAssetCache>) -> Self {
        let clock = Arc::new(SampleClock::new(config.sample_rate));
        Self::with_clock(config, assets, clock)
    }

    /// Creates an engine driving an existing clock.
    pub fn with_clock(
        config: AudioConfig,
        assets: Arc<PitchAssetCache>,
        clock: Arc<SampleClock>,
    ) -> Self {
        Self {
            config,
            clock,
            assets,
            voices: Arc::new(Mutex::new(Vec::new())),
            runs: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<SampleClock> {
        self.clock.clone()
    }

    pub fn assets(&self) -> &Arc<PitchAssetCache> {
        &self.assets
    }

    /// Starts a new run whose epoch sits one lead-in after the current clock.
    pub fn begin_session(&self) -> Result<PlaybackSession> {
        let epoch = self.clock.now() + self.config.lead_in().as_secs_f64();
        self.begin_session_at(epoch)
    }

    /// Starts a new run at an explicit epoch. Every older run becomes stale
    /// and its voices are dropped.
    pub fn begin_session_at(&self, epoch: f64) -> Result<PlaybackSession> {
        let mut voices = self.lock_voices()?;
        let run_id = self.runs.fetch_add(1, Ordering::AcqRel) + 1;
        voices.clear();
        tracing::info!(run_id, epoch, "playback session started");
        Ok(PlaybackSession {
            epoch,
            run_id,
            runs: self.runs.clone(),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Places every voice of every sounding event at
    /// `epoch + event.start`, regardless of when this call runs. A voice whose
    /// asset fails to load is skipped; the rest of the plan still plays.
    pub fn schedule(&self, plan: &TimelinePlan, session: &PlaybackSession) -> Result<ScheduleReport> {
        let envelope = Envelope {
            attack: self.clock.frame_at(self.config.attack().as_secs_f64()),
            release: self.clock.frame_at(self.config.release().as_secs_f64()),
        };
        let mut report = ScheduleReport::default();

        for event in plan.events().iter().filter(|event| !event.is_rest()) {
            let start = self.clock.frame_at(session.epoch + event.start_seconds());
            let release_at = self.clock.frame_at(session.epoch + event.end().as_secs_f64());
            let gain = self.config.master_gain / (event.pitches.len() as f32).sqrt();

            for &pitch in &event.pitches {
                let asset = match self.assets.get(pitch) {
                    Ok(asset) => asset,
                    Err(err) => {
                        tracing::warn!(%pitch, error = %err, "skipping voice");
                        report.skipped += 1;
                        continue;
                    }
                };

                // The run check and the insert happen under one lock so a
                // concurrent cancel either sees this voice or prevents it.
                let mut voices = self.lock_voices()?;
                if !session.is_current() {
                    report.stale = true;
                    tracing::debug!(run_id = session.run_id, "dropping stale schedule");
                    return Ok(report);
                }
                voices.push(ScheduledVoice {
                    run_id: session.run_id,
                    pitch,
                    asset,
                    start,
                    release_at,
                    end: release_at + envelope.release,
                    gain,
                    envelope,
                });
                report.scheduled += 1;
            }
        }

        tracing::debug!(
            run_id = session.run_id,
            scheduled = report.scheduled,
            skipped = report.skipped,
            "plan scheduled"
        );
        Ok(report)
    }

    /// Runs [`AudioEngine::schedule`] on its own thread so slow asset loads
    /// never block the caller.
    pub fn schedule_in_background(
        self: &Arc<Self>,
        plan: Arc<TimelinePlan>,
        session: PlaybackSession,
    ) -> JoinHandle<Result<ScheduleReport>> {
        let engine = self.clone();
        thread::spawn(move || engine.schedule(&plan, &session))
    }

    /// Silences the session at once: marks it cancelled, invalidates its run
    /// and removes its voices.
    pub fn cancel(&self, session: &PlaybackSession) -> Result<()> {
        session.cancelled.store(true, Ordering::Release);
        let _ = self.runs.compare_exchange(
            session.run_id,
            session.run_id + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let mut voices = self.lock_voices()?;
        voices.retain(|voice| voice.run_id != session.run_id);
        tracing::info!(run_id = session.run_id, "playback session cancelled");
        Ok(())
    }

    /// Invalidates every session, current or older, and silences them.
    pub fn halt(&self) -> Result<()> {
        let mut voices = self.lock_voices()?;
        let run_id = self.runs.fetch_add(1, Ordering::AcqRel) + 1;
        voices.clear();
        tracing::info!(run_id, "playback halted");
        Ok(())
    }

    /// Mixes every voice of the current run overlapping the next
    /// `out.len()` frames into `out`, then advances the clock.
    pub fn render(&self, out: &mut [f32]) -> Result<()> {
        out.fill(0.0);
        let start = self.clock.position();
        let end = start + out.len() as u64;
        let rate = self.clock.sample_rate() as f64;
        let current = self.runs.load(Ordering::Acquire);

        {
            let mut voices = self.lock_voices()?;
            voices.retain(|voice| voice.run_id == current && voice.end > start);
            for voice in voices.iter().filter(|voice| voice.start < end) {
                for frame in voice.start.max(start)..voice.end.min(end) {
                    let t = (frame - voice.start) as f64 / rate;
                    out[(frame - start) as usize] +=
                        voice.asset.sample_at(t) * voice.amplitude(frame) * voice.gain;
                }
            }
        }

        self.clock.advance(out.len() as u64);
        Ok(())
    }

    /// True once the clock has passed the plan's last event plus the release
    /// tail.
    pub fn is_complete(&self, session: &PlaybackSession, plan: &TimelinePlan) -> bool {
        let finish =
            session.epoch + plan.total_duration().as_secs_f64() + self.config.release_tail().as_secs_f64();
        self.clock.now() >= finish
    }

    pub fn active_voices(&self) -> usize {
        self.voices.lock().map(|voices| voices.len()).unwrap_or(0)
    }

    /// Pitches of the scheduled voices, for inspection.
    pub fn scheduled_pitches(&self) -> Vec<PitchId> {
        self.voices
            .lock()
            .map(|voices| voices.iter().map(|voice| voice.pitch).collect())
            .unwrap_or_default()
    }

    fn lock_voices(&self) -> Result<MutexGuard<'_, Vec<ScheduledVoice>>> {
        self.voices
            .lock()
            .map_err(|_| MotifError::Poisoned("voice table"))
    }
}

impl fmt::Debug for AudioEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioEngine")
            .field("sample_rate", &self.config.sample_rate)
            .field("position", &self.clock.position())
            .field("run", &self.runs.load(Ordering::Relaxed))
            .field("voices", &self.active_voices())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assets::{PitchAssetSource, ToneSource},
        timeline::TimelineBuilder,
    };

    const RATE: u32 = 8_000;

    fn config() -> AudioConfig {
        AudioConfig {
            sample_rate: RATE,
            attack_ms: 5,
            release_ms: 50,
            release_tail_ms: 100,
            lead_in_ms: 20,
            ..Default::default()
        }
    }

    fn engine() -> AudioEngine {
        let assets = Arc::new(PitchAssetCache::new(ToneSource::new(RATE)));
        AudioEngine::new(config(), assets)
    }

    fn plan(input: &str) -> TimelinePlan {
        TimelineBuilder::default().build(input)
    }

    fn render_frames(engine: &AudioEngine, frames: usize, block: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(frames);
        let mut buf = vec![0.0; block];
        while out.len() < frames {
            let n = block.min(frames - out.len());
            engine.render(&mut buf[..n]).unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    struct MissingSource(PitchId);

    impl PitchAssetSource for MissingSource {
        fn fetch(&self, pitch: PitchId) -> Result<Vec<u8>> {
            if pitch == self.0 {
                Err(MotifError::msg("404"))
            } else {
                ToneSource::new(RATE).fetch(pitch)
            }
        }
    }

    #[test]
    fn voices_start_on_their_exact_frame() {
        let engine = engine();
        let session = engine.begin_session_at(0.0125).unwrap();
        let report = engine.schedule(&plan("A"), &session).unwrap();
        assert_eq!(report.scheduled, 1);

        // Blocks of 30 frames put the onset (frame 100) mid-block.
        let out = render_frames(&engine, 400, 30);
        assert!(out[..=100].iter().all(|s| *s == 0.0));
        assert!(out[101..400].iter().any(|s| s.abs() > 1e-3));
    }

    #[test]
    fn timing_does_not_depend_on_when_schedule_runs() {
        let early = engine();
        let session = early.begin_session_at(0.05).unwrap();
        early.schedule(&plan("AB"), &session).unwrap();
        let a = render_frames(&early, 8_000, 256);

        let late = engine();
        render_frames(&late, 300, 100);
        let session = late.begin_session_at(0.05).unwrap();
        late.schedule(&plan("AB"), &session).unwrap();
        let mut b = vec![0.0; 300];
        b.extend(render_frames(&late, 8_000 - 300, 64));

        assert_eq!(a, b);
    }

    #[test]
    fn cancel_then_restart_hears_only_second_session() {
        let engine = engine();
        let first = engine.begin_session().unwrap();
        engine.schedule(&plan("AAAA"), &first).unwrap();
        render_frames(&engine, 1_000, 128);

        engine.cancel(&first).unwrap();
        assert!(first.is_cancelled());
        assert_eq!(engine.active_voices(), 0);

        let second = engine.begin_session().unwrap();
        engine.schedule(&plan("B"), &second).unwrap();
        let heard = render_frames(&engine, 4_000, 128);

        let reference = engine_at(1_000);
        let session = reference.begin_session_at(second.epoch()).unwrap();
        reference.schedule(&plan("B"), &session).unwrap();
        let expected = render_frames(&reference, 4_000, 128);

        assert_eq!(heard, expected);
    }

    fn engine_at(position: u64) -> AudioEngine {
        let engine = engine();
        engine.clock().advance(position);
        engine
    }

    #[test]
    fn new_session_supersedes_the_old_one() {
        let engine = engine();
        let first = engine.begin_session().unwrap();
        let second = engine.begin_session().unwrap();
        assert!(!first.is_current());
        assert!(second.is_current());
        assert!(second.run_id() > first.run_id());

        let report = engine.schedule(&plan("A"), &first).unwrap();
        assert!(report.stale);
        assert_eq!(engine.active_voices(), 0);
    }

    #[test]
    fn halt_makes_every_session_stale() {
        let engine = engine();
        let session = engine.begin_session().unwrap();
        engine.schedule(&plan("AB"), &session).unwrap();
        assert!(engine.active_voices() > 0);

        engine.halt().unwrap();
        assert!(!session.is_current());
        assert_eq!(engine.active_voices(), 0);
        assert!(engine.schedule(&plan("A"), &session).unwrap().stale);

        let next = engine.begin_session().unwrap();
        assert!(next.is_current());
    }

    #[test]
    fn schedule_after_cancel_is_a_no_op() {
        let engine = Arc::new(engine());
        let session = engine.begin_session().unwrap();
        engine.cancel(&session).unwrap();

        let report = engine
            .schedule_in_background(Arc::new(plan("ABC")), session)
            .join()
            .unwrap()
            .unwrap();
        assert!(report.stale);
        assert_eq!(report.scheduled, 0);
        assert!(render_frames(&engine, 4_000, 256).iter().all(|s| *s == 0.0));
    }

    #[test]
    fn missing_asset_skips_only_that_voice() {
        let assets = Arc::new(PitchAssetCache::new(MissingSource(PitchId(62))));
        let engine = AudioEngine::new(config(), assets);
        let session = engine.begin_session().unwrap();

        let report = engine.schedule(&plan("AB"), &session).unwrap();
        assert_eq!(report, ScheduleReport { scheduled: 1, skipped: 1, stale: false });
        assert_eq!(engine.scheduled_pitches(), vec![PitchId(60)]);
    }

    #[test]
    fn replaying_a_plan_needs_only_a_new_session() {
        let engine = engine();
        let plan = plan("AB1");
        for _ in 0..2 {
            let session = engine.begin_session().unwrap();
            let report = engine.schedule(&plan, &session).unwrap();
            assert_eq!(report.scheduled, 2 + plan.events()[2].pitches.len());
            assert_eq!(engine.active_voices(), report.scheduled);
        }
    }

    #[test]
    fn envelope_ramps_in_and_out() {
        let asset = Arc::new(PitchAsset {
            id: PitchId(60),
            sample_rate: RATE,
            samples: vec![1.0; 1_000],
        });
        let voice = ScheduledVoice {
            run_id: 1,
            pitch: PitchId(60),
            asset,
            start: 100,
            release_at: 300,
            end: 400,
            gain: 1.0,
            envelope: Envelope { attack: 40, release: 100 },
        };
        assert_eq!(voice.amplitude(99), 0.0);
        assert_eq!(voice.amplitude(100), 0.0);
        assert!((voice.amplitude(120) - 0.5).abs() < 1e-6);
        assert_eq!(voice.amplitude(200), 1.0);
        assert!((voice.amplitude(350) - 0.5).abs() < 1e-6);
        assert!(voice.amplitude(399) < 0.02);
        assert_eq!(voice.amplitude(400), 0.0);
    }

    #[test]
    fn completes_after_release_tail() {
        let engine = engine();
        let plan = plan("A");
        let session = engine.begin_session_at(0.0).unwrap();
        // 0.3 s of plan plus 0.1 s of tail at 8 kHz.
        render_frames(&engine, 3_190, 100);
        assert!(!engine.is_complete(&session, &plan));
        render_frames(&engine, 20, 20);
        assert!(engine.is_complete(&session, &plan));
    }
}

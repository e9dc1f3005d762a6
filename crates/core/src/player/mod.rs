//! Live playback: wires the audio engine to an output device and a visual
//! loop.
//!
//! Outputs start locked. A play request made before [`Player::unlock`]
//! succeeds is kept and started once the output resumes.

use std::{
    cell::Cell,
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    assets::PitchAssetCache,
    audio::{AudioEngine, PlaybackSession, ScheduleReport},
    config::{AppConfig, VisualConfig},
    render::Renderer,
    timeline::TimelinePlan,
    visual::{VisualLoop, VisualOutcome},
    MotifError, Result,
};

#[cfg(feature = "device")]
mod device;

#[cfg(feature = "device")]
pub use device::DeviceOutput;

/// Where rendered audio blocks go.
pub trait AudioOutput: Send {
    /// Unlocks the output. May fail, in which case playback stays deferred.
    fn resume(&mut self) -> Result<()>;
    fn write(&mut self, block: &[f32]) -> Result<()>;

    /// Feeds the output until the feed is stopped. The default pulls blocks
    /// from the engine and hands them to [`AudioOutput::write`]; outputs
    /// that render from their own callback override it and call
    /// [`OutputFeed::started`] once sound is flowing.
    fn drive(&mut self, feed: &OutputFeed) -> Result<()> {
        feed.pump(self)
    }
}

/// Discards audio. Useful when only the visual side matters.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, _block: &[f32]) -> Result<()> {
        Ok(())
    }
}

/// Streams mono `f32` little-endian samples, e.g. into another program's
/// stdin.
#[derive(Debug)]
pub struct RawPcmOutput<W> {
    writer: W,
}

impl<W: Write + Send> RawPcmOutput<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl RawPcmOutput<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> AudioOutput for RawPcmOutput<W> {
    fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, block: &[f32]) -> Result<()> {
        let mut bytes = Vec::with_capacity(block.len() * 4);
        for sample in block {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        self.writer.write_all(&bytes)?;
        Ok(())
    }
}

/// How the output driver keeps time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pacing {
    /// One block per block duration of wall-clock time.
    #[default]
    Realtime,
    /// As fast as the output accepts blocks.
    Freewheel,
}

/// The engine side of an output driver, handed to [`AudioOutput::drive`].
pub struct OutputFeed {
    engine: Arc<AudioEngine>,
    pacing: Pacing,
    stop: Arc<AtomicBool>,
    ready: mpsc::Sender<()>,
    started: Cell<bool>,
}

impl OutputFeed {
    pub fn engine(&self) -> &Arc<AudioEngine> {
        &self.engine
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Marks the output as running. Until this is called a failing driver
    /// counts as a refused unlock.
    pub fn started(&self) {
        if !self.started.replace(true) {
            let _ = self.ready.send(());
        }
    }

    fn has_started(&self) -> bool {
        self.started.get()
    }

    /// Renders block after block into `output` until stopped.
    pub fn pump<O: AudioOutput + ?Sized>(&self, output: &mut O) -> Result<()> {
        let clock = self.engine.clock();
        let rate = self.engine.config().sample_rate.max(1) as f64;
        let mut block = vec![0.0f32; self.engine.config().block_size.max(1)];
        let started = Instant::now();
        let origin = clock.position();
        self.started();

        while !self.is_stopped() {
            self.engine.render(&mut block)?;
            output.write(&block)?;
            match self.pacing {
                Pacing::Realtime => {
                    let due = Duration::from_secs_f64((clock.position() - origin) as f64 / rate);
                    if let Some(ahead) = due.checked_sub(started.elapsed()) {
                        thread::sleep(ahead);
                    }
                }
                Pacing::Freewheel => thread::yield_now(),
            }
        }
        Ok(())
    }
}

/// Result of a play request.
#[derive(Debug, Clone)]
pub enum PlayState {
    /// Output still locked; the request starts on unlock.
    Deferred,
    /// Nothing to play.
    Nothing,
    Started(PlaybackSession),
}

type Failure = Arc<Mutex<Option<MotifError>>>;

struct Driver {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Box<dyn AudioOutput>>,
}

struct Active {
    session: PlaybackSession,
    schedule: JoinHandle<Result<ScheduleReport>>,
    visual: JoinHandle<VisualOutcome>,
}

type PendingPlay = (Arc<TimelinePlan>, Box<dyn Renderer + Send>);

pub struct Player {
    engine: Arc<AudioEngine>,
    visual: VisualConfig,
    pacing: Pacing,
    output: Option<Box<dyn AudioOutput>>,
    driver: Option<Driver>,
    failure: Failure,
    pending: Option<PendingPlay>,
    active: Option<Active>,
}

impl Player {
    pub fn new(
        engine: Arc<AudioEngine>,
        visual: VisualConfig,
        pacing: Pacing,
        output: Box<dyn AudioOutput>,
    ) -> Self {
        Self {
            engine,
            visual,
            pacing,
            output: Some(output),
            driver: None,
            failure: Arc::new(Mutex::new(None)),
            pending: None,
            active: None,
        }
    }

    pub fn from_config(
        config: &AppConfig,
        assets: Arc<PitchAssetCache>,
        pacing: Pacing,
        output: Box<dyn AudioOutput>,
    ) -> Self {
        let engine = Arc::new(AudioEngine::new(config.audio.clone(), assets));
        Self::new(engine, config.visual.clone(), pacing, output)
    }

    pub fn engine(&self) -> &Arc<AudioEngine> {
        &self.engine
    }

    /// True while an output driver is running.
    pub fn is_unlocked(&self) -> bool {
        self.driver
            .as_ref()
            .is_some_and(|driver| !driver.handle.is_finished())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Starts `plan`, replacing whatever is playing.
    pub fn play<R>(&mut self, plan: Arc<TimelinePlan>, renderer: R) -> Result<PlayState>
    where
        R: Renderer + Send + 'static,
    {
        if plan.is_empty() {
            tracing::debug!("empty plan, nothing to play");
            return Ok(PlayState::Nothing);
        }
        self.reap_driver()?;
        if !self.is_unlocked() {
            tracing::info!("audio output locked, deferring playback");
            self.pending = Some((plan, Box::new(renderer)));
            return Ok(PlayState::Deferred);
        }
        self.start(plan, Box::new(renderer))
    }

    /// Resumes the output. On success the output driver starts and any
    /// deferred request is played.
    pub fn unlock(&mut self) -> Result<PlayState> {
        self.reap_driver()?;
        if self.driver.is_none() {
            let Some(mut output) = self.output.take() else {
                return Err(MotifError::msg("audio output already consumed"));
            };
            if let Err(err) = output.resume() {
                tracing::warn!(error = %err, "audio output refused to resume");
                self.output = Some(output);
                return Err(MotifError::AudioLocked);
            }

            let stop = Arc::new(AtomicBool::new(false));
            let (ready, started) = mpsc::channel();
            let feed = OutputFeed {
                engine: self.engine.clone(),
                pacing: self.pacing,
                stop: stop.clone(),
                ready,
                started: Cell::new(false),
            };
            let handle = spawn_driver(output, feed, self.failure.clone());
            if started.recv().is_err() {
                // The driver gave up before producing any sound.
                let output = handle
                    .join()
                    .map_err(|_| MotifError::msg("audio driver panicked"))?;
                self.output = Some(output);
                if let Some(err) = self.take_failure()? {
                    tracing::warn!(error = %err, "audio output failed to start");
                }
                return Err(MotifError::AudioLocked);
            }
            self.driver = Some(Driver { stop, handle });
            tracing::info!(pacing = ?self.pacing, "audio output unlocked");
        }

        match self.pending.take() {
            Some((plan, renderer)) => self.start(plan, renderer),
            None => Ok(PlayState::Nothing),
        }
    }

    fn start(&mut self, plan: Arc<TimelinePlan>, renderer: Box<dyn Renderer + Send>) -> Result<PlayState> {
        self.stop()?;

        // Priming: every asset is loaded before the epoch is chosen, so no
        // voice reaches the table after its onset.
        let preload = self.engine.assets().preload(&plan);
        if !preload.failed.is_empty() {
            tracing::warn!(missing = ?preload.failed, "some pitches will be silent");
        }

        let session = self.engine.begin_session()?;
        // A driver that died before this session began never halted it.
        if let Some(err) = self.take_failure()? {
            self.engine.cancel(&session)?;
            self.reap_driver()?;
            return Err(err);
        }

        let schedule = self.engine.schedule_in_background(plan.clone(), session.clone());
        let visual = VisualLoop::spawn(
            self.engine.clock(),
            session.clone(),
            plan,
            self.visual.clone(),
            self.engine.config().release_tail(),
            renderer,
        );
        self.active = Some(Active {
            session: session.clone(),
            schedule,
            visual,
        });
        Ok(PlayState::Started(session))
    }

    /// Cancels the current session, if any. Also drops a deferred request.
    pub fn stop(&mut self) -> Result<()> {
        self.pending = None;
        if let Some(active) = &self.active {
            if active.session.is_current() {
                self.engine.cancel(&active.session)?;
            }
        }
        Ok(())
    }

    /// Blocks until the current visual loop ends, returning how it ended.
    /// A failed output driver cancels the loop and its error is returned
    /// here.
    pub fn wait(&mut self) -> Result<Option<VisualOutcome>> {
        let Some(active) = self.active.take() else {
            return Ok(None);
        };
        let report = active
            .schedule
            .join()
            .map_err(|_| MotifError::msg("scheduler thread panicked"))??;
        tracing::debug!(?report, "schedule finished");
        let outcome = active
            .visual
            .join()
            .map_err(|_| MotifError::msg("visual loop panicked"))?;
        if let Some(err) = self.take_failure()? {
            self.reap_driver()?;
            return Err(err);
        }
        Ok(Some(outcome))
    }

    /// Stops playback and the output driver.
    pub fn shutdown(&mut self) -> Result<()> {
        self.stop()?;
        if let Some(active) = self.active.take() {
            let _ = active.schedule.join();
            let _ = active.visual.join();
        }
        if let Some(driver) = self.driver.take() {
            driver.stop.store(true, Ordering::Release);
            let output = driver
                .handle
                .join()
                .map_err(|_| MotifError::msg("audio driver panicked"))?;
            self.output = Some(output);
            tracing::info!("audio output stopped");
        }
        match self.take_failure()? {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Collects a driver thread that has exited and takes its output back,
    /// so a later unlock can resume it.
    fn reap_driver(&mut self) -> Result<()> {
        if !self.driver.as_ref().is_some_and(|driver| driver.handle.is_finished()) {
            return Ok(());
        }
        if let Some(driver) = self.driver.take() {
            let output = driver
                .handle
                .join()
                .map_err(|_| MotifError::msg("audio driver panicked"))?;
            self.output = Some(output);
            tracing::debug!("collected stopped audio driver");
        }
        if let Some(err) = self.take_failure()? {
            tracing::warn!(error = %err, "audio output had stopped");
        }
        Ok(())
    }

    fn take_failure(&self) -> Result<Option<MotifError>> {
        Ok(self
            .failure
            .lock()
            .map_err(|_| MotifError::Poisoned("driver failure"))?
            .take())
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::warn!(error = %err, "player shutdown failed");
        }
    }
}

/// Runs `output` on its own thread. A driver that fails after starting
/// records its error and halts the engine, so every session it was serving
/// goes stale and the visual loop stops.
fn spawn_driver(
    mut output: Box<dyn AudioOutput>,
    feed: OutputFeed,
    failure: Failure,
) -> JoinHandle<Box<dyn AudioOutput>> {
    thread::spawn(move || {
        if let Err(err) = output.drive(&feed) {
            let started = feed.has_started();
            if started {
                tracing::error!(error = %err, "audio output failed");
            }
            if let Ok(mut slot) = failure.lock() {
                *slot = Some(err);
            }
            if started {
                if let Err(err) = feed.engine.halt() {
                    tracing::warn!(error = %err, "could not halt playback");
                }
            }
        }
        output
    })
}

#[cfg(test)]
mod tests {
    use std::{io, sync::atomic::AtomicUsize};

    use super::*;
    use crate::{
        assets::{PitchAssetSource, ToneSource},
        config::AudioConfig,
        mapping::PitchId,
        render::TraceRenderer,
        timeline::TimelineBuilder,
    };

    const RATE: u32 = 8_000;

    /// Refuses the first resume, like a browser before a user gesture.
    struct GestureOutput {
        resumes: Arc<AtomicUsize>,
        written: Arc<AtomicUsize>,
    }

    impl AudioOutput for GestureOutput {
        fn resume(&mut self) -> Result<()> {
            if self.resumes.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(MotifError::AudioLocked)
            } else {
                Ok(())
            }
        }

        fn write(&mut self, block: &[f32]) -> Result<()> {
            self.written.fetch_add(block.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails with a broken pipe once it has taken `blocks` blocks.
    struct ClosingPipe {
        blocks: usize,
    }

    impl AudioOutput for ClosingPipe {
        fn resume(&mut self) -> Result<()> {
            Ok(())
        }

        fn write(&mut self, _block: &[f32]) -> Result<()> {
            if self.blocks == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "reader went away").into());
            }
            self.blocks -= 1;
            Ok(())
        }
    }

    /// Resumes fine but its driver gives up before the first block.
    struct StillbornOutput {
        drives: Arc<AtomicUsize>,
    }

    impl AudioOutput for StillbornOutput {
        fn resume(&mut self) -> Result<()> {
            Ok(())
        }

        fn write(&mut self, _block: &[f32]) -> Result<()> {
            Ok(())
        }

        fn drive(&mut self, _feed: &OutputFeed) -> Result<()> {
            self.drives.fetch_add(1, Ordering::SeqCst);
            Err(MotifError::msg("device vanished"))
        }
    }

    /// Keeps every sample, indexed by clock frame.
    struct Capture(Arc<Mutex<Vec<f32>>>);

    impl AudioOutput for Capture {
        fn resume(&mut self) -> Result<()> {
            Ok(())
        }

        fn write(&mut self, block: &[f32]) -> Result<()> {
            self.0.lock().unwrap().extend_from_slice(block);
            Ok(())
        }
    }

    struct SlowSource;

    impl PitchAssetSource for SlowSource {
        fn fetch(&self, pitch: PitchId) -> Result<Vec<u8>> {
            thread::sleep(Duration::from_millis(250));
            ToneSource::new(RATE).fetch(pitch)
        }
    }

    fn player(output: Box<dyn AudioOutput>, pacing: Pacing) -> Player {
        player_with(PitchAssetCache::new(ToneSource::new(RATE)), output, pacing)
    }

    fn player_with(assets: PitchAssetCache, output: Box<dyn AudioOutput>, pacing: Pacing) -> Player {
        let audio = AudioConfig {
            sample_rate: RATE,
            block_size: 128,
            release_tail_ms: 100,
            ..Default::default()
        };
        let visual = VisualConfig {
            fps: 500,
            ..Default::default()
        };
        Player::new(
            Arc::new(AudioEngine::new(audio, Arc::new(assets))),
            visual,
            pacing,
            output,
        )
    }

    fn plan(input: &str) -> Arc<TimelinePlan> {
        Arc::new(TimelineBuilder::default().build(input))
    }

    #[test]
    fn start_is_deferred_until_unlock() {
        let written = Arc::new(AtomicUsize::new(0));
        let output = GestureOutput {
            resumes: Arc::new(AtomicUsize::new(0)),
            written: written.clone(),
        };
        let mut player = player(Box::new(output), Pacing::Freewheel);

        assert!(matches!(player.play(plan("AB"), TraceRenderer::new()).unwrap(), PlayState::Deferred));
        assert!(player.has_pending());

        assert!(matches!(player.unlock(), Err(MotifError::AudioLocked)));
        assert!(!player.is_unlocked());
        assert!(player.has_pending());
        assert_eq!(player.engine().clock().position(), 0);

        let session = match player.unlock().unwrap() {
            PlayState::Started(session) => session,
            other => panic!("expected playback to start, got {other:?}"),
        };
        assert!(session.is_current());
        assert!(!player.has_pending());

        match player.wait().unwrap() {
            Some(VisualOutcome::Completed(snapshot)) => {
                assert_eq!(snapshot.revealed, 2);
                assert_eq!(snapshot.caption, "AB");
            }
            other => panic!("expected completion, got {other:?}"),
        }
        player.shutdown().unwrap();
        assert!(written.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn empty_plan_plays_nothing() {
        let mut player = player(Box::new(NullOutput), Pacing::Freewheel);
        player.unlock().unwrap();
        assert!(matches!(player.play(plan(""), TraceRenderer::new()).unwrap(), PlayState::Nothing));
        assert!(player.wait().unwrap().is_none());
    }

    #[test]
    fn new_play_cancels_the_previous_one() {
        // Realtime, so neither phrase can finish before the test stops it.
        let mut player = player(Box::new(NullOutput), Pacing::Realtime);
        player.unlock().unwrap();
        let PlayState::Started(first) = player.play(plan("a long phrase"), TraceRenderer::new()).unwrap() else {
            panic!("first play did not start");
        };
        let PlayState::Started(second) = player.play(plan("another phrase"), TraceRenderer::new()).unwrap() else {
            panic!("second play did not start");
        };
        assert!(!first.is_current());
        assert!(second.is_current());
        assert!(second.run_id() > first.run_id());

        player.stop().unwrap();
        assert!(second.is_cancelled());
        assert!(matches!(player.wait().unwrap(), Some(VisualOutcome::Cancelled { .. })));
    }

    #[test]
    fn raw_output_writes_little_endian_floats() {
        let mut output = RawPcmOutput::new(Vec::new());
        output.resume().unwrap();
        output.write(&[0.5, -1.0]).unwrap();
        let bytes = output.into_inner();
        assert_eq!(bytes.len(), 8);
        assert_eq!(f32::from_le_bytes(bytes[..4].try_into().unwrap()), 0.5);
        assert_eq!(f32::from_le_bytes(bytes[4..].try_into().unwrap()), -1.0);
    }

    #[test]
    fn unlock_without_pending_play() {
        let mut player = player(Box::new(NullOutput), Pacing::Freewheel);
        assert!(matches!(player.unlock().unwrap(), PlayState::Nothing));
        assert!(player.is_unlocked());
        // A second unlock keeps the running driver.
        assert!(matches!(player.unlock().unwrap(), PlayState::Nothing));
        player.shutdown().unwrap();
        assert!(!player.is_unlocked());
    }

    #[test]
    fn driver_that_never_starts_keeps_the_player_locked() {
        let drives = Arc::new(AtomicUsize::new(0));
        let mut player = player(
            Box::new(StillbornOutput { drives: drives.clone() }),
            Pacing::Freewheel,
        );
        assert!(matches!(
            player.play(plan("AB"), TraceRenderer::new()).unwrap(),
            PlayState::Deferred
        ));
        assert!(matches!(player.unlock(), Err(MotifError::AudioLocked)));
        assert!(!player.is_unlocked());
        // The output came back, so a retry drives it again.
        assert!(matches!(player.unlock(), Err(MotifError::AudioLocked)));
        assert_eq!(drives.load(Ordering::SeqCst), 2);
        player.shutdown().unwrap();
    }

    #[test]
    fn failing_output_ends_playback_with_its_error() {
        let (done, finished) = mpsc::channel();
        thread::spawn(move || {
            let mut player = player(Box::new(ClosingPipe { blocks: 5 }), Pacing::Realtime);
            assert!(matches!(
                player.play(plan("a long phrase"), TraceRenderer::new()).unwrap(),
                PlayState::Deferred
            ));
            // The pipe may close before or after the session begins; either
            // way the error surfaces instead of a hang.
            let outcome = match player.unlock() {
                Ok(PlayState::Started(_)) => player.wait().map(|_| ()),
                Ok(other) => panic!("expected playback to start, got {other:?}"),
                Err(err) => Err(err),
            };
            player.shutdown().unwrap();
            let _ = done.send((outcome, player.is_unlocked()));
        });

        let (outcome, unlocked) = finished
            .recv_timeout(Duration::from_secs(10))
            .expect("playback did not end after the output failed");
        match outcome {
            Err(MotifError::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("expected the pipe error, got {other:?}"),
        }
        assert!(!unlocked);
    }

    #[test]
    fn slow_assets_do_not_delay_onsets() {
        let heard = Arc::new(Mutex::new(Vec::new()));
        let mut player = player_with(
            PitchAssetCache::new(SlowSource),
            Box::new(Capture(heard.clone())),
            Pacing::Realtime,
        );
        player.unlock().unwrap();
        let PlayState::Started(session) = player.play(plan("A"), TraceRenderer::new()).unwrap() else {
            panic!("playback did not start");
        };
        assert!(matches!(player.wait().unwrap(), Some(VisualOutcome::Completed(_))));
        player.shutdown().unwrap();

        let onset = player.engine().clock().frame_at(session.epoch()) as usize;
        let heard = heard.lock().unwrap();
        let first = heard
            .iter()
            .position(|sample| *sample != 0.0)
            .expect("the note was never heard");
        // Silent on the onset frame itself, then the attack ramp begins.
        assert!(first > onset && first <= onset + 4, "onset {onset}, first sound {first}");
    }
}

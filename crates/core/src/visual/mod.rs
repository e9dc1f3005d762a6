//! Frame-rate view of a plan that follows the audio clock.
//!
//! The loop never keeps time on its own. Each tick reads the audio clock,
//! works out how far into the plan playback is, and reveals every event whose
//! start was crossed since the previous tick. A late or dropped frame only
//! delays drawing; it never loses an event.

use std::{
    collections::VecDeque,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    audio::{AudioClock, PlaybackSession},
    config::VisualConfig,
    render::{node_for, Channel, Renderer},
    timeline::{EventKind, TimelinePlan},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailNode {
    pub node: usize,
    pub activated_at: f64,
    /// `None` once the node is frozen.
    pub expires_at: Option<f64>,
}

/// Recently activated nodes of one channel, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct TrailState {
    nodes: VecDeque<TrailNode>,
    capacity: usize,
    lifetime: f64,
}

impl TrailState {
    pub fn new(capacity: usize, lifetime: Duration) -> Self {
        Self {
            nodes: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            lifetime: lifetime.as_secs_f64(),
        }
    }

    pub fn activate(&mut self, node: usize, at: f64) {
        self.nodes.push_back(TrailNode {
            node,
            activated_at: at,
            expires_at: Some(at + self.lifetime),
        });
        while self.nodes.len() > self.capacity {
            self.nodes.pop_front();
        }
    }

    pub fn expire(&mut self, now: f64) {
        self.nodes
            .retain(|n| n.expires_at.map_or(true, |expires| expires > now));
    }

    /// Makes every remaining node permanent.
    pub fn freeze(&mut self) {
        for node in &mut self.nodes {
            node.expires_at = None;
        }
    }

    pub fn is_frozen(&self) -> bool {
        !self.nodes.is_empty() && self.nodes.iter().all(|n| n.expires_at.is_none())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TrailNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Remaining life of a node as a fraction, 1.0 for frozen nodes.
    pub fn strength(&self, node: &TrailNode, now: f64) -> f32 {
        match node.expires_at {
            None => 1.0,
            Some(expires) if self.lifetime > 0.0 => {
                ((expires - now) / self.lifetime).clamp(0.0, 1.0) as f32
            }
            Some(_) => 0.0,
        }
    }
}

/// Result of one [`VisualSync::advance`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Indices of the events revealed by this tick, in order.
    pub revealed: Vec<usize>,
    pub completed: bool,
}

/// Terminal state of a finished loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualSnapshot {
    pub caption: String,
    pub revealed: usize,
    pub melody: Vec<TrailNode>,
    pub harmony: Vec<TrailNode>,
}

/// Reveal logic shared by live playback and export.
#[derive(Debug, Clone)]
pub struct VisualSync {
    plan: Arc<TimelinePlan>,
    cursor: usize,
    melody: TrailState,
    harmony: TrailState,
    caption: String,
    finish: f64,
    now: f64,
    completed: bool,
}

impl VisualSync {
    pub fn new(plan: Arc<TimelinePlan>, config: &VisualConfig, release_tail: Duration) -> Self {
        let finish = (plan.total_duration() + release_tail).as_secs_f64();
        Self {
            plan,
            cursor: 0,
            melody: TrailState::new(config.trail_length, config.trail_lifetime()),
            harmony: TrailState::new(config.trail_length, config.trail_lifetime()),
            caption: String::new(),
            finish,
            now: f64::NEG_INFINITY,
            completed: false,
        }
    }

    /// Moves the view to `elapsed` seconds into the plan, revealing every
    /// event crossed since the last call.
    pub fn advance(&mut self, elapsed: f64) -> TickReport {
        let mut report = TickReport {
            completed: self.completed,
            ..Default::default()
        };
        if self.completed {
            return report;
        }

        let plan = self.plan.clone();
        let events = plan.events();
        while self.cursor < events.len() && events[self.cursor].start_seconds() <= elapsed {
            self.reveal(self.cursor);
            report.revealed.push(self.cursor);
            self.cursor += 1;
        }
        // Past the finish the trails are judged at the finish itself, so the
        // frozen state does not depend on how late the final tick arrives.
        let now = elapsed.min(self.finish);
        self.melody.expire(now);
        self.harmony.expire(now);
        self.now = now;

        if elapsed >= self.finish {
            self.melody.freeze();
            self.harmony.freeze();
            self.completed = true;
            report.completed = true;
            tracing::debug!(revealed = self.cursor, "visual state frozen");
        }
        report
    }

    fn reveal(&mut self, index: usize) {
        let event = &self.plan.events()[index];
        let at = event.start_seconds();
        let trail = match event.kind {
            EventKind::Melody => Some(&mut self.melody),
            EventKind::Chord => Some(&mut self.harmony),
            EventKind::Rest => None,
        };
        if let Some(trail) = trail {
            for &pitch in &event.pitches {
                trail.activate(node_for(pitch), at);
            }
        }
        self.caption.push_str(&event.caption);
    }

    /// Draws the current trails and caption.
    pub fn draw(&self, renderer: &mut impl Renderer) {
        renderer.begin_frame();
        for channel in Channel::ALL {
            let trail = self.trail(channel);
            let nodes: Vec<&TrailNode> = trail.nodes().collect();
            for pair in nodes.windows(2) {
                let strength = trail
                    .strength(pair[0], self.now)
                    .min(trail.strength(pair[1], self.now));
                renderer.draw_segment(channel, pair[0].node, pair[1].node, strength);
            }
            for node in nodes {
                renderer.draw_node(channel, node.node, trail.strength(node, self.now));
            }
        }
        renderer.draw_caption(&self.caption);
        renderer.end_frame();
    }

    pub fn trail(&self, channel: Channel) -> &TrailState {
        match channel {
            Channel::Melody => &self.melody,
            Channel::Harmony => &self.harmony,
        }
    }

    pub fn caption(&self) -> &str {
        &self.caption
    }

    pub fn revealed(&self) -> usize {
        self.cursor
    }

    /// Seconds into the plan at which the view freezes.
    pub fn finish_seconds(&self) -> f64 {
        self.finish
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn snapshot(&self) -> VisualSnapshot {
        VisualSnapshot {
            caption: self.caption.clone(),
            revealed: self.cursor,
            melody: self.melody.nodes().copied().collect(),
            harmony: self.harmony.nodes().copied().collect(),
        }
    }
}

/// How a frame loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum VisualOutcome {
    /// The session played to the end; the trails are frozen.
    Completed(VisualSnapshot),
    /// The session was cancelled or superseded and the loop stopped.
    Cancelled { revealed: usize },
}

/// Runs [`VisualSync`] on its own thread at the configured frame rate.
pub struct VisualLoop;

impl VisualLoop {
    pub fn spawn<R>(
        clock: Arc<dyn AudioClock>,
        session: PlaybackSession,
        plan: Arc<TimelinePlan>,
        config: VisualConfig,
        release_tail: Duration,
        mut renderer: R,
    ) -> JoinHandle<VisualOutcome>
    where
        R: Renderer + Send + 'static,
    {
        thread::spawn(move || {
            let interval = config.frame_interval();
            let mut sync = VisualSync::new(plan, &config, release_tail);
            loop {
                if !session.is_current() {
                    tracing::debug!(run_id = session.run_id(), "visual loop cancelled");
                    return VisualOutcome::Cancelled {
                        revealed: sync.revealed(),
                    };
                }
                let report = sync.advance(session.elapsed(clock.now()));
                sync.draw(&mut renderer);
                if report.completed {
                    return VisualOutcome::Completed(sync.snapshot());
                }
                thread::sleep(interval);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assets::{PitchAssetCache, ToneSource},
        audio::{AudioEngine, SampleClock},
        config::AudioConfig,
        timeline::TimelineBuilder,
    };

    const TAIL: Duration = Duration::from_millis(500);

    fn sync_for(input: &str) -> VisualSync {
        let plan = Arc::new(TimelineBuilder::default().build(input));
        VisualSync::new(plan, &VisualConfig::default(), TAIL)
    }

    #[derive(Default)]
    struct Recorder {
        segments: usize,
        nodes: Vec<(Channel, usize)>,
        captions: Vec<String>,
        frames: usize,
    }

    impl Renderer for Recorder {
        fn draw_segment(&mut self, _: Channel, _: usize, _: usize, _: f32) {
            self.segments += 1;
        }

        fn draw_node(&mut self, channel: Channel, node: usize, _: f32) {
            self.nodes.push((channel, node));
        }

        fn draw_caption(&mut self, text: &str) {
            self.captions.push(text.to_string());
        }

        fn end_frame(&mut self) {
            self.frames += 1;
        }
    }

    #[test]
    fn reveals_events_as_their_start_is_crossed() {
        let mut sync = sync_for("AB1");
        assert!(sync.advance(-0.05).revealed.is_empty());
        assert_eq!(sync.advance(0.0).revealed, vec![0]);
        assert!(sync.advance(0.2).revealed.is_empty());
        assert_eq!(sync.advance(0.31).revealed, vec![1]);
        assert_eq!(sync.caption(), "AB");
        assert_eq!(sync.trail(Channel::Melody).len(), 2);
        assert!(sync.trail(Channel::Harmony).is_empty());
    }

    #[test]
    fn catches_up_after_a_long_stall() {
        let mut sync = sync_for("Hi, 42!");
        let total = sync.plan.events().len();
        let report = sync.advance(1.0);
        assert_eq!(report.revealed, (0..sync.revealed()).collect::<Vec<_>>());

        // One huge gap: every remaining event is revealed, none skipped.
        let report = sync.advance(30.0);
        assert_eq!(sync.revealed(), total);
        assert!(report.completed);
        // Digit runs are captioned as typed, not as read.
        assert_eq!(sync.caption(), "Hi, 42!");
    }

    #[test]
    fn trail_is_bounded_and_expires() {
        let mut trail = TrailState::new(3, Duration::from_millis(1000));
        for (i, at) in [0.0, 0.1, 0.2, 0.3].into_iter().enumerate() {
            trail.activate(i, at);
        }
        assert_eq!(trail.nodes().map(|n| n.node).collect::<Vec<_>>(), vec![1, 2, 3]);

        trail.expire(1.15);
        assert_eq!(trail.nodes().map(|n| n.node).collect::<Vec<_>>(), vec![2, 3]);
        let first = *trail.nodes().next().unwrap();
        assert!((trail.strength(&first, 1.15) - 0.05).abs() < 1e-4);

        trail.freeze();
        trail.expire(100.0);
        assert!(trail.is_frozen());
        assert_eq!(trail.len(), 2);
    }

    #[test]
    fn freezes_only_after_release_tail() {
        let mut sync = sync_for("AB");
        assert!(!sync.advance(0.65).completed);
        assert!(!sync.trail(Channel::Melody).is_frozen());

        let report = sync.advance(1.2);
        assert!(report.completed);
        assert!(sync.trail(Channel::Melody).is_frozen());
        assert!(sync.is_completed());

        // Frozen state stays put however far the clock moves.
        let frozen = sync.snapshot();
        assert!(sync.advance(50.0).completed);
        assert_eq!(sync.snapshot(), frozen);
    }

    #[test]
    fn draws_segments_nodes_and_caption() {
        let mut sync = sync_for("AB1");
        sync.advance(0.7);
        let mut recorder = Recorder::default();
        sync.draw(&mut recorder);

        let chord_nodes = sync.trail(Channel::Harmony).len();
        assert_eq!(recorder.nodes.len(), 2 + chord_nodes);
        assert_eq!(recorder.segments, 1 + chord_nodes.saturating_sub(1));
        assert_eq!(recorder.captions, vec!["AB1".to_string()]);
        assert_eq!(recorder.frames, 1);
    }

    #[test]
    fn separate_syncs_do_not_share_state() {
        let plan = Arc::new(TimelineBuilder::default().build("100 100"));
        let mut live = VisualSync::new(plan.clone(), &VisualConfig::default(), TAIL);
        let mut export = VisualSync::new(plan, &VisualConfig::default(), TAIL);
        live.advance(10.0);
        assert_eq!(export.revealed(), 0);
        export.advance(0.0);
        assert_eq!(export.revealed(), 1);
        assert_eq!(live.snapshot().caption, "100 100");
    }

    fn engine() -> AudioEngine {
        let config = AudioConfig {
            sample_rate: 1_000,
            ..Default::default()
        };
        let assets = Arc::new(PitchAssetCache::new(ToneSource::new(1_000)));
        AudioEngine::new(config, assets)
    }

    fn fast() -> VisualConfig {
        VisualConfig {
            fps: 1_000,
            ..Default::default()
        }
    }

    #[test]
    fn loop_follows_the_audio_clock_to_completion() {
        let engine = engine();
        let clock: Arc<SampleClock> = engine.clock();
        let session = engine.begin_session_at(0.0).unwrap();
        let plan = Arc::new(TimelineBuilder::default().build("A.B"));

        let handle = VisualLoop::spawn(
            clock.clone(),
            session,
            plan.clone(),
            fast(),
            TAIL,
            Recorder::default(),
        );
        // Jump the clock past the whole plan in one step.
        clock.advance(10_000);

        match handle.join().unwrap() {
            VisualOutcome::Completed(snapshot) => {
                assert_eq!(snapshot.revealed, plan.events().len());
                assert_eq!(snapshot.caption, "A.B");
                // B (0.6 s) outlives the 1.4 s finish; A (0.0 s) does not.
                assert_eq!(snapshot.melody.len(), 1);
                assert_eq!(snapshot.harmony.len(), plan.events()[1].pitches.len());
                assert!(snapshot.melody.iter().all(|n| n.expires_at.is_none()));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn loop_stops_when_session_is_cancelled() {
        let engine = engine();
        let session = engine.begin_session_at(0.0).unwrap();
        let plan = Arc::new(TimelineBuilder::default().build("a long phrase"));

        let handle = VisualLoop::spawn(
            engine.clock(),
            session.clone(),
            plan,
            fast(),
            TAIL,
            Recorder::default(),
        );
        thread::sleep(Duration::from_millis(5));
        engine.cancel(&session).unwrap();

        // The clock never moved, so at most the first event was shown.
        match handle.join().unwrap() {
            VisualOutcome::Cancelled { revealed } => assert!(revealed <= 1),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }
}

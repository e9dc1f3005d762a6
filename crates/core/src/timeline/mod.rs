//! Deterministic conversion of tokens into a contiguous timeline of events.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    mapping::{Alternation, DurationBucket, MappingRules, PitchId, Punctuation, RULES_VERSION},
    tokenize::{tokenize, Token, TokenCategory},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Melody,
    Chord,
    Rest,
}

/// One scheduled musical unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub pitches: Vec<PitchId>,
    /// How the event is read, e.g. `"40"` for the tens of `42`.
    pub label: Option<String>,
    /// Input text this event adds to the on-screen caption. A digit run puts
    /// all of its characters on its first event.
    pub caption: String,
    pub start: Duration,
    pub duration: Duration,
}

impl Event {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }

    pub fn start_seconds(&self) -> f64 {
        self.start.as_secs_f64()
    }

    pub fn is_rest(&self) -> bool {
        self.kind == EventKind::Rest
    }
}

/// The ordered, gap-free sequence of events derived from one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelinePlan {
    events: Vec<Event>,
    total_duration: Duration,
    source_digest: String,
}

impl TimelinePlan {
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    /// Hex SHA-256 of the input text and the mapping rules.
    pub fn source_digest(&self) -> &str {
        &self.source_digest
    }

    /// An empty plan means there is nothing to play.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Every distinct pitch the plan sounds, in ascending order.
    pub fn pitches(&self) -> Vec<PitchId> {
        let mut pitches: Vec<PitchId> = self
            .events
            .iter()
            .flat_map(|event| event.pitches.iter().copied())
            .collect();
        pitches.sort();
        pitches.dedup();
        pitches
    }

    /// Index of the first event whose start lies after `elapsed`.
    pub fn first_after(&self, elapsed: Duration) -> usize {
        self.events.partition_point(|event| event.start <= elapsed)
    }
}

/// Builds [`TimelinePlan`]s. Holds only the mapping rules; every piece of
/// per-run state, such as chord alternation, lives inside a single
/// [`TimelineBuilder::build`] call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimelineBuilder {
    rules: MappingRules,
}

impl TimelineBuilder {
    pub fn new(rules: MappingRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> MappingRules {
        self.rules
    }

    pub fn build(&self, input: &str) -> TimelinePlan {
        let tokens = tokenize(input);
        let plan = self.assemble(&tokens, digest(input, &self.rules));
        tracing::debug!(
            events = plan.events.len(),
            total = ?plan.total_duration,
            digest = %plan.source_digest,
            "built timeline plan"
        );
        plan
    }

    /// Builds from already tokenized input. The digest covers the raw
    /// characters of the tokens.
    pub fn build_tokens(&self, tokens: &[Token]) -> TimelinePlan {
        let text: String = tokens.iter().map(|t| t.raw).collect();
        self.assemble(tokens, digest(&text, &self.rules))
    }

    fn assemble(&self, tokens: &[Token], source_digest: String) -> TimelinePlan {
        let mut run = BuildRun::new(self.rules);
        let mut index = 0;
        while index < tokens.len() {
            let token = tokens[index];
            let consumed = match token.category {
                TokenCategory::Letter => {
                    run.letter(token.raw);
                    1
                }
                TokenCategory::Digit => {
                    let len = run_length(&tokens[index..], |t| t.category == TokenCategory::Digit);
                    let run_tokens = &tokens[index..index + len];
                    let digits: Vec<u8> = run_tokens.iter().map(|t| t.raw as u8 - b'0').collect();
                    run.number(run_tokens.iter().map(|t| t.raw).collect(), &digits);
                    len
                }
                TokenCategory::Symbol if token.raw == '.' => {
                    let len = run_length(&tokens[index..], |t| t.raw == '.');
                    run.dots(len);
                    len
                }
                TokenCategory::Symbol => {
                    run.symbol(token.raw);
                    1
                }
                TokenCategory::Separator => {
                    run.separator(token.raw);
                    1
                }
            };
            index += consumed;
        }

        TimelinePlan {
            total_duration: run.cursor,
            events: run.events,
            source_digest,
        }
    }
}

fn run_length(tokens: &[Token], matches: impl Fn(&Token) -> bool) -> usize {
    tokens.iter().take_while(|t| matches(t)).count()
}

fn digest(input: &str, rules: &MappingRules) -> String {
    let mut hasher = Sha256::new();
    hasher.update(RULES_VERSION.to_le_bytes());
    hasher.update(rules.key.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(rules.mode.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// State of one build: the running cursor and the two alternations.
struct BuildRun {
    rules: MappingRules,
    events: Vec<Event>,
    cursor: Duration,
    cadence: Alternation,
    zero: Alternation,
}

impl BuildRun {
    fn new(rules: MappingRules) -> Self {
        Self {
            rules,
            events: Vec::new(),
            cursor: Duration::ZERO,
            cadence: Alternation::default(),
            zero: Alternation::default(),
        }
    }

    fn push(&mut self, kind: EventKind, pitches: Vec<PitchId>, label: String, bucket: DurationBucket) {
        let duration = bucket.duration();
        self.events.push(Event {
            kind,
            pitches,
            caption: label.clone(),
            label: Some(label),
            start: self.cursor,
            duration,
        });
        self.cursor += duration;
    }

    fn chord(&mut self, pitches: Vec<PitchId>, label: impl Into<String>) {
        self.push(EventKind::Chord, pitches, label.into(), DurationBucket::Default);
    }

    fn rest(&mut self, raw: char, bucket: DurationBucket) {
        self.push(EventKind::Rest, Vec::new(), raw.to_string(), bucket);
    }

    fn letter(&mut self, raw: char) {
        let pitch = self.rules.letter_pitch(raw);
        self.push(EventKind::Melody, vec![pitch], raw.to_string(), DurationBucket::Default);
    }

    fn separator(&mut self, raw: char) {
        match raw {
            '_' | '/' => self.rest(raw, DurationBucket::MicroRest),
            _ => self.rest(raw, DurationBucket::ShortRest),
        }
    }

    fn symbol(&mut self, raw: char) {
        match Punctuation::of(raw) {
            Some(punctuation) => {
                let chord = self.rules.punctuation_chord(punctuation);
                self.chord(chord, raw);
            }
            None if raw == ',' => self.rest(raw, DurationBucket::ShortRest),
            None => self.rest(raw, DurationBucket::MicroRest),
        }
    }

    /// Dots are consumed three at a time as soft ticks; leftovers are
    /// ordinary periods.
    fn dots(&mut self, count: usize) {
        for _ in 0..(count / 3) * 3 {
            let tick = self.rules.tick_pitch();
            self.push(EventKind::Melody, vec![tick], ".".to_string(), DurationBucket::SoftTick);
        }
        for _ in 0..count % 3 {
            self.symbol('.');
        }
    }

    /// Reads a digit run and captions it with the digits as typed.
    fn number(&mut self, text: String, digits: &[u8]) {
        let first = self.events.len();
        self.digits(digits);
        if let Some((head, rest)) = self.events[first..].split_first_mut() {
            head.caption = text;
            for event in rest {
                event.caption.clear();
            }
        }
    }

    /// Reads a run of digits the way a number is spoken.
    fn digits(&mut self, digits: &[u8]) {
        match digits.len() {
            0 => {}
            1 => self.single(digits[0]),
            2 => self.pair(digits[0], digits[1]),
            3 => self.triple(digits),
            4 => {
                self.pair(digits[0], digits[1]);
                self.pair(digits[2], digits[3]);
            }
            _ => {
                self.triple(&digits[..3]);
                self.digits(&digits[3..]);
            }
        }
    }

    fn single(&mut self, digit: u8) {
        let chord = if digit == 0 {
            self.rules.zero_chord(&mut self.zero)
        } else {
            self.rules.digit_chord(digit)
        };
        self.chord(chord, digit.to_string());
    }

    fn pair(&mut self, tens: u8, ones: u8) {
        match tens {
            0 => {
                self.single(0);
                self.single(ones);
            }
            1 => {
                let chord = self.rules.teen_chord(ones);
                self.chord(chord, format!("1{ones}"));
            }
            _ => {
                let chord = self.rules.decade_chord(tens);
                self.chord(chord, format!("{tens}0"));
                if ones != 0 {
                    self.single(ones);
                }
            }
        }
    }

    fn triple(&mut self, digits: &[u8]) {
        if digits[0] != 1 {
            self.single(digits[0]);
            self.pair(digits[1], digits[2]);
            return;
        }

        let chord = self.rules.cadence_chord(&mut self.cadence);
        self.chord(chord, "100");
        match (digits[1], digits[2]) {
            (0, 0) => {}
            (0, ones) => self.single(ones),
            (tens, ones) => self.pair(tens, ones),
        }
    }
}

//! Fixed mapping rules from musical units to pitches and durations.
//!
//! Everything in here is a pure function of [`MappingRules`] and the tables
//! below. Changing a table changes what existing shared links sound like, so
//! bump [`RULES_VERSION`] alongside any edit.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{MotifError, Result};

/// Mixed into every plan digest.
pub const RULES_VERSION: u32 = 1;

/// Lowest MIDI note any voice may use (C3).
pub const REGISTER_LOW: i32 = 48;
/// Highest MIDI note any voice may use (C6).
pub const REGISTER_HIGH: i32 = 84;

const MELODY_BASE: i32 = 60;
const CHORD_BASE: i32 = 48;

const MAJOR_SCALE: [i32; 7] = [0, 2, 4, 5, 7, 9, 11];
const MINOR_SCALE: [i32; 7] = [0, 2, 3, 5, 7, 8, 10];

/// Chord shapes are scale degrees above the chord base; 7 is the octave.
pub type Shape = &'static [usize];

const DIGIT_SHAPES: [Shape; 10] = [
    &[0, 4, 7], // zero is read through ZERO_SHAPES
    &[0, 2, 4],
    &[1, 3, 5],
    &[2, 4, 6],
    &[3, 5, 7],
    &[4, 6, 8],
    &[5, 7, 9],
    &[6, 8, 10],
    &[0, 4, 7, 9],
    &[4, 6, 8, 10],
];

const TEEN_SHAPES: [Shape; 10] = [
    &[0, 2, 4, 6],
    &[0, 2, 4, 8],
    &[1, 3, 5, 7],
    &[2, 4, 6, 8],
    &[3, 5, 7, 9],
    &[4, 6, 8, 10],
    &[5, 7, 9, 11],
    &[6, 8, 10, 12],
    &[0, 3, 4],
    &[4, 7, 8],
];

/// Indexed by the tens digit; 0 and 1 are read as zero and teen chords.
const DECADE_SHAPES: [Shape; 10] = [
    &[],
    &[],
    &[1, 4, 8],
    &[2, 5, 9],
    &[3, 6, 10],
    &[4, 7, 11],
    &[5, 8, 12],
    &[6, 9, 13],
    &[0, 7, 14],
    &[1, 8, 15],
];

const CADENCE_SHAPES: [Shape; 2] = [&[4, 6, 8, 10], &[0, 2, 4, 7]];
const ZERO_SHAPES: [Shape; 2] = [&[0, 4, 7], &[3, 7, 10]];

const PERIOD_SHAPE: Shape = &[0, 2, 4];
const EXCLAIM_SHAPE: Shape = &[3, 5, 7, 10];
const QUESTION_SHAPE: Shape = &[4, 6, 8, 11];

/// Identifier of a pitch sample: a MIDI note number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PitchId(pub u8);

const PITCH_NAMES: [&str; 12] = [
    "C", "Cs", "D", "Ds", "E", "F", "Fs", "G", "Gs", "A", "As", "B",
];

impl PitchId {
    pub fn midi(self) -> u8 {
        self.0
    }

    pub fn pitch_class(self) -> u8 {
        self.0 % 12
    }

    pub fn octave(self) -> i32 {
        self.0 as i32 / 12 - 1
    }

    /// Equal-tempered frequency with A4 = 440 Hz.
    pub fn frequency(self) -> f32 {
        440.0 * 2f32.powf((self.0 as f32 - 69.0) / 12.0)
    }
}

impl fmt::Display for PitchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            PITCH_NAMES[self.pitch_class() as usize],
            self.octave()
        )
    }
}

/// Tonic of the scale the mapping is played in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    #[default]
    C,
    Db,
    D,
    Eb,
    E,
    F,
    Gb,
    G,
    Ab,
    A,
    Bb,
    B,
}

const KEYS: [Key; 12] = [
    Key::C,
    Key::Db,
    Key::D,
    Key::Eb,
    Key::E,
    Key::F,
    Key::Gb,
    Key::G,
    Key::Ab,
    Key::A,
    Key::Bb,
    Key::B,
];

impl Key {
    pub fn from_pitch_class(pc: i32) -> Self {
        KEYS[pc.rem_euclid(12) as usize]
    }

    pub fn pitch_class(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl FromStr for Key {
    type Err = MotifError;

    /// Accepts `C`, `c#`, `Db`, `Fs`, ... (case-insensitive, `#`/`s` sharp,
    /// `b` flat).
    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.trim().chars();
        let letter = chars
            .next()
            .ok_or_else(|| MotifError::msg("empty key name"))?;
        let natural = match letter.to_ascii_uppercase() {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return Err(MotifError::msg(format!("unknown key `{s}`"))),
        };
        let accidental = match chars.as_str().to_ascii_lowercase().as_str() {
            "" => 0,
            "#" | "s" => 1,
            "b" => -1,
            _ => return Err(MotifError::msg(format!("unknown key `{s}`"))),
        };
        Ok(Self::from_pitch_class(natural + accidental))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Major,
    Minor,
}

impl Mode {
    fn scale(self) -> &'static [i32; 7] {
        match self {
            Mode::Major => &MAJOR_SCALE,
            Mode::Minor => &MINOR_SCALE,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Major => "major",
            Mode::Minor => "minor",
        })
    }
}

impl FromStr for Mode {
    type Err = MotifError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "major" | "maj" => Ok(Mode::Major),
            "minor" | "min" => Ok(Mode::Minor),
            _ => Err(MotifError::msg(format!("unknown mode `{s}`"))),
        }
    }
}

/// One of the four fixed durations every event is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationBucket {
    Default,
    ShortRest,
    MicroRest,
    SoftTick,
}

impl DurationBucket {
    pub fn duration(self) -> Duration {
        match self {
            DurationBucket::Default => Duration::from_millis(300),
            DurationBucket::ShortRest => Duration::from_millis(100),
            DurationBucket::MicroRest => Duration::from_millis(50),
            DurationBucket::SoftTick => Duration::from_millis(80),
        }
    }
}

/// Sentence-ending punctuation with a chord of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Punctuation {
    Period,
    Exclamation,
    Question,
}

impl Punctuation {
    pub fn of(ch: char) -> Option<Self> {
        match ch {
            '.' => Some(Self::Period),
            '!' => Some(Self::Exclamation),
            '?' => Some(Self::Question),
            _ => None,
        }
    }

    fn shape(self) -> Shape {
        match self {
            Punctuation::Period => PERIOD_SHAPE,
            Punctuation::Exclamation => EXCLAIM_SHAPE,
            Punctuation::Question => QUESTION_SHAPE,
        }
    }
}

/// Two-state toggle for chord families that alternate between shapes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Alternation {
    flipped: bool,
}

impl Alternation {
    /// Returns the shape index to use now and flips for the next occurrence.
    pub fn next(&mut self) -> usize {
        let index = usize::from(self.flipped);
        self.flipped = !self.flipped;
        index
    }
}

/// Key and mode the input is rendered in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappingRules {
    pub key: Key,
    pub mode: Mode,
}

impl MappingRules {
    pub fn new(key: Key, mode: Mode) -> Self {
        Self { key, mode }
    }

    /// Pitch for a letter: a modulo-7 walk over the alphabet, with blocks of
    /// seven letters alternating between two octaves.
    pub fn letter_pitch(&self, letter: char) -> PitchId {
        let index = (letter.to_ascii_uppercase() as i32 - 'A' as i32).clamp(0, 25);
        let degree = (index % 7) as usize;
        let octave = 12 * ((index / 7) % 2);
        let pitch = MELODY_BASE + self.key.pitch_class() + self.degree_offset(degree) + octave;
        PitchId(fold_into_register(pitch) as u8)
    }

    pub fn tick_pitch(&self) -> PitchId {
        let pitch = MELODY_BASE + 12 + self.key.pitch_class();
        PitchId(fold_into_register(pitch) as u8)
    }

    pub fn digit_chord(&self, digit: u8) -> Vec<PitchId> {
        self.voice(DIGIT_SHAPES[digit as usize % 10])
    }

    /// Chord for 10..=19, addressed by the ones digit.
    pub fn teen_chord(&self, ones: u8) -> Vec<PitchId> {
        self.voice(TEEN_SHAPES[ones as usize % 10])
    }

    /// Chord for 20, 30, ... 90, addressed by the tens digit.
    pub fn decade_chord(&self, tens: u8) -> Vec<PitchId> {
        let tens = (tens as usize % 10).max(2);
        self.voice(DECADE_SHAPES[tens])
    }

    pub fn zero_chord(&self, alternation: &mut Alternation) -> Vec<PitchId> {
        self.voice(ZERO_SHAPES[alternation.next()])
    }

    pub fn cadence_chord(&self, alternation: &mut Alternation) -> Vec<PitchId> {
        self.voice(CADENCE_SHAPES[alternation.next()])
    }

    pub fn punctuation_chord(&self, punctuation: Punctuation) -> Vec<PitchId> {
        self.voice(punctuation.shape())
    }

    fn degree_offset(&self, degree: usize) -> i32 {
        let scale = self.mode.scale();
        12 * (degree / 7) as i32 + scale[degree % 7]
    }

    fn voice(&self, shape: Shape) -> Vec<PitchId> {
        let base = CHORD_BASE + self.key.pitch_class();
        let pitches: Vec<i32> = shape
            .iter()
            .map(|&degree| fold_into_register(base + self.degree_offset(degree)))
            .collect();
        avoid_collisions(&pitches)
    }
}

/// Moves a pitch by whole octaves until it sits inside the register.
pub fn fold_into_register(mut pitch: i32) -> i32 {
    while pitch > REGISTER_HIGH {
        pitch -= 12;
    }
    while pitch < REGISTER_LOW {
        pitch += 12;
    }
    pitch
}

/// Voices simultaneous pitches so no two coincide. A duplicate moves an
/// octave up, or down when up leaves the register; it is dropped when neither
/// octave is free. Pitch classes never change.
pub fn avoid_collisions(pitches: &[i32]) -> Vec<PitchId> {
    let in_register = |p: &i32| (REGISTER_LOW..=REGISTER_HIGH).contains(p);
    let mut voiced: Vec<i32> = Vec::with_capacity(pitches.len());
    for &pitch in pitches {
        let placed = [pitch, pitch + 12, pitch - 12]
            .into_iter()
            .find(|candidate| in_register(candidate) && !voiced.contains(candidate));
        if let Some(pitch) = placed {
            voiced.push(pitch);
        }
    }
    voiced.into_iter().map(|p| PitchId(p as u8)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_in_register(pitches: &[PitchId]) -> bool {
        pitches
            .iter()
            .all(|p| (REGISTER_LOW..=REGISTER_HIGH).contains(&(p.midi() as i32)))
    }

    #[test]
    fn letters_cycle_every_seven() {
        let rules = MappingRules::default();
        assert_eq!(rules.letter_pitch('A'), PitchId(60));
        assert_eq!(rules.letter_pitch('B'), PitchId(62));
        assert_eq!(rules.letter_pitch('a'), rules.letter_pitch('A'));
        // H starts the second block, one octave above A.
        assert_eq!(rules.letter_pitch('H'), PitchId(72));
        // O starts the third block, back in the base octave.
        assert_eq!(rules.letter_pitch('O'), PitchId(60));
    }

    #[test]
    fn every_pitch_stays_in_register() {
        for key in KEYS {
            for mode in [Mode::Major, Mode::Minor] {
                let rules = MappingRules::new(key, mode);
                for letter in 'A'..='Z' {
                    assert!(all_in_register(&[rules.letter_pitch(letter)]));
                }
                for digit in 0..10 {
                    assert!(all_in_register(&rules.digit_chord(digit)));
                    assert!(all_in_register(&rules.teen_chord(digit)));
                    assert!(all_in_register(&rules.decade_chord(digit)));
                }
            }
        }
    }

    #[test]
    fn collisions_shift_by_octave() {
        assert_eq!(
            avoid_collisions(&[60, 60, 60]),
            vec![PitchId(60), PitchId(72), PitchId(48)]
        );
        // At the top of the register the duplicate moves down instead.
        assert_eq!(avoid_collisions(&[84, 84]), vec![PitchId(84), PitchId(72)]);
        // No free octave left: the duplicate is dropped.
        assert_eq!(
            avoid_collisions(&[60, 72, 48, 60]),
            vec![PitchId(60), PitchId(72), PitchId(48)]
        );
    }

    #[test]
    fn folded_decade_chords_never_double_a_pitch() {
        let rules = MappingRules::new(Key::B, Mode::Major);
        for tens in 2..10 {
            let chord = rules.decade_chord(tens);
            let mut unique = chord.clone();
            unique.sort();
            unique.dedup();
            assert_eq!(unique.len(), chord.len());
        }
    }

    #[test]
    fn alternation_starts_on_first_shape() {
        let rules = MappingRules::default();
        let mut alternation = Alternation::default();
        let first = rules.cadence_chord(&mut alternation);
        let second = rules.cadence_chord(&mut alternation);
        let third = rules.cadence_chord(&mut alternation);
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn parses_keys_and_modes() {
        assert_eq!("c#".parse::<Key>().unwrap(), Key::Db);
        assert_eq!("Fs".parse::<Key>().unwrap(), Key::Gb);
        assert_eq!("Bb".parse::<Key>().unwrap(), Key::Bb);
        assert_eq!("Cb".parse::<Key>().unwrap(), Key::B);
        assert!("H".parse::<Key>().is_err());
        assert_eq!("MINOR".parse::<Mode>().unwrap(), Mode::Minor);
        assert!("lydian".parse::<Mode>().is_err());
    }

    #[test]
    fn pitch_names_are_file_safe() {
        assert_eq!(PitchId(60).to_string(), "C4");
        assert_eq!(PitchId(61).to_string(), "Cs4");
        assert_eq!(PitchId(48).to_string(), "C3");
        assert!((PitchId(69).frequency() - 440.0).abs() < 1e-3);
    }
}

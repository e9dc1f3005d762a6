//! Core library for Motif: turns text, dates and phone numbers into short,
//! deterministic pieces of music with a synchronized visual.
//!
//! Input is tokenized and mapped onto a contiguous [`TimelinePlan`]. The
//! [`AudioEngine`] schedules a plan against its sample clock, a
//! [`VisualLoop`] follows that same clock to reveal trails and captions, and
//! the [`ExportPipeline`] re-renders a plan offline into a downloadable
//! recording.

pub mod assets;
pub mod audio;
pub mod config;
pub mod error;
pub mod mapping;
pub mod player;
pub mod record;
pub mod render;
pub mod share;
pub mod timeline;
pub mod tokenize;
pub mod visual;

pub use assets::{PitchAsset, PitchAssetCache, PitchAssetSource};
pub use audio::{AudioClock, AudioEngine, PlaybackSession, SampleClock};
pub use config::{AppConfig, AudioConfig, ExportConfig, VisualConfig};
pub use error::{MotifError, Result};
pub use mapping::{Key, MappingRules, Mode, PitchId};
pub use player::{AudioOutput, Pacing, PlayState, Player};
pub use record::{EncoderFormat, ExportOutcome, ExportPipeline, ExportState};
pub use render::{RasterSurface, Renderer, TraceRenderer};
pub use share::{InputKind, ShareState};
pub use timeline::{Event, EventKind, TimelineBuilder, TimelinePlan};
pub use tokenize::{tokenize, Token, TokenCategory};
pub use visual::{VisualLoop, VisualOutcome, VisualSync};

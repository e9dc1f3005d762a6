use crate::assets::AssetError;
use crate::record::ExportState;

/// Result alias that carries the custom [`MotifError`] type.
pub type Result<T> = std::result::Result<T, MotifError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum MotifError {
    /// Free-form failure that does not fit any of the structured variants.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// A pitch asset could not be fetched or decoded.
    #[error(transparent)]
    Asset(#[from] AssetError),
    /// WAV encoding or decoding failed.
    #[error("wav codec error: {0}")]
    Decode(#[from] hound::Error),
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    /// The recording encoder rejected input or could not produce output.
    #[error("encoder error: {0}")]
    Encode(String),
    /// The server-side container normalizer failed or returned nothing.
    #[error("normalization failed: {0}")]
    Normalize(String),
    #[error("illegal export transition {from:?} -> {to:?}")]
    InvalidTransition { from: ExportState, to: ExportState },
    /// None of the preferred formats is supported by any encoder backend.
    #[error("no encoder backend supports any of the requested formats")]
    NoEncoder,
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    /// The audio output has not been unlocked yet.
    #[error("audio output is locked until it is resumed")]
    AudioLocked,
}

impl MotifError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for MotifError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for MotifError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

//! Plan-defining inputs as a flat, URL-safe parameter set.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use url::{form_urlencoded, Url};

use crate::{
    mapping::{Key, MappingRules, Mode},
    timeline::{TimelineBuilder, TimelinePlan},
    MotifError, Result,
};

/// Longest input kept after sanitizing, in characters.
pub const MAX_INPUT_CHARS: usize = 120;

const TEXT_PUNCTUATION: &str = ".,!?'-/_:;&";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    #[default]
    Text,
    Date,
    Phone,
}

impl InputKind {
    fn allows(self, ch: char) -> bool {
        match self {
            InputKind::Text => {
                ch.is_ascii_alphanumeric() || ch == ' ' || TEXT_PUNCTUATION.contains(ch)
            }
            InputKind::Date => ch.is_ascii_digit() || matches!(ch, '-' | '/'),
            InputKind::Phone => ch.is_ascii_digit() || matches!(ch, '+' | '-' | ' ' | '(' | ')' | '.'),
        }
    }
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InputKind::Text => "text",
            InputKind::Date => "date",
            InputKind::Phone => "phone",
        })
    }
}

impl FromStr for InputKind {
    type Err = MotifError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(InputKind::Text),
            "date" => Ok(InputKind::Date),
            "phone" => Ok(InputKind::Phone),
            _ => Err(MotifError::msg(format!("unknown input kind `{s}`"))),
        }
    }
}

/// Keeps only the characters `kind` allows, maps other whitespace to a
/// space and caps the length.
pub fn sanitize_input(kind: InputKind, raw: &str) -> String {
    raw.chars()
        .map(|ch| if ch.is_whitespace() { ' ' } else { ch })
        .filter(|&ch| kind.allows(ch))
        .take(MAX_INPUT_CHARS)
        .collect()
}

/// Everything needed to rebuild a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareState {
    pub kind: InputKind,
    pub value: String,
    pub key: Key,
    pub mode: Mode,
}

impl ShareState {
    pub fn new(kind: InputKind, value: &str, rules: MappingRules) -> Self {
        Self {
            kind,
            value: sanitize_input(kind, value),
            key: rules.key,
            mode: rules.mode,
        }
    }

    pub fn rules(&self) -> MappingRules {
        MappingRules::new(self.key, self.mode)
    }

    pub fn to_query(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .append_pair("kind", &self.kind.to_string())
            .append_pair("value", &self.value)
            .append_pair("key", &self.key.to_string())
            .append_pair("mode", &self.mode.to_string())
            .finish()
    }

    /// Parses a query string, with or without the leading `?`. Missing or
    /// unreadable parameters keep their defaults; this never fails.
    pub fn from_query(query: &str) -> Self {
        let mut state = ShareState::default();
        let mut value = String::new();
        for (name, raw) in form_urlencoded::parse(query.trim_start_matches('?').as_bytes()) {
            match name.as_ref() {
                "kind" => state.kind = raw.parse().unwrap_or_default(),
                "value" => value = raw.into_owned(),
                "key" => state.key = raw.parse().unwrap_or_default(),
                "mode" => state.mode = raw.parse().unwrap_or_default(),
                other => tracing::debug!(parameter = other, "ignoring unknown share parameter"),
            }
        }
        state.value = sanitize_input(state.kind, &value);
        state
    }

    pub fn to_url(&self, base: &Url) -> Url {
        let mut url = base.clone();
        url.set_query(Some(&self.to_query()));
        url
    }

    pub fn from_url(url: &Url) -> Self {
        Self::from_query(url.query().unwrap_or_default())
    }

    /// Text handed to the timeline builder. Dates written `YYYY-MM-DD` are
    /// read in `MM/DD/YYYY` order.
    pub fn source_text(&self) -> String {
        match self.kind {
            InputKind::Date => reorder_iso_date(&self.value).unwrap_or_else(|| self.value.clone()),
            InputKind::Text | InputKind::Phone => self.value.clone(),
        }
    }

    pub fn build_plan(&self) -> TimelinePlan {
        TimelineBuilder::new(self.rules()).build(&self.source_text())
    }
}

fn reorder_iso_date(value: &str) -> Option<String> {
    let mut parts = value.split('-');
    let (year, month, day) = (parts.next()?, parts.next()?, parts.next()?);
    let digits = |part: &str, len: usize| part.len() == len && part.chars().all(|c| c.is_ascii_digit());
    if parts.next().is_some() || !digits(year, 4) || !digits(month, 2) || !digits(day, 2) {
        return None;
    }
    Some(format!("{month}/{day}/{year}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_round_trip_rebuilds_the_same_plan() {
        let states = [
            ShareState::new(InputKind::Text, "Hello, world & co!", MappingRules::default()),
            ShareState::new(InputKind::Date, "2024-12-25", MappingRules::new(Key::Eb, Mode::Minor)),
            ShareState::new(InputKind::Phone, "+1 (555) 867-5309", MappingRules::new(Key::Gb, Mode::Major)),
        ];
        for state in states {
            let decoded = ShareState::from_query(&state.to_query());
            assert_eq!(decoded, state);
            assert_eq!(decoded.build_plan(), state.build_plan());
        }
    }

    #[test]
    fn missing_and_unknown_parameters_use_defaults() {
        let state = ShareState::from_query("?value=hi&kind=poem&key=H&mode=lydian&extra=1");
        assert_eq!(state.kind, InputKind::Text);
        assert_eq!(state.value, "hi");
        assert_eq!(state.key, Key::C);
        assert_eq!(state.mode, Mode::Major);
        assert_eq!(ShareState::from_query(""), ShareState::default());
    }

    #[test]
    fn encodes_as_flat_parameters() {
        let state = ShareState::new(InputKind::Text, "a b&c", MappingRules::new(Key::Bb, Mode::Minor));
        assert_eq!(state.to_query(), "kind=text&value=a+b%26c&key=Bb&mode=minor");

        let base = Url::parse("https://example.com/play").unwrap();
        let url = state.to_url(&base);
        assert_eq!(url.path(), "/play");
        assert_eq!(ShareState::from_url(&url), state);
    }

    #[test]
    fn sanitizing_keeps_allowed_classes_only() {
        assert_eq!(sanitize_input(InputKind::Text, "héllo\twörld<>!"), "hllo wrld!");
        assert_eq!(sanitize_input(InputKind::Date, "2024-12-25T10:00"), "2024-12-251000");
        assert_eq!(sanitize_input(InputKind::Phone, "tel: +1 (555) 010"), " +1 (555) 010");
        assert_eq!(sanitize_input(InputKind::Text, &"x".repeat(500)).len(), MAX_INPUT_CHARS);
    }

    #[test]
    fn dates_are_read_month_first() {
        let date = ShareState::new(InputKind::Date, "2024-12-25", MappingRules::default());
        assert_eq!(date.source_text(), "12/25/2024");
        let written = ShareState::new(InputKind::Date, "12/25/2024", MappingRules::default());
        assert_eq!(written.source_text(), "12/25/2024");
        assert_eq!(date.build_plan(), written.build_plan());

        let odd = ShareState::new(InputKind::Date, "24-12-25", MappingRules::default());
        assert_eq!(odd.source_text(), "24-12-25");
    }
}

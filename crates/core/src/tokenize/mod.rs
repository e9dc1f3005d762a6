//! Splits sanitized input into the musical units the timeline builder reads.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenCategory {
    Letter,
    Digit,
    Symbol,
    Separator,
}

/// One character of input together with its classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub category: TokenCategory,
    pub raw: char,
    /// Character index within the input.
    pub position: usize,
}

impl TokenCategory {
    /// Classifies a single character. Total: anything that is not a letter,
    /// digit or separator is a symbol.
    pub fn of(ch: char) -> Self {
        if ch.is_ascii_alphabetic() {
            Self::Letter
        } else if ch.is_ascii_digit() {
            Self::Digit
        } else if ch.is_whitespace() || matches!(ch, '-' | '_' | '/') {
            Self::Separator
        } else {
            Self::Symbol
        }
    }
}

/// Produces exactly one token per character.
pub fn tokenize(input: &str) -> Vec<Token> {
    input
        .chars()
        .enumerate()
        .map(|(position, raw)| Token {
            category: TokenCategory::of(raw),
            raw,
            position,
        })
        .collect()
}

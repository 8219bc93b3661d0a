//! Character-based token estimates and hard truncation.
//!
//! A token is approximated as four characters. Truncation always produces
//! text whose own estimate fits the ceiling, so applying it twice with the
//! same ceiling is a no-op.

use serde::{Deserialize, Serialize};

pub const DEFAULT_FILE_TOKEN_LIMIT: usize = 15_000;
pub const DEFAULT_DOCUMENTS_TOKEN_LIMIT: usize = 20_000;
pub const DEFAULT_TOTAL_TOKEN_LIMIT: usize = 25_000;

const CHARS_PER_TOKEN: usize = 4;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Ceiling applied to each extracted file or context document.
    pub file_tokens: usize,
    /// Ceiling applied to the merged block of all extracted documents.
    pub documents_tokens: usize,
    /// Ceiling applied to the final user message text.
    pub total_tokens: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            file_tokens: DEFAULT_FILE_TOKEN_LIMIT,
            documents_tokens: DEFAULT_DOCUMENTS_TOKEN_LIMIT,
            total_tokens: DEFAULT_TOTAL_TOKEN_LIMIT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Truncation {
    pub content: String,
    pub truncated: bool,
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

pub fn truncate(text: &str, ceiling: usize) -> Truncation {
    let estimate = estimate_tokens(text);
    if estimate <= ceiling {
        return Truncation {
            content: text.to_string(),
            truncated: false,
        };
    }

    let marker =
        format!("\n\n[Content truncated: original was ~{estimate} tokens, limit {ceiling} tokens]");
    let max_chars = ceiling.saturating_mul(CHARS_PER_TOKEN);
    let marker_chars = marker.chars().count();

    let content = if marker_chars <= max_chars {
        let mut out = take_chars(text, max_chars - marker_chars);
        out.push_str(&marker);
        out
    } else {
        // The marker alone would blow the ceiling; keep the raw prefix.
        take_chars(text, max_chars)
    };

    Truncation {
        content,
        truncated: true,
    }
}

fn take_chars(text: &str, count: usize) -> String {
    match text.char_indices().nth(count) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

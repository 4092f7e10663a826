//! Canned answers for recognized prompts.
//!
//! The [`TemplateTable`] is immutable after construction. A lookup normalizes
//! the prompt, tries an exact match against the normalized keys, then scans
//! the keys in table order and returns the first one that equals, is
//! contained in, or contains the prompt. There is no relevance scoring beyond
//! "first qualifying key", so table order matters.
//!
//! Tables come from a YAML file ([`load_templates`]) or the built-in set
//! ([`TemplateTable::builtin`]).

mod loader;

use std::collections::HashMap;

use serde::Deserialize;
use tracing::warn;

use crate::config::ConfigError;

pub use loader::{BUILTIN_TEMPLATES, load_templates, parse_templates};

/// One `{prompt, response}` entry as written in the template file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TemplateEntry {
    pub prompt: String,
    pub response: String,
}

/// How a template lookup matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Fuzzy,
}

/// A successful template lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateHit<'a> {
    pub response: &'a str,
    pub kind: MatchKind,
}

/// Immutable normalized-prompt → response table.
#[derive(Debug, Clone, Default)]
pub struct TemplateTable {
    /// `(normalized key, response)` in scan order.
    entries: Vec<(String, String)>,
    /// Normalized key → position in `entries`.
    index: HashMap<String, usize>,
}

impl TemplateTable {
    /// A table that never matches.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in table used when no template file is configured.
    pub fn builtin() -> Self {
        // Built-in prompts are non-empty, so this cannot fail in practice
        let entries = BUILTIN_TEMPLATES
            .iter()
            .map(|(prompt, response)| TemplateEntry {
                prompt: (*prompt).to_string(),
                response: (*response).to_string(),
            })
            .collect();
        Self::from_entries(entries).unwrap_or_default()
    }

    /// Build a table from entries, keeping their order.
    ///
    /// Entries whose prompt normalizes to an empty string are rejected. When
    /// two entries normalize to the same key, the first one wins and a
    /// warning is logged.
    pub fn from_entries(entries: Vec<TemplateEntry>) -> Result<Self, ConfigError> {
        let mut table = Self::default();
        for (i, entry) in entries.into_iter().enumerate() {
            let key = normalize(&entry.prompt);
            if key.is_empty() {
                return Err(ConfigError::EmptyTemplatePrompt { index: i });
            }
            if table.index.contains_key(&key) {
                warn!(
                    index = i,
                    prompt = %entry.prompt,
                    "Duplicate template prompt after normalization, keeping first entry"
                );
                continue;
            }
            table.index.insert(key.clone(), table.entries.len());
            table.entries.push((key, entry.response));
        }
        Ok(table)
    }

    /// Look up a canned answer for `prompt`.
    ///
    /// Exact match on the normalized prompt beats any fuzzy match. An empty
    /// normalized prompt never matches.
    pub fn lookup(&self, prompt: &str) -> Option<TemplateHit<'_>> {
        let normalized = normalize(prompt);
        if normalized.is_empty() {
            return None;
        }

        if let Some(&i) = self.index.get(&normalized) {
            return Some(TemplateHit {
                response: &self.entries[i].1,
                kind: MatchKind::Exact,
            });
        }

        self.entries
            .iter()
            .find(|(key, _)| {
                *key == normalized
                    || normalized.contains(key.as_str())
                    || key.contains(normalized.as_str())
            })
            .map(|(_, response)| TemplateHit {
                response,
                kind: MatchKind::Fuzzy,
            })
    }

    /// Shorthand for `lookup(prompt).map(|hit| hit.response)`.
    pub fn find(&self, prompt: &str) -> Option<&str> {
        self.lookup(prompt).map(|hit| hit.response)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Normalize a prompt for matching.
///
/// Lowercases, collapses every whitespace run to a single space, trims, and
/// strips trailing punctuation (ASCII and common Unicode sentence marks).
pub fn normalize(prompt: &str) -> String {
    let lowered = prompt.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(|c: char| is_trailing_punctuation(c) || c.is_whitespace())
        .to_string()
}

fn is_trailing_punctuation(c: char) -> bool {
    c.is_ascii_punctuation() || matches!(c, '…' | '？' | '！' | '。' | '，' | '、' | '¿' | '¡')
}

//! Host-facing configuration and result types.

use crate::ast::TriggerId;
use crate::engine::ReplyMetrics;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_DEPTH: usize = 50;
pub const DEFAULT_PUNCTUATION: &str = "[.,!?;:]";

/// Texts returned in place of a reply when something goes wrong.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ErrorMessages {
    pub reply_not_matched: String,
    pub reply_not_found: String,
    pub object_not_found: String,
    pub deep_recursion: String,
}

impl Default for ErrorMessages {
    fn default() -> Self {
        ErrorMessages {
            reply_not_matched: "ERR: No Reply Matched".to_string(),
            reply_not_found: "ERR: No Reply Found".to_string(),
            object_not_found: "[ERR: Object Not Found]".to_string(),
            deep_recursion: "ERR: Deep Recursion Detected".to_string(),
        }
    }
}

/// Options that affect loading and replying.
///
/// # Example
/// ```
/// use rivebrain::Options;
///
/// let options = Options::from_toml_str("utf8 = true\ndepth = 20\n[errors]\nreply_not_matched = \"Huh?\"").unwrap();
/// assert!(options.utf8);
/// assert_eq!(options.depth, 20);
/// assert_eq!(options.errors.reply_not_matched, "Huh?");
/// assert_eq!(options.errors.reply_not_found, "ERR: No Reply Found");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Recursion limit for redirects, inline redirects and topic walks.
    pub depth: usize,
    /// Abort a load on the first syntax error instead of warning.
    pub strict: bool,
    /// Keep non-ASCII text in messages and triggers.
    pub utf8: bool,
    /// Allow uppercase topic names.
    pub force_case: bool,
    /// Characters stripped from messages in UTF-8 mode (a regex).
    pub unicode_punctuation: String,
    /// Seed for reply selection; random when unset.
    pub seed: Option<u64>,
    pub errors: ErrorMessages,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            depth: DEFAULT_DEPTH,
            strict: true,
            utf8: false,
            force_case: false,
            unicode_punctuation: DEFAULT_PUNCTUATION.to_string(),
            seed: None,
            errors: ErrorMessages::default(),
        }
    }
}

impl Options {
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// Result from [`Brain::reply_verbose`](crate::Brain::reply_verbose).
#[derive(Debug, Clone)]
pub struct ReplyDetails {
    /// The reply text.
    pub text: String,
    /// The message as it was matched (lowercased, substituted, stripped).
    pub message: String,
    pub topic_before: String,
    pub topic_after: String,
    /// First trigger matched for this message.
    pub initial_match: Option<String>,
    /// Last trigger matched (differs from `initial_match` after redirects).
    pub last_match: Option<String>,
    /// Stars captured by the first match.
    pub stars: Vec<String>,
    pub triggers: Vec<TriggerId>,
    pub elapsed: Duration,
    pub metrics: ReplyMetrics,
}

//! Reply run metrics.
//!
//! Small structs for observing what a reply did: one [`StepMetrics`] per
//! resolution step (the top-level message, the BEGIN pass, every redirect
//! hop), plus the total wall time.
//!
//! The intended usage is:
//!
//! - `Brain::reply` for normal operation (metrics are collected but dropped).
//! - `Brain::reply_verbose` for debugging content: which topic was searched,
//!   how many candidates were tried, what matched.
//!
//! ## Design notes
//!
//! - `search` covers only the trigger scan of a step, not the tag expansion
//!   or nested steps it triggers.

use std::time::Duration;

/// Which pass of the reply a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// The BEGIN block's `request` pass.
    Begin,
    Normal,
}

#[derive(Debug, Clone)]
pub struct StepMetrics {
    /// Recursion depth, 0 for the top-level message.
    pub depth: usize,
    pub kind: StepKind,
    /// Message as matched (normalized).
    pub message: String,
    /// Topic whose sorted list was searched.
    pub topic: String,
    /// Candidate patterns tried before a match (or all of them).
    pub candidates: usize,
    /// Pattern that matched, if any.
    pub matched: Option<String>,
    /// Whether the match came from a `%Previous` trigger.
    pub via_previous: bool,
    /// Time spent scanning candidates.
    pub search: Duration,
}

#[derive(Debug, Default, Clone)]
pub struct ReplyMetrics {
    /// Total elapsed time for the reply, session I/O included.
    pub total: Duration,
    pub steps: Vec<StepMetrics>,
}

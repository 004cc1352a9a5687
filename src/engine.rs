//! Matching and reply engine.
//!
//! This module is the *public entry point* for the engine: [`Brain`] owns the
//! loaded content and answers messages. The work is split into focused
//! submodules under `src/engine/` while the public paths stay at
//! `crate::engine::*`.
//!
//! ## How the parts work together
//!
//! Loading and sorting happen once; replying runs per message:
//!
//! ```text
//! Document ── Brain::load ──┬─ syntax checks (pattern.rs)
//!                           ├─ objects → ObjectHandler::load
//!                           ├─ begin block → subs/person/arrays/vars
//!                           └─ topics merged, PreviousIndex (compiled.rs)
//!                                         │
//!                     Brain::sort_replies │
//!                                         v
//!                    TopicGraph (topics.rs) ─▶ sort_triggers (sorting.rs)
//!                                         │
//!                                         v
//!                                    SortBuffers
//!
//! message ── format_message (substitute.rs, text.rs)
//!                │
//!                v
//!           get_reply (brain.rs)
//!             - BEGIN "request" pass
//!             - %Previous scan, then sorted scan
//!             - compile(pattern) → Matcher → stars (pattern.rs)
//!             - redirect / conditions / weighted choice
//!                │
//!                v
//!           process_tags (tags.rs) ─▶ <call> → ObjectHandler::call
//!                │
//!                v
//!           history + last match → SessionStore
//! ```
//!
//! ## Responsibilities by module
//!
//! - `brain.rs`: the `Brain` itself, loading, the host API and the reply
//!   resolution loop.
//! - `pattern.rs`: trigger syntax checks and compilation of a trigger into an
//!   exact or regex matcher, with a bounded regex cache.
//! - `sorting.rs`: specificity order of triggers within a topic.
//! - `topics.rs`: `includes`/`inherits` resolution into an ordered trigger
//!   list per topic.
//! - `compiled.rs`: sort buffers built from the above, and the `%Previous`
//!   lookup index.
//! - `substitute.rs`: phrase substitution tables (`sub` and `person`).
//! - `tags.rs`: reply template expansion.
//! - `text.rs`: small text helpers shared by the rest.
//! - `metrics.rs`: per-step observations for `reply_verbose`.
//!
//! ## Debugging
//!
//! Everything logs through `tracing`: match decisions at `debug`, candidate
//! level detail at `trace`, content problems (bad weights, missing arrays,
//! unknown objects) at `warn`.

#[path = "engine/brain.rs"]
mod brain;
#[path = "engine/compiled.rs"]
mod compiled;
#[path = "engine/metrics.rs"]
mod metrics;
#[path = "engine/pattern.rs"]
mod pattern;
#[path = "engine/sorting.rs"]
mod sorting;
#[path = "engine/substitute.rs"]
mod substitute;
#[path = "engine/tags.rs"]
mod tags;
#[path = "engine/text.rs"]
mod text;
#[path = "engine/topics.rs"]
mod topics;


#[allow(unused_imports)]
pub use brain::Brain;
#[allow(unused_imports)]
pub use metrics::{ReplyMetrics, StepKind, StepMetrics};
#[allow(unused_imports)]
pub use substitute::SubstitutionTable;

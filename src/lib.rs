//! A rule-based conversational engine.
//!
//! Content is authored as topics of triggers (patterns with wildcards,
//! alternatives, optionals and arrays) and reply templates. The [`Brain`]
//! loads that content as a [`Document`], sorts every topic's triggers from most
//! to least specific, and answers each message with the first trigger that
//! matches it in the user's current topic.
//!
//! ```
//! use rivebrain::{Brain, Document, Options, Trigger};
//!
//! # tokio_test_block(async {
//! let mut brain = Brain::new(Options::default());
//! let document = Document::new()
//!     .trigger(Trigger::new("hello bot").reply("Hello, human!"))
//!     .trigger(Trigger::new("my name is *").reply("<set name=<formal>>Nice to meet you, <get name>."));
//! brain.load(document).await?;
//! brain.sort_replies();
//!
//! assert_eq!(brain.reply("alice", "Hello bot").await?, "Hello, human!");
//! assert_eq!(brain.reply("alice", "my name is alice").await?, "Nice to meet you, Alice.");
//! # Ok::<(), rivebrain::Error>(())
//! # }).unwrap();
//! # fn tokio_test_block<F: std::future::Future>(future: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(future)
//! # }
//! ```
//!
//! Per-user state (variables, topic, history) lives behind the
//! [`SessionStore`] trait; [`MemorySessionStore`] is the default. `<call>`
//! tags run object macros through [`ObjectHandler`]s registered per language.

#[macro_use]
mod macros;
mod api;
mod ast;
mod engine;
mod error;
mod objects;
mod session;

pub use api::{DEFAULT_DEPTH, DEFAULT_PUNCTUATION, ErrorMessages, Options, ReplyDetails};
pub use ast::{BEGIN_TOPIC, Begin, DEFAULT_TOPIC, Document, ObjectMacro, Topic, Trigger, TriggerId, UNDEF};
pub use engine::{Brain, ReplyMetrics, StepKind, StepMetrics, SubstitutionTable};
pub use error::{Error, LoadError, MacroError, Result, SessionError};
pub use objects::{FunctionHandler, MacroCall, ObjectHandler, RUST_LANGUAGE, Scope, Subroutine};
pub use session::{
    HISTORY_LEN, History, MemorySessionStore, NullSessionStore, SessionPatch, SessionStore, ThawAction, UNDEFINED,
    UserData,
};

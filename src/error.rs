//! Error types.
//!
//! Nothing a *user* types can make [`Brain::reply`](crate::Brain::reply) fail:
//! match failures, math mistakes and macro problems all come back as bracketed
//! text inside the reply. The variants here cover the host's side of the
//! contract: loading bad content, replying before sorting, and session store
//! failures.

/// Top-level error for host-facing calls.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `reply` was called before `sort_replies` (or after a `load` that was not
    /// followed by a new sort).
    #[error("replies are not sorted; call sort_replies() after loading")]
    NotSorted,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("invalid options: {0}")]
    Config(#[from] toml::de::Error),

    #[error("invalid document: {0}")]
    Document(#[from] serde_json::Error),
}

/// Problems found while loading a [`Document`](crate::Document).
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("syntax error in topic '{topic}' at `{pattern}`: {message}")]
    Syntax { topic: String, pattern: String, message: String },

    #[error("object '{name}' ({language}) failed to load: {source}")]
    ObjectLoad {
        name: String,
        language: String,
        #[source]
        source: MacroError,
    },
}

/// Session store failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no session data for user '{0}'")]
    UserNotFound(String),

    #[error("user '{0}' has no frozen variables")]
    NoFrozenSnapshot(String),

    /// Free-form failure from a remote backend.
    #[error("session backend error: {0}")]
    Backend(String),
}

/// Failure reported by an object macro handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MacroError {
    #[error("{0}")]
    Failed(String),
}

impl MacroError {
    pub fn new(message: impl Into<String>) -> Self {
        MacroError::Failed(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

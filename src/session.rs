//! Per-user session storage.
//!
//! The brain never keeps user state itself; everything a user accumulates
//! (variables, current topic, history, match bookkeeping) goes through a
//! [`SessionStore`]. Stores are async so a backend can live behind a network
//! hop; the bundled [`MemorySessionStore`] just guards a map.
//!
//! Writes are merge-patches ([`SessionPatch`]): keys the patch does not mention
//! are left alone. A user's data is only ever replaced wholesale by
//! [`SessionStore::reset`] or a thaw.

use crate::ast::{DEFAULT_TOPIC, TriggerId};
use crate::error::SessionError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Value reported for anything that has never been set.
pub const UNDEFINED: &str = "undefined";
/// Entries kept in each history ring.
pub const HISTORY_LEN: usize = 10;

// --- Data --------------------------------------------------------------------

/// Recent inputs and replies, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub input: Vec<String>,
    pub reply: Vec<String>,
}

impl Default for History {
    fn default() -> Self {
        History { input: vec![UNDEFINED.to_string(); HISTORY_LEN], reply: vec![UNDEFINED.to_string(); HISTORY_LEN] }
    }
}

impl History {
    pub fn push(&mut self, input: impl Into<String>, reply: impl Into<String>) {
        self.input.insert(0, input.into());
        self.reply.insert(0, reply.into());
        self.input.truncate(HISTORY_LEN);
        self.reply.truncate(HISTORY_LEN);
    }

    /// `n`-th most recent input, 1-based.
    pub fn input(&self, n: usize) -> &str {
        n.checked_sub(1).and_then(|i| self.input.get(i)).map(String::as_str).unwrap_or(UNDEFINED)
    }

    /// `n`-th most recent reply, 1-based.
    pub fn reply(&self, n: usize) -> &str {
        n.checked_sub(1).and_then(|i| self.reply.get(i)).map(String::as_str).unwrap_or(UNDEFINED)
    }
}

/// Everything stored for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    /// User variables, including the reserved `topic`.
    pub vars: BTreeMap<String, String>,
    pub history: History,
    pub last_match: Option<String>,
    pub initial_match: Option<String>,
    pub last_triggers: Vec<TriggerId>,
}

impl Default for UserData {
    fn default() -> Self {
        let mut vars = BTreeMap::new();
        vars.insert("topic".to_string(), DEFAULT_TOPIC.to_string());
        UserData {
            vars,
            history: History::default(),
            last_match: None,
            initial_match: None,
            last_triggers: Vec::new(),
        }
    }
}

impl UserData {
    /// Variable value, `"undefined"` when unset.
    pub fn var(&self, name: &str) -> &str {
        self.vars.get(name).map(String::as_str).unwrap_or(UNDEFINED)
    }

    pub fn topic(&self) -> &str {
        self.vars.get("topic").map(String::as_str).unwrap_or(DEFAULT_TOPIC)
    }

    pub fn apply(&mut self, patch: SessionPatch) {
        for (name, value) in patch.vars {
            match value {
                Some(value) => {
                    self.vars.insert(name, value);
                }
                None => {
                    self.vars.remove(&name);
                }
            }
        }
        if let Some(history) = patch.history {
            self.history = history;
        }
        if let Some(last_match) = patch.last_match {
            self.last_match = last_match;
        }
        if let Some(initial_match) = patch.initial_match {
            self.initial_match = initial_match;
        }
        if let Some(last_triggers) = patch.last_triggers {
            self.last_triggers = last_triggers;
        }
    }
}

/// Partial update for one user. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    /// `Some(value)` sets, `None` deletes.
    pub vars: BTreeMap<String, Option<String>>,
    pub history: Option<History>,
    pub last_match: Option<Option<String>>,
    pub initial_match: Option<Option<String>>,
    pub last_triggers: Option<Vec<TriggerId>>,
}

impl SessionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), Some(value.into()));
        self
    }

    pub fn unset(mut self, name: impl Into<String>) -> Self {
        self.vars.insert(name.into(), None);
        self
    }

    pub fn history(mut self, history: History) -> Self {
        self.history = Some(history);
        self
    }
}

/// What to do with a frozen snapshot when thawing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThawAction {
    /// Restore the snapshot and forget it.
    #[default]
    Thaw,
    /// Forget the snapshot without restoring.
    Discard,
    /// Restore the snapshot and keep it for another thaw.
    Keep,
}

// --- Store contract ----------------------------------------------------------

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Merge `patch` into the user's data, creating the user if needed.
    async fn set(&self, user: &str, patch: SessionPatch) -> Result<(), SessionError>;

    /// One variable. `None` for an unknown user, `Some("undefined")` for an
    /// unset key.
    async fn get(&self, user: &str, key: &str) -> Result<Option<String>, SessionError>;

    async fn get_any(&self, user: &str) -> Result<Option<UserData>, SessionError>;

    async fn get_all(&self) -> Result<HashMap<String, UserData>, SessionError>;

    async fn reset(&self, user: &str) -> Result<(), SessionError>;

    async fn reset_all(&self) -> Result<(), SessionError>;

    /// Snapshot the user's data. Fails for unknown users.
    async fn freeze(&self, user: &str) -> Result<(), SessionError>;

    /// Apply `action` to the user's snapshot. Fails when there is none.
    async fn thaw(&self, user: &str, action: ThawAction) -> Result<(), SessionError>;
}

// --- In-memory store ---------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<String, UserData>,
    frozen: HashMap<String, UserData>,
}

/// Default store: everything in a process-local map.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    state: Mutex<MemoryState>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn set(&self, user: &str, patch: SessionPatch) -> Result<(), SessionError> {
        self.state.lock().users.entry(user.to_string()).or_default().apply(patch);
        Ok(())
    }

    async fn get(&self, user: &str, key: &str) -> Result<Option<String>, SessionError> {
        Ok(self.state.lock().users.get(user).map(|data| data.var(key).to_string()))
    }

    async fn get_any(&self, user: &str) -> Result<Option<UserData>, SessionError> {
        Ok(self.state.lock().users.get(user).cloned())
    }

    async fn get_all(&self) -> Result<HashMap<String, UserData>, SessionError> {
        Ok(self.state.lock().users.clone())
    }

    async fn reset(&self, user: &str) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        state.users.remove(user);
        state.frozen.remove(user);
        Ok(())
    }

    async fn reset_all(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        state.users.clear();
        state.frozen.clear();
        Ok(())
    }

    async fn freeze(&self, user: &str) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        let snapshot = state.users.get(user).cloned().ok_or_else(|| SessionError::UserNotFound(user.to_string()))?;
        state.frozen.insert(user.to_string(), snapshot);
        Ok(())
    }

    async fn thaw(&self, user: &str, action: ThawAction) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        let snapshot = match action {
            ThawAction::Keep => state.frozen.get(user).cloned(),
            ThawAction::Thaw | ThawAction::Discard => state.frozen.remove(user),
        }
        .ok_or_else(|| SessionError::NoFrozenSnapshot(user.to_string()))?;

        if action != ThawAction::Discard {
            state.users.insert(user.to_string(), snapshot);
        }
        Ok(())
    }
}

// --- Null store --------------------------------------------------------------

/// Remembers nothing: every user looks brand new on every read.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSessionStore;

#[async_trait]
impl SessionStore for NullSessionStore {
    async fn set(&self, _user: &str, _patch: SessionPatch) -> Result<(), SessionError> {
        Ok(())
    }

    async fn get(&self, _user: &str, _key: &str) -> Result<Option<String>, SessionError> {
        Ok(None)
    }

    async fn get_any(&self, _user: &str) -> Result<Option<UserData>, SessionError> {
        Ok(None)
    }

    async fn get_all(&self) -> Result<HashMap<String, UserData>, SessionError> {
        Ok(HashMap::new())
    }

    async fn reset(&self, _user: &str) -> Result<(), SessionError> {
        Ok(())
    }

    async fn reset_all(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn freeze(&self, _user: &str) -> Result<(), SessionError> {
        Ok(())
    }

    async fn thaw(&self, _user: &str, _action: ThawAction) -> Result<(), SessionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_newest_first_and_bounded() {
        let mut history = History::default();
        assert_eq!(history.input(1), UNDEFINED);
        for i in 0..12 {
            history.push(format!("in {i}"), format!("out {i}"));
        }
        assert_eq!(history.input.len(), HISTORY_LEN);
        assert_eq!(history.input(1), "in 11");
        assert_eq!(history.reply(2), "out 10");
        assert_eq!(history.input(0), UNDEFINED);
        assert_eq!(history.input(11), UNDEFINED);
    }

    #[tokio::test]
    async fn memory_store_merges_patches() {
        let store = MemorySessionStore::new();
        assert_eq!(store.get("alice", "name").await.unwrap(), None);

        store.set("alice", SessionPatch::new().var("name", "Alice")).await.unwrap();
        store.set("alice", SessionPatch::new().var("age", "30")).await.unwrap();

        assert_eq!(store.get("alice", "name").await.unwrap().as_deref(), Some("Alice"));
        assert_eq!(store.get("alice", "age").await.unwrap().as_deref(), Some("30"));
        assert_eq!(store.get("alice", "color").await.unwrap().as_deref(), Some(UNDEFINED));
        assert_eq!(store.get("alice", "topic").await.unwrap().as_deref(), Some("random"));

        store.set("alice", SessionPatch::new().unset("age")).await.unwrap();
        assert_eq!(store.get("alice", "age").await.unwrap().as_deref(), Some(UNDEFINED));
    }

    #[tokio::test]
    async fn reset_forgets_user_and_snapshot() {
        let store = MemorySessionStore::new();
        store.set("bob", SessionPatch::new().var("x", "1")).await.unwrap();
        store.set("carol", SessionPatch::new().var("x", "2")).await.unwrap();
        store.freeze("bob").await.unwrap();

        store.reset("bob").await.unwrap();
        assert_eq!(store.get_any("bob").await.unwrap(), None);
        assert!(matches!(store.thaw("bob", ThawAction::Thaw).await, Err(SessionError::NoFrozenSnapshot(_))));
        assert_eq!(store.get_all().await.unwrap().len(), 1);

        store.reset_all().await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn freeze_and_thaw_actions() {
        let store = MemorySessionStore::new();
        assert!(matches!(store.freeze("dave").await, Err(SessionError::UserNotFound(_))));

        store.set("dave", SessionPatch::new().var("mood", "happy")).await.unwrap();
        store.freeze("dave").await.unwrap();

        store.set("dave", SessionPatch::new().var("mood", "sad")).await.unwrap();
        store.thaw("dave", ThawAction::Keep).await.unwrap();
        assert_eq!(store.get("dave", "mood").await.unwrap().as_deref(), Some("happy"));

        store.set("dave", SessionPatch::new().var("mood", "sad")).await.unwrap();
        store.thaw("dave", ThawAction::Discard).await.unwrap();
        assert_eq!(store.get("dave", "mood").await.unwrap().as_deref(), Some("sad"));
        assert!(store.thaw("dave", ThawAction::Thaw).await.is_err());

        store.freeze("dave").await.unwrap();
        store.set("dave", SessionPatch::new().var("mood", "angry")).await.unwrap();
        store.thaw("dave", ThawAction::Thaw).await.unwrap();
        assert_eq!(store.get("dave", "mood").await.unwrap().as_deref(), Some("sad"));
        assert!(store.thaw("dave", ThawAction::Keep).await.is_err());
    }

    #[tokio::test]
    async fn null_store_remembers_nothing() {
        let store = NullSessionStore;
        store.set("erin", SessionPatch::new().var("name", "Erin")).await.unwrap();
        assert_eq!(store.get("erin", "name").await.unwrap(), None);
        assert_eq!(store.get_any("erin").await.unwrap(), None);
    }
}

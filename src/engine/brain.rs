//! Reply resolution.
//!
//! This module is the operational core of the engine:
//!
//! - Own all loaded content (topics, substitutions, arrays, bot variables) and
//!   the derived sort buffers (see `compiled.rs`).
//! - For each message, normalize it, find the first matching trigger in the
//!   user's topic and turn that trigger into text: redirects, conditions,
//!   weighted reply choice, then tag expansion (see `tags.rs`).
//! - Record what matched in the user's session once per top-level call.
//!
//! ## Pass structure
//!
//! ```text
//! (0) normalize            -> lowercase, `sub`, strip punctuation
//! (1) BEGIN pass           -> "request" in __begin__; {ok} splices (2) in
//! (2) %Previous scan       -> depth 0 only, whole topic tree
//! (3) ordinary scan        -> user's topic, sorted order
//! (4) redirect/conditions  -> may recurse into (2)/(3) at depth + 1
//! (5) tag expansion        -> may recurse via {@...}
//! (6) history + bookkeeping
//! ```
//!
//! ## Concurrency
//!
//! Replies for the same user are serialized by a per-user async mutex held for
//! the whole call, so two messages from one user cannot interleave their
//! session reads and writes. Different users never wait on each other.
//! Shared tables that tags can write (`<bot>`, `<env>`) sit behind
//! `parking_lot` locks that are never held across an `.await`.
//!
//! Object handlers receive `&Brain` and may read or write user variables, but
//! must not call `reply` for the user they are serving: that user's mutex is
//! already held.

use super::compiled::{PreviousIndex, SortBuffers};
use super::metrics::{ReplyMetrics, StepKind, StepMetrics};
use super::pattern::{PatternScope, RegexCache, check_condition, check_topic_name, check_trigger, compile};
use super::sorting::weight_of;
use super::substitute::SubstitutionTable;
use super::tags::{TAG_LIMIT, find};
use super::text::{collapse_whitespace, parse_leading_int, strip_nasties};
use super::topics::TopicGraph;
use crate::api::{DEFAULT_PUNCTUATION, Options, ReplyDetails};
use crate::ast::{BEGIN_TOPIC, DEFAULT_TOPIC, Document, Topic, Trigger, TriggerId, UNDEF};
use crate::error::{Error, LoadError, MacroError, Result};
use crate::objects::{FunctionHandler, MacroCall, ObjectHandler, RUST_LANGUAGE, Scope};
use crate::session::{MemorySessionStore, SessionPatch, SessionStore, ThawAction, UNDEFINED, UserData};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Per-call bookkeeping carried through recursion.
pub(crate) struct ReplyContext {
    pub user: String,
    pub scope: Option<Scope>,
    pub last_match: Option<String>,
    pub initial_match: Option<String>,
    pub last_triggers: Vec<TriggerId>,
    /// Stars of the first ordinary match.
    pub stars: Option<Vec<String>>,
    pub steps: Vec<StepMetrics>,
}

impl ReplyContext {
    fn new(user: &str, scope: Option<Scope>) -> Self {
        ReplyContext {
            user: user.to_string(),
            scope,
            last_match: None,
            initial_match: None,
            last_triggers: Vec::new(),
            stars: None,
            steps: Vec::new(),
        }
    }
}

/// A trigger that matched, with what it captured.
struct Found {
    id: TriggerId,
    stars: Vec<String>,
    botstars: Vec<String>,
    via_previous: bool,
}

/// The chatbot engine: loaded content plus everything needed to answer.
///
/// Usage: create with [`Brain::new`], [`load`](Brain::load) one or more
/// documents, call [`sort_replies`](Brain::sort_replies), then
/// [`reply`](Brain::reply).
///
/// ```text
/// load() ─▶ sort_replies() ─▶ reply()
///   │            └─ topic graph + sorter per topic
///   └─ syntax check, objects, begin block, topics
/// ```
pub struct Brain {
    pub(crate) options: Options,
    /// Recursion limit; `options.depth` unless a document's `global depth` overrides it.
    pub(crate) depth: usize,
    pub(crate) topics: BTreeMap<String, Topic>,
    pub(crate) previous: PreviousIndex,
    pub(crate) sorted: Option<SortBuffers>,
    pub(crate) subs: SubstitutionTable,
    pub(crate) person: SubstitutionTable,
    pub(crate) arrays: HashMap<String, Vec<String>>,
    pub(crate) vars: RwLock<HashMap<String, String>>,
    pub(crate) globals: RwLock<HashMap<String, String>>,
    pub(crate) handlers: HashMap<String, Arc<dyn ObjectHandler>>,
    pub(crate) functions: Arc<FunctionHandler>,
    /// Object name → language.
    pub(crate) object_languages: HashMap<String, String>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) regexes: RegexCache,
    pub(crate) punctuation: Regex,
    pub(crate) rng: Mutex<StdRng>,
    pub(crate) user_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for Brain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Brain")
            .field("options", &self.options)
            .field("depth", &self.depth)
            .field("topics", &self.topics.keys().collect::<Vec<_>>())
            .field("sorted", &self.sorted.is_some())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for Brain {
    fn default() -> Self {
        Brain::new(Options::default())
    }
}

impl Brain {
    /// Create an empty brain with an in-memory session store.
    pub fn new(options: Options) -> Self {
        Brain::with_session_store(options, Arc::new(MemorySessionStore::new()))
    }

    pub fn with_session_store(options: Options, sessions: Arc<dyn SessionStore>) -> Self {
        let punctuation = Regex::new(&options.unicode_punctuation).unwrap_or_else(|err| {
            let pattern = &options.unicode_punctuation;
            warn!(%pattern, %err, fallback = DEFAULT_PUNCTUATION, "invalid unicode_punctuation");
            regex!("[.,!?;:]").clone()
        });
        let rng = options.seed.map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);

        let functions = Arc::new(FunctionHandler::new());
        let mut handlers: HashMap<String, Arc<dyn ObjectHandler>> = HashMap::new();
        handlers.insert(RUST_LANGUAGE.to_string(), functions.clone());

        Brain {
            depth: options.depth,
            options,
            topics: BTreeMap::new(),
            previous: PreviousIndex::default(),
            sorted: None,
            subs: SubstitutionTable::new(),
            person: SubstitutionTable::new(),
            arrays: HashMap::new(),
            vars: RwLock::new(HashMap::new()),
            globals: RwLock::new(HashMap::new()),
            handlers,
            functions,
            object_languages: HashMap::new(),
            sessions,
            regexes: RegexCache::default(),
            punctuation,
            rng: Mutex::new(rng),
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    // --- Loading -------------------------------------------------------------

    /// Load a document.
    ///
    /// Syntax is checked first: in strict mode the first problem aborts the
    /// load before anything is applied; otherwise problems are logged and the
    /// content loads anyway. Loading drops the sort buffers, so
    /// [`sort_replies`](Brain::sort_replies) must run again before replying.
    pub async fn load(&mut self, document: Document) -> Result<()> {
        for problem in self.check_document(&document) {
            if self.options.strict {
                return Err(problem.into());
            }
            warn!(error = %problem, "syntax error");
        }

        for object in &document.objects {
            let Some(handler) = self.handlers.get(&object.language) else {
                warn!(object = %object.name, language = %object.language, "no handler for object language");
                continue;
            };
            match handler.load(&object.name, &object.code).await {
                Ok(()) => {
                    self.object_languages.insert(object.name.clone(), object.language.clone());
                }
                Err(source) if self.options.strict => {
                    return Err(LoadError::ObjectLoad {
                        name: object.name.clone(),
                        language: object.language.clone(),
                        source,
                    }
                    .into());
                }
                Err(err) => warn!(object = %object.name, language = %object.language, %err, "object failed to load"),
            }
        }

        let begin = document.begin;
        for (name, value) in begin.global {
            if name == "depth" {
                let depth = parse_leading_int(&value).and_then(|d| usize::try_from(d).ok());
                self.depth = depth.unwrap_or(self.options.depth);
                debug!(depth = self.depth, "recursion depth set");
            }
            apply_define(self.globals.get_mut(), name, value);
        }
        for (name, value) in begin.var {
            apply_define(self.vars.get_mut(), name, value);
        }
        for (phrase, replacement) in begin.sub {
            let replacement = (replacement != UNDEF).then_some(replacement);
            self.set_substitution(&phrase, replacement.as_deref());
        }
        for (phrase, replacement) in begin.person {
            let replacement = (replacement != UNDEF).then_some(replacement);
            self.set_person(&phrase, replacement.as_deref());
        }
        for (name, items) in begin.array {
            let items = (items.iter().any(|item| item != UNDEF)).then_some(items);
            self.set_array(&name, items);
        }

        for topic in document.topics {
            match self.topics.get_mut(&topic.name) {
                Some(existing) => existing.merge(topic),
                None => {
                    self.topics.insert(topic.name.clone(), topic);
                }
            }
        }
        self.previous = PreviousIndex::build(&self.topics);
        self.sorted = None;
        Ok(())
    }

    /// Parse a JSON document and load it.
    pub async fn load_json(&mut self, json: &str) -> Result<()> {
        self.load(Document::from_json_str(json)?).await
    }

    fn check_document(&self, document: &Document) -> Vec<LoadError> {
        let utf8 = self.options.utf8;
        let mut problems = Vec::new();
        let mut report = |topic: &str, pattern: &str, message: String| {
            problems.push(LoadError::Syntax { topic: topic.to_string(), pattern: pattern.to_string(), message });
        };

        for topic in &document.topics {
            if topic.name != BEGIN_TOPIC {
                if let Err(message) = check_topic_name(&topic.name, self.options.force_case) {
                    report(&topic.name, &topic.name, message);
                }
            }
            for trigger in &topic.triggers {
                let patterns = std::iter::once(&trigger.pattern).chain(&trigger.previous).chain(&trigger.redirect);
                for pattern in patterns {
                    if let Err(message) = check_trigger(pattern, utf8) {
                        report(&topic.name, pattern, message);
                    }
                }
                for condition in &trigger.conditions {
                    if let Err(message) = check_condition(condition) {
                        report(&topic.name, condition, message);
                    }
                }
            }
        }
        problems
    }

    /// Build the per-topic trial order. Must run after loading and before
    /// replying.
    pub fn sort_replies(&mut self) {
        let buffers = SortBuffers::build(&self.topics, &self.previous, self.depth);
        debug!(topics = buffers.topics.len(), "sorted replies");
        self.sorted = Some(buffers);
    }

    /// Patterns of `topic` in the order they are tried.
    pub fn sorted_patterns(&self, topic: &str) -> Option<Vec<&str>> {
        let sorted = self.sorted.as_ref()?.topics.get(topic)?;
        Some(sorted.iter().map(|entry| entry.pattern.as_str()).collect())
    }

    pub fn trigger(&self, id: &TriggerId) -> Option<&Trigger> {
        self.topics.get(&id.topic)?.triggers.get(id.index)
    }

    pub fn topic_names(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    // --- Objects -------------------------------------------------------------

    /// Register (or with `None`, remove) the handler for an object language.
    pub fn set_handler(&mut self, language: &str, handler: Option<Arc<dyn ObjectHandler>>) {
        match handler {
            Some(handler) => {
                self.handlers.insert(language.to_string(), handler);
            }
            None => {
                self.handlers.remove(language);
            }
        }
    }

    /// Register a native macro callable as `<call>name ...</call>`.
    pub fn set_subroutine<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&MacroCall<'_>) -> std::result::Result<String, MacroError> + Send + Sync + 'static,
    {
        self.functions.insert(name, Arc::new(function));
        self.object_languages.insert(name.to_string(), RUST_LANGUAGE.to_string());
    }

    // --- Bot tables ----------------------------------------------------------

    /// Set (or with `None`, delete) a bot variable.
    pub fn set_variable(&self, name: &str, value: Option<&str>) {
        set_or_remove(&mut self.vars.write(), name, value);
    }

    pub fn variable(&self, name: &str) -> Option<String> {
        self.vars.read().get(name).cloned()
    }

    /// Set (or with `None`, delete) a global variable.
    pub fn set_global(&self, name: &str, value: Option<&str>) {
        set_or_remove(&mut self.globals.write(), name, value);
    }

    pub fn global(&self, name: &str) -> Option<String> {
        self.globals.read().get(name).cloned()
    }

    pub fn set_substitution(&mut self, phrase: &str, replacement: Option<&str>) {
        match replacement {
            Some(replacement) => self.subs.insert(phrase, replacement),
            None => {
                self.subs.remove(phrase);
            }
        }
    }

    pub fn set_person(&mut self, phrase: &str, replacement: Option<&str>) {
        match replacement {
            Some(replacement) => self.person.insert(phrase, replacement),
            None => {
                self.person.remove(phrase);
            }
        }
    }

    pub fn set_array(&mut self, name: &str, items: Option<Vec<String>>) {
        match items {
            Some(items) => {
                self.arrays.insert(name.to_string(), items);
            }
            None => {
                self.arrays.remove(name);
            }
        }
    }

    pub fn substitutions(&self) -> &SubstitutionTable {
        &self.subs
    }

    pub fn person_substitutions(&self) -> &SubstitutionTable {
        &self.person
    }

    // --- User variables ------------------------------------------------------

    pub async fn set_uservar(&self, user: &str, name: &str, value: &str) -> Result<()> {
        Ok(self.sessions.set(user, SessionPatch::new().var(name, value)).await?)
    }

    pub async fn set_uservars<I, K, V>(&self, user: &str, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let patch = vars.into_iter().fold(SessionPatch::new(), |patch, (k, v)| patch.var(k, v));
        Ok(self.sessions.set(user, patch).await?)
    }

    /// `None` for an unknown user, `Some("undefined")` for an unset variable.
    pub async fn uservar(&self, user: &str, name: &str) -> Result<Option<String>> {
        Ok(self.sessions.get(user, name).await?)
    }

    pub async fn uservars(&self, user: &str) -> Result<Option<UserData>> {
        Ok(self.sessions.get_any(user).await?)
    }

    pub async fn all_uservars(&self) -> Result<HashMap<String, UserData>> {
        Ok(self.sessions.get_all().await?)
    }

    pub async fn clear_uservars(&self, user: &str) -> Result<()> {
        Ok(self.sessions.reset(user).await?)
    }

    pub async fn clear_all_uservars(&self) -> Result<()> {
        Ok(self.sessions.reset_all().await?)
    }

    pub async fn freeze_uservars(&self, user: &str) -> Result<()> {
        Ok(self.sessions.freeze(user).await?)
    }

    pub async fn thaw_uservars(&self, user: &str, action: ThawAction) -> Result<()> {
        Ok(self.sessions.thaw(user, action).await?)
    }

    /// Trigger pattern matched last (after redirects) for the user.
    pub async fn last_match(&self, user: &str) -> Result<Option<String>> {
        Ok(self.sessions.get_any(user).await?.and_then(|data| data.last_match))
    }

    /// Trigger pattern first matched by the user's most recent message.
    pub async fn initial_match(&self, user: &str) -> Result<Option<String>> {
        Ok(self.sessions.get_any(user).await?.and_then(|data| data.initial_match))
    }

    /// Every trigger matched while answering the user's most recent message.
    pub async fn last_triggers(&self, user: &str) -> Result<Vec<TriggerId>> {
        Ok(self.sessions.get_any(user).await?.map(|data| data.last_triggers).unwrap_or_default())
    }

    /// Patterns of the user's current topic tree in the order they are tried.
    pub async fn user_topic_triggers(&self, user: &str) -> Result<Vec<String>> {
        let sorted = self.sorted.as_ref().ok_or(Error::NotSorted)?;
        let topic = self.sessions.get(user, "topic").await?.unwrap_or_else(|| DEFAULT_TOPIC.to_string());
        let patterns = sorted.topics.get(&topic).map(|list| list.iter().map(|entry| entry.pattern.clone()).collect());
        Ok(patterns.unwrap_or_default())
    }

    // --- Replying ------------------------------------------------------------

    /// Answer `message` from `user`.
    pub async fn reply(&self, user: &str, message: &str) -> Result<String> {
        Ok(self.reply_verbose(user, message, None).await?.text)
    }

    /// Answer `message`, making `scope` available to object macros.
    pub async fn reply_with_scope(&self, user: &str, message: &str, scope: Scope) -> Result<String> {
        Ok(self.reply_verbose(user, message, Some(scope)).await?.text)
    }

    /// Answer `message` and report what happened on the way.
    pub async fn reply_verbose(&self, user: &str, message: &str, scope: Option<Scope>) -> Result<ReplyDetails> {
        let start = Instant::now();
        if self.sorted.is_none() {
            return Err(Error::NotSorted);
        }

        let lock = self.user_lock(user);
        let result = {
            let _turn = lock.lock().await;
            self.answer(user, message, scope, start).await
        };
        self.release_user_lock(user, lock);
        result
    }

    async fn answer(&self, user: &str, message: &str, scope: Option<Scope>, start: Instant) -> Result<ReplyDetails> {
        let topic_before = match self.sessions.get_any(user).await? {
            Some(data) => data.topic().to_string(),
            None => {
                self.sessions.set(user, SessionPatch::new().var("topic", DEFAULT_TOPIC)).await?;
                DEFAULT_TOPIC.to_string()
            }
        };

        let message = self.format_message(message, false);
        let mut ctx = ReplyContext::new(user, scope);
        debug!(user, message = %message, topic = %topic_before, "reply requested");

        let text = if self.topics.contains_key(BEGIN_TOPIC) {
            let begin = self.get_reply(&mut ctx, "request".to_string(), StepKind::Begin, 0).await?;
            let begin = if begin.contains("{ok}") {
                let reply = self.get_reply(&mut ctx, message.clone(), StepKind::Normal, 0).await?;
                begin.replace("{ok}", &reply)
            } else {
                begin
            };
            self.process_tags(&mut ctx, &begin, &[], &[], 0).await?
        } else {
            self.get_reply(&mut ctx, message.clone(), StepKind::Normal, 0).await?
        };

        let mut history = self.sessions.get_any(user).await?.map(|data| data.history).unwrap_or_default();
        history.push(message.clone(), text.clone());
        let patch = SessionPatch {
            history: Some(history),
            last_match: Some(ctx.last_match.clone()),
            initial_match: Some(ctx.initial_match.clone()),
            last_triggers: Some(ctx.last_triggers.clone()),
            ..SessionPatch::default()
        };
        self.sessions.set(user, patch).await?;
        let topic_after = self.sessions.get(user, "topic").await?.unwrap_or_else(|| DEFAULT_TOPIC.to_string());

        let elapsed = start.elapsed();
        debug!(user, reply = %text, ?elapsed, "reply ready");
        Ok(ReplyDetails {
            text,
            message,
            topic_before,
            topic_after,
            initial_match: ctx.initial_match,
            last_match: ctx.last_match,
            stars: ctx.stars.unwrap_or_default(),
            triggers: ctx.last_triggers,
            elapsed,
            metrics: ReplyMetrics { total: elapsed, steps: ctx.steps },
        })
    }

    fn user_lock(&self, user: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.user_locks.lock().entry(user.to_string()).or_default().clone()
    }

    /// Forget the user's mutex once no other reply is waiting on it.
    fn release_user_lock(&self, user: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.user_locks.lock();
        drop(lock);
        if locks.get(user).is_some_and(|held| Arc::strong_count(held) == 1) {
            locks.remove(user);
        }
    }

    /// Normalize a message (or, with `bot_reply`, a previous bot reply) for
    /// matching.
    pub(crate) fn format_message(&self, message: &str, bot_reply: bool) -> String {
        let message = self.subs.apply(&message.to_lowercase(), &self.punctuation);
        let message = if self.options.utf8 {
            let message = strip_nasties(&message, true);
            let message = self.punctuation.replace_all(&message, "");
            if bot_reply {
                regex!(r"[.?,!;:@#$%^&*()]").replace_all(&message, "").into_owned()
            } else {
                message.into_owned()
            }
        } else {
            strip_nasties(&message, false)
        };
        collapse_whitespace(&message)
    }

    /// Resolve one message at `depth`.
    pub(crate) fn get_reply<'a>(
        &'a self,
        ctx: &'a mut ReplyContext,
        message: String,
        kind: StepKind,
        depth: usize,
    ) -> BoxFuture<'a, Result<String>> {
        async move {
            if depth > self.depth {
                warn!(user = %ctx.user, depth, "deep recursion detected");
                return Ok(self.options.errors.deep_recursion.clone());
            }
            let sorted = self.sorted.as_ref().ok_or(Error::NotSorted)?;

            let mut data = self.sessions.get_any(&ctx.user).await?.unwrap_or_default();
            if !self.topics.contains_key(data.topic()) {
                warn!(user = %ctx.user, topic = data.topic(), "user was in an empty topic, moving them to 'random'");
                self.sessions.set(&ctx.user, SessionPatch::new().var("topic", DEFAULT_TOPIC)).await?;
                data.vars.insert("topic".to_string(), DEFAULT_TOPIC.to_string());
            }
            let topic = match kind {
                StepKind::Begin => BEGIN_TOPIC.to_string(),
                StepKind::Normal => data.topic().to_string(),
            };
            if !self.topics.contains_key(&topic) {
                return Ok(format!("ERR: No default topic '{DEFAULT_TOPIC}' was found!"));
            }

            let started = Instant::now();
            let (found, candidates) = self.find_match(sorted, &data, &message, &topic, depth);
            ctx.steps.push(StepMetrics {
                depth,
                kind,
                message: message.clone(),
                topic: topic.clone(),
                candidates,
                matched: found.as_ref().and_then(|f| self.trigger(&f.id)).map(|t| t.pattern.clone()),
                via_previous: found.as_ref().is_some_and(|f| f.via_previous),
                search: started.elapsed(),
            });

            let matched = found.as_ref().and_then(|f| Some((f, self.trigger(&f.id)?)));
            ctx.last_match = matched.map(|(_, trigger)| trigger.pattern.clone());
            if depth == 0 {
                ctx.initial_match = ctx.last_match.clone();
                ctx.last_triggers.clear();
            }

            let text = match matched {
                None => {
                    debug!(user = %ctx.user, topic = %topic, message = %message, "no trigger matched");
                    self.options.errors.reply_not_matched.clone()
                }
                Some((found, trigger)) => {
                    let stars = &found.stars;
                    debug!(user = %ctx.user, topic = %topic, trigger = %trigger.pattern, ?stars, "trigger matched");
                    ctx.last_triggers.push(found.id.clone());
                    if kind == StepKind::Normal && depth == 0 && ctx.stars.is_none() {
                        ctx.stars = Some(found.stars.clone());
                    }

                    if let Some(redirect) = &trigger.redirect {
                        let target = self.process_tags(ctx, redirect, &found.stars, &found.botstars, depth).await?;
                        let target = self.format_message(&target, false);
                        debug!(user = %ctx.user, target = %target, "redirecting");
                        return self.get_reply(ctx, target, kind, depth + 1).await;
                    }

                    let mut reply = None;
                    for condition in &trigger.conditions {
                        if self.condition_holds(ctx, condition, &found.stars, &found.botstars, depth).await? {
                            reply = split_condition(condition).map(|(_, text)| text.to_string());
                            break;
                        }
                    }
                    let reply = match reply {
                        Some(reply) => Some(reply),
                        None => self.pick_reply(&ctx.user, trigger),
                    };
                    match reply {
                        Some(reply) if !reply.is_empty() => {
                            if kind == StepKind::Begin && depth == 0 {
                                return self.consume_begin_tags(ctx, reply).await;
                            }
                            return self.process_tags(ctx, &reply, &found.stars, &found.botstars, depth).await;
                        }
                        _ => self.options.errors.reply_not_found.clone(),
                    }
                }
            };
            if kind == StepKind::Begin && depth == 0 {
                return Ok(text);
            }
            self.process_tags(ctx, &text, &[], &[], depth).await
        }
        .boxed()
    }

    /// Scan for the first matching trigger. Returns it with the number of
    /// candidates tried.
    fn find_match(
        &self,
        sorted: &SortBuffers,
        data: &UserData,
        message: &str,
        topic: &str,
        depth: usize,
    ) -> (Option<Found>, usize) {
        let bot_vars = self.vars.read();
        let format_reply = |text: &str| self.format_message(text, true);
        let scope = PatternScope {
            bot_vars: &bot_vars,
            arrays: &self.arrays,
            user: data,
            utf8: self.options.utf8,
            format_reply: &format_reply,
        };
        let mut candidates = 0;

        if depth == 0 {
            let last_reply = self.format_message(data.history.reply(1), true);
            let graph = TopicGraph::new(&self.topics, &self.previous, self.depth);
            for name in graph.tree(topic) {
                let Some(entries) = sorted.thats.get(&name) else {
                    continue;
                };
                for entry in entries {
                    candidates += 1;
                    let Some(previous) = self.trigger(&entry.id).and_then(|t| t.previous.as_deref()) else {
                        continue;
                    };
                    let Some(botstars) = self.try_match(previous, &last_reply, &scope) else {
                        continue;
                    };
                    trace!(trigger = %entry.pattern, previous, "bot side of %Previous matched");
                    if let Some(stars) = self.try_match(&entry.pattern, message, &scope) {
                        return (Some(Found { id: entry.id.clone(), stars, botstars, via_previous: true }), candidates);
                    }
                }
            }
        }

        if let Some(entries) = sorted.topics.get(topic) {
            for entry in entries {
                candidates += 1;
                if let Some(stars) = self.try_match(&entry.pattern, message, &scope) {
                    let found = Found { id: entry.id.clone(), stars, botstars: Vec::new(), via_previous: false };
                    return (Some(found), candidates);
                }
            }
        }
        (None, candidates)
    }

    fn try_match(&self, pattern: &str, message: &str, scope: &PatternScope<'_>) -> Option<Vec<String>> {
        let result = compile(pattern, scope).and_then(|matcher| matcher.captures(message, &self.regexes));
        match result {
            Ok(stars) => stars,
            Err(err) => {
                warn!(trigger = pattern, %err, "trigger can not be matched");
                None
            }
        }
    }

    async fn condition_holds(
        &self,
        ctx: &mut ReplyContext,
        condition: &str,
        stars: &[String],
        botstars: &[String],
        depth: usize,
    ) -> Result<bool> {
        let Some((test, _)) = split_condition(condition) else {
            return Ok(false);
        };
        let (left, op, right) = match regex!(r"^(.+?)\s+(==|eq|!=|ne|<>|<|<=|>|>=)\s+(.*?)$").captures(test) {
            Some(caps) => (caps[1].trim().to_string(), caps[2].to_string(), caps[3].trim().to_string()),
            None => return Ok(false),
        };

        let left = self.process_tags(ctx, &left, stars, botstars, depth).await?;
        let right = self.process_tags(ctx, &right, stars, botstars, depth).await?;
        let left = if left.is_empty() { UNDEFINED.to_string() } else { left };
        let right = if right.is_empty() { UNDEFINED.to_string() } else { right };
        trace!(left = %left, op = %op, right = %right, "checking condition");

        Ok(match op.as_str() {
            "==" | "eq" => left == right,
            "!=" | "ne" | "<>" => left != right,
            _ => match (parse_leading_int(&left), parse_leading_int(&right)) {
                (Some(a), Some(b)) => match op.as_str() {
                    "<" => a < b,
                    "<=" => a <= b,
                    ">" => a > b,
                    _ => a >= b,
                },
                _ => {
                    warn!(user = %ctx.user, condition, "numeric comparison on a non-numeric value");
                    false
                }
            },
        })
    }

    /// Weighted random choice among a trigger's replies.
    fn pick_reply(&self, user: &str, trigger: &Trigger) -> Option<String> {
        if trigger.replies.is_empty() {
            return None;
        }
        let weights: Vec<u64> = trigger
            .replies
            .iter()
            .map(|text| {
                if !regex!(r"(?i)\{weight=\d+\}").is_match(text) {
                    return 1;
                }
                match weight_of(text) {
                    0 => {
                        warn!(user, trigger = %trigger.pattern, reply = %text, "reply weight must be positive");
                        1
                    }
                    w => u64::from(w),
                }
            })
            .collect();

        let total: u64 = weights.iter().sum();
        let mut roll = self.rng.lock().random_range(0..total);
        for (text, weight) in trigger.replies.iter().zip(&weights) {
            if roll < *weight {
                return Some(text.clone());
            }
            roll -= weight;
        }
        trigger.replies.last().cloned()
    }

    /// BEGIN replies only honor `{topic=...}` and `<set ...>`; everything else
    /// is left for the final expansion pass.
    async fn consume_begin_tags(&self, ctx: &ReplyContext, mut reply: String) -> Result<String> {
        let mut guard = 0;
        while let Some(m) = find(regex!(r"(?i)\{topic=(.+?)\}"), &reply) {
            guard += 1;
            if guard > TAG_LIMIT {
                warn!(user = %ctx.user, "too many topic tags in BEGIN reply");
                break;
            }
            self.sessions.set(&ctx.user, SessionPatch::new().var("topic", m.groups[0].as_str())).await?;
            reply.replace_range(m.span, "");
        }

        let mut guard = 0;
        while let Some(m) = find(regex!(r"(?i)<set (.+?)=(.+?)>"), &reply) {
            guard += 1;
            if guard > TAG_LIMIT {
                warn!(user = %ctx.user, "too many set tags in BEGIN reply");
                break;
            }
            self.sessions.set(&ctx.user, SessionPatch::new().var(m.groups[0].as_str(), m.groups[1].as_str())).await?;
            reply.replace_range(m.span, "");
        }
        Ok(reply)
    }
}

fn split_condition(condition: &str) -> Option<(&str, &str)> {
    let halves: Vec<&str> = regex!(r"\s*=>\s*").splitn(condition, 3).collect();
    match halves.as_slice() {
        [test, reply] => Some((test.trim(), reply.trim())),
        _ => None,
    }
}

fn apply_define(table: &mut HashMap<String, String>, name: String, value: String) {
    if value == UNDEF {
        table.remove(&name);
    } else {
        table.insert(name, value);
    }
}

fn set_or_remove(table: &mut HashMap<String, String>, name: &str, value: Option<&str>) {
    match value {
        Some(value) => {
            table.insert(name.to_string(), value.to_string());
        }
        None => {
            table.remove(name);
        }
    }
}

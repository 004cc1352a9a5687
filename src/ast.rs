//! Loadable content: the structures a source parser hands to the brain.
//!
//! A [`Document`] mirrors one parsed source file: the `begin` block (bot/global
//! variables, substitutions, arrays), the topics with their triggers, and any
//! object macros. It is plain serde data so a parser living in another process
//! can ship it as JSON; the builder methods make hand-written content in tests
//! and hosts short.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the topic every user starts in.
pub const DEFAULT_TOPIC: &str = "random";
/// Reserved topic holding the BEGIN block's triggers.
pub const BEGIN_TOPIC: &str = "__begin__";
/// Value that deletes a `begin` entry instead of setting it.
pub const UNDEF: &str = "<undef>";

/// Stable reference to a trigger: its topic plus its position in that topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerId {
    pub topic: String,
    pub index: usize,
}

impl TriggerId {
    pub fn new(topic: impl Into<String>, index: usize) -> Self {
        TriggerId { topic: topic.into(), index }
    }
}

/// A user-side pattern with everything the bot may answer for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Trigger {
    #[serde(alias = "trigger")]
    pub pattern: String,
    #[serde(alias = "reply")]
    pub replies: Vec<String>,
    #[serde(alias = "condition")]
    pub conditions: Vec<String>,
    pub redirect: Option<String>,
    pub previous: Option<String>,
}

impl Trigger {
    pub fn new(pattern: impl Into<String>) -> Self {
        Trigger { pattern: pattern.into(), ..Default::default() }
    }

    pub fn reply(mut self, text: impl Into<String>) -> Self {
        self.replies.push(text.into());
        self
    }

    pub fn condition(mut self, text: impl Into<String>) -> Self {
        self.conditions.push(text.into());
        self
    }

    pub fn redirect(mut self, target: impl Into<String>) -> Self {
        self.redirect = Some(target.into());
        self
    }

    pub fn previous(mut self, pattern: impl Into<String>) -> Self {
        self.previous = Some(pattern.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topic {
    pub name: String,
    pub includes: Vec<String>,
    pub inherits: Vec<String>,
    pub triggers: Vec<Trigger>,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Topic { name: name.into(), ..Default::default() }
    }

    pub fn includes(mut self, topic: impl Into<String>) -> Self {
        push_unique(&mut self.includes, topic.into());
        self
    }

    pub fn inherits(mut self, topic: impl Into<String>) -> Self {
        push_unique(&mut self.inherits, topic.into());
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Merge another definition of the same topic into this one.
    ///
    /// Topics may be declared in several documents; relations are kept as
    /// ordered sets and triggers append.
    pub(crate) fn merge(&mut self, other: Topic) {
        for name in other.includes {
            push_unique(&mut self.includes, name);
        }
        for name in other.inherits {
            push_unique(&mut self.inherits, name);
        }
        self.triggers.extend(other.triggers);
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// Bot configuration declared in a BEGIN block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Begin {
    pub global: BTreeMap<String, String>,
    pub var: BTreeMap<String, String>,
    pub sub: BTreeMap<String, String>,
    pub person: BTreeMap<String, String>,
    pub array: BTreeMap<String, Vec<String>>,
}

/// Source of an object macro, dispatched to the handler for `language`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMacro {
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub code: String,
}

/// One unit of loadable content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Document {
    pub begin: Begin,
    pub topics: Vec<Topic>,
    pub objects: Vec<ObjectMacro>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn global(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.begin.global.insert(name.into(), value.into());
        self
    }

    pub fn var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.begin.var.insert(name.into(), value.into());
        self
    }

    pub fn sub(mut self, phrase: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.begin.sub.insert(phrase.into(), replacement.into());
        self
    }

    pub fn person(mut self, phrase: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.begin.person.insert(phrase.into(), replacement.into());
        self
    }

    pub fn array<I, S>(mut self, name: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.begin.array.insert(name.into(), items.into_iter().map(Into::into).collect());
        self
    }

    /// Add a topic, merging into an earlier topic of the same name.
    pub fn topic(mut self, topic: Topic) -> Self {
        match self.topics.iter_mut().find(|t| t.name == topic.name) {
            Some(existing) => existing.merge(topic),
            None => self.topics.push(topic),
        }
        self
    }

    /// Shorthand for adding a trigger to the default topic.
    pub fn trigger(self, trigger: Trigger) -> Self {
        self.topic(Topic::new(DEFAULT_TOPIC).trigger(trigger))
    }

    pub fn object(mut self, name: impl Into<String>, language: impl Into<String>, code: impl Into<String>) -> Self {
        self.objects.push(ObjectMacro { name: name.into(), language: language.into(), code: code.into() });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_merges_topics_with_the_same_name() {
        let doc = Document::new()
            .trigger(Trigger::new("hello bot").reply("Hello human."))
            .topic(Topic::new("random").includes("colors").includes("colors"))
            .trigger(Trigger::new("*").reply("Catch-all."));

        assert_eq!(doc.topics.len(), 1);
        let random = &doc.topics[0];
        assert_eq!(random.includes, vec!["colors".to_string()]);
        assert_eq!(random.triggers.len(), 2);
        assert_eq!(random.triggers[1].pattern, "*");
    }

    #[test]
    fn document_deserializes_parser_style_json() {
        let json = r#"{
            "begin": { "var": { "name": "Aiden" }, "array": { "colors": ["red", "blue"] } },
            "topics": [
                { "name": "random", "triggers": [
                    { "trigger": "knock knock", "reply": ["Who's there?"] },
                    { "trigger": "*", "previous": "who is there", "reply": ["<sentence> who?"] }
                ] }
            ],
            "objects": [ { "name": "hi", "language": "rust" } ]
        }"#;

        let doc = Document::from_json_str(json).unwrap();
        assert_eq!(doc.begin.var["name"], "Aiden");
        assert_eq!(doc.begin.array["colors"], vec!["red", "blue"]);
        let triggers = &doc.topics[0].triggers;
        assert_eq!(triggers[0].replies, vec!["Who's there?"]);
        assert_eq!(triggers[1].previous.as_deref(), Some("who is there"));
        assert_eq!(doc.objects[0].code, "");
    }
}

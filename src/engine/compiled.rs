//! Sort buffers and trigger indexes.
//!
//! This module holds the *static* side of the brain: structures derived from
//! the loaded topics that make a reply cheap and predictable.
//!
//! Replying is split into two phases:
//!
//! 1. **Sort** (this module): flatten every topic through the topic graph
//!    (`topics.rs`) and order the result (`sorting.rs`). Ordinary triggers and
//!    `%Previous` triggers get separate lists.
//! 2. **Run** (see `brain.rs`): walk the user's topic list, compile candidate
//!    patterns on demand (`pattern.rs`) and expand the chosen reply (`tags.rs`).
//!
//! ## Invariants
//!
//! - Buffers are rebuilt wholesale by [`SortBuffers::build`]; nothing updates
//!   them in place. Loading new content drops them.
//! - Every trigger with a `previous` is reachable in O(1) through
//!   [`PreviousIndex`] by topic, pattern and previous pattern.
//! - `TriggerId::index` points into `Topic::triggers`; topics only grow, so ids
//!   handed out earlier stay valid.

use super::sorting::{SortedTrigger, sort_triggers};
use super::topics::TopicGraph;
use crate::ast::{Topic, TriggerId};
use std::collections::{BTreeMap, HashMap};

/// `topic → (pattern, previous) → trigger`, last definition wins.
#[derive(Debug, Default, Clone)]
pub(crate) struct PreviousIndex {
    by_topic: HashMap<String, HashMap<(String, String), TriggerId>>,
}

impl PreviousIndex {
    pub(crate) fn build(topics: &BTreeMap<String, Topic>) -> Self {
        let mut index = PreviousIndex::default();
        for (name, topic) in topics {
            for (i, trigger) in topic.triggers.iter().enumerate() {
                if let Some(previous) = &trigger.previous {
                    index
                        .by_topic
                        .entry(name.clone())
                        .or_default()
                        .insert((trigger.pattern.clone(), previous.clone()), TriggerId::new(name.as_str(), i));
                }
            }
        }
        index
    }

    pub(crate) fn lookup(&self, topic: &str, pattern: &str, previous: &str) -> Option<&TriggerId> {
        self.by_topic.get(topic)?.get(&(pattern.to_string(), previous.to_string()))
    }
}

/// Per-topic trial order.
#[derive(Debug, Default, Clone)]
pub(crate) struct SortBuffers {
    pub topics: HashMap<String, Vec<SortedTrigger>>,
    pub thats: HashMap<String, Vec<SortedTrigger>>,
}

impl SortBuffers {
    pub(crate) fn build(topics: &BTreeMap<String, Topic>, previous: &PreviousIndex, depth_limit: usize) -> Self {
        let graph = TopicGraph::new(topics, previous, depth_limit);
        let mut buffers = SortBuffers::default();
        for name in topics.keys() {
            buffers.topics.insert(name.clone(), sort_triggers(graph.triggers(name, false)));
            buffers.thats.insert(name.clone(), sort_triggers(graph.triggers(name, true)));
        }
        buffers
    }
}

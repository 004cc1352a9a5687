//! Topic inheritance and inclusion.
//!
//! A topic may `include` others (their triggers join its own, on equal
//! footing) or `inherit` others (their triggers join too, but only get a
//! chance after every trigger of the inheriting topic failed). Both relations
//! are walked depth-first; inheritance is encoded into the returned patterns as
//! an `{inherits=N}` prefix that the sorter understands:
//!
//! ```text
//! topic override inherits colors
//!   collect(override, depth 0, level 0)
//!     ├─ inherits colors ──▶ collect(colors, depth 1, level 1, inherited)
//!     │                        "{inherits=1}what color is the sky"
//!     └─ own triggers         "{inherits=0}what color is *"
//! ```
//!
//! Included topics share the includer's level, so a topic that both includes
//! and inherits still tries everything it includes before anything inherited.
//!
//! Cycles are not detected; the depth limit turns them into a warning and an
//! empty branch.

use super::compiled::PreviousIndex;
use crate::ast::{Topic, TriggerId};
use std::collections::BTreeMap;
use tracing::warn;

pub(crate) struct TopicGraph<'a> {
    topics: &'a BTreeMap<String, Topic>,
    previous: &'a PreviousIndex,
    depth_limit: usize,
}

impl<'a> TopicGraph<'a> {
    pub(crate) fn new(topics: &'a BTreeMap<String, Topic>, previous: &'a PreviousIndex, depth_limit: usize) -> Self {
        TopicGraph { topics, previous, depth_limit }
    }

    /// Effective trigger list of `topic`: ordinary triggers, or the
    /// `%Previous` ones when `thats` is set.
    pub(crate) fn triggers(&self, topic: &str, thats: bool) -> Vec<(String, TriggerId)> {
        let mut out = Vec::new();
        self.collect(topic, thats, 0, 0, false, &mut out);
        out
    }

    fn collect(
        &self,
        name: &str,
        thats: bool,
        depth: usize,
        inheritance: usize,
        inherited: bool,
        out: &mut Vec<(String, TriggerId)>,
    ) {
        if depth > self.depth_limit {
            warn!(topic = name, depth, "deep recursion while collecting topic triggers");
            return;
        }
        let Some(topic) = self.topics.get(name) else {
            warn!(topic = name, "inherited or included topic does not exist");
            return;
        };

        // Included triggers rank with the includer's own.
        let tag = !topic.inherits.is_empty() || inherited;
        for include in &topic.includes {
            self.collect(include, thats, depth + 1, inheritance, tag, out);
        }
        for parent in &topic.inherits {
            self.collect(parent, thats, depth + 1, inheritance + 1, true, out);
        }

        for (index, trigger) in topic.triggers.iter().enumerate() {
            let id = TriggerId::new(name, index);
            let keep = match &trigger.previous {
                None => !thats,
                // Redefinitions of the same pattern/previous pair replace earlier ones.
                Some(previous) => thats && self.previous.lookup(name, &trigger.pattern, previous) == Some(&id),
            };
            if !keep {
                continue;
            }
            let pattern =
                if tag { format!("{{inherits={inheritance}}}{}", trigger.pattern) } else { trigger.pattern.clone() };
            out.push((pattern, id));
        }
    }

    /// `topic` plus every topic reachable through includes and inherits.
    pub(crate) fn tree(&self, topic: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.walk(topic, 0, &mut out);
        out
    }

    fn walk(&self, name: &str, depth: usize, out: &mut Vec<String>) {
        if depth > self.depth_limit {
            warn!(topic = name, depth, "deep recursion while walking the topic tree");
            return;
        }
        out.push(name.to_string());
        let Some(topic) = self.topics.get(name) else {
            return;
        };
        for next in topic.includes.iter().chain(&topic.inherits) {
            self.walk(next, depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Trigger;

    fn graph_fixture() -> (BTreeMap<String, Topic>, PreviousIndex) {
        let topics = [
            Topic::new("random").trigger(Trigger::new("hello")).trigger(Trigger::new("*")),
            Topic::new("colors")
                .trigger(Trigger::new("what color is the sky"))
                .trigger(Trigger::new("*").previous("who is there")),
            Topic::new("override").inherits("colors").trigger(Trigger::new("what color is *")),
            Topic::new("lobby").includes("random").trigger(Trigger::new("look around")),
            Topic::new("hall").includes("random").inherits("colors").trigger(Trigger::new("look up")),
            Topic::new("loop_a").includes("loop_b"),
            Topic::new("loop_b").includes("loop_a").trigger(Trigger::new("spin")),
        ];
        let topics: BTreeMap<String, Topic> = topics.into_iter().map(|t| (t.name.clone(), t)).collect();
        let previous = PreviousIndex::build(&topics);
        (topics, previous)
    }

    fn patterns(list: Vec<(String, TriggerId)>) -> Vec<String> {
        list.into_iter().map(|(p, _)| p).collect()
    }

    #[test]
    fn inherited_triggers_are_tagged_deeper() {
        let (topics, previous) = graph_fixture();
        let graph = TopicGraph::new(&topics, &previous, 50);
        assert_eq!(
            patterns(graph.triggers("override", false)),
            vec!["{inherits=1}what color is the sky", "{inherits=0}what color is *"]
        );
    }

    #[test]
    fn included_triggers_are_untagged() {
        let (topics, previous) = graph_fixture();
        let graph = TopicGraph::new(&topics, &previous, 50);
        assert_eq!(patterns(graph.triggers("lobby", false)), vec!["hello", "*", "look around"]);
    }

    #[test]
    fn included_triggers_share_level_with_inherits() {
        let (topics, previous) = graph_fixture();
        let graph = TopicGraph::new(&topics, &previous, 50);
        assert_eq!(
            patterns(graph.triggers("hall", false)),
            vec!["{inherits=0}hello", "{inherits=0}*", "{inherits=1}what color is the sky", "{inherits=0}look up"]
        );
    }

    #[test]
    fn previous_triggers_are_split_out() {
        let (topics, previous) = graph_fixture();
        let graph = TopicGraph::new(&topics, &previous, 50);
        let thats = graph.triggers("colors", true);
        assert_eq!(thats, vec![("*".to_string(), TriggerId::new("colors", 1))]);
        assert_eq!(patterns(graph.triggers("colors", false)), vec!["what color is the sky"]);
    }

    #[test]
    fn cycles_and_missing_topics_degrade() {
        let (topics, previous) = graph_fixture();
        let graph = TopicGraph::new(&topics, &previous, 5);
        let spins = graph.triggers("loop_a", false);
        assert!(!spins.is_empty());
        assert!(spins.iter().all(|(p, _)| p == "spin"));
        assert!(graph.triggers("nowhere", false).is_empty());
    }

    #[test]
    fn tree_lists_reachable_topics() {
        let (topics, previous) = graph_fixture();
        let graph = TopicGraph::new(&topics, &previous, 50);
        assert_eq!(graph.tree("override"), vec!["override", "colors"]);
        assert_eq!(graph.tree("random"), vec!["random"]);
        assert_eq!(graph.tree("lobby"), vec!["lobby", "random"]);
    }
}

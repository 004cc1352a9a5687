//! Trigger specificity ordering.
//!
//! Given a topic's flattened trigger list, produce the one order in which the
//! brain tries them. The order is what makes `"my name is bob"` beat
//! `"my name is *"`, which in turn beats `"*"`; getting it wrong silently
//! changes which reply a user sees.
//!
//! ```text
//! weight (desc)
//!   └─ inheritance depth (asc, untagged last)
//!        └─ category: atomic < optional < `_` < `#` < `*` < lone `_` < lone `#` < lone `*`
//!             └─ real word count (desc)
//!                  └─ pattern length (desc), then input order
//! ```
//!
//! Each entry carries a [`SortKey`] computed once; the list is then stably
//! sorted on it, so equal keys keep the order the topic graph produced.

use super::pattern::{PatternShape, strip_metadata};
use super::text::word_count;
use crate::ast::TriggerId;
use std::cmp::{Ordering, Reverse};

/// A pattern as it will be tried, plus the trigger it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SortedTrigger {
    /// Pattern text with the `{inherits=N}` tag removed.
    pub pattern: String,
    pub id: TriggerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Category {
    Atomic,
    Optional,
    Alpha,
    Number,
    Wild,
    LoneUnderscore,
    LonePound,
    LoneStar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SortKey {
    weight: u32,
    inherits: Option<u32>,
    category: Category,
    words: usize,
    length: usize,
}

impl SortKey {
    fn of(pattern: &str) -> Self {
        let bare = strip_metadata(pattern);
        let shape = PatternShape::scan(&bare);
        let words = word_count(&bare, false);

        let category = if shape.contains(PatternShape::UNDERSCORE) {
            if words > 0 { Category::Alpha } else { Category::LoneUnderscore }
        } else if shape.contains(PatternShape::POUND) {
            if words > 0 { Category::Number } else { Category::LonePound }
        } else if shape.contains(PatternShape::STAR) {
            if words > 0 { Category::Wild } else { Category::LoneStar }
        } else if shape.contains(PatternShape::OPTIONAL) {
            Category::Optional
        } else {
            Category::Atomic
        };

        SortKey { weight: weight_of(pattern), inherits: inherits_of(pattern), category, words, length: bare.len() }
    }

    fn cmp_priority(&self, other: &Self) -> Ordering {
        other
            .weight
            .cmp(&self.weight)
            .then_with(|| inherit_rank(self.inherits).cmp(&inherit_rank(other.inherits)))
            .then_with(|| self.category.cmp(&other.category))
            .then_with(|| other.words.cmp(&self.words))
            .then_with(|| other.length.cmp(&self.length))
    }
}

fn inherit_rank(inherits: Option<u32>) -> (bool, u32) {
    (inherits.is_none(), inherits.unwrap_or(0))
}

/// `{weight=N}` value, 0 when absent.
pub(crate) fn weight_of(text: &str) -> u32 {
    regex!(r"(?i)\{weight=(\d+)\}")
        .captures(text)
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(0)
}

fn inherits_of(text: &str) -> Option<u32> {
    regex!(r"(?i)\{inherits=(\d+)\}").captures(text).and_then(|caps| caps[1].parse().ok())
}

fn strip_inherits(text: &str) -> String {
    regex!(r"(?i)\{inherits=\d+\}").replace_all(text, "").trim().to_string()
}

/// Order a flattened trigger list for matching.
pub(crate) fn sort_triggers(triggers: Vec<(String, TriggerId)>) -> Vec<SortedTrigger> {
    let mut keyed: Vec<(SortKey, SortedTrigger)> = triggers
        .into_iter()
        .map(|(pattern, id)| (SortKey::of(&pattern), SortedTrigger { pattern: strip_inherits(&pattern), id }))
        .collect();

    keyed.sort_by(|(a, _), (b, _)| a.cmp_priority(b));
    keyed.into_iter().map(|(_, entry)| entry).collect()
}

/// Order phrases by descending word count, then descending length.
pub(crate) fn sort_list<'a>(items: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
    let mut items: Vec<&str> = items.into_iter().collect();
    items.sort_by_key(|item| (Reverse(word_count(item, true)), Reverse(item.len()), *item));
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(patterns: &[&str]) -> Vec<String> {
        let input = patterns.iter().enumerate().map(|(i, p)| (p.to_string(), TriggerId::new("random", i))).collect();
        sort_triggers(input).into_iter().map(|t| t.pattern).collect()
    }

    #[test]
    fn categories_in_trial_order() {
        let out = sorted(&["*", "#", "_", "hello *", "hello #", "hello _", "hello [there]", "hello bot"]);
        assert_eq!(out, vec!["hello bot", "hello [there]", "hello _", "hello #", "hello *", "_", "#", "*"]);
    }

    #[test]
    fn more_words_first_then_longer() {
        let out = sorted(&["my name is *", "*", "my name is bob *", "i am *", "who is *", "my *"]);
        assert_eq!(out, vec!["my name is bob *", "my name is *", "who is *", "i am *", "my *", "*"]);
    }

    #[test]
    fn atomic_before_wildcard_regardless_of_length() {
        let out = sorted(&["my name is *", "hi", "my name is bob"]);
        assert_eq!(out, vec!["my name is bob", "hi", "my name is *"]);
    }

    #[test]
    fn weight_dominates() {
        let out = sorted(&["hello bot", "* {weight=10}", "hi {weight=5}"]);
        assert_eq!(out, vec!["* {weight=10}", "hi {weight=5}", "hello bot"]);
    }

    #[test]
    fn inheritance_depth_before_specificity() {
        let out = sorted(&[
            "{inherits=1}what color is the sky",
            "{inherits=1}*",
            "{inherits=0}what color is *",
            "{inherits=0}hello",
            "untagged atomic trigger here",
        ]);
        assert_eq!(
            out,
            vec!["hello", "what color is *", "what color is the sky", "*", "untagged atomic trigger here"]
        );
    }

    #[test]
    fn classification_precedence() {
        // `_` outranks `*` and `[` for classification, even when both appear.
        let out = sorted(&["[a] b c d", "x _ *", "x # y"]);
        assert_eq!(out, vec!["[a] b c d", "x _ *", "x # y"]);
    }

    #[test]
    fn equal_keys_keep_input_order() {
        let out = sorted(&["ab *", "cd *", "ef *"]);
        assert_eq!(out, vec!["ab *", "cd *", "ef *"]);
    }

    #[test]
    fn sorting_is_idempotent() {
        let patterns =
            ["*", "hello", "hello *", "[please] help", "# apples", "_ bananas", "{weight=2}yo", "i am # years old"];
        let once = sorted(&patterns);
        let refs: Vec<&str> = once.iter().map(String::as_str).collect();
        assert_eq!(sorted(&refs), once);
    }

    #[test]
    fn sort_list_orders_phrases() {
        assert_eq!(sort_list(["a", "what is", "i am sure", "abc"]), vec!["i am sure", "what is", "abc", "a"]);
    }
}

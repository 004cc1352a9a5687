//! Substitution tables (`sub` and `person`).
//!
//! A table maps a phrase of one or more words to its replacement. Applying a
//! table scans the message left to right and, at each word, tries the longest
//! window first (bounded by the longest phrase in the table), so `"i am"` wins
//! over `"i"`. Replaced text is never rescanned, which is what lets `person`
//! swap `"i am"` and `"you are"` without ping-ponging.
//!
//! Lookup keys are compared with the configured punctuation removed, so
//! `"what's?"` still finds a `"what's"` entry. Punctuation attached to a
//! replaced phrase is dropped along with it. Whitespace between words,
//! line breaks included, is kept as written.

use super::sorting::sort_list;
use super::text::word_count;
use regex::Regex;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct SubstitutionTable {
    map: HashMap<String, String>,
    max_words: usize,
}

impl SubstitutionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a phrase. Phrases are stored lowercased.
    pub fn insert(&mut self, phrase: impl Into<String>, replacement: impl Into<String>) {
        let phrase = phrase.into().to_lowercase();
        self.max_words = self.max_words.max(word_count(&phrase, true));
        self.map.insert(phrase, replacement.into());
    }

    /// Remove a phrase. The cached window size is left as is; it only bounds
    /// the search.
    pub fn remove(&mut self, phrase: &str) -> Option<String> {
        self.map.remove(&phrase.to_lowercase())
    }

    pub fn get(&self, phrase: &str) -> Option<&str> {
        self.map.get(&phrase.to_lowercase()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Word count of the longest phrase ever inserted.
    pub fn max_words(&self) -> usize {
        self.max_words
    }

    /// Phrases in match priority: most words first, then longest.
    pub fn phrases(&self) -> Vec<&str> {
        sort_list(self.map.keys().map(String::as_str))
    }

    /// Rewrite `text`, ignoring characters matched by `punctuation` when
    /// looking phrases up.
    pub fn apply(&self, text: &str, punctuation: &Regex) -> String {
        if self.map.is_empty() {
            return text.to_string();
        }

        let spans: Vec<(usize, usize)> = regex!(r"\S+").find_iter(text).map(|m| (m.start(), m.end())).collect();
        let words: Vec<&str> = spans.iter().map(|&(start, end)| &text[start..end]).collect();
        let keys: Vec<String> = words.iter().map(|w| punctuation.replace_all(w, "").to_lowercase()).collect();
        let mut out = String::with_capacity(text.len());
        // Separators between tokens are copied from the input.
        let mut copied = 0;

        let mut i = 0;
        'scan: while i < words.len() {
            out.push_str(&text[copied..spans[i].0]);
            let widest = self.max_words.min(words.len() - i);
            for n in (1..=widest).rev() {
                let key = keys[i..i + n].join(" ");
                if let Some(replacement) = self.map.get(&key) {
                    out.push_str(replacement);
                    copied = spans[i + n - 1].1;
                    i += n;
                    continue 'scan;
                }
            }
            out.push_str(words[i]);
            copied = spans[i].1;
            i += 1;
        }
        out.push_str(&text[copied..]);

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn punctuation() -> Regex {
        Regex::new("[.,!?;:]").unwrap()
    }

    fn person() -> SubstitutionTable {
        let mut table = SubstitutionTable::new();
        for (from, to) in [("i am", "you are"), ("you are", "I am"), ("i", "you"), ("you", "me"), ("my", "your")] {
            table.insert(from, to);
        }
        table
    }

    #[test]
    fn longest_phrase_wins() {
        let table = person();
        assert_eq!(table.apply("i am cool", &punctuation()), "you are cool");
        assert_eq!(table.apply("i like you", &punctuation()), "you like me");
        assert_eq!(table.max_words(), 2);
    }

    #[test]
    fn replacements_are_not_rescanned() {
        let table = person();
        assert_eq!(table.apply("you are my friend", &punctuation()), "I am your friend");
    }

    #[test]
    fn punctuation_is_ignored_for_lookup() {
        let mut table = SubstitutionTable::new();
        table.insert("what's", "what is");
        assert_eq!(table.apply("what's up?", &punctuation()), "what is up?");
        assert_eq!(table.apply("so, what's?", &punctuation()), "so, what is");
    }

    #[test]
    fn line_breaks_survive() {
        let table = person();
        assert_eq!(table.apply("i am here\nand you  are there", &punctuation()), "you are here\nand I am there");
    }

    #[test]
    fn words_inside_other_words_are_left_alone() {
        let table = person();
        assert_eq!(table.apply("this is mine", &punctuation()), "this is mine");
    }

    #[test]
    fn phrases_sorted_by_words_then_length() {
        let table = person();
        assert_eq!(table.phrases(), vec!["you are", "i am", "you", "my", "i"]);
    }
}

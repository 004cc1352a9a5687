//! Trigger pattern compilation.
//!
//! A trigger is written in a small pattern language (`*`, `#`, `_`, `[opt]`,
//! `(a|b)`, `@array`, plus embedded `<bot>`/`<get>`/`<input>`/`<reply>`
//! references). This module turns one pattern into a [`Matcher`]:
//!
//! ```text
//! "my name is *"        ──▶ Exact? no ──▶ Regex("my name is (.+?)")
//! "hello bot"           ──▶ Exact("hello bot")       (atomic fast path)
//! "what is your [home] number"
//!                       ──▶ Regex("what is your(?:(?:\s+|\b)home(?:\s+|\b)|(?:\s+|\b))number")
//! ```
//!
//! The compiler walks the pattern once, left to right. Variable references are
//! resolved against the current user/bot state as they are met and emitted as
//! escaped literal text, so a user variable can never inject wildcard syntax.
//! Everything that is not syntax is escaped as well.
//!
//! ## Design notes
//!
//! - Compiled regexes are shared through [`RegexCache`], keyed by the final
//!   regex source. Patterns with embedded variables produce a different source
//!   per value, so the cache is bounded and simply flushed when full.
//! - [`PatternShape`] is a cheap character scan used both for the atomic fast
//!   path and by the sorter's classification.
//! - Load-time validation (`check_*`) lives here too since it guards the same
//!   grammar.

use super::text::{collapse_whitespace, strip_nasties};
use crate::session::{UNDEFINED, UserData};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;

/// Optionals expanded per pattern before giving up.
pub(crate) const OPTIONAL_LIMIT: usize = 50;
const REGEX_CACHE_LIMIT: usize = 2048;
const BOUNDARY: &str = r"(?:\s+|\b)";

// --- Shape scan --------------------------------------------------------------

bitflags::bitflags! {
    /// Syntax present in a pattern.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub(crate) struct PatternShape: u8 {
        const STAR       = 1 << 0;
        const POUND      = 1 << 1;
        const UNDERSCORE = 1 << 2;
        const OPTIONAL   = 1 << 3;
        const GROUP      = 1 << 4;
        const TAG        = 1 << 5;
        const ARRAY      = 1 << 6;
    }
}

impl PatternShape {
    pub(crate) fn scan(pattern: &str) -> Self {
        let mut shape = PatternShape::empty();
        for b in pattern.bytes() {
            shape |= match b {
                b'*' => PatternShape::STAR,
                b'#' => PatternShape::POUND,
                b'_' => PatternShape::UNDERSCORE,
                b'[' => PatternShape::OPTIONAL,
                b'(' => PatternShape::GROUP,
                b'<' => PatternShape::TAG,
                b'@' => PatternShape::ARRAY,
                _ => continue,
            };
        }
        shape
    }

    /// No wildcard, optional, group, tag or array syntax at all.
    pub(crate) fn is_atomic(self) -> bool {
        self.is_empty()
    }
}

// --- Compilation -------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub(crate) enum PatternError {
    #[error("unclosed '{0}'")]
    Unclosed(char),
    #[error("more than {OPTIONAL_LIMIT} optionals")]
    TooManyOptionals,
    #[error("unknown array '@{0}'")]
    MissingArray(String),
    #[error(transparent)]
    Regex(#[from] regex::Error),
}

/// Live state a pattern may reference.
pub(crate) struct PatternScope<'a> {
    pub bot_vars: &'a HashMap<String, String>,
    pub arrays: &'a HashMap<String, Vec<String>>,
    pub user: &'a UserData,
    pub utf8: bool,
    /// Normalizes a stored bot reply before it is embedded via `<reply>`.
    pub format_reply: &'a (dyn Fn(&str) -> String + Sync),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Matcher {
    /// Atomic pattern: plain string equality.
    Exact(String),
    /// Unanchored regex source; [`RegexCache`] anchors it.
    Regex(String),
}

impl Matcher {
    /// Stars captured from `message`, or `None` when it does not match.
    ///
    /// Groups that did not participate in the match read `"undefined"`.
    pub(crate) fn captures(&self, message: &str, cache: &RegexCache) -> Result<Option<Vec<String>>, PatternError> {
        match self {
            Matcher::Exact(text) => Ok((text == message).then(Vec::new)),
            Matcher::Regex(source) => {
                let re = cache.get(source)?;
                Ok(re.captures(message).map(|caps| {
                    caps.iter()
                        .skip(1)
                        .map(|m| m.map_or_else(|| UNDEFINED.to_string(), |m| m.as_str().to_string()))
                        .collect()
                }))
            }
        }
    }
}

/// Remove `{weight=N}`/`{inherits=N}` metadata and normalize spacing.
pub(crate) fn strip_metadata(pattern: &str) -> String {
    collapse_whitespace(&regex!(r"(?i)\{(?:weight|inherits)=\d+\}").replace_all(pattern, " "))
}

fn normalize_pipes(pattern: &str) -> String {
    let collapsed = regex!(r"\|{2,}").replace_all(pattern, "|");
    let opened = regex!(r"([(\[])\|+").replace_all(&collapsed, "$1");
    regex!(r"\|+([)\]])").replace_all(&opened, "$1").into_owned()
}

pub(crate) fn compile(pattern: &str, scope: &PatternScope<'_>) -> Result<Matcher, PatternError> {
    let text = normalize_pipes(&strip_metadata(pattern));
    if PatternShape::scan(&text).is_atomic() {
        return Ok(Matcher::Exact(text));
    }
    if text == "*" {
        return Ok(Matcher::Regex("(.*?)".to_string()));
    }

    let mut compiler = Compiler { scope, optionals: 0 };
    let mut out = String::with_capacity(text.len() * 2);
    compiler.emit(&text, Wildcards::Capture, &mut out)?;
    Ok(Matcher::Regex(out))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wildcards {
    Capture,
    /// Inside an optional.
    NonCapturing,
}

impl Wildcards {
    fn regex(self, symbol: char) -> &'static str {
        match (self, symbol) {
            (Wildcards::Capture, '#') => r"(\d+?)",
            (Wildcards::Capture, '_') => r"([^\s\d]+?)",
            (Wildcards::Capture, _) => "(.+?)",
            (Wildcards::NonCapturing, '#') => r"(?:\d+?)",
            (Wildcards::NonCapturing, '_') => r"(?:[^\s\d]+?)",
            (Wildcards::NonCapturing, _) => "(?:.+?)",
        }
    }
}

struct Compiler<'s, 'a> {
    scope: &'s PatternScope<'a>,
    optionals: usize,
}

impl Compiler<'_, '_> {
    fn emit(&mut self, src: &str, wildcards: Wildcards, out: &mut String) -> Result<(), PatternError> {
        let mut rest = src;
        while let Some(c) = rest.chars().next() {
            match c {
                '*' | '#' | '_' => {
                    out.push_str(wildcards.regex(c));
                    rest = &rest[1..];
                }
                '[' => {
                    let end = rest.find(']').ok_or(PatternError::Unclosed('['))?;
                    self.optionals += 1;
                    if self.optionals > OPTIONAL_LIMIT {
                        return Err(PatternError::TooManyOptionals);
                    }
                    let alternatives = match self.alternatives(&rest[1..end], Wildcards::NonCapturing) {
                        Err(PatternError::MissingArray(_)) => Vec::new(),
                        other => other?,
                    };

                    // The optional owns the whitespace around it.
                    while out.ends_with(' ') {
                        out.pop();
                    }
                    out.push_str("(?:");
                    for alternative in &alternatives {
                        out.push_str(BOUNDARY);
                        out.push_str(alternative);
                        out.push_str(BOUNDARY);
                        out.push('|');
                    }
                    out.push_str(BOUNDARY);
                    out.push(')');
                    rest = rest[end + 1..].trim_start();
                }
                '(' => {
                    let end = closing_paren(rest).ok_or(PatternError::Unclosed('('))?;
                    let alternatives = self.alternatives(&rest[1..end], wildcards)?;
                    out.push('(');
                    out.push_str(&alternatives.join("|"));
                    out.push(')');
                    rest = &rest[end + 1..];
                }
                '@' => {
                    let name_len =
                        rest[1..].find(|c: char| !(c.is_alphanumeric() || c == '_')).unwrap_or(rest.len() - 1);
                    if name_len == 0 {
                        out.push('@');
                        rest = &rest[1..];
                        continue;
                    }
                    let name = &rest[1..1 + name_len];
                    let items = self
                        .scope
                        .arrays
                        .get(name)
                        .filter(|items| !items.is_empty())
                        .ok_or_else(|| PatternError::MissingArray(name.to_string()))?;
                    let escaped: Vec<String> = items.iter().map(|item| regex::escape(&item.to_lowercase())).collect();
                    out.push_str("(?:");
                    out.push_str(&escaped.join("|"));
                    out.push(')');
                    rest = &rest[1 + name_len..];
                }
                '<' => {
                    if let Some(end) = rest.find('>') {
                        if let Some(value) = self.resolve(&rest[1..end]) {
                            out.push_str(&regex::escape(&value));
                            rest = &rest[end + 1..];
                            continue;
                        }
                    }
                    out.push('<');
                    rest = &rest[1..];
                }
                _ => {
                    let mut buf = [0u8; 4];
                    out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
                    rest = &rest[c.len_utf8()..];
                }
            }
        }
        Ok(())
    }

    /// Compile each `|`-separated alternative. Alternatives naming an unknown
    /// array are dropped; if nothing survives that is reported upward.
    fn alternatives(&mut self, inner: &str, wildcards: Wildcards) -> Result<Vec<String>, PatternError> {
        let mut compiled = Vec::new();
        let mut missing = None;
        for part in split_alternatives(inner) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut buf = String::new();
            match self.emit(part, wildcards, &mut buf) {
                Ok(()) => compiled.push(buf),
                Err(PatternError::MissingArray(name)) => {
                    missing.get_or_insert(name);
                }
                Err(e) => return Err(e),
            }
        }
        match missing {
            Some(name) if compiled.is_empty() => Err(PatternError::MissingArray(name)),
            _ => Ok(compiled),
        }
    }

    /// Value of an embedded `<...>` reference, or `None` for tags that are
    /// matched literally.
    fn resolve(&self, tag: &str) -> Option<String> {
        let (kind, arg) = match tag.split_once(' ') {
            Some((kind, arg)) => (kind, arg.trim()),
            None => (tag, ""),
        };
        let kind = kind.to_ascii_lowercase();
        match kind.as_str() {
            "bot" => {
                let value = self.scope.bot_vars.get(arg).map(String::as_str).unwrap_or("");
                Some(strip_nasties(value, self.scope.utf8).to_lowercase())
            }
            "get" => Some(self.scope.user.var(arg).to_lowercase()),
            _ if arg.is_empty() => {
                let (name, index) = history_ref(&kind)?;
                let history = &self.scope.user.history;
                Some(match name {
                    "input" => history.input(index).to_string(),
                    _ => (self.scope.format_reply)(history.reply(index)),
                })
            }
            _ => None,
        }
    }
}

/// Parse `input`, `reply`, `inputN`, `replyN` (N in 1..=9).
pub(crate) fn history_ref(tag: &str) -> Option<(&'static str, usize)> {
    let (name, digits) = if let Some(rest) = tag.strip_prefix("input") {
        ("input", rest)
    } else if let Some(rest) = tag.strip_prefix("reply") {
        ("reply", rest)
    } else {
        return None;
    };
    match digits {
        "" => Some((name, 1)),
        d if d.len() == 1 => match d.parse::<usize>() {
            Ok(n @ 1..=9) => Some((name, n)),
            _ => None,
        },
        _ => None,
    }
}

fn split_alternatives(inner: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            '|' if depth == 0 => {
                parts.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&inner[start..]);
    parts
}

fn closing_paren(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

// --- Regex cache -------------------------------------------------------------

/// Anchored regexes keyed by their unanchored source.
#[derive(Debug, Default)]
pub(crate) struct RegexCache {
    compiled: Mutex<HashMap<String, Regex>>,
}

impl RegexCache {
    pub(crate) fn get(&self, source: &str) -> Result<Regex, regex::Error> {
        let mut compiled = self.compiled.lock();
        if let Some(re) = compiled.get(source) {
            return Ok(re.clone());
        }
        let re = Regex::new(&format!("^{source}$"))?;
        if compiled.len() >= REGEX_CACHE_LIMIT {
            compiled.clear();
        }
        compiled.insert(source.to_string(), re.clone());
        Ok(re)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.compiled.lock().len()
    }
}

// --- Load-time validation ----------------------------------------------------

/// Validate a trigger, `%Previous` or redirect pattern.
pub(crate) fn check_trigger(pattern: &str, utf8: bool) -> Result<(), String> {
    if utf8 {
        if regex!(r"[A-Z\\.]").is_match(pattern) {
            return Err("Triggers can't contain uppercase letters, backslashes or dots in UTF-8 mode".into());
        }
    } else if regex!(r"[^a-z0-9(|)\[\]*_#@{}<>=/\s]").is_match(pattern) {
        return Err(
            "Triggers may only contain lowercase letters, numbers, and these symbols: ( | ) [ ] * _ # { } < > = /"
                .into(),
        );
    }

    if regex!(r"\(\||\|\)").is_match(pattern) {
        return Err("Piped alternations can't begin or end with a |".into());
    }
    if regex!(r"\([^)].+\|\|.+\)").is_match(pattern) {
        return Err("Piped alternations can't include blank entries".into());
    }
    if regex!(r"\[\||\|\]").is_match(pattern) {
        return Err("Piped optionals can't begin or end with a |".into());
    }
    if regex!(r"\[[^\]].+\|\|.+\]").is_match(pattern) {
        return Err("Piped optionals can't include blank entries".into());
    }

    let (mut parens, mut square, mut curly, mut angle) = (0i32, 0i32, 0i32, 0i32);
    for c in pattern.chars() {
        match c {
            '(' => parens += 1,
            ')' => parens -= 1,
            '[' => square += 1,
            ']' => square -= 1,
            '{' => curly += 1,
            '}' => curly -= 1,
            '<' => angle += 1,
            '>' => angle -= 1,
            _ => {}
        }
    }
    if parens != 0 {
        return Err("Unmatched parenthesis brackets".into());
    }
    if square != 0 {
        return Err("Unmatched square brackets".into());
    }
    if curly != 0 {
        return Err("Unmatched curly brackets".into());
    }
    if angle != 0 {
        return Err("Unmatched angle brackets".into());
    }
    Ok(())
}

pub(crate) fn check_condition(condition: &str) -> Result<(), String> {
    if regex!(r"^.+?\s*(?:==|eq|!=|ne|<>|<|<=|>|>=)\s*.+?=>.+?$").is_match(condition) {
        Ok(())
    } else {
        Err("Invalid format for condition: should be like 'value symbol value => response'".into())
    }
}

pub(crate) fn check_topic_name(name: &str, force_case: bool) -> Result<(), String> {
    if !force_case && regex!(r"[^a-z0-9_\-\s]").is_match(name) {
        Err("Topics should be lowercased and contain only letters and numbers".into())
    } else if regex!(r"[^A-Za-z0-9_\-\s]").is_match(name) {
        Err("Topics should contain only letters and numbers in forceCase mode".into())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        bot: HashMap<String, String>,
        arrays: HashMap<String, Vec<String>>,
        user: UserData,
    }

    impl Fixture {
        fn new() -> Self {
            let mut bot = HashMap::new();
            bot.insert("name".to_string(), "Aiden!".to_string());
            let mut arrays = HashMap::new();
            arrays.insert("colors".to_string(), vec!["red".to_string(), "light blue".to_string()]);
            let mut user = UserData::default();
            user.vars.insert("name".to_string(), "Bob".to_string());
            user.history.push("hello bot", "Hello, human!");
            Fixture { bot, arrays, user }
        }

        fn matches(&self, pattern: &str, message: &str) -> Option<Vec<String>> {
            let format_reply = |text: &str| strip_nasties(&text.to_lowercase(), false);
            let scope = PatternScope {
                bot_vars: &self.bot,
                arrays: &self.arrays,
                user: &self.user,
                utf8: false,
                format_reply: &format_reply,
            };
            match compile(pattern, &scope) {
                Ok(matcher) => matcher.captures(message, &RegexCache::default()).unwrap(),
                Err(PatternError::MissingArray(_)) => None,
                Err(e) => panic!("{pattern:?} failed to compile: {e}"),
            }
        }
    }

    #[test]
    fn atomic_patterns_compare_exactly() {
        let f = Fixture::new();
        let scope = PatternScope {
            bot_vars: &f.bot,
            arrays: &f.arrays,
            user: &f.user,
            utf8: false,
            format_reply: &|t: &str| t.to_string(),
        };
        assert_eq!(compile("hello bot {weight=5}", &scope).unwrap(), Matcher::Exact("hello bot".into()));
        assert_eq!(f.matches("hello bot", "hello bot"), Some(vec![]));
        assert_eq!(f.matches("hello bot", "hello bots"), None);
    }

    #[test]
    fn wildcards_capture() {
        let f = Fixture::new();
        let cases: &[(&str, &str, Option<&[&str]>)] = &[
            ("my name is *", "my name is bob", Some(&["bob"])),
            ("* told me to say *", "john told me to say hi there", Some(&["john", "hi there"])),
            ("i am # years old", "i am 42 years old", Some(&["42"])),
            ("i am # years old", "i am forty years old", None),
            ("i am _ years old", "i am forty years old", Some(&["forty"])),
            ("i am _ years old", "i am 42 years old", None),
            ("*", "", Some(&[""])),
            ("*", "anything at all", Some(&["anything at all"])),
        ];
        for (pattern, message, expected) in cases {
            let expected = expected.map(|stars| stars.iter().map(|s| s.to_string()).collect::<Vec<_>>());
            assert_eq!(f.matches(pattern, message), expected, "{pattern:?} vs {message:?}");
        }
    }

    #[test]
    fn optionals_absorb_whitespace() {
        let f = Fixture::new();
        let pattern = "what is your [home|office] phone number";
        assert_eq!(f.matches(pattern, "what is your phone number"), Some(vec![]));
        assert_eq!(f.matches(pattern, "what is your home phone number"), Some(vec![]));
        assert_eq!(f.matches(pattern, "what is your office phone number"), Some(vec![]));
        assert_eq!(f.matches(pattern, "what is your cell phone number"), None);
        assert_eq!(f.matches("[please] help", "help"), Some(vec![]));
        assert_eq!(f.matches("hello [there]", "hello"), Some(vec![]));
        assert_eq!(f.matches("hello [*]", "hello you there"), Some(vec![]));
    }

    #[test]
    fn alternations_capture_as_stars() {
        let f = Fixture::new();
        assert_eq!(f.matches("i (like|love) *", "i love cats"), Some(vec!["love".into(), "cats".into()]));
        assert_eq!(f.matches("(||hi|hello) bot", "hi bot"), Some(vec!["hi".into()]));
    }

    #[test]
    fn arrays_expand_and_missing_arrays_match_nothing() {
        let f = Fixture::new();
        assert_eq!(f.matches("my favorite color is @colors", "my favorite color is light blue"), Some(vec![]));
        assert_eq!(f.matches("i like (@colors)", "i like red"), Some(vec!["red".into()]));
        assert_eq!(f.matches("my favorite color is @nope", "my favorite color is "), None);
        assert_eq!(f.matches("my favorite color is @nope", "my favorite color is red"), None);
        assert_eq!(f.matches("i like [@nope] pie", "i like pie"), Some(vec![]));
    }

    #[test]
    fn variables_resolve_as_literal_text() {
        let f = Fixture::new();
        assert_eq!(f.matches("my name is <get name>", "my name is bob"), Some(vec![]));
        assert_eq!(f.matches("are you <bot name>", "are you aiden"), Some(vec![]));
        assert_eq!(f.matches("<input>", "hello bot"), Some(vec![]));
        assert_eq!(f.matches("<reply1>", "hello human"), Some(vec![]));
        assert_eq!(f.matches("say <input2>", "say undefined"), Some(vec![]));
    }

    #[test]
    fn too_many_optionals_give_up() {
        let f = Fixture::new();
        let scope = PatternScope {
            bot_vars: &f.bot,
            arrays: &f.arrays,
            user: &f.user,
            utf8: false,
            format_reply: &|t: &str| t.to_string(),
        };
        let pattern = "[a] ".repeat(OPTIONAL_LIMIT + 1);
        assert!(matches!(compile(&pattern, &scope), Err(PatternError::TooManyOptionals)));
        assert!(matches!(compile("hello [there", &scope), Err(PatternError::Unclosed('['))));
    }

    #[test]
    fn shape_scan() {
        assert!(PatternShape::scan("hello bot").is_atomic());
        assert!(!PatternShape::scan("hello @bots").is_atomic());
        let shape = PatternShape::scan("_ [x] #");
        assert!(shape.contains(PatternShape::UNDERSCORE | PatternShape::OPTIONAL | PatternShape::POUND));
        assert!(!shape.contains(PatternShape::STAR));
    }

    #[test]
    fn cache_reuses_compiled_regexes() {
        let cache = RegexCache::default();
        cache.get("a (.+?)").unwrap();
        cache.get("a (.+?)").unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("(unclosed").is_err());
    }

    #[test]
    fn syntax_checks() {
        let cases: &[(&str, bool, bool)] = &[
            ("hello bot", false, true),
            ("my name is *", false, true),
            ("Hello bot", false, false),
            ("what's up", false, false),
            ("(ab||cd) c", false, false),
            ("(|a) c", false, false),
            ("[a|] c", false, false),
            ("hello (bot", false, false),
            ("hello <get name", false, false),
            ("ça va", true, true),
            ("hello.", true, false),
            ("hello {weight=10}", false, true),
        ];
        for (pattern, utf8, ok) in cases {
            assert_eq!(check_trigger(pattern, *utf8).is_ok(), *ok, "{pattern:?}");
        }
        assert!(check_condition("<get age> > 18 => Adult.").is_ok());
        assert!(check_condition("just words").is_err());
        assert!(check_topic_name("sales_2", false).is_ok());
        assert!(check_topic_name("Sales", false).is_err());
        assert!(check_topic_name("Sales", true).is_ok());
    }
}

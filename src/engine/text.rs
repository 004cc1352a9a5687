//! Small string helpers shared by the pattern compiler, the sorter and the tag
//! engine.
//!
//! Everything here is pure and allocation-light; none of it knows about users
//! or sessions.

/// Case transforms used by the `{formal}`/`{sentence}`/`{uppercase}`/
/// `{lowercase}` blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Case {
    Upper,
    Lower,
    /// First character of the string uppercased.
    Sentence,
    /// First character of every word uppercased.
    Formal,
}

impl Case {
    pub(crate) fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "uppercase" => Some(Case::Upper),
            "lowercase" => Some(Case::Lower),
            "sentence" => Some(Case::Sentence),
            "formal" => Some(Case::Formal),
            _ => None,
        }
    }

    pub(crate) fn apply(self, text: &str) -> String {
        match self {
            Case::Upper => text.to_uppercase(),
            Case::Lower => text.to_lowercase(),
            Case::Sentence => capitalize(text),
            Case::Formal => text.split(' ').map(capitalize).collect::<Vec<_>>().join(" "),
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Count "real" words, ignoring wildcard symbols and pipes.
///
/// With `all` set, every space-separated chunk counts (used for substitution
/// phrases); otherwise wildcard characters act as separators too.
pub(crate) fn word_count(text: &str, all: bool) -> usize {
    if all {
        text.split_whitespace().count()
    } else {
        text.split(|c: char| c.is_whitespace() || matches!(c, '*' | '#' | '_' | '|')).filter(|w| !w.is_empty()).count()
    }
}

/// Trim and collapse every whitespace run to a single space.
pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove anything that is not a plain ASCII letter, digit or space.
///
/// In UTF-8 mode only the characters that would break tag parsing are dropped.
pub(crate) fn strip_nasties(text: &str, utf8: bool) -> String {
    if utf8 {
        text.chars().filter(|c| !matches!(c, '<' | '>' | '\\')).collect()
    } else {
        text.chars().filter(|c| c.is_ascii_alphanumeric() || *c == ' ').collect()
    }
}

/// Integer parse that tolerates trailing garbage: `"12 apples"` is 12.
///
/// Leading whitespace and a sign are accepted; a string without leading digits
/// is not a number.
pub(crate) fn parse_leading_int(text: &str) -> Option<i64> {
    let trimmed = text.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let end = digits.bytes().take_while(u8::is_ascii_digit).count();
    if end == 0 {
        return None;
    }
    let value: i64 = digits[..end].parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Render a number the way user variables store it: whole values without a
/// decimal point.
pub(crate) fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Split `<call>` arguments on whitespace, keeping double-quoted spans whole.
pub(crate) fn shell_words(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;

    for c in text.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if pending {
                    words.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_transforms() {
        let cases = [
            (Case::Upper, "hello there", "HELLO THERE"),
            (Case::Lower, "HeLLo", "hello"),
            (Case::Sentence, "hello there", "Hello there"),
            (Case::Formal, "john van doe", "John Van Doe"),
            (Case::Sentence, "", ""),
        ];
        for (case, input, expected) in cases {
            assert_eq!(case.apply(input), expected, "{case:?} on {input:?}");
        }
    }

    #[test]
    fn word_count_ignores_wildcards() {
        assert_eq!(word_count("my name is *", false), 3);
        assert_eq!(word_count("* told me to say *", false), 4);
        assert_eq!(word_count("_ # *", false), 0);
        assert_eq!(word_count("(a|b) c", false), 3);
        assert_eq!(word_count("what's up", true), 2);
    }

    #[test]
    fn strip_nasties_modes() {
        assert_eq!(strip_nasties("what's up?", false), "whats up");
        assert_eq!(strip_nasties("<b>ça va?</b>", true), "bça va?/b");
    }

    #[test]
    fn leading_int_parse() {
        assert_eq!(parse_leading_int("42"), Some(42));
        assert_eq!(parse_leading_int("  -7 apples"), Some(-7));
        assert_eq!(parse_leading_int("3.9"), Some(3));
        assert_eq!(parse_leading_int("abc"), None);
        assert_eq!(parse_leading_int(""), None);
    }

    #[test]
    fn number_formatting_drops_trailing_zero() {
        assert_eq!(format_number(6.0), "6");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(-3.0), "-3");
    }

    #[test]
    fn shell_words_keep_quoted_spans() {
        assert_eq!(shell_words(r#"base64 "hello world" again"#), vec!["base64", "hello world", "again"]);
        assert_eq!(shell_words("  a   b "), vec!["a", "b"]);
        assert_eq!(shell_words(r#"say """#), vec!["say", ""]);
    }
}

//! Reply template expansion.
//!
//! A chosen reply is rewritten by a fixed sequence of passes. Order matters:
//! later passes see the output of earlier ones, so `<set name=<star>>` works
//! because stars are substituted before variable tags, and a `{random}` built
//! from `(@array)` is resolved because arrays run first.
//!
//! ```text
//! (@array) ─▶ <call> args wrapped ─▶ shortcuts ─▶ {weight} strip
//!    ─▶ <star>/<botstar> ─▶ <input>/<reply> ─▶ <id> ─▶ \s \n \#
//!    ─▶ {random} ─▶ {person}/{formal}/... ─▶ <bot>/<env>/<set>/<get>/math (innermost first)
//!    ─▶ {topic=} ─▶ {@redirect} ─▶ <call> dispatch
//! ```
//!
//! Every loop is bounded; running out logs a warning and leaves whatever is
//! left literal. Variable tags are resolved innermost-first by always taking
//! the first `<...>` without a nested `<`; unknown tags are parked as
//! `\x00...\x01` so the scan moves past them, then restored at the end.
//!
//! `<call>` bodies are tokenized up front and each argument is wrapped in
//! private markers, so the passes above expand arguments in place without a
//! value containing spaces being re-split later.

use super::brain::{Brain, ReplyContext};
use super::metrics::StepKind;
use super::text::{Case, format_number, parse_leading_int, shell_words};
use crate::error::Result;
use crate::objects::MacroCall;
use crate::session::{History, SessionPatch, UNDEFINED};
use rand::Rng;
use regex::Regex;
use std::ops::Range;
use tracing::{debug, warn};

/// Cap for the topic, format, inline redirect and call passes.
pub(crate) const TAG_LIMIT: usize = 50;
/// Cap for the innermost-first variable tag pass.
const VARIABLE_TAG_LIMIT: usize = 1000;

const CALL_OPEN: &str = "\u{2}call\u{3}";
const CALL_CLOSE: &str = "\u{2}/call\u{3}";
const ARG_OPEN: &str = "\u{2}arg\u{3}";
const ARG_CLOSE: &str = "\u{2}/arg\u{3}";

/// Owned result of a regex search, so the searched string can be edited.
pub(super) struct TagMatch {
    pub span: Range<usize>,
    pub groups: Vec<String>,
}

pub(super) fn find(re: &Regex, text: &str) -> Option<TagMatch> {
    let caps = re.captures(text)?;
    let span = caps.get(0)?.range();
    let groups = caps.iter().skip(1).map(|m| m.map_or_else(String::new, |m| m.as_str().to_string())).collect();
    Some(TagMatch { span, groups })
}

fn format_block(kind: &str) -> &'static Regex {
    match kind {
        "person" => regex!(r"(?is)\{person\}(.*?)\{/person\}"),
        "formal" => regex!(r"(?is)\{formal\}(.*?)\{/formal\}"),
        "sentence" => regex!(r"(?is)\{sentence\}(.*?)\{/sentence\}"),
        "uppercase" => regex!(r"(?is)\{uppercase\}(.*?)\{/uppercase\}"),
        _ => regex!(r"(?is)\{lowercase\}(.*?)\{/lowercase\}"),
    }
}

const FORMAT_BLOCKS: [&str; 5] = ["person", "formal", "sentence", "uppercase", "lowercase"];

/// `<starN>`-style lookup: 1-based, anything missing reads `"undefined"`.
fn star(stars: &[String], index: &str) -> String {
    let n = if index.is_empty() { 1 } else { index.parse::<usize>().unwrap_or(0) };
    n.checked_sub(1).and_then(|i| stars.get(i)).cloned().unwrap_or_else(|| UNDEFINED.to_string())
}

/// Rewrite `<call>name a "b c"</call>` into marker form with wrapped args.
fn wrap_calls(reply: &str) -> String {
    regex!(r"(?is)<call>(.*?)</call>")
        .replace_all(reply, |caps: &regex::Captures<'_>| {
            let mut words = shell_words(&caps[1]).into_iter();
            let name = words.next().unwrap_or_default();
            let args: String = words.map(|arg| format!(" {ARG_OPEN}{arg}{ARG_CLOSE}")).collect();
            format!("{CALL_OPEN}{name}{args}{CALL_CLOSE}")
        })
        .into_owned()
}

fn expand_shortcuts(reply: &str) -> String {
    let reply = regex!(r"(?i)<person>").replace_all(reply, "{person}<star>{/person}");
    let reply = regex!(r"(?i)<@>").replace_all(&reply, "{@<star>}");
    let reply = regex!(r"(?i)<formal>").replace_all(&reply, "{formal}<star>{/formal}");
    let reply = regex!(r"(?i)<sentence>").replace_all(&reply, "{sentence}<star>{/sentence}");
    let reply = regex!(r"(?i)<uppercase>").replace_all(&reply, "{uppercase}<star>{/uppercase}");
    regex!(r"(?i)<lowercase>").replace_all(&reply, "{lowercase}<star>{/lowercase}").into_owned()
}

impl Brain {
    /// Run every expansion pass over `reply`.
    pub(crate) async fn process_tags(
        &self,
        ctx: &mut ReplyContext,
        reply: &str,
        stars: &[String],
        botstars: &[String],
        depth: usize,
    ) -> Result<String> {
        let user = ctx.user.clone();
        let mut reply = reply.to_string();

        // (@array) → {random}
        let mut guard = 0;
        while let Some(m) = find(regex!(r"\(@([A-Za-z0-9_]+)\)"), &reply) {
            guard += 1;
            if guard > self.depth {
                warn!(user = %user, "too many array expansions in reply");
                break;
            }
            let name = &m.groups[0];
            let replacement = match self.arrays.get(name) {
                Some(items) => format!("{{random}}{}{{/random}}", items.join("|")),
                None => format!("\x00@{name}\x00"),
            };
            reply.replace_range(m.span, &replacement);
        }
        reply = regex!(r"\x00@([A-Za-z0-9_]+)\x00").replace_all(&reply, "(@$1)").into_owned();

        reply = wrap_calls(&reply);
        reply = expand_shortcuts(&reply);
        reply = regex!(r"(?i)\{weight=\d+\}").replace_all(&reply, "").into_owned();

        reply = regex!(r"(?i)<star(\d*)>")
            .replace_all(&reply, |caps: &regex::Captures<'_>| star(stars, &caps[1]))
            .into_owned();
        reply = regex!(r"(?i)<botstar(\d*)>")
            .replace_all(&reply, |caps: &regex::Captures<'_>| star(botstars, &caps[1]))
            .into_owned();

        let history_tag = regex!(r"(?i)<(input|reply)([1-9]?)>");
        if history_tag.is_match(&reply) {
            let history: History = self.sessions.get_any(&user).await?.map(|data| data.history).unwrap_or_default();
            reply = history_tag
                .replace_all(&reply, |caps: &regex::Captures<'_>| {
                    let n = caps[2].parse::<usize>().unwrap_or(1);
                    let value = if caps[1].eq_ignore_ascii_case("input") { history.input(n) } else { history.reply(n) };
                    value.to_string()
                })
                .into_owned();
        }

        reply = regex!(r"(?i)<id>").replace_all(&reply, regex::NoExpand(&user)).into_owned();
        reply = reply.replace("\\s", " ").replace("\\n", "\n").replace("\\#", "#");

        // {random}
        let mut guard = 0;
        while let Some(m) = find(regex!(r"(?is)\{random\}(.*?)\{/random\}"), &reply) {
            guard += 1;
            if guard > self.depth {
                warn!(user = %user, "too many {{random}} tags in reply");
                break;
            }
            let body = &m.groups[0];
            let choices: Vec<&str> =
                if body.contains('|') { body.split('|').collect() } else { body.split(' ').collect() };
            let choice = choices[self.rng.lock().random_range(0..choices.len())].to_string();
            reply.replace_range(m.span, &choice);
        }

        // {person} {formal} {sentence} {uppercase} {lowercase}
        for kind in FORMAT_BLOCKS {
            let mut guard = 0;
            while let Some(m) = find(format_block(kind), &reply) {
                guard += 1;
                if guard > TAG_LIMIT {
                    warn!(user = %user, block = kind, "too many format blocks in reply");
                    break;
                }
                let body = &m.groups[0];
                let formatted = match Case::from_tag(kind) {
                    Some(case) => case.apply(body),
                    None => self.person.apply(body, &self.punctuation),
                };
                reply.replace_range(m.span, &formatted);
            }
        }

        // Innermost-first variable tags.
        let mut guard = 0;
        while let Some(m) = find(regex!(r"<([^<]+?)>"), &reply) {
            guard += 1;
            if guard > VARIABLE_TAG_LIMIT {
                warn!(user = %user, "too many tags in reply");
                break;
            }
            let inner = &m.groups[0];
            let (tag, data) = match inner.split_once(' ') {
                Some((tag, data)) => (tag.to_ascii_lowercase(), data),
                None => (inner.to_ascii_lowercase(), ""),
            };
            // Unknown tags nested in this one are stored as written.
            let data = data.replace('\x00', "<").replace('\x01', ">");
            let data = data.as_str();
            let insert = match tag.as_str() {
                "bot" | "env" => self.bot_or_env(&tag, data),
                "set" => {
                    match data.split_once('=') {
                        Some((name, value)) => {
                            debug!(user = %user, name, value, "set user variable");
                            self.sessions.set(&user, SessionPatch::new().var(name, value)).await?;
                        }
                        None => warn!(user = %user, tag = %inner, "<set> without a value"),
                    }
                    String::new()
                }
                "add" | "sub" | "mult" | "div" => self.math(&user, &tag, data).await?,
                "get" => self.sessions.get(&user, data).await?.unwrap_or_else(|| UNDEFINED.to_string()),
                _ => format!("\x00{inner}\x01"),
            };
            reply.replace_range(m.span, &insert);
        }
        reply = reply.replace('\x00', "<").replace('\x01', ">");

        // {topic=...}
        let mut guard = 0;
        while let Some(m) = find(regex!(r"(?i)\{topic=(.+?)\}"), &reply) {
            guard += 1;
            if guard > TAG_LIMIT {
                warn!(user = %user, "too many topic tags in reply");
                break;
            }
            let topic = m.groups[0].as_str();
            debug!(user = %user, topic, "topic changed");
            self.sessions.set(&user, SessionPatch::new().var("topic", topic)).await?;
            reply.replace_range(m.span, "");
        }

        // {@inline redirect}
        let mut guard = 0;
        while let Some(m) = find(regex!(r"\{@([^}]*?)\}"), &reply) {
            guard += 1;
            if guard > TAG_LIMIT {
                warn!(user = %user, "too many inline redirects in reply");
                break;
            }
            let target = self.process_calls(ctx, m.groups[0].trim()).await?;
            let target = self.format_message(&target, false);
            debug!(user = %user, target = %target, "inline redirect");
            let subreply = self.get_reply(ctx, target, StepKind::Normal, depth + 1).await?;
            reply.replace_range(m.span, &subreply);
        }

        self.process_calls(ctx, &reply).await
    }

    /// Read or assign a bot (`<bot>`) or global (`<env>`) variable.
    fn bot_or_env(&self, tag: &str, data: &str) -> String {
        let table = if tag == "bot" { &self.vars } else { &self.globals };
        if let Some((name, value)) = data.split_once('=') {
            debug!(tag, name, value, "set variable");
            table.write().insert(name.to_string(), value.to_string());
            return String::new();
        }
        let value = table.read().get(data).cloned();
        value.filter(|v| !v.is_empty()).unwrap_or_else(|| UNDEFINED.to_string())
    }

    /// `<add|sub|mult|div name=value>`; the text to insert in the reply.
    async fn math(&self, user: &str, op: &str, data: &str) -> Result<String> {
        let (name, value) = data.split_once('=').unwrap_or((data, ""));

        let mut current = self.sessions.get(user, name).await?.unwrap_or_else(|| UNDEFINED.to_string());
        if current == UNDEFINED {
            current = "0".to_string();
            self.sessions.set(user, SessionPatch::new().var(name, "0")).await?;
        }

        let Some(operand) = parse_leading_int(value) else {
            return Ok(format!("[ERR: Math can't '{op}' non-numeric value '{value}']"));
        };
        let Some(base) = parse_leading_int(&current) else {
            return Ok(format!("[ERR: Math can't '{op}' non-numeric user variable '{name}']"));
        };

        let (base, operand) = (base as f64, operand as f64);
        let result = match op {
            "add" => base + operand,
            "sub" => base - operand,
            "mult" => base * operand,
            _ if operand == 0.0 => return Ok("[ERR: Can't Divide By Zero]".to_string()),
            _ => base / operand,
        };
        self.sessions.set(user, SessionPatch::new().var(name, format_number(result))).await?;
        Ok(String::new())
    }

    /// Dispatch every `<call>` left in `text` to its object handler.
    pub(crate) async fn process_calls(&self, ctx: &ReplyContext, text: &str) -> Result<String> {
        let mut text = text.to_string();
        let mut guard = 0;
        while let Some(start) = text.find(CALL_OPEN) {
            guard += 1;
            if guard > TAG_LIMIT {
                warn!(user = %ctx.user, "too many object calls in reply");
                break;
            }
            let body_start = start + CALL_OPEN.len();
            let Some(len) = text[body_start..].find(CALL_CLOSE) else {
                break;
            };
            let body = &text[body_start..body_start + len];
            let name = body.split(ARG_OPEN).next().unwrap_or("").trim().to_string();
            let args: Vec<String> = body
                .split(ARG_OPEN)
                .skip(1)
                .map(|arg| arg.split(ARG_CLOSE).next().unwrap_or("").to_string())
                .collect();

            let output = self.call_object(ctx, &name, &args).await;
            text.replace_range(start..body_start + len + CALL_CLOSE.len(), &output);
        }
        // Leftover markers from an unterminated call stay readable.
        let text = text.replace(CALL_OPEN, "<call>").replace(CALL_CLOSE, "</call>");
        Ok(text.replace(ARG_OPEN, "").replace(ARG_CLOSE, ""))
    }

    async fn call_object(&self, ctx: &ReplyContext, name: &str, args: &[String]) -> String {
        let Some(language) = self.object_languages.get(name) else {
            warn!(user = %ctx.user, object = name, "call to an unknown object");
            return self.options.errors.object_not_found.clone();
        };
        let Some(handler) = self.handlers.get(language) else {
            warn!(user = %ctx.user, object = name, language = %language, "no handler for object language");
            return "[ERR: No Object Handler]".to_string();
        };

        let call = MacroCall { brain: self, user: &ctx.user, name, args, scope: ctx.scope.as_ref() };
        match handler.call(call).await {
            Ok(output) => output,
            Err(err) => {
                warn!(user = %ctx.user, object = name, language = %language, %err, "object call failed");
                format!("[ERR: Error when executing {language} object: {err}]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_lookup_defaults_to_undefined() {
        let stars = vec!["bob".to_string(), "42".to_string()];
        assert_eq!(star(&stars, ""), "bob");
        assert_eq!(star(&stars, "2"), "42");
        assert_eq!(star(&stars, "3"), UNDEFINED);
        assert_eq!(star(&stars, "0"), UNDEFINED);
        assert_eq!(star(&[], ""), UNDEFINED);
    }

    #[test]
    fn calls_are_wrapped_with_tokenized_args() {
        let wrapped = wrap_calls(r#"Result: <call>reverse "hello world" <star></call>!"#);
        assert_eq!(
            wrapped,
            format!(
                "Result: {CALL_OPEN}reverse {ARG_OPEN}hello world{ARG_CLOSE} {ARG_OPEN}<star>{ARG_CLOSE}{CALL_CLOSE}!"
            )
        );
    }

    #[test]
    fn shortcuts_expand_to_star_blocks() {
        assert_eq!(expand_shortcuts("<person> and <@>"), "{person}<star>{/person} and {@<star>}");
        assert_eq!(expand_shortcuts("<Formal>"), "{formal}<star>{/formal}");
    }

    #[test]
    fn find_returns_owned_groups() {
        let m = find(regex!(r"\{topic=(.+?)\}"), "ok {topic=sales} done").unwrap();
        assert_eq!(m.span, 3..16);
        assert_eq!(m.groups, vec!["sales"]);
    }
}

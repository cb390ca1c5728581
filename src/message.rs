use std::{fmt::Display, str::FromStr};

use thiserror::Error;
use tracing::debug;

/// Default cap on the tag section, including the leading `@` and trailing space.
pub const MAX_TAGS_LENGTH: usize = 8191;
/// Default cap on everything after the tag section, including CRLF.
pub const MAX_LINE_LENGTH: usize = 512;
const MAX_PARAMS: usize = 15;

/*
<message>       ::= ['@' <tags> <SPACE>] [':' <source> <SPACE> ] <command> <parameters> <crlf>
<tags>          ::= <tag> [';' <tag>]*
<tag>           ::= <key> ['=' <escaped value>]
<key>           ::= [ <client_prefix> ] [ <vendor> '/' ] <sequence of letters, digits, hyphens (`-`)>
<client_prefix> ::= '+'
<escaped value> ::= <sequence of any characters except NUL, CR, LF, semicolon (`;`) and SPACE>
<command>       ::= <letter>+ | <digit>{3}
<parameters>    ::= *( SPACE middle ) [ SPACE ":" trailing ]
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineLimits {
    pub tags: usize,
    pub body: usize,
}

impl Default for LineLimits {
    fn default() -> Self {
        LineLimits {
            tags: MAX_TAGS_LENGTH,
            body: MAX_LINE_LENGTH,
        }
    }
}

impl LineLimits {
    pub fn frame(&self) -> usize {
        self.tags + self.body
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("message is empty")]
    Empty,
    #[error("message has no command")]
    MissingCommand,
    #[error("invalid command {0}")]
    InvalidCommand(String),
    #[error("tag section exceeds {limit} bytes")]
    TagsTooLong { limit: usize },
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

/// Message tags. Keys are unique; a second insert of the same key replaces
/// the value in place so the wire order stays stable.
#[derive(Debug, Clone, Default)]
pub struct Tags(Vec<(String, Option<String>)>);

impl Tags {
    pub fn new() -> Self {
        Tags(Vec::new())
    }

    /// Keys that could not be written back to the wire are dropped.
    pub fn insert(&mut self, key: impl Into<String>, value: Option<String>) {
        let key = key.into();
        if !is_valid_tag_key(&key) {
            debug!("dropping tag with invalid key {:?}", key);
            return;
        }
        // `key=` and `key` are equivalent on the wire
        let value = value.filter(|v| !v.is_empty());

        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Option<String>> {
        let index = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(index).1)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn retain<F: FnMut(&str) -> bool>(&mut self, mut keep: F) {
        self.0.retain(|(k, _)| keep(k));
    }

    /// Client-only tags (`+` prefixed), the only ones relayed from a client.
    pub fn client_only(&self) -> Tags {
        Tags(
            self.0
                .iter()
                .filter(|(k, _)| k.starts_with('+'))
                .cloned()
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn parse(raw: &str) -> Tags {
        let mut tags = Tags::new();

        for item in raw.split(';').filter(|item| !item.is_empty()) {
            let (key, raw_value) = match item.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (item, None),
            };

            if !is_valid_tag_key(key) {
                debug!("dropping tag with invalid key {:?}", key);
                continue;
            }

            let value = match raw_value.map(unescape_value) {
                Some(Some(value)) => Some(value),
                Some(None) => {
                    debug!("dropping tag {} with malformed escaping", key);
                    continue;
                }
                None => None,
            };

            tags.insert(key, value);
        }

        tags
    }

    fn write_to(&self, out: &mut String) {
        out.push('@');
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(';');
            }
            out.push_str(key);
            if let Some(value) = value {
                out.push('=');
                escape_value(value, out);
            }
        }
        out.push(' ');
    }
}

impl PartialEq for Tags {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .0
                .iter()
                .all(|(k, v)| other.0.iter().any(|(ok, ov)| ok == k && ov == v))
    }
}

impl<K: Into<String>> FromIterator<(K, Option<String>)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, Option<String>)>>(iter: I) -> Self {
        let mut tags = Tags::new();
        for (key, value) in iter {
            tags.insert(key, value);
        }
        tags
    }
}

fn is_valid_tag_key(key: &str) -> bool {
    let name = key.strip_prefix('+').unwrap_or(key);
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '/' || c == '.')
}

/// `None` when the value ends in a lone backslash.
fn unescape_value(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => return None,
        }
    }

    Some(out)
}

fn escape_value(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
}

/// Whether `param` can sit before the last parameter.
fn is_middle(param: &str) -> bool {
    !param.is_empty() && !param.starts_with(':') && !param.contains(' ')
}

fn is_valid_command(command: &str) -> bool {
    command.chars().all(|c| c.is_ascii_alphabetic())
        || (command.len() == 3 && command.chars().all(|c| c.is_ascii_digit()))
}

pub(crate) fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// A single protocol line. Built once through the `with_*` methods and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    tags: Tags,
    prefix: Option<String>,
    command: String,
    params: Vec<String>,
}

impl Message {
    pub fn new(command: &str) -> Self {
        Message {
            tags: Tags::new(),
            prefix: None,
            command: command.to_ascii_uppercase(),
            params: vec![],
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.push_param(param.into());
        self
    }

    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for param in params {
            self.push_param(param.into());
        }
        self
    }

    /// Keeps the params writable: only the last may be empty, hold spaces
    /// or start with `:`, and there are at most `MAX_PARAMS`. A param that
    /// would break either rule is joined onto the last one with a space.
    fn push_param(&mut self, mut param: String) {
        if param.contains(|c: char| matches!(c, '\r' | '\n' | '\0')) {
            param = param.replace(|c: char| matches!(c, '\r' | '\n' | '\0'), " ");
        }

        let full = self.params.len() >= MAX_PARAMS;
        match self.params.last_mut() {
            Some(last) if full || !is_middle(last) => {
                last.push(' ');
                last.push_str(&param);
            }
            _ => self.params.push(param),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        self.tags.insert(key, value);
        self
    }

    pub fn with_tags(mut self, tags: &Tags) -> Self {
        for (key, value) in tags.iter() {
            self.tags.insert(key, value.map(str::to_string));
        }
        self
    }

    pub fn without_tag(mut self, key: &str) -> Self {
        self.tags.remove(key);
        self
    }

    pub fn retain_tags<F: FnMut(&str) -> bool>(mut self, keep: F) -> Self {
        self.tags.retain(keep);
        self
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.value(key)
    }

    pub fn has_tag(&self, key: &str) -> bool {
        self.tags.contains(key)
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// Parses a single line. A trailing CRLF or bare LF is tolerated.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
        if line.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let mut rest = line;
        let mut tags = Tags::new();

        if let Some(stripped) = rest.strip_prefix('@') {
            let (raw_tags, remainder) = stripped
                .split_once(' ')
                .ok_or(ParseError::MissingCommand)?;
            tags = Tags::parse(raw_tags);
            rest = remainder;
        }

        rest = rest.trim_start_matches(' ');
        let mut prefix = None;

        if let Some(stripped) = rest.strip_prefix(':') {
            let (raw_prefix, remainder) = stripped
                .split_once(' ')
                .ok_or(ParseError::MissingCommand)?;
            prefix = Some(raw_prefix.to_string());
            rest = remainder.trim_start_matches(' ');
        }

        let (raw_command, mut rest) = match rest.split_once(' ') {
            Some((command, remainder)) => (command, remainder),
            None => (rest, ""),
        };

        if raw_command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        if !is_valid_command(raw_command) {
            return Err(ParseError::InvalidCommand(raw_command.to_string()));
        }

        let mut params = vec![];
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }

            // the 15th parameter swallows the rest of the line for legacy clients
            if params.len() == MAX_PARAMS - 1 {
                params.push(rest.strip_prefix(':').unwrap_or(rest).to_string());
                break;
            }

            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }

            match rest.split_once(' ') {
                Some((param, remainder)) => {
                    params.push(param.to_string());
                    rest = remainder;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Ok(Message {
            tags,
            prefix,
            command: raw_command.to_ascii_uppercase(),
            params,
        })
    }

    /// Decodes one raw line off the wire, enforcing the byte limits.
    ///
    /// Invalid UTF-8 is a hard error only in UTF-8-only mode; otherwise the
    /// offending bytes are replaced and the line is still delivered.
    pub fn decode(raw: &[u8], limits: &LineLimits, utf8_only: bool) -> Result<Self, ParseError> {
        let line = strip_line_ending(raw);

        let body_start = if line.first() == Some(&b'@') {
            let tags_end = line
                .iter()
                .position(|b| *b == b' ')
                .ok_or(ParseError::MissingCommand)?;
            if tags_end + 1 > limits.tags {
                return Err(ParseError::TagsTooLong { limit: limits.tags });
            }
            tags_end + 1
        } else {
            0
        };

        if line.len() - body_start + 2 > limits.body {
            return Err(ParseError::LineTooLong { limit: limits.body });
        }

        match std::str::from_utf8(line) {
            Ok(text) => Message::parse(text),
            Err(_) if utf8_only => Err(ParseError::InvalidUtf8),
            Err(_) => Message::parse(&String::from_utf8_lossy(line)),
        }
    }

    /// The wire form without the line terminator.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();

        if !self.tags.is_empty() {
            self.tags.write_to(&mut out);
        }

        if let Some(prefix) = &self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }

        out.push_str(&self.command);

        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            out.push(' ');
            if i == last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                out.push(':');
            }
            out.push_str(param);
        }

        out
    }

    /// The wire form with CRLF, ready for the socket.
    pub fn encode(&self) -> Vec<u8> {
        let mut wire = self.to_wire().into_bytes();
        wire.extend_from_slice(b"\r\n");
        wire
    }

    /// The nick portion of a `nick!user@host` prefix.
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|p| p.split(|c| c == '!' || c == '@').next().unwrap_or(p))
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

impl FromStr for Message {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Message::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn parse_nick_without_prefix() {
        let message = Message::parse("NICK vince").unwrap();
        assert_eq!("NICK", message.command());
        assert_eq!(&["vince".to_string()], message.params());
        assert_eq!(None, message.prefix());
    }

    #[test]
    fn parse_prefix_and_trailing() {
        let message = Message::parse(":joe!~joe@localhost PRIVMSG #chan :hello there  world").unwrap();
        assert_eq!(Some("joe!~joe@localhost"), message.prefix());
        assert_eq!(Some("joe"), message.source_nick());
        assert_eq!("PRIVMSG", message.command());
        assert_eq!(Some("#chan"), message.param(0));
        assert_eq!(Some("hello there  world"), message.param(1));
    }

    #[test]
    fn parse_tags_are_unescaped() {
        let message =
            Message::parse("@+draft/reply=abc;time=2021-01-01T00:00:00.000Z;x=a\\sb\\:c\\\\ TAGMSG #a")
                .unwrap();
        assert_eq!(Some("abc"), message.tag("+draft/reply"));
        assert_eq!(Some("2021-01-01T00:00:00.000Z"), message.tag("time"));
        assert_eq!(Some("a b;c\\"), message.tag("x"));
    }

    #[test]
    fn parse_bad_escape_drops_only_that_tag() {
        let message = Message::parse("@good=1;bad=oops\\ PRIVMSG #a :hi").unwrap();
        assert_eq!(Some("1"), message.tag("good"));
        assert!(!message.has_tag("bad"));
        assert_eq!(Some("hi"), message.param(1));
    }

    #[test]
    fn parse_duplicate_tag_last_wins() {
        let message = Message::parse("@a=1;a=2 PING x").unwrap();
        assert_eq!(1, message.tags().len());
        assert_eq!(Some("2"), message.tag("a"));
    }

    #[test]
    fn parse_valueless_tag() {
        let message = Message::parse("@draft/multiline-concat;b= PRIVMSG #a :x").unwrap();
        assert!(message.has_tag("draft/multiline-concat"));
        assert_eq!(None, message.tag("draft/multiline-concat"));
        assert!(message.has_tag("b"));
    }

    #[test]
    fn parse_fifteenth_param_takes_rest_of_line() {
        let line = "CMD 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17";
        let message = Message::parse(line).unwrap();
        assert_eq!(15, message.params().len());
        assert_eq!(Some("15 16 17"), message.param(14));
    }

    #[test]
    fn parse_tolerates_bare_lf_and_extra_spaces() {
        let message = Message::parse("USER  guest 0 *  :Real Name\n").unwrap();
        assert_eq!(
            vec!["guest", "0", "*", "Real Name"],
            message.params().iter().map(String::as_str).collect::<Vec<_>>()
        );
    }

    #[test_case("" => ParseError::Empty ; "empty line")]
    #[test_case("@a=b" => ParseError::MissingCommand ; "tags only")]
    #[test_case(":prefix" => ParseError::MissingCommand ; "prefix only")]
    #[test_case("12 foo" => ParseError::InvalidCommand("12".to_string()) ; "two digit numeric")]
    #[test_case("PRIV-MSG x" => ParseError::InvalidCommand("PRIV-MSG".to_string()) ; "punctuation in command")]
    fn parse_errors(line: &str) -> ParseError {
        Message::parse(line).unwrap_err()
    }

    #[test]
    fn decode_rejects_long_body() {
        let line = format!("PRIVMSG #a :{}\r\n", "x".repeat(600));
        let result = Message::decode(line.as_bytes(), &LineLimits::default(), false);
        assert_eq!(Err(ParseError::LineTooLong { limit: 512 }), result);
    }

    #[test]
    fn decode_counts_tags_separately_from_body() {
        let tags = format!("@+data={}", "y".repeat(2000));
        let line = format!("{} TAGMSG #a\r\n", tags);
        let message = Message::decode(line.as_bytes(), &LineLimits::default(), false).unwrap();
        assert_eq!(2000, message.tag("+data").unwrap().len());
    }

    #[test]
    fn decode_rejects_long_tags() {
        let line = format!("@+data={} TAGMSG #a\r\n", "y".repeat(9000));
        let result = Message::decode(line.as_bytes(), &LineLimits::default(), false);
        assert_eq!(Err(ParseError::TagsTooLong { limit: 8191 }), result);
    }

    #[test]
    fn decode_invalid_utf8_depends_on_mode() {
        let line = b"PRIVMSG #a :caf\xe9\r\n";
        let lenient = Message::decode(line, &LineLimits::default(), false).unwrap();
        assert_eq!(Some("caf\u{fffd}"), lenient.param(1));

        let strict = Message::decode(line, &LineLimits::default(), true);
        assert_eq!(Err(ParseError::InvalidUtf8), strict);
    }

    #[test]
    fn encode_escapes_tags_and_marks_trailing() {
        let message = Message::new("privmsg")
            .with_tag("+x", Some("a b;c".to_string()))
            .with_tag("flag", None)
            .with_prefix("joe!~joe@host")
            .with_param("#chan")
            .with_param("hello world");
        assert_eq!(
            "@+x=a\\sb\\:c;flag :joe!~joe@host PRIVMSG #chan :hello world",
            message.to_wire()
        );
        assert!(message.encode().ends_with(b"\r\n"));
    }

    #[test]
    fn encode_keeps_tag_order() {
        let message = Message::new("TAGMSG")
            .with_tag("z", Some("1".to_string()))
            .with_tag("a", Some("2".to_string()))
            .with_tag("m", None)
            .with_param("#a");
        assert_eq!("@z=1;a=2;m TAGMSG #a", message.to_wire());
    }

    #[test]
    fn encode_empty_and_colon_trailing() {
        assert_eq!("TOPIC #a :", Message::new("TOPIC").with_param("#a").with_param("").to_wire());
        assert_eq!("PRIVMSG #a ::)", Message::new("PRIVMSG").with_param("#a").with_param(":)").to_wire());
    }

    #[test]
    fn params_after_a_trailing_param_are_joined() {
        let message = Message::new("PRIVMSG").with_param("#a").with_param("two words").with_param("more");
        assert_eq!(&["#a".to_string(), "two words more".to_string()], message.params());
        assert_eq!(message, Message::parse(&message.to_wire()).unwrap());

        let empty = Message::new("TOPIC").with_param("").with_param("x");
        assert_eq!(&[" x".to_string()], empty.params());
        assert_eq!(empty, Message::parse(&empty.to_wire()).unwrap());
    }

    #[test]
    fn params_past_the_fifteenth_are_joined() {
        let message = Message::new("FOO").with_params((0..20).map(|n| n.to_string()));
        assert_eq!(15, message.params().len());
        assert_eq!(Some("14 15 16 17 18 19"), message.param(14));
        assert_eq!(message, Message::parse(&message.to_wire()).unwrap());
    }

    #[test]
    fn invalid_tag_keys_are_not_kept() {
        let message = Message::new("TAGMSG")
            .with_tag("bad key", Some("x".to_string()))
            .with_tag("", None)
            .with_tag("+good", None)
            .with_param("#a");
        assert_eq!("@+good TAGMSG #a", message.to_wire());
        assert_eq!(message, Message::parse(&message.to_wire()).unwrap());
    }

    #[test]
    fn line_breaks_in_params_become_spaces() {
        let message = Message::new("PRIVMSG").with_param("#a").with_param("one\r\ntwo");
        assert_eq!("PRIVMSG #a :one  two", message.to_wire());
    }

    #[test]
    fn tags_compare_without_order() {
        let a: Tags = vec![("x", Some("1".to_string())), ("y", None)].into_iter().collect();
        let b: Tags = vec![("y", None), ("x", Some("1".to_string()))].into_iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_tag_value_is_normalised() {
        let message = Message::new("TAGMSG").with_tag("k", Some(String::new())).with_param("#a");
        assert_eq!("@k TAGMSG #a", message.to_wire());
        assert_eq!(message, Message::parse(&message.to_wire()).unwrap());
    }
}

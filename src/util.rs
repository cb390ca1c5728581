use chrono::{SecondsFormat, Utc};
use regex::RegexBuilder;
use serde_derive::Deserialize;
use tracing::warn;

/// Hostmask glob match: `*` matches any run, `?` a single character.
/// Case-insensitive; everything else is literal.
pub fn match_mask(input: &str, mask: &str) -> bool {
    let mut regex = String::from("^");
    regex.push_str(
        &regex::escape(mask)
            .replace("\\*", ".*")
            .replace("\\?", "."),
    );
    regex.push('$');

    let re = match RegexBuilder::new(&regex).case_insensitive(true).build() {
        Ok(re) => re,
        Err(e) => {
            warn!("error building regex {} {} {:?}", mask, regex, e);
            return false;
        }
    };

    re.is_match(input)
}

/// How nicks and channel names are folded before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseMapping {
    Ascii,
    Rfc1459,
}

impl Default for CaseMapping {
    fn default() -> Self {
        CaseMapping::Rfc1459
    }
}

impl CaseMapping {
    pub fn normalize(&self, name: &str) -> String {
        name.chars()
            .map(|c| match (self, c) {
                (CaseMapping::Rfc1459, '[') => '{',
                (CaseMapping::Rfc1459, ']') => '}',
                (CaseMapping::Rfc1459, '\\') => '|',
                (CaseMapping::Rfc1459, '~') => '^',
                (_, c) => c.to_ascii_lowercase(),
            })
            .collect()
    }

    pub fn equals(&self, a: &str, b: &str) -> bool {
        self.normalize(a) == self.normalize(b)
    }

    pub fn token(&self) -> &'static str {
        match self {
            CaseMapping::Ascii => "ascii",
            CaseMapping::Rfc1459 => "rfc1459",
        }
    }
}

fn is_nick_special(c: char) -> bool {
    matches!(c, '[' | ']' | '\\' | '`' | '_' | '^' | '{' | '|' | '}')
}

pub fn is_valid_nick(nick: &str, max_len: usize) -> bool {
    let mut chars = nick.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };

    nick.len() <= max_len
        && (first.is_ascii_alphabetic() || is_nick_special(first))
        && chars.all(|c| c.is_ascii_alphanumeric() || is_nick_special(c) || c == '-')
}

pub fn is_channel_name(name: &str) -> bool {
    name.starts_with('#') || name.starts_with('&')
}

pub fn is_valid_channel_name(name: &str, max_len: usize) -> bool {
    is_channel_name(name)
        && name.len() > 1
        && name.len() <= max_len
        && !name
            .chars()
            .any(|c| c == ' ' || c == ',' || c == '\x07' || c.is_control())
}

/// `server-time` tag value, millisecond precision in UTC.
pub fn server_time() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[test]
fn match_mask_prefix_matches_no_wildcard_no_match() {
    assert_eq!(false, match_mask("nick!username@host", "nick"));
}

#[test]
fn match_mask_single_char_wildcard_multi_char_mask_no_match() {
    assert_eq!(false, match_mask("nick!username@host", "?"));
}

#[test]
fn match_mask_wildcard_matches() {
    assert_eq!(true, match_mask("nick!username@host", "*"));
}

#[test]
fn match_mask_dots_are_literal() {
    assert_eq!(false, match_mask("nick!user@hostXcom", "*@host.com"));
    assert_eq!(true, match_mask("Nick!user@host.com", "nick!*@host.com"));
}

#[test]
fn rfc1459_folds_brackets() {
    let mapping = CaseMapping::Rfc1459;
    assert_eq!("{foo}|^", mapping.normalize("[FOO]\\~"));
    assert!(mapping.equals("#Chan[1]", "#chan{1}"));
    assert!(!CaseMapping::Ascii.equals("#Chan[1]", "#chan{1}"));
}

#[test]
fn nick_validation() {
    assert!(is_valid_nick("vince", 30));
    assert!(is_valid_nick("[away]-x", 30));
    assert!(!is_valid_nick("1abc", 30));
    assert!(!is_valid_nick("has space", 30));
    assert!(!is_valid_nick("", 30));
    assert!(!is_valid_nick("abcdef", 5));
}

#[test]
fn channel_validation() {
    assert!(is_valid_channel_name("#rust", 50));
    assert!(is_valid_channel_name("&local", 50));
    assert!(!is_valid_channel_name("#", 50));
    assert!(!is_valid_channel_name("rust", 50));
    assert!(!is_valid_channel_name("#a,b", 50));
}

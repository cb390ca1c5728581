use thiserror::Error;

use crate::{batch::MessageKind, message::Message};

/// Client commands with their parameters pulled out of a parsed line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Cap {
        subcommand: String,
        args: Vec<String>,
    },
    Nick {
        nick: String,
    },
    User {
        user: String,
        mode: String,
        realname: String,
    },
    Pass {
        password: String,
    },
    Authenticate {
        payload: String,
    },
    Ping {
        token: String,
    },
    Pong,
    Quit {
        message: Option<String>,
    },
    Join {
        channels: Vec<String>,
        keys: Vec<String>,
    },
    Part {
        channels: Vec<String>,
        message: Option<String>,
    },
    Kick {
        channel: String,
        targets: Vec<String>,
        reason: Option<String>,
    },
    Mode {
        target: String,
        changes: Vec<String>,
    },
    Topic {
        channel: String,
        topic: Option<String>,
    },
    Chat {
        kind: MessageKind,
        targets: Vec<String>,
        text: Option<String>,
    },
    Names {
        channels: Vec<String>,
    },
    Who {
        mask: String,
    },
    Whois {
        targets: Vec<String>,
    },
    List {
        channels: Vec<String>,
    },
    Invite {
        nick: String,
        channel: String,
    },
    Away {
        message: Option<String>,
    },
    Batch {
        reference: String,
        batch_type: Option<String>,
        params: Vec<String>,
    },
    Redact {
        target: String,
        msgid: String,
        reason: Option<String>,
    },
    ChatHistory {
        subcommand: String,
        target: String,
        params: Vec<String>,
    },
    MarkRead {
        target: String,
        timestamp: Option<String>,
    },
    RelayMsg {
        channel: String,
        relay_nick: String,
        text: String,
    },
    Motd,
    Lusers,
    Unhandled {
        command: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("{0} needs more parameters")]
    NeedMoreParams(String),
    #[error("no recipient given for {0}")]
    NoRecipient(String),
    #[error("no text to send")]
    NoTextToSend,
    #[error("no nickname given")]
    NoNicknameGiven,
}

fn split_list(param: &str) -> Vec<String> {
    param
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn required<'a>(message: &'a Message, index: usize) -> Result<&'a str, CommandError> {
    message
        .param(index)
        .ok_or_else(|| CommandError::NeedMoreParams(message.command().to_string()))
}

fn optional(message: &Message, index: usize) -> Option<String> {
    message.param(index).map(str::to_string)
}

impl Command {
    pub fn from_message(message: &Message) -> Result<Command, CommandError> {
        let command = match message.command() {
            "CAP" => Command::Cap {
                subcommand: required(message, 0)?.to_ascii_uppercase(),
                args: message.params()[1..].to_vec(),
            },
            "NICK" => match message.param(0) {
                Some(nick) if !nick.is_empty() => Command::Nick {
                    nick: nick.to_string(),
                },
                _ => return Err(CommandError::NoNicknameGiven),
            },
            "USER" => {
                let realname = required(message, 3)?;
                Command::User {
                    user: required(message, 0)?.to_string(),
                    mode: required(message, 1)?.to_string(),
                    realname: realname.to_string(),
                }
            }
            "PASS" => Command::Pass {
                password: required(message, 0)?.to_string(),
            },
            "AUTHENTICATE" => Command::Authenticate {
                payload: required(message, 0)?.to_string(),
            },
            "PING" => Command::Ping {
                token: required(message, 0)?.to_string(),
            },
            "PONG" => Command::Pong,
            "QUIT" => Command::Quit {
                message: optional(message, 0),
            },
            "JOIN" => Command::Join {
                channels: split_list(required(message, 0)?),
                keys: message.param(1).map(split_list).unwrap_or_default(),
            },
            "PART" => Command::Part {
                channels: split_list(required(message, 0)?),
                message: optional(message, 1),
            },
            "KICK" => Command::Kick {
                channel: required(message, 0)?.to_string(),
                targets: split_list(required(message, 1)?),
                reason: optional(message, 2),
            },
            "MODE" => Command::Mode {
                target: required(message, 0)?.to_string(),
                changes: message.params()[1..].to_vec(),
            },
            "TOPIC" => Command::Topic {
                channel: required(message, 0)?.to_string(),
                topic: optional(message, 1),
            },
            "PRIVMSG" | "NOTICE" | "TAGMSG" => {
                let kind = match message.command() {
                    "PRIVMSG" => MessageKind::PrivMsg,
                    "NOTICE" => MessageKind::Notice,
                    _ => MessageKind::TagMsg,
                };
                let targets = match message.param(0) {
                    Some(targets) if !targets.is_empty() => split_list(targets),
                    _ => return Err(CommandError::NoRecipient(message.command().to_string())),
                };
                let text = match kind {
                    MessageKind::TagMsg => None,
                    _ => match message.param(1) {
                        Some(text) if !text.is_empty() => Some(text.to_string()),
                        _ => return Err(CommandError::NoTextToSend),
                    },
                };
                Command::Chat {
                    kind,
                    targets,
                    text,
                }
            }
            "NAMES" => Command::Names {
                channels: message.param(0).map(split_list).unwrap_or_default(),
            },
            "WHO" => Command::Who {
                mask: required(message, 0)?.to_string(),
            },
            // WHOIS [server] <nick>[,<nick>]
            "WHOIS" => match message.params().last().map(|nicks| split_list(nicks)) {
                Some(targets) if !targets.is_empty() => Command::Whois { targets },
                _ => return Err(CommandError::NoNicknameGiven),
            },
            "LIST" => Command::List {
                channels: message.param(0).map(split_list).unwrap_or_default(),
            },
            "INVITE" => Command::Invite {
                nick: required(message, 0)?.to_string(),
                channel: required(message, 1)?.to_string(),
            },
            "AWAY" => Command::Away {
                message: message
                    .param(0)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string),
            },
            "BATCH" => Command::Batch {
                reference: required(message, 0)?.to_string(),
                batch_type: optional(message, 1),
                params: message.params().iter().skip(2).cloned().collect(),
            },
            "REDACT" => Command::Redact {
                target: required(message, 0)?.to_string(),
                msgid: required(message, 1)?.to_string(),
                reason: optional(message, 2),
            },
            "CHATHISTORY" => Command::ChatHistory {
                subcommand: required(message, 0)?.to_ascii_uppercase(),
                target: required(message, 1)?.to_string(),
                params: message.params()[2..].to_vec(),
            },
            "MARKREAD" => Command::MarkRead {
                target: required(message, 0)?.to_string(),
                timestamp: optional(message, 1),
            },
            "RELAYMSG" => Command::RelayMsg {
                channel: required(message, 0)?.to_string(),
                relay_nick: required(message, 1)?.to_string(),
                text: required(message, 2)?.to_string(),
            },
            "MOTD" => Command::Motd,
            "LUSERS" => Command::Lusers,
            other => Command::Unhandled {
                command: other.to_string(),
            },
        };

        Ok(command)
    }

    /// Commands a client may send before registration completes. With
    /// `pre_away`, AWAY is allowed too.
    pub fn allowed_before_registration(&self, pre_away: bool) -> bool {
        match self {
            Command::Cap { .. }
            | Command::Nick { .. }
            | Command::User { .. }
            | Command::Pass { .. }
            | Command::Authenticate { .. }
            | Command::Ping { .. }
            | Command::Pong
            | Command::Quit { .. } => true,
            Command::Away { .. } => pre_away,
            _ => false,
        }
    }

    /// Targets that receive a separate reply each, so a label is only
    /// meaningful when there is at most one.
    pub fn target_count(&self) -> usize {
        match self {
            Command::Join { channels, .. }
            | Command::Part { channels, .. }
            | Command::Names { channels } => channels.len(),
            Command::Chat { targets, .. } => targets.len(),
            Command::Kick { targets, .. } => targets.len(),
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn parse(line: &str) -> Result<Command, CommandError> {
        Command::from_message(&Message::parse(line).unwrap())
    }

    #[test]
    fn user_takes_realname_from_fourth_param() {
        assert_eq!(
            Ok(Command::User {
                user: "jim".to_string(),
                mode: "0".to_string(),
                realname: "Jim Smith".to_string(),
            }),
            parse("USER jim 0 * :Jim Smith")
        );
    }

    #[test]
    fn join_splits_channels_and_keys() {
        assert_eq!(
            Ok(Command::Join {
                channels: vec!["#a".to_string(), "#b".to_string()],
                keys: vec!["key".to_string()],
            }),
            parse("JOIN #a,#b key")
        );
    }

    #[test]
    fn privmsg_to_many_targets() {
        assert_eq!(
            Ok(Command::Chat {
                kind: MessageKind::PrivMsg,
                targets: vec!["#a".to_string(), "bob".to_string()],
                text: Some("hi there".to_string()),
            }),
            parse("privmsg #a,bob :hi there")
        );
    }

    #[test]
    fn tagmsg_has_no_text() {
        assert_eq!(
            Ok(Command::Chat {
                kind: MessageKind::TagMsg,
                targets: vec!["#a".to_string()],
                text: None,
            }),
            parse("@+typing=active TAGMSG #a")
        );
    }

    #[test_case("PRIVMSG", CommandError::NoRecipient("PRIVMSG".to_string()) ; "privmsg without target")]
    #[test_case("PRIVMSG #a", CommandError::NoTextToSend ; "privmsg without text")]
    #[test_case("NOTICE #a :", CommandError::NoTextToSend ; "notice with empty text")]
    #[test_case("NICK", CommandError::NoNicknameGiven ; "nick without nick")]
    #[test_case("WHOIS", CommandError::NoNicknameGiven ; "whois without nick")]
    #[test_case("USER jim 0 *", CommandError::NeedMoreParams("USER".to_string()) ; "user without realname")]
    #[test_case("JOIN", CommandError::NeedMoreParams("JOIN".to_string()) ; "join without channel")]
    #[test_case("KICK #a", CommandError::NeedMoreParams("KICK".to_string()) ; "kick without target")]
    fn missing_parameters(line: &str, expected: CommandError) {
        assert_eq!(Err(expected), parse(line));
    }

    #[test_case("WHOIS bob", &["bob"] ; "single nick")]
    #[test_case("WHOIS irc.example.com bob,carol", &["bob", "carol"] ; "server then nicks")]
    fn whois_takes_nicks_from_last_param(line: &str, expected: &[&str]) {
        assert_eq!(
            Ok(Command::Whois {
                targets: expected.iter().map(|s| s.to_string()).collect(),
            }),
            parse(line)
        );
    }

    #[test]
    fn list_without_channels_lists_everything() {
        assert_eq!(Ok(Command::List { channels: vec![] }), parse("LIST"));
        assert_eq!(
            Ok(Command::List {
                channels: vec!["#a".to_string(), "#b".to_string()],
            }),
            parse("LIST #a,#b")
        );
    }

    #[test]
    fn unknown_commands_are_unhandled() {
        assert_eq!(
            Ok(Command::Unhandled {
                command: "FOO".to_string()
            }),
            parse("FOO bar")
        );
    }

    #[test]
    fn empty_away_clears() {
        assert_eq!(Ok(Command::Away { message: None }), parse("AWAY :"));
    }

    #[test]
    fn registration_gate() {
        assert!(parse("CAP LS 302").unwrap().allowed_before_registration(false));
        assert!(!parse("JOIN #a").unwrap().allowed_before_registration(false));
        assert!(!parse("AWAY :brb").unwrap().allowed_before_registration(false));
        assert!(parse("AWAY :brb").unwrap().allowed_before_registration(true));
    }
}

use crate::{
    batch::{MessageKind, MultilineMessage},
    channel::{Channel, HistoryEntry},
    delivery::{chat_message, multiline_fallback, stamp, Origin, Payload},
    handlers::{ChannelEnv, Outcome},
    message::{Message, Tags},
    replies::{self, Reply},
};

pub const RELAYMSG_TAG: &str = "draft/relaymsg";

fn refused(channel: &Channel, env: &ChannelEnv, origin: &Origin, kind: MessageKind) -> Outcome {
    // NOTICE never generates automatic replies
    if kind == MessageKind::Notice {
        return Outcome::default();
    }
    Outcome::error(
        env,
        Reply::ErrCannotSendToChan {
            nick: origin.nick(),
            channel: channel.name().to_string(),
        },
    )
}

pub fn handle_message(
    channel: &mut Channel,
    env: &ChannelEnv,
    origin: &Origin,
    kind: MessageKind,
    text: Option<&str>,
    client_tags: &Tags,
) -> Outcome {
    if !channel.can_speak(origin.id()) {
        return refused(channel, env, origin, kind);
    }

    let message = chat_message(&origin.identity, kind, channel.name(), text, client_tags);

    if kind != MessageKind::TagMsg {
        if let Some(msgid) = message.tag("msgid") {
            channel.record(HistoryEntry {
                msgid: msgid.to_string(),
                sender: origin.id(),
                messages: vec![message.clone()],
                redacted: false,
            });
        }
    }

    let mut outcome = Outcome::default();
    outcome.broadcast(
        channel.recipients(),
        Payload::Chat {
            message,
            sender: origin.id(),
        },
    );
    outcome
}

/// Delivers a completed multiline batch as one logical message.
pub fn handle_multiline(
    channel: &mut Channel,
    env: &ChannelEnv,
    origin: &Origin,
    mut multiline: MultilineMessage,
) -> Outcome {
    if !channel.can_speak(origin.id()) {
        return refused(channel, env, origin, multiline.kind);
    }

    // recipients see the channel's own spelling
    multiline.target = channel.name().to_string();
    let source = origin.identity.mask();
    let tags = stamp(
        Message::new("BATCH").with_tags(&multiline.tags),
        origin.identity.account.as_deref(),
    )
    .tags()
    .clone();

    if let Some(msgid) = tags.value("msgid") {
        channel.record(HistoryEntry {
            msgid: msgid.to_string(),
            sender: origin.id(),
            messages: multiline_fallback(&multiline, &source, &tags),
            redacted: false,
        });
    }

    let mut outcome = Outcome::default();
    outcome.broadcast(
        channel.recipients(),
        Payload::Multiline {
            multiline,
            source,
            tags,
            sender: origin.id(),
        },
    );
    outcome
}

/// Channel operators relay messages from another network as `nick/network`.
pub fn handle_relay(
    channel: &mut Channel,
    env: &ChannelEnv,
    origin: &Origin,
    relay_nick: &str,
    text: &str,
) -> Outcome {
    let name = channel.name().to_string();

    if !channel.is_operator(origin.id()) {
        return Outcome::reply(vec![replies::fail(
            &env.server_host,
            "RELAYMSG",
            "PRIVS_NEEDED",
            &[&name],
            "You must be a channel operator to relay messages",
        )]);
    }
    if !relay_nick.contains('/') || relay_nick.contains(' ') {
        return Outcome::reply(vec![replies::fail(
            &env.server_host,
            "RELAYMSG",
            "INVALID_NICK",
            &[&name, relay_nick],
            "Relayed nicknames must contain a /",
        )]);
    }

    let message = Message::new("PRIVMSG")
        .with_tag(RELAYMSG_TAG, Some(origin.nick()))
        .with_prefix(format!("{}!relay@{}", relay_nick, env.server_host))
        .with_param(name)
        .with_param(text);
    let message = stamp(message, None);

    let mut outcome = Outcome::default();
    outcome.broadcast(
        channel.recipients(),
        Payload::Chat {
            message,
            sender: origin.id(),
        },
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        batch::MultilinePart,
        handlers::testing::{channel, env, origin, seat},
    };

    #[test]
    fn external_message_refused_on_no_external() {
        let mut channel = channel();
        let outsider = origin("outsider", &[]);

        let privmsg = handle_message(
            &mut channel,
            &env(),
            &outsider,
            MessageKind::PrivMsg,
            Some("hi"),
            &Tags::new(),
        );
        let notice = handle_message(
            &mut channel,
            &env(),
            &outsider,
            MessageKind::Notice,
            Some("hi"),
            &Tags::new(),
        );

        assert_eq!("404", privmsg.origin_messages()[0].command());
        assert!(notice.deliveries.is_empty());
    }

    #[test]
    fn member_message_is_broadcast_and_recorded() {
        let mut channel = channel();
        let jim = origin("jim", &[]);
        seat(&mut channel, &jim);
        seat(&mut channel, &origin("bob", &[]));

        let outcome = handle_message(
            &mut channel,
            &env(),
            &jim,
            MessageKind::PrivMsg,
            Some("hello"),
            &Tags::new(),
        );

        match outcome.broadcasts()[0] {
            Payload::Chat { message, sender } => {
                assert_eq!(jim.id(), *sender);
                assert_eq!(Some("hello"), message.param(1));
                assert!(message.has_tag("msgid"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(1, channel.latest(10).len());
    }

    #[test]
    fn tagmsg_is_not_recorded() {
        let mut channel = channel();
        let jim = origin("jim", &[]);
        seat(&mut channel, &jim);

        handle_message(&mut channel, &env(), &jim, MessageKind::TagMsg, None, &Tags::new());

        assert!(channel.latest(10).is_empty());
    }

    #[test]
    fn multiline_records_fallback_lines() {
        let mut channel = channel();
        let jim = origin("jim", &[]);
        seat(&mut channel, &jim);
        let multiline = MultilineMessage {
            kind: MessageKind::PrivMsg,
            target: "#test".to_string(),
            parts: vec![
                MultilinePart {
                    text: "one".to_string(),
                    concat: false,
                },
                MultilinePart {
                    text: "two".to_string(),
                    concat: false,
                },
            ],
            tags: Tags::new(),
        };

        let outcome = handle_multiline(&mut channel, &env(), &jim, multiline);

        assert_eq!(2, channel.latest(1)[0].messages.len());
        match outcome.broadcasts()[0] {
            Payload::Multiline { multiline, tags, .. } => {
                assert_eq!("#Test", multiline.target);
                assert!(tags.contains("msgid"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn relay_needs_operator_and_slash() {
        let mut channel = channel();
        let op = origin("op", &[]);
        let bob = origin("bob", &[]);
        seat(&mut channel, &op);
        seat(&mut channel, &bob);

        let denied = handle_relay(&mut channel, &env(), &bob, "alice/other", "hi");
        assert_eq!(Some("PRIVS_NEEDED"), denied.origin_messages()[0].param(1));

        let invalid = handle_relay(&mut channel, &env(), &op, "alice", "hi");
        assert_eq!(Some("INVALID_NICK"), invalid.origin_messages()[0].param(1));

        let relayed = handle_relay(&mut channel, &env(), &op, "alice/other", "hi");
        match relayed.broadcasts()[0] {
            Payload::Chat { message, .. } => {
                assert_eq!(Some("alice/other"), message.source_nick());
                assert_eq!(Some("op"), message.tag(RELAYMSG_TAG));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}

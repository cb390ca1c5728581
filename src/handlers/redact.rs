use tracing::info;

use crate::{
    capabilities::Capability,
    channel::Channel,
    delivery::{stamp, Origin, Payload},
    handlers::{ChannelEnv, Outcome},
    message::Message,
    replies,
};

fn fail(env: &ChannelEnv, code: &str, context: &[&str], description: &str) -> Outcome {
    Outcome::reply(vec![replies::fail(
        &env.server_host,
        "REDACT",
        code,
        context,
        description,
    )])
}

/// Senders may redact their own messages, operators anyone's.
pub fn handle_redact(
    channel: &mut Channel,
    env: &ChannelEnv,
    origin: &Origin,
    msgid: &str,
    reason: Option<&str>,
) -> Outcome {
    let name = channel.name().to_string();

    if !channel.is_member(origin.id()) {
        return fail(env, "INVALID_TARGET", &[&name], "You are not in that channel");
    }

    let is_operator = channel.is_operator(origin.id());
    let entry = match channel.find_history_mut(msgid) {
        Some(entry) if !entry.redacted => entry,
        _ => return fail(env, "UNKNOWN_MSGID", &[&name, msgid], "No such message"),
    };
    if entry.sender != origin.id() && !is_operator {
        return fail(
            env,
            "REDACT_FORBIDDEN",
            &[&name, msgid],
            "You may not redact that message",
        );
    }
    entry.redacted = true;
    info!(channel = %name, msgid, by = %origin.nick(), "message redacted");

    let redact = Message::new("REDACT")
        .with_prefix(origin.identity.mask())
        .with_param(name)
        .with_param(msgid);
    let redact = match reason {
        Some(reason) => redact.with_param(reason),
        None => redact,
    };

    let mut outcome = Outcome::default();
    outcome.broadcast(
        channel.recipients(),
        Payload::Gated {
            message: stamp(redact, origin.identity.account.as_deref()),
            required: Capability::MessageRedaction,
        },
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        batch::MessageKind,
        handlers::{
            privmsg::handle_message,
            testing::{channel, env, origin, seat},
        },
        message::Tags,
    };

    fn sent_msgid(channel: &mut Channel, sender: &Origin) -> String {
        let outcome = handle_message(
            channel,
            &env(),
            sender,
            MessageKind::PrivMsg,
            Some("oops"),
            &Tags::new(),
        );
        match outcome.broadcasts()[0] {
            Payload::Chat { message, .. } => message.tag("msgid").unwrap().to_string(),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn sender_redacts_own_message() {
        let mut channel = channel();
        let op = origin("op", &[]);
        let bob = origin("bob", &[]);
        seat(&mut channel, &op);
        seat(&mut channel, &bob);
        let msgid = sent_msgid(&mut channel, &bob);

        let outcome = handle_redact(&mut channel, &env(), &bob, &msgid, Some("typo"));

        assert_eq!(1, outcome.broadcasts().len());
        assert!(channel.latest(10).is_empty());
    }

    #[test]
    fn others_cannot_redact_unless_operator() {
        let mut channel = channel();
        let op = origin("op", &[]);
        let bob = origin("bob", &[]);
        let eve = origin("eve", &[]);
        seat(&mut channel, &op);
        seat(&mut channel, &bob);
        seat(&mut channel, &eve);
        let msgid = sent_msgid(&mut channel, &bob);

        let denied = handle_redact(&mut channel, &env(), &eve, &msgid, None);
        assert_eq!(Some("REDACT_FORBIDDEN"), denied.origin_messages()[0].param(1));

        let allowed = handle_redact(&mut channel, &env(), &op, &msgid, None);
        assert_eq!(1, allowed.broadcasts().len());
    }

    #[test]
    fn unknown_msgid() {
        let mut channel = channel();
        let op = origin("op", &[]);
        seat(&mut channel, &op);

        let outcome = handle_redact(&mut channel, &env(), &op, "nope", None);

        assert_eq!(Some("UNKNOWN_MSGID"), outcome.origin_messages()[0].param(1));
    }
}

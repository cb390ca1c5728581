use tracing::debug;

use crate::{
    channel::Channel,
    connection::ConnectionEvent,
    delivery::{stamp, Origin, Payload},
    handlers::{ChannelEnv, Outcome},
    message::Message,
    replies::Reply,
};

pub fn handle_kick(
    channel: &mut Channel,
    env: &ChannelEnv,
    origin: &Origin,
    targets: &[String],
    reason: Option<&str>,
) -> Outcome {
    let nick = origin.nick();
    let name = channel.name().to_string();

    if !channel.is_member(origin.id()) {
        return Outcome::error(env, Reply::ErrNotOnChannel { nick, channel: name });
    }
    if !channel.is_operator(origin.id()) {
        return Outcome::error(env, Reply::ErrChanOPrivsNeeded { nick, channel: name });
    }

    let mut outcome = Outcome::default();
    for target in targets {
        let (id, target_nick, recipient) = match channel.find_by_nick(target, env.casemapping) {
            Some(member) => (
                member.identity.connection_id,
                member.nick(),
                member.recipient.clone(),
            ),
            None => {
                outcome.to_origin(vec![Reply::ErrUserNotInChannel {
                    nick: nick.clone(),
                    target: target.clone(),
                    channel: name.clone(),
                }
                .to_message(&env.server_host)]);
                continue;
            }
        };

        let kick = Message::new("KICK")
            .with_prefix(origin.identity.mask())
            .with_param(name.as_str())
            .with_param(target_nick.as_str())
            .with_param(reason.unwrap_or(&nick));

        debug!(channel = %name, kicker = %nick, target = %target_nick, "kick");
        // the target is still a member here so it sees the KICK too
        outcome.broadcast(
            channel.recipients(),
            Payload::Plain(stamp(kick, origin.identity.account.as_deref())),
        );
        channel.remove_member(id);
        outcome.notify(
            recipient,
            ConnectionEvent::Removed {
                channel: channel.key().to_string(),
            },
        );
    }

    outcome
}

use tracing::debug;

use crate::{
    channel::{Channel, JoinError},
    connection::ConnectionEvent,
    delivery::{stamp, Origin, Payload},
    handlers::{names::names_replies, ChannelEnv, Outcome},
    message::Message,
    replies::Reply,
};

pub fn handle_join(
    channel: &mut Channel,
    env: &ChannelEnv,
    origin: &Origin,
    key: Option<&str>,
) -> Outcome {
    let nick = origin.nick();
    let mut outcome = Outcome::default();

    if channel.is_member(origin.id()) {
        outcome.notify(
            origin.recipient.clone(),
            ConnectionEvent::Joined {
                channel: channel.key().to_string(),
            },
        );
        return outcome;
    }

    if let Err(e) = channel.check_join(&origin.identity, key) {
        debug!(channel = channel.name(), nick = %nick, "join refused: {}", e);
        let name = channel.name().to_string();
        let reply = match e {
            JoinError::Full => Reply::ErrChannelIsFull { nick, channel: name },
            JoinError::InviteOnly => Reply::ErrInviteOnlyChan { nick, channel: name },
            JoinError::BadKey => Reply::ErrBadChannelKey { nick, channel: name },
            JoinError::Banned => Reply::ErrBannedFromChan { nick, channel: name },
        };
        outcome.to_origin(vec![reply.to_message(&env.server_host)]);
        outcome.notify(
            origin.recipient.clone(),
            ConnectionEvent::JoinRejected {
                channel: channel.key().to_string(),
            },
        );
        return outcome;
    }

    let founder = channel.add_member(origin.identity.clone(), origin.recipient.clone());
    debug!(channel = channel.name(), nick = %nick, founder, "joined");

    outcome.notify(
        origin.recipient.clone(),
        ConnectionEvent::Joined {
            channel: channel.key().to_string(),
        },
    );

    let account = origin.identity.account.clone();
    let message = stamp(
        Message::new("JOIN")
            .with_prefix(origin.identity.mask())
            .with_param(channel.name()),
        account.as_deref(),
    );
    outcome.broadcast(
        channel.recipients(),
        Payload::Join {
            message,
            account,
            real_name: origin.identity.real_name.clone().unwrap_or_default(),
        },
    );

    if let Some(topic) = &channel.topic {
        outcome.to_origin(vec![
            Reply::Topic {
                nick: nick.clone(),
                channel: channel.name().to_string(),
                topic: topic.text.clone(),
            }
            .to_message(&env.server_host),
            Reply::TopicWhoTime {
                nick,
                channel: channel.name().to_string(),
                set_by: topic.set_by.clone(),
                set_at: topic.set_at,
            }
            .to_message(&env.server_host),
        ]);
    }

    outcome.to_origin(names_replies(channel, env, origin));
    outcome
}

use crate::{
    channel::Channel,
    delivery::{stamp, Origin, Payload},
    handlers::{truncate, ChannelEnv, Outcome},
    message::Message,
    replies::Reply,
};

pub fn handle_topic(
    channel: &mut Channel,
    env: &ChannelEnv,
    origin: &Origin,
    topic: Option<&str>,
) -> Outcome {
    let nick = origin.nick();
    let name = channel.name().to_string();

    let text = match topic {
        Some(text) => text,
        None => {
            let replies = match &channel.topic {
                Some(topic) => vec![
                    Reply::Topic {
                        nick: nick.clone(),
                        channel: name.clone(),
                        topic: topic.text.clone(),
                    },
                    Reply::TopicWhoTime {
                        nick,
                        channel: name,
                        set_by: topic.set_by.clone(),
                        set_at: topic.set_at,
                    },
                ],
                None => vec![Reply::NoTopic { nick, channel: name }],
            };
            return Outcome::reply(
                replies
                    .into_iter()
                    .map(|r| r.to_message(&env.server_host))
                    .collect(),
            );
        }
    };

    if !channel.is_member(origin.id()) {
        return Outcome::error(env, Reply::ErrNotOnChannel { nick, channel: name });
    }
    if channel.modes.topic_lock && !channel.is_operator(origin.id()) {
        return Outcome::error(env, Reply::ErrChanOPrivsNeeded { nick, channel: name });
    }

    let text = truncate(text, env.topic_len).to_string();
    channel.set_topic(text.clone(), origin.identity.mask());

    let message = Message::new("TOPIC")
        .with_prefix(origin.identity.mask())
        .with_param(name)
        .with_param(text);
    let mut outcome = Outcome::default();
    outcome.broadcast(
        channel.recipients(),
        Payload::Plain(stamp(message, origin.identity.account.as_deref())),
    );
    outcome
}

use crate::{
    channel::Channel,
    connection::ConnectionEvent,
    delivery::{stamp, Origin, Payload},
    handlers::{ChannelEnv, Outcome},
    message::Message,
    replies::Reply,
};

pub fn handle_part(
    channel: &mut Channel,
    env: &ChannelEnv,
    origin: &Origin,
    reason: Option<&str>,
) -> Outcome {
    if !channel.is_member(origin.id()) {
        return Outcome::error(
            env,
            Reply::ErrNotOnChannel {
                nick: origin.nick(),
                channel: channel.name().to_string(),
            },
        );
    }

    let part = Message::new("PART")
        .with_prefix(origin.identity.mask())
        .with_param(channel.name());
    let part = match reason {
        Some(reason) => part.with_param(reason),
        None => part,
    };

    let mut outcome = Outcome::default();
    // the leaver sees its own PART
    outcome.broadcast(
        channel.recipients(),
        Payload::Plain(stamp(part, origin.identity.account.as_deref())),
    );
    channel.remove_member(origin.id());
    outcome.notify(
        origin.recipient.clone(),
        ConnectionEvent::Removed {
            channel: channel.key().to_string(),
        },
    );
    outcome
}

use crate::{
    channel::Channel,
    delivery::{stamp, Origin, Payload},
    handlers::{ChannelEnv, Outcome},
    message::Message,
    replies::Reply,
};

pub fn handle_invite(
    channel: &mut Channel,
    env: &ChannelEnv,
    origin: &Origin,
    target: &Origin,
) -> Outcome {
    let nick = origin.nick();
    let name = channel.name().to_string();

    if !channel.is_member(origin.id()) {
        return Outcome::error(env, Reply::ErrNotOnChannel { nick, channel: name });
    }
    if channel.modes.invite_only && !channel.is_operator(origin.id()) {
        return Outcome::error(env, Reply::ErrChanOPrivsNeeded { nick, channel: name });
    }
    if channel.is_member(target.id()) {
        return Outcome::error(
            env,
            Reply::ErrUserOnChannel {
                nick,
                target: target.nick(),
                channel: name,
            },
        );
    }

    channel.invite(target.id());

    let invite = Message::new("INVITE")
        .with_prefix(origin.identity.mask())
        .with_param(target.nick())
        .with_param(name.as_str());

    let mut outcome = Outcome::reply(vec![Reply::Inviting {
        nick,
        target: target.nick(),
        channel: name,
    }
    .to_message(&env.server_host)]);
    outcome.direct(
        target.recipient.clone(),
        Payload::Plain(stamp(invite, origin.identity.account.as_deref())),
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::JoinError,
        handlers::{
            testing::{channel, env, origin, seat},
            Delivery,
        },
    };

    #[test]
    fn invite_lets_target_past_invite_only() {
        let mut channel = channel();
        channel.modes.invite_only = true;
        let op = origin("op", &[]);
        let guest = origin("guest", &[]);
        seat(&mut channel, &op);
        assert_eq!(
            Err(JoinError::InviteOnly),
            channel.check_join(&guest.identity, None)
        );

        let outcome = handle_invite(&mut channel, &env(), &op, &guest);

        assert_eq!("341", outcome.origin_messages()[0].command());
        assert!(outcome
            .deliveries
            .iter()
            .any(|d| matches!(d, Delivery::Direct { .. })));
        assert_eq!(Ok(()), channel.check_join(&guest.identity, None));
    }

    #[test]
    fn cannot_invite_existing_member() {
        let mut channel = channel();
        let op = origin("op", &[]);
        let bob = origin("bob", &[]);
        seat(&mut channel, &op);
        seat(&mut channel, &bob);

        let outcome = handle_invite(&mut channel, &env(), &op, &bob);

        assert_eq!("443", outcome.origin_messages()[0].command());
    }
}

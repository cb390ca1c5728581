use crate::{
    capabilities::Capability,
    channel::Channel,
    delivery::Origin,
    handlers::{ChannelEnv, Outcome},
    replies::Reply,
};

/// RPL_WHOREPLY for every member, then RPL_ENDOFWHO.
pub fn handle_who(channel: &Channel, env: &ChannelEnv, origin: &Origin) -> Outcome {
    let nick = origin.nick();
    let multi_prefix = origin.recipient.has(Capability::MultiPrefix);

    let mut replies: Vec<_> = channel
        .members()
        .map(|member| {
            let here = if member.identity.away.is_some() { "G" } else { "H" };
            Reply::Who {
                nick: nick.clone(),
                channel: channel.name().to_string(),
                user: member.identity.username(),
                host: member.identity.client_host.clone(),
                target: member.nick(),
                flags: format!("{}{}", here, member.modes.prefix(multi_prefix)),
                realname: member.identity.real_name.clone().unwrap_or_default(),
            }
            .to_message(&env.server_host)
        })
        .collect();

    replies.push(
        Reply::EndOfWho {
            nick,
            mask: channel.name().to_string(),
        }
        .to_message(&env.server_host),
    );

    Outcome::reply(replies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{channel, env, origin, seat};

    #[test]
    fn who_lists_members_with_flags() {
        let mut channel = channel();
        let op = origin("op", &[]);
        let mut away = origin("away", &[]);
        away.identity.away = Some("lunch".to_string());
        seat(&mut channel, &op);
        seat(&mut channel, &away);

        let outcome = handle_who(&channel, &env(), &op);
        let replies = outcome.origin_messages();

        assert_eq!(3, replies.len());
        assert_eq!(
            ":irc.local 352 op #Test ~op example.com irc.local op H@ :0 op real",
            replies[0].to_string()
        );
        assert_eq!(Some("G"), replies[1].param(6));
        assert_eq!("315", replies[2].command());
    }
}

use crate::{
    capabilities::{chunk_tokens, Capability},
    channel::Channel,
    delivery::Origin,
    handlers::{ChannelEnv, Outcome},
    message::{Message, MAX_LINE_LENGTH},
    replies::Reply,
};

/// RPL_NAMREPLY lines packed under the line limit, then RPL_ENDOFNAMES.
pub fn names_replies(channel: &Channel, env: &ChannelEnv, origin: &Origin) -> Vec<Message> {
    let nick = origin.nick();
    let multi_prefix = origin.recipient.has(Capability::MultiPrefix);

    let names: Vec<String> = channel
        .members()
        .map(|m| format!("{}{}", m.modes.prefix(multi_prefix), m.nick()))
        .collect();

    let overhead = format!(":{} 353 {} = {} :\r\n", env.server_host, nick, channel.name()).len();
    let mut replies: Vec<Message> = chunk_tokens(&names, MAX_LINE_LENGTH - overhead)
        .into_iter()
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| {
            Reply::NamReply {
                nick: nick.clone(),
                channel: channel.name().to_string(),
                names: vec![chunk],
            }
            .to_message(&env.server_host)
        })
        .collect();

    replies.push(
        Reply::EndOfNames {
            nick,
            channel: channel.name().to_string(),
        }
        .to_message(&env.server_host),
    );
    replies
}

pub fn handle_names(channel: &Channel, env: &ChannelEnv, origin: &Origin) -> Outcome {
    Outcome::reply(names_replies(channel, env, origin))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{channel, env, origin, seat};

    #[test]
    fn prefixes_follow_multi_prefix() {
        let mut channel = channel();
        let op = origin("op", &[]);
        seat(&mut channel, &op);
        channel.member_mut(op.id()).unwrap().modes.voice = true;
        let viewer = origin("viewer", &[Capability::MultiPrefix]);
        seat(&mut channel, &viewer);

        let plain = names_replies(&channel, &env(), &op);
        let multi = names_replies(&channel, &env(), &viewer);

        assert_eq!(":irc.local 353 op = #Test :@op viewer", plain[0].to_string());
        assert_eq!(Some("@+op viewer"), multi[0].param(3));
        assert_eq!("366", plain[1].command());
    }

    #[test]
    fn long_member_lists_are_split() {
        let mut channel = channel();
        let viewer = origin("viewer", &[]);
        for i in 0..80 {
            seat(&mut channel, &origin(&format!("someone_{:02}", i), &[]));
        }

        let replies = names_replies(&channel, &env(), &viewer);

        assert!(replies.len() > 2);
        assert!(replies.iter().all(|m| m.encode().len() <= MAX_LINE_LENGTH));
        let total: usize = replies
            .iter()
            .filter(|m| m.command() == "353")
            .map(|m| m.param(3).unwrap().split(' ').count())
            .sum();
        assert_eq!(80, total);
    }
}

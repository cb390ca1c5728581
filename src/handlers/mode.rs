use tracing::debug;

use crate::{
    channel::Channel,
    delivery::{stamp, Origin, Payload},
    handlers::{ChannelEnv, Outcome},
    message::Message,
    replies::Reply,
};

/// Channel modes this server understands, for RPL_MYINFO and ISUPPORT.
pub const CHANNEL_MODES: &str = "beiklmnopstv";
pub const CHANMODES_TOKEN: &str = "CHANMODES=be,k,l,imnpst";

#[derive(Debug, Clone, PartialEq)]
pub struct ModeChange {
    pub adding: bool,
    pub mode: char,
    pub argument: Option<String>,
}

/// Splits `+o-v jim bob` style parameters into individual changes. An
/// unknown mode character is returned as the error.
pub fn parse_mode_changes(params: &[String]) -> Result<Vec<ModeChange>, char> {
    let mut changes = vec![];
    let (modes, arguments) = match params.split_first() {
        Some(split) => split,
        None => return Ok(changes),
    };
    let mut arguments = arguments.iter();
    let mut adding = true;

    for mode in modes.chars() {
        let argument = match mode {
            '+' => {
                adding = true;
                continue;
            }
            '-' => {
                adding = false;
                continue;
            }
            'o' | 'v' | 'b' | 'e' | 'k' => arguments.next().cloned(),
            'l' if adding => arguments.next().cloned(),
            'l' | 'i' | 'm' | 'n' | 'p' | 's' | 't' => None,
            other => return Err(other),
        };
        changes.push(ModeChange {
            adding,
            mode,
            argument,
        });
    }

    Ok(changes)
}

/// `+ov-k` and its arguments, grouping consecutive signs.
fn format_changes(changes: &[ModeChange]) -> (String, Vec<String>) {
    let mut modes = String::new();
    let mut arguments = vec![];
    let mut sign = None;

    for change in changes {
        if sign != Some(change.adding) {
            modes.push(if change.adding { '+' } else { '-' });
            sign = Some(change.adding);
        }
        modes.push(change.mode);
        if let Some(argument) = &change.argument {
            arguments.push(argument.clone());
        }
    }

    (modes, arguments)
}

fn set_flag(flag: &mut bool, adding: bool) -> bool {
    let changed = *flag != adding;
    *flag = adding;
    changed
}

fn edit_list(list: &mut Vec<String>, mask: &str, adding: bool) -> bool {
    let present = list.iter().any(|m| m.eq_ignore_ascii_case(mask));
    match (adding, present) {
        (true, false) => {
            list.push(mask.to_string());
            true
        }
        (false, true) => {
            list.retain(|m| !m.eq_ignore_ascii_case(mask));
            true
        }
        _ => false,
    }
}

fn list_replies(channel: &Channel, env: &ChannelEnv, nick: &str, mode: char) -> Vec<Message> {
    let name = channel.name().to_string();
    let mut replies: Vec<Reply> = vec![];

    if mode == 'b' {
        replies.extend(channel.bans.iter().map(|mask| Reply::BanList {
            nick: nick.to_string(),
            channel: name.clone(),
            mask: mask.clone(),
        }));
        replies.push(Reply::EndOfBanList {
            nick: nick.to_string(),
            channel: name,
        });
    } else {
        replies.extend(channel.exceptions.iter().map(|mask| Reply::ExceptList {
            nick: nick.to_string(),
            channel: name.clone(),
            mask: mask.clone(),
        }));
        replies.push(Reply::EndOfExceptList {
            nick: nick.to_string(),
            channel: name,
        });
    }

    replies
        .into_iter()
        .map(|reply| reply.to_message(&env.server_host))
        .collect()
}

pub fn handle_mode(
    channel: &mut Channel,
    env: &ChannelEnv,
    origin: &Origin,
    params: &[String],
) -> Outcome {
    let nick = origin.nick();
    let name = channel.name().to_string();

    if params.is_empty() {
        let (modes, arguments) = channel.modes.mode_string(channel.is_member(origin.id()));
        return Outcome::reply(vec![
            Reply::ChannelModeIs {
                nick: nick.clone(),
                channel: name.clone(),
                modes,
                arguments,
            }
            .to_message(&env.server_host),
            Reply::CreationTime {
                nick,
                channel: name,
                created_at: channel.created_at(),
            }
            .to_message(&env.server_host),
        ]);
    }

    let changes = match parse_mode_changes(params) {
        Ok(changes) => changes,
        Err(mode) => return Outcome::error(env, Reply::ErrUnknownMode { nick, mode }),
    };

    let (queries, updates): (Vec<ModeChange>, Vec<ModeChange>) = changes
        .into_iter()
        .partition(|c| matches!(c.mode, 'b' | 'e') && c.argument.is_none());

    let mut outcome = Outcome::default();
    for query in &queries {
        outcome.to_origin(list_replies(channel, env, &nick, query.mode));
    }

    if updates.is_empty() {
        return outcome;
    }
    if !channel.is_operator(origin.id()) {
        outcome.to_origin(vec![Reply::ErrChanOPrivsNeeded { nick, channel: name }
            .to_message(&env.server_host)]);
        return outcome;
    }

    let mut applied = vec![];
    for change in updates {
        let adding = change.adding;
        let applied_change = match (change.mode, change.argument) {
            ('o', Some(target)) | ('v', Some(target)) => {
                let id = channel
                    .find_by_nick(&target, env.casemapping)
                    .map(|m| m.identity.connection_id);
                match id.and_then(|id| channel.member_mut(id)) {
                    Some(member) => {
                        let flag = if change.mode == 'o' {
                            &mut member.modes.operator
                        } else {
                            &mut member.modes.voice
                        };
                        set_flag(flag, adding).then(|| Some(member.nick()))
                    }
                    None => {
                        outcome.to_origin(vec![Reply::ErrUserNotInChannel {
                            nick: nick.clone(),
                            target,
                            channel: name.clone(),
                        }
                        .to_message(&env.server_host)]);
                        None
                    }
                }
            }
            ('b', Some(mask)) => edit_list(&mut channel.bans, &mask, adding).then(|| Some(mask)),
            ('e', Some(mask)) => {
                edit_list(&mut channel.exceptions, &mask, adding).then(|| Some(mask))
            }
            ('k', key) if adding => match key {
                Some(key) if !key.is_empty() => {
                    channel.modes.key = Some(key.clone());
                    Some(Some(key))
                }
                _ => None,
            },
            ('k', _) => channel.modes.key.take().map(|_| Some("*".to_string())),
            ('l', limit) if adding => match limit.and_then(|l| l.parse::<usize>().ok()) {
                Some(limit) if limit > 0 => {
                    channel.modes.limit = Some(limit);
                    Some(Some(limit.to_string()))
                }
                _ => None,
            },
            ('l', _) => channel.modes.limit.take().map(|_| None),
            ('i', _) => set_flag(&mut channel.modes.invite_only, adding).then(|| None),
            ('m', _) => set_flag(&mut channel.modes.moderated, adding).then(|| None),
            ('n', _) => set_flag(&mut channel.modes.no_external, adding).then(|| None),
            ('p', _) => set_flag(&mut channel.modes.private, adding).then(|| None),
            ('s', _) => set_flag(&mut channel.modes.secret, adding).then(|| None),
            ('t', _) => set_flag(&mut channel.modes.topic_lock, adding).then(|| None),
            _ => None,
        };

        if let Some(argument) = applied_change {
            applied.push(ModeChange {
                adding,
                mode: change.mode,
                argument,
            });
        }
    }

    if applied.is_empty() {
        return outcome;
    }

    let (modes, arguments) = format_changes(&applied);
    debug!(channel = %name, nick = %nick, modes = %modes, "modes changed");
    let message = Message::new("MODE")
        .with_prefix(origin.identity.mask())
        .with_param(name)
        .with_param(modes)
        .with_params(arguments);
    outcome.broadcast(
        channel.recipients(),
        Payload::Plain(stamp(message, origin.identity.account.as_deref())),
    );
    outcome
}

use crate::{
    channel::Channel,
    delivery::{Origin, Payload, SharedNotice},
    handlers::Outcome,
};

/// Renames the member in place and passes the NICK on to peers that have
/// not seen it through another channel.
pub fn handle_rename(
    channel: &mut Channel,
    origin: &Origin,
    new_nick: &str,
    notice: &SharedNotice,
) -> Outcome {
    let mut outcome = Outcome::default();
    match channel.member_mut(origin.id()) {
        Some(member) => member.identity.nick = Some(new_nick.to_string()),
        None => return outcome,
    }

    let peers = notice.claim(channel.recipients());
    if !peers.is_empty() {
        outcome.broadcast(peers, Payload::Plain(notice.message().clone()));
    }
    outcome
}

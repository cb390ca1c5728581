use crate::{
    channel::Channel,
    delivery::{Origin, Payload, SharedNotice},
    handlers::Outcome,
};

/// Drops a disconnecting member and tells the peers that have not heard
/// about the QUIT from another shared channel.
pub fn handle_quit(channel: &mut Channel, origin: &Origin, notice: &SharedNotice) -> Outcome {
    let mut outcome = Outcome::default();
    if channel.remove_member(origin.id()).is_some() {
        let peers = notice.claim(channel.recipients());
        outcome.broadcast(peers, Payload::Plain(notice.message().clone()));
    }
    outcome
}

use crate::{
    batch,
    capabilities::Capability,
    channel::Channel,
    delivery::{filter_tags, Origin},
    handlers::{ChannelEnv, Outcome},
    message::{Message, Tags},
    replies,
};

pub const CHATHISTORY_BATCH: &str = "chathistory";

/// `CHATHISTORY LATEST`: the newest `limit` entries, oldest first, wrapped
/// in a `chathistory` batch when the client can take one.
pub fn handle_history(
    channel: &Channel,
    env: &ChannelEnv,
    origin: &Origin,
    limit: usize,
) -> Outcome {
    let name = channel.name().to_string();

    if !channel.is_member(origin.id()) {
        return Outcome::reply(vec![replies::fail(
            &env.server_host,
            "CHATHISTORY",
            "INVALID_TARGET",
            &["LATEST", &name],
            "You are not in that channel",
        )]);
    }

    let caps = origin.recipient.capabilities();
    let messages: Vec<Message> = channel
        .latest(limit)
        .into_iter()
        .flat_map(|entry| entry.messages.iter().cloned())
        .collect();

    let messages = if caps.has(Capability::Batch) {
        batch::wrap(
            &env.server_host,
            &batch::next_reference(),
            CHATHISTORY_BATCH,
            &[name],
            &Tags::new(),
            messages,
        )
    } else {
        messages
    };

    Outcome::reply(
        messages
            .into_iter()
            .map(|m| filter_tags(m, &caps))
            .collect(),
    )
}

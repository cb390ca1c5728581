use uuid::Uuid;

use crate::{channel::Channel, message::Message, replies::Reply};

/// One RPL_LIST line's worth of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSummary {
    pub name: String,
    pub visible: usize,
    pub topic: String,
}

/// What `requester` may see of the channel. `+s` and `+p` channels are
/// left out unless the requester is a member.
pub fn summarize(channel: &Channel, requester: Uuid) -> Option<ChannelSummary> {
    if !channel.is_visible_to(requester) {
        return None;
    }

    Some(ChannelSummary {
        name: channel.name().to_string(),
        visible: channel.len(),
        topic: channel
            .topic
            .as_ref()
            .map(|topic| topic.text.clone())
            .unwrap_or_default(),
    })
}

/// RPL_LISTSTART, one RPL_LIST per channel, RPL_LISTEND.
pub fn list_replies(server_host: &str, nick: &str, summaries: Vec<ChannelSummary>) -> Vec<Message> {
    let mut replies = vec![Reply::ListStart {
        nick: nick.to_string(),
    }];
    replies.extend(summaries.into_iter().map(|summary| Reply::List {
        nick: nick.to_string(),
        channel: summary.name,
        visible: summary.visible,
        topic: summary.topic,
    }));
    replies.push(Reply::ListEnd {
        nick: nick.to_string(),
    });

    replies.iter().map(|r| r.to_message(server_host)).collect()
}

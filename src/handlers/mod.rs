//! Command handling. Channel handlers run inside the owning channel actor,
//! mutate the channel and describe what to send; the actor does the
//! sending. `list` and `whois` build replies from what the registry and
//! the channels report.

pub mod history;
pub mod invite;
pub mod join;
pub mod kick;
pub mod list;
pub mod mode;
pub mod names;
pub mod nick;
pub mod part;
pub mod privmsg;
pub mod quit;
pub mod redact;
pub mod topic;
pub mod who;
pub mod whois;

use std::sync::Arc;

use crate::{
    connection::ConnectionEvent,
    delivery::{Payload, Recipient},
    message::Message,
    replies::Reply,
    store::PersistenceStore,
    util::CaseMapping,
};

/// Server settings a channel actor needs, fixed at spawn.
pub struct ChannelEnv {
    pub server_host: String,
    pub casemapping: CaseMapping,
    pub topic_len: usize,
    pub history_len: usize,
    pub relaymsg: bool,
    pub store: Arc<dyn PersistenceStore>,
}

#[derive(Debug)]
pub enum Delivery {
    /// Replies to the requester, subject to its label.
    Origin(Vec<Message>),
    Broadcast {
        recipients: Vec<Recipient>,
        payload: Payload,
    },
    Direct {
        recipient: Recipient,
        payload: Payload,
    },
    Notify {
        recipient: Recipient,
        event: ConnectionEvent,
    },
}

/// Everything one request produced, in the order it should go out.
#[derive(Debug, Default)]
pub struct Outcome {
    pub deliveries: Vec<Delivery>,
}

impl Outcome {
    pub fn reply(messages: Vec<Message>) -> Self {
        Outcome {
            deliveries: vec![Delivery::Origin(messages)],
        }
    }

    pub fn error(env: &ChannelEnv, reply: Reply) -> Self {
        Outcome::reply(vec![reply.to_message(&env.server_host)])
    }

    pub fn to_origin(&mut self, messages: Vec<Message>) {
        self.deliveries.push(Delivery::Origin(messages));
    }

    pub fn broadcast(&mut self, recipients: Vec<Recipient>, payload: Payload) {
        self.deliveries.push(Delivery::Broadcast {
            recipients,
            payload,
        });
    }

    pub fn direct(&mut self, recipient: Recipient, payload: Payload) {
        self.deliveries.push(Delivery::Direct { recipient, payload });
    }

    pub fn notify(&mut self, recipient: Recipient, event: ConnectionEvent) {
        self.deliveries.push(Delivery::Notify { recipient, event });
    }

    /// Messages addressed to the requester, ignoring broadcasts.
    #[cfg(test)]
    pub fn origin_messages(&self) -> Vec<&Message> {
        self.deliveries
            .iter()
            .filter_map(|d| match d {
                Delivery::Origin(messages) => Some(messages.iter()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[cfg(test)]
    pub fn broadcasts(&self) -> Vec<&Payload> {
        self.deliveries
            .iter()
            .filter_map(|d| match d {
                Delivery::Broadcast { payload, .. } => Some(payload),
                _ => None,
            })
            .collect()
    }
}

/// Cuts `text` to at most `max` bytes on a character boundary.
pub fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}


#[test]
fn truncate_respects_char_boundaries() {
    assert_eq!("héllo", truncate("héllo", 10));
    assert_eq!("h", truncate("héllo", 2));
    assert_eq!("hé", truncate("héllo", 3));
}

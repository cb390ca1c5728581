use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    batch::{self, MessageKind, MultilineMessage, CONCAT_TAG, MULTILINE_BATCH},
    capabilities::{Capability, CapabilitySet},
    connection::ConnectionEvent,
    context::ConnectionContext,
    message::{Message, Tags, MAX_LINE_LENGTH},
    util,
};

/// How actors reach one connection: its outbound queue, its event queue and
/// a live view of its negotiated capabilities.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub connection_id: Uuid,
    pub outbound: mpsc::Sender<Message>,
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
    pub caps: watch::Receiver<CapabilitySet>,
}

impl Recipient {
    pub fn has(&self, capability: Capability) -> bool {
        self.caps.borrow().has(capability)
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.caps.borrow().clone()
    }

    /// Queues in order without waiting. A closed connection just stops
    /// receiving; a full queue means the client stopped reading, and the
    /// connection is told to give up on it.
    pub fn send(&self, messages: Vec<Message>) {
        for message in messages {
            match self.outbound.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(connection_id = %self.connection_id, "outbound queue full");
                    self.notify(ConnectionEvent::SendQExceeded);
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(connection_id = %self.connection_id, "dropping output for closed connection");
                    return;
                }
            }
        }
    }

    pub fn notify(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

/// The connection a request came from.
#[derive(Debug, Clone)]
pub struct Origin {
    pub identity: ConnectionContext,
    pub recipient: Recipient,
}

impl Origin {
    pub fn id(&self) -> Uuid {
        self.identity.connection_id
    }

    pub fn nick(&self) -> String {
        self.identity.nick_or_star()
    }
}

/// One message fanned out through several channel actors, such as a QUIT
/// or NICK. Each connection gets it once, from whichever channel reaches it
/// first, in that channel's order.
#[derive(Debug, Clone)]
pub struct SharedNotice {
    message: Message,
    reached: Arc<Mutex<HashSet<Uuid>>>,
}

impl SharedNotice {
    /// `exclude` never receives it.
    pub fn new(message: Message, exclude: Uuid) -> Self {
        let mut reached = HashSet::new();
        reached.insert(exclude);
        SharedNotice {
            message,
            reached: Arc::new(Mutex::new(reached)),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The candidates that have not had the notice yet, marking them as
    /// reached.
    pub fn claim(&self, candidates: Vec<Recipient>) -> Vec<Recipient> {
        let mut reached = match self.reached.lock() {
            Ok(reached) => reached,
            Err(poisoned) => poisoned.into_inner(),
        };
        candidates
            .into_iter()
            .filter(|recipient| reached.insert(recipient.connection_id))
            .collect()
    }
}

/// A message rendered differently per recipient.
#[derive(Debug, Clone)]
pub enum Payload {
    Plain(Message),
    Join {
        message: Message,
        account: Option<String>,
        real_name: String,
    },
    Chat {
        message: Message,
        sender: Uuid,
    },
    Multiline {
        multiline: MultilineMessage,
        source: String,
        tags: Tags,
        sender: Uuid,
    },
    /// Only sent to recipients that negotiated `required`.
    Gated {
        message: Message,
        required: Capability,
    },
}

/// Drops tags the recipient did not negotiate.
pub fn filter_tags(message: Message, caps: &CapabilitySet) -> Message {
    let tags = caps.has(Capability::MessageTags);
    let time = caps.has(Capability::ServerTime);
    let account = caps.has(Capability::AccountTag);
    let batch = caps.has(Capability::Batch);
    let label = caps.has(Capability::LabeledResponse);

    message.retain_tags(|key| match key {
        "time" => time,
        "account" => account,
        "batch" => batch,
        "label" => label,
        CONCAT_TAG => true,
        _ => tags,
    })
}

/// Adds `time`, `msgid` and, when logged in, `account`.
pub fn stamp(message: Message, account: Option<&str>) -> Message {
    let message = message
        .with_tag("time", Some(util::server_time()))
        .with_tag("msgid", Some(Uuid::new_v4().to_simple().to_string()));
    match account {
        Some(account) => message.with_tag("account", Some(account.to_string())),
        None => message,
    }
}

/// A stamped PRIVMSG/NOTICE/TAGMSG from `identity` carrying its client tags.
pub fn chat_message(
    identity: &ConnectionContext,
    kind: MessageKind,
    target: &str,
    text: Option<&str>,
    client_tags: &Tags,
) -> Message {
    let message = Message::new(kind.command())
        .with_tags(&client_tags.client_only())
        .with_prefix(identity.mask())
        .with_param(target);
    let message = match (kind, text) {
        (MessageKind::TagMsg, _) => message,
        (_, text) => message.with_param(text.unwrap_or_default()),
    };
    stamp(message, identity.account.as_deref())
}

fn is_echo(recipient: &Recipient, sender: Uuid, caps: &CapabilitySet) -> bool {
    recipient.connection_id == sender && !caps.has(Capability::EchoMessage)
}

fn multiline_envelope(
    multiline: &MultilineMessage,
    source: &str,
    tags: &Tags,
) -> Vec<Message> {
    let command = multiline.kind.command();
    let lines = multiline
        .parts
        .iter()
        .map(|part| {
            let line = Message::new(command)
                .with_prefix(source)
                .with_param(multiline.target.as_str())
                .with_param(part.text.as_str());
            if part.concat {
                line.with_tag(CONCAT_TAG, None)
            } else {
                line
            }
        })
        .collect();

    batch::wrap(
        source,
        &batch::next_reference(),
        MULTILINE_BATCH,
        &[multiline.target.clone()],
        tags,
        lines,
    )
}

/// Cuts `text` into pieces of at most `max` bytes on character boundaries.
fn split_text(text: &str, max: usize) -> Vec<String> {
    let max = max.max(4);
    let mut pieces = vec![];
    let mut rest = text;

    while rest.len() > max {
        let mut end = max;
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        pieces.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    pieces.push(rest.to_string());
    pieces
}

/// Plain lines for recipients without multiline support. Logical lines
/// longer than fits on the wire are split.
pub fn multiline_fallback(multiline: &MultilineMessage, source: &str, tags: &Tags) -> Vec<Message> {
    // ":source COMMAND target :text\r\n"
    let overhead = source.len() + multiline.kind.command().len() + multiline.target.len() + 7;
    let room = MAX_LINE_LENGTH.saturating_sub(overhead);

    multiline
        .fallback_lines()
        .iter()
        .flat_map(|line| split_text(line, room))
        .enumerate()
        .map(|(i, text)| {
            let line = Message::new(multiline.kind.command())
                .with_prefix(source)
                .with_param(multiline.target.as_str())
                .with_param(text);
            // the msgid belongs to the first line only
            if i == 0 {
                line.with_tags(tags)
            } else {
                line.with_tags(tags).without_tag("msgid")
            }
        })
        .collect()
}

/// What `recipient` should see of `payload`, in wire order.
pub fn render(payload: &Payload, recipient: &Recipient) -> Vec<Message> {
    let caps = recipient.capabilities();

    let messages = match payload {
        Payload::Plain(message) => vec![message.clone()],
        Payload::Join {
            message,
            account,
            real_name,
        } => {
            if caps.has(Capability::ExtendedJoin) {
                vec![message
                    .clone()
                    .with_param(account.as_deref().unwrap_or("*"))
                    .with_param(real_name.as_str())]
            } else {
                vec![message.clone()]
            }
        }
        Payload::Chat { message, sender } => {
            if is_echo(recipient, *sender, &caps) {
                vec![]
            } else if message.command() == "TAGMSG" && !caps.has(Capability::MessageTags) {
                vec![]
            } else {
                vec![message.clone()]
            }
        }
        Payload::Multiline {
            multiline,
            source,
            tags,
            sender,
        } => {
            if is_echo(recipient, *sender, &caps) {
                vec![]
            } else if caps.has(Capability::Multiline) && caps.has(Capability::Batch) {
                multiline_envelope(multiline, source, tags)
            } else {
                multiline_fallback(multiline, source, tags)
            }
        }
        Payload::Gated { message, required } => {
            if caps.has(*required) {
                vec![message.clone()]
            } else {
                vec![]
            }
        }
    };

    messages
        .into_iter()
        .map(|m| filter_tags(m, &caps))
        .collect()
}

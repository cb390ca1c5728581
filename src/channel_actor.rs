use std::{panic::AssertUnwindSafe, sync::Arc};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::{
    batch::{self, MessageKind, MultilineMessage},
    channel::Channel,
    connection::ConnectionEvent,
    delivery::{filter_tags, render, Origin, SharedNotice},
    handlers::{
        history::handle_history, invite::handle_invite, join::handle_join, kick::handle_kick,
        list::{summarize, ChannelSummary},
        mode::handle_mode, names::handle_names, nick::handle_rename, part::handle_part,
        privmsg::{handle_message, handle_multiline, handle_relay},
        quit::handle_quit,
        redact::handle_redact,
        topic::handle_topic,
        who::handle_who,
        ChannelEnv, Delivery, Outcome,
    },
    mailbox::Mailbox,
    message::{Message, Tags},
    registry::RegistryNotice,
    replies::Reply,
};

pub const STATE_LOST_REASON: &str = "Channel state lost";

#[derive(Debug)]
pub enum ChannelAction {
    Join {
        key: Option<String>,
    },
    Part {
        reason: Option<String>,
    },
    Kick {
        targets: Vec<String>,
        reason: Option<String>,
    },
    Mode {
        params: Vec<String>,
    },
    Topic {
        topic: Option<String>,
    },
    Message {
        kind: MessageKind,
        text: Option<String>,
        tags: Tags,
    },
    Multiline(MultilineMessage),
    Relay {
        relay_nick: String,
        text: String,
    },
    Redact {
        msgid: String,
        reason: Option<String>,
    },
    History {
        limit: usize,
    },
    Names,
    Who,
    Invite {
        target: Origin,
    },
    Rename {
        new_nick: String,
        notice: SharedNotice,
    },
    Quit {
        notice: SharedNotice,
    },
    /// A LIST entry, answered to the registry's caller rather than the
    /// origin's queue.
    Summary {
        reply: oneshot::Sender<Option<ChannelSummary>>,
    },
}

impl ChannelAction {
    pub fn is_join(&self) -> bool {
        matches!(self, ChannelAction::Join { .. })
    }

    /// Membership changes are kept for a busy channel instead of being
    /// refused.
    pub fn must_arrive(&self) -> bool {
        matches!(
            self,
            ChannelAction::Join { .. }
                | ChannelAction::Part { .. }
                | ChannelAction::Rename { .. }
                | ChannelAction::Quit { .. }
        )
    }

    pub fn command(&self) -> &'static str {
        match self {
            ChannelAction::Join { .. } => "JOIN",
            ChannelAction::Part { .. } => "PART",
            ChannelAction::Kick { .. } => "KICK",
            ChannelAction::Mode { .. } => "MODE",
            ChannelAction::Topic { .. } => "TOPIC",
            ChannelAction::Message { kind, .. } => kind.command(),
            ChannelAction::Multiline(_) => "BATCH",
            ChannelAction::Relay { .. } => "RELAYMSG",
            ChannelAction::Redact { .. } => "REDACT",
            ChannelAction::History { .. } => "CHATHISTORY",
            ChannelAction::Names => "NAMES",
            ChannelAction::Who => "WHO",
            ChannelAction::Invite { .. } => "INVITE",
            ChannelAction::Rename { .. } => "NICK",
            ChannelAction::Quit { .. } => "QUIT",
            ChannelAction::Summary { .. } => "LIST",
        }
    }
}

#[derive(Debug)]
pub struct ChannelRequest {
    pub origin: Origin,
    pub label: Option<String>,
    pub action: ChannelAction,
}

fn dispatch(
    channel: &mut Channel,
    env: &ChannelEnv,
    origin: &Origin,
    action: ChannelAction,
) -> Outcome {
    match action {
        ChannelAction::Join { key } => handle_join(channel, env, origin, key.as_deref()),
        ChannelAction::Part { reason } => handle_part(channel, env, origin, reason.as_deref()),
        ChannelAction::Kick { targets, reason } => {
            handle_kick(channel, env, origin, &targets, reason.as_deref())
        }
        ChannelAction::Mode { params } => handle_mode(channel, env, origin, &params),
        ChannelAction::Topic { topic } => handle_topic(channel, env, origin, topic.as_deref()),
        ChannelAction::Message { kind, text, tags } => {
            handle_message(channel, env, origin, kind, text.as_deref(), &tags)
        }
        ChannelAction::Multiline(multiline) => handle_multiline(channel, env, origin, multiline),
        ChannelAction::Relay { relay_nick, text } => {
            handle_relay(channel, env, origin, &relay_nick, &text)
        }
        ChannelAction::Redact { msgid, reason } => {
            handle_redact(channel, env, origin, &msgid, reason.as_deref())
        }
        ChannelAction::History { limit } => handle_history(channel, env, origin, limit),
        ChannelAction::Names => handle_names(channel, env, origin),
        ChannelAction::Who => handle_who(channel, env, origin),
        ChannelAction::Invite { target } => handle_invite(channel, env, origin, &target),
        ChannelAction::Rename { new_nick, notice } => {
            handle_rename(channel, origin, &new_nick, &notice)
        }
        ChannelAction::Quit { notice } => handle_quit(channel, origin, &notice),
        ChannelAction::Summary { reply } => {
            let _ = reply.send(summarize(channel, origin.id()));
            Outcome::default()
        }
    }
}

/// Sends an outcome: other connections first, then everything for the
/// requester in one labeled unit. Never waits on a recipient.
pub fn deliver(outcome: Outcome, origin: &Origin, label: Option<&str>, server_host: &str) {
    let mut to_origin: Vec<Message> = vec![];

    for delivery in outcome.deliveries {
        match delivery {
            Delivery::Origin(messages) => to_origin.extend(messages),
            Delivery::Broadcast {
                recipients,
                payload,
            } => {
                for recipient in recipients {
                    let rendered = render(&payload, &recipient);
                    if recipient.connection_id == origin.id() {
                        to_origin.extend(rendered);
                    } else {
                        recipient.send(rendered);
                    }
                }
            }
            Delivery::Direct { recipient, payload } => {
                let rendered = render(&payload, &recipient);
                if recipient.connection_id == origin.id() {
                    to_origin.extend(rendered);
                } else {
                    recipient.send(rendered);
                }
            }
            Delivery::Notify { recipient, event } => recipient.notify(event),
        }
    }

    let caps = origin.recipient.capabilities();
    let messages = batch::labeled(label, server_host, to_origin)
        .into_iter()
        .map(|m| filter_tags(m, &caps))
        .collect();
    origin.recipient.send(messages);
}

/// Sole owner of one channel's state. Requests are handled strictly in
/// arrival order, which gives every member the same view of the channel.
pub struct ChannelActor {
    channel: Channel,
    env: Arc<ChannelEnv>,
    instance: u64,
    joins_processed: u64,
    notices: mpsc::UnboundedSender<RegistryNotice>,
    failed: bool,
}

impl ChannelActor {
    pub fn new(
        channel: Channel,
        env: Arc<ChannelEnv>,
        instance: u64,
        notices: mpsc::UnboundedSender<RegistryNotice>,
    ) -> Self {
        ChannelActor {
            channel,
            env,
            instance,
            joins_processed: 0,
            notices,
            failed: false,
        }
    }

    pub async fn run<T>(mut self, mailbox: &mut T)
    where
        T: Mailbox<ChannelRequest>,
    {
        info!(channel = self.channel.name(), instance = self.instance, "channel started");

        while let Some(request) = mailbox.receive().await {
            self.process(request);
        }

        if !self.failed {
            self.env
                .store
                .save_channel(self.channel.key(), self.channel.snapshot())
                .await;
        }
        info!(channel = self.channel.name(), instance = self.instance, "channel stopped");
    }

    fn process(&mut self, request: ChannelRequest) {
        let ChannelRequest {
            origin,
            label,
            action,
        } = request;

        if action.is_join() {
            self.joins_processed += 1;
        }

        if self.failed {
            self.refuse(origin, label, action);
            return;
        }

        let channel = &mut self.channel;
        let env = &*self.env;
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            dispatch(channel, env, &origin, action)
        }));

        match result {
            Ok(outcome) => {
                deliver(outcome, &origin, label.as_deref(), &self.env.server_host);
            }
            Err(_) => {
                self.tear_down();
                return;
            }
        }

        if self.channel.is_empty() {
            let _ = self.notices.send(RegistryNotice::Emptied {
                key: self.channel.key().to_string(),
                instance: self.instance,
                joins_processed: self.joins_processed,
            });
        }
    }

    /// After a failure the channel answers as if it no longer exists until
    /// its mailbox drains.
    fn refuse(&self, origin: Origin, label: Option<String>, action: ChannelAction) {
        let key = self.channel.key().to_string();
        match action {
            ChannelAction::Rename { .. }
            | ChannelAction::Quit { .. }
            | ChannelAction::Summary { .. } => return,
            ChannelAction::Join { .. } => {
                origin
                    .recipient
                    .notify(ConnectionEvent::JoinRejected { channel: key });
            }
            _ => {}
        }

        let outcome = Outcome::reply(vec![Reply::ErrNoSuchChannel {
            nick: origin.nick(),
            channel: self.channel.name().to_string(),
        }
        .to_message(&self.env.server_host)]);
        deliver(outcome, &origin, label.as_deref(), &self.env.server_host);
    }

    /// A handler panicked: the state can no longer be trusted, so every
    /// member is parted and the registry forgets this instance.
    fn tear_down(&mut self) {
        error!(
            channel = self.channel.name(),
            instance = self.instance,
            members = self.channel.len(),
            "channel handler panicked, dropping channel"
        );
        self.failed = true;

        let name = self.channel.name().to_string();
        let key = self.channel.key().to_string();
        let members: Vec<_> = self.channel.members().cloned().collect();

        for member in members {
            let part = Message::new("PART")
                .with_prefix(member.identity.mask())
                .with_param(name.as_str())
                .with_param(STATE_LOST_REASON);
            let caps = member.recipient.capabilities();
            member.recipient.send(vec![filter_tags(part, &caps)]);
            member.recipient.notify(ConnectionEvent::Removed {
                channel: key.clone(),
            });
        }

        debug!(channel = %name, "notifying registry of failed channel");
        let _ = self.notices.send(RegistryNotice::Failed {
            key,
            instance: self.instance,
        });
    }
}

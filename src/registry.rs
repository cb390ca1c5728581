use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{
        broadcast,
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    batch::{MessageKind, MultilineMessage},
    channel::{Channel, ChannelModes},
    channel_actor::{deliver, ChannelAction, ChannelActor, ChannelRequest},
    connection::ConnectionEvent,
    context::ServerContext,
    delivery::{chat_message, stamp, Origin, Payload, SharedNotice},
    events::LifecycleEvent,
    handlers::{list::ChannelSummary, whois::whois_replies, ChannelEnv, Outcome},
    mailbox::Mailbox,
    message::{Message, Tags},
    replies::Reply,
    result::Result,
};

/// What a direct (nick-targeted) message carries.
#[derive(Debug)]
pub enum DirectContent {
    Chat {
        kind: MessageKind,
        text: Option<String>,
        tags: Tags,
    },
    Multiline(MultilineMessage),
}

impl DirectContent {
    fn kind(&self) -> MessageKind {
        match self {
            DirectContent::Chat { kind, .. } => *kind,
            DirectContent::Multiline(multiline) => multiline.kind,
        }
    }
}

/// How often held-back requests are retried against a busy channel.
const BACKLOG_RETRY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub users: usize,
    pub channels: usize,
}

#[derive(Debug)]
pub enum RegistryRequest {
    /// Claims `new_nick` for the connection, releasing any nick it held.
    /// Registered connections also have the change fanned out.
    Nick {
        origin: Origin,
        new_nick: String,
        channels: Vec<String>,
        reply: oneshot::Sender<bool>,
    },
    Registered {
        origin: Origin,
    },
    SetAway {
        connection_id: Uuid,
        away: Option<String>,
    },
    Channel {
        channel: String,
        request: ChannelRequest,
    },
    Invite {
        origin: Origin,
        label: Option<String>,
        target: String,
        channel: String,
    },
    Direct {
        target: String,
        origin: Origin,
        label: Option<String>,
        content: DirectContent,
    },
    Who {
        origin: Origin,
        label: Option<String>,
        mask: String,
    },
    Whois {
        origin: Origin,
        label: Option<String>,
        targets: Vec<String>,
    },
    /// One pending summary per listed channel; the caller collects them.
    List {
        origin: Origin,
        channels: Vec<String>,
        reply: oneshot::Sender<Vec<oneshot::Receiver<Option<ChannelSummary>>>>,
    },
    Stats {
        reply: oneshot::Sender<Stats>,
    },
    Disconnect {
        origin: Origin,
        channels: Vec<String>,
        message: String,
    },
}

/// Sent by channel actors back to the registry.
#[derive(Debug)]
pub enum RegistryNotice {
    Emptied {
        key: String,
        instance: u64,
        joins_processed: u64,
    },
    Failed {
        key: String,
        instance: u64,
    },
}

struct ChannelEntry {
    sender: mpsc::Sender<ChannelRequest>,
    /// Membership changes that found the mailbox full, oldest first.
    backlog: VecDeque<ChannelRequest>,
    instance: u64,
    joins_routed: u64,
}

/// Owns the nick directory and the channel table. Channel state itself
/// lives in the channel actors; the registry only routes to them.
pub struct Registry {
    context: Arc<ServerContext>,
    env: Arc<ChannelEnv>,
    nicks: HashMap<String, Uuid>,
    owned: HashMap<Uuid, String>,
    users: HashMap<Uuid, Origin>,
    channels: HashMap<String, ChannelEntry>,
    next_instance: u64,
    notices_tx: mpsc::UnboundedSender<RegistryNotice>,
    notices: mpsc::UnboundedReceiver<RegistryNotice>,
}

/// Starts the registry task.
pub fn spawn(
    context: Arc<ServerContext>,
    shutdown: broadcast::Receiver<()>,
) -> (mpsc::Sender<RegistryRequest>, JoinHandle<Result<()>>) {
    let (sender, mut mailbox) = mpsc::channel(context.settings.limits.registry_mailbox);
    let registry = Registry::new(context);
    let handle = tokio::spawn(async move { registry.run(&mut mailbox, shutdown).await });
    (sender, handle)
}

impl Registry {
    pub fn new(context: Arc<ServerContext>) -> Self {
        let settings = &context.settings;
        let env = Arc::new(ChannelEnv {
            server_host: settings.server_host.clone(),
            casemapping: settings.casemapping,
            topic_len: settings.limits.topic_len,
            history_len: settings.limits.history_len,
            relaymsg: settings.capabilities.relaymsg,
            store: context.store.clone(),
        });
        let (notices_tx, notices) = mpsc::unbounded_channel();

        Registry {
            context,
            env,
            nicks: HashMap::new(),
            owned: HashMap::new(),
            users: HashMap::new(),
            channels: HashMap::new(),
            next_instance: 0,
            notices_tx,
            notices,
        }
    }

    pub async fn run<T>(mut self, mailbox: &mut T, mut shutdown: broadcast::Receiver<()>) -> Result<()>
    where
        T: Mailbox<RegistryRequest>,
    {
        info!("registry started");

        loop {
            tokio::select! {
                request = mailbox.receive() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                Some(notice) = self.notices.recv() => self.handle_notice(notice),
                _ = sleep(BACKLOG_RETRY), if self.has_backlog() => self.flush_backlogs(),
                _ = shutdown.recv() => break,
            }
        }

        info!(channels = self.channels.len(), users = self.users.len(), "registry stopped");
        Ok(())
    }

    fn normalize(&self, name: &str) -> String {
        self.context.casemapping().normalize(name)
    }

    fn host(&self) -> &str {
        self.context.server_host()
    }

    async fn handle(&mut self, request: RegistryRequest) {
        match request {
            RegistryRequest::Nick {
                origin,
                new_nick,
                channels,
                reply,
            } => self.change_nick(origin, new_nick, channels, reply).await,
            RegistryRequest::Registered { origin } => {
                debug!(connection_id = %origin.id(), nick = %origin.nick(), "registered");
                self.users.insert(origin.id(), origin);
            }
            RegistryRequest::SetAway {
                connection_id,
                away,
            } => {
                if let Some(user) = self.users.get_mut(&connection_id) {
                    user.identity.away = away;
                }
            }
            RegistryRequest::Channel { channel, request } => self.route(&channel, request).await,
            RegistryRequest::Invite {
                origin,
                label,
                target,
                channel,
            } => {
                let key = self.normalize(&target);
                match self.nicks.get(&key).and_then(|id| self.users.get(id)).cloned() {
                    Some(target) => {
                        let request = ChannelRequest {
                            origin,
                            label,
                            action: ChannelAction::Invite { target },
                        };
                        self.route(&channel, request).await;
                    }
                    None => {
                        let reply = Reply::ErrNoSuchNick {
                            nick: origin.nick(),
                            target,
                        };
                        let outcome = Outcome::reply(vec![reply.to_message(self.host())]);
                        deliver(outcome, &origin, label.as_deref(), self.host());
                    }
                }
            }
            RegistryRequest::Direct {
                target,
                origin,
                label,
                content,
            } => self.direct(target, origin, label, content),
            RegistryRequest::Who {
                origin,
                label,
                mask,
            } => self.who_nick(origin, label, mask),
            RegistryRequest::Whois {
                origin,
                label,
                targets,
            } => self.whois(origin, label, targets),
            RegistryRequest::List {
                origin,
                channels,
                reply,
            } => {
                let pending = self.list(origin, channels).await;
                let _ = reply.send(pending);
            }
            RegistryRequest::Stats { reply } => {
                let _ = reply.send(Stats {
                    users: self.users.len(),
                    channels: self.channels.len(),
                });
            }
            RegistryRequest::Disconnect {
                origin,
                channels,
                message,
            } => self.disconnect(origin, channels, message).await,
        }
    }

    fn handle_notice(&mut self, notice: RegistryNotice) {
        let (key, instance, removable) = match notice {
            RegistryNotice::Emptied {
                key,
                instance,
                joins_processed,
            } => {
                // a JOIN still in the mailbox keeps the channel alive
                let idle = self
                    .channels
                    .get(&key)
                    .map_or(false, |entry| entry.joins_routed == joins_processed);
                (key, instance, idle)
            }
            RegistryNotice::Failed { key, instance } => {
                warn!(channel = %key, instance, "channel failed");
                (key, instance, true)
            }
        };

        let current = self
            .channels
            .get(&key)
            .map_or(false, |entry| entry.instance == instance);
        if current && removable {
            self.channels.remove(&key);
            debug!(channel = %key, instance, "channel removed");
            self.context
                .events
                .publish(LifecycleEvent::ChannelDestroyed { channel: key });
        }
    }

    async fn create_channel(&mut self, name: &str, key: &str) {
        let settings = &self.context.settings;
        let mut channel = Channel::new(
            name,
            key,
            ChannelModes::from_flags(&settings.default_channel_modes),
            settings.limits.history_len,
        );
        if let Some(state) = self.context.store.load_channel(key).await {
            channel.restore(state);
        }

        self.next_instance += 1;
        let instance = self.next_instance;
        let (sender, mut mailbox) = mpsc::channel(self.context.settings.limits.channel_mailbox);
        let actor = ChannelActor::new(channel, self.env.clone(), instance, self.notices_tx.clone());
        tokio::spawn(async move { actor.run(&mut mailbox).await });

        self.channels.insert(
            key.to_string(),
            ChannelEntry {
                sender,
                backlog: VecDeque::new(),
                instance,
                joins_routed: 0,
            },
        );
        self.context.events.publish(LifecycleEvent::ChannelCreated {
            channel: name.to_string(),
        });
    }

    async fn route(&mut self, name: &str, request: ChannelRequest) {
        let key = self.normalize(name);
        let is_join = request.action.is_join();

        if is_join && !self.channels.contains_key(&key) {
            self.create_channel(name, &key).await;
        }

        let entry = match self.channels.get_mut(&key) {
            Some(entry) => entry,
            None => return self.miss(name, request),
        };
        if is_join {
            entry.joins_routed += 1;
        }

        // nothing may overtake a held-back request
        let request = if entry.backlog.is_empty() {
            match entry.sender.try_send(request) {
                Ok(()) => return,
                Err(TrySendError::Full(request)) => request,
                Err(TrySendError::Closed(request)) => {
                    warn!(channel = %key, "channel mailbox closed, dropping channel");
                    self.channels.remove(&key);
                    return self.miss(name, request);
                }
            }
        } else {
            request
        };

        if request.action.must_arrive() {
            debug!(channel = %key, backlog = entry.backlog.len() + 1, "channel busy, holding request");
            entry.backlog.push_back(request);
        } else {
            self.busy(request);
        }
    }

    fn has_backlog(&self) -> bool {
        self.channels.values().any(|entry| !entry.backlog.is_empty())
    }

    /// Moves held-back requests into their mailboxes while there is room.
    fn flush_backlogs(&mut self) {
        let mut closed = vec![];

        for (key, entry) in self.channels.iter_mut() {
            while let Some(request) = entry.backlog.pop_front() {
                match entry.sender.try_send(request) {
                    Ok(()) => {}
                    Err(TrySendError::Full(request)) => {
                        entry.backlog.push_front(request);
                        break;
                    }
                    Err(TrySendError::Closed(request)) => {
                        entry.backlog.push_front(request);
                        closed.push(key.clone());
                        break;
                    }
                }
            }
        }

        for key in closed {
            if let Some(entry) = self.channels.remove(&key) {
                warn!(channel = %key, "channel mailbox closed, dropping channel");
                for request in entry.backlog {
                    self.miss(&key, request);
                }
            }
        }
    }

    /// A request that a busy channel cannot take right now.
    fn busy(&self, request: ChannelRequest) {
        let ChannelRequest {
            origin,
            label,
            action,
        } = request;

        match action {
            ChannelAction::Summary { .. }
            | ChannelAction::Message {
                kind: MessageKind::Notice,
                ..
            } => return,
            _ => {}
        }

        let reply = Reply::TryAgain {
            nick: origin.nick(),
            command: action.command().to_string(),
        };
        let outcome = Outcome::reply(vec![reply.to_message(self.host())]);
        deliver(outcome, &origin, label.as_deref(), self.host());
    }

    /// A request for a channel that does not exist.
    fn miss(&self, name: &str, request: ChannelRequest) {
        let ChannelRequest {
            origin,
            label,
            action,
        } = request;

        match action {
            ChannelAction::Rename { .. }
            | ChannelAction::Quit { .. }
            | ChannelAction::Summary { .. } => return,
            ChannelAction::Message {
                kind: MessageKind::Notice,
                ..
            } => return,
            ChannelAction::Join { .. } => origin.recipient.notify(ConnectionEvent::JoinRejected {
                channel: self.normalize(name),
            }),
            _ => {}
        }

        let reply = Reply::ErrNoSuchChannel {
            nick: origin.nick(),
            channel: name.to_string(),
        };
        let outcome = Outcome::reply(vec![reply.to_message(self.host())]);
        deliver(outcome, &origin, label.as_deref(), self.host());
    }

    async fn change_nick(
        &mut self,
        origin: Origin,
        new_nick: String,
        channels: Vec<String>,
        reply: oneshot::Sender<bool>,
    ) {
        let key = self.normalize(&new_nick);
        let id = origin.id();

        if matches!(self.nicks.get(&key), Some(owner) if *owner != id) {
            let _ = reply.send(false);
            return;
        }

        if let Some(old) = self.owned.insert(id, key.clone()) {
            if old != key {
                self.nicks.remove(&old);
            }
        }
        self.nicks.insert(key, id);
        let _ = reply.send(true);

        let user = match self.users.get_mut(&id) {
            Some(user) => user,
            None => return,
        };
        user.identity.nick = Some(new_nick.clone());

        let message = stamp(
            Message::new("NICK")
                .with_prefix(origin.identity.mask())
                .with_param(new_nick.as_str()),
            origin.identity.account.as_deref(),
        );

        let notice = SharedNotice::new(message, id);
        for channel in channels {
            let request = ChannelRequest {
                origin: origin.clone(),
                label: None,
                action: ChannelAction::Rename {
                    new_nick: new_nick.clone(),
                    notice: notice.clone(),
                },
            };
            self.route(&channel, request).await;
        }
    }

    async fn disconnect(&mut self, origin: Origin, channels: Vec<String>, message: String) {
        let id = origin.id();
        if let Some(key) = self.owned.remove(&id) {
            self.nicks.remove(&key);
        }
        let was_registered = self.users.remove(&id).is_some();
        debug!(connection_id = %id, channels = channels.len(), "disconnect");

        if !was_registered {
            return;
        }

        let quit = stamp(
            Message::new("QUIT")
                .with_prefix(origin.identity.mask())
                .with_param(message),
            origin.identity.account.as_deref(),
        );

        let notice = SharedNotice::new(quit, id);
        for channel in channels {
            let request = ChannelRequest {
                origin: origin.clone(),
                label: None,
                action: ChannelAction::Quit {
                    notice: notice.clone(),
                },
            };
            self.route(&channel, request).await;
        }
    }

    fn direct(
        &mut self,
        target: String,
        origin: Origin,
        label: Option<String>,
        content: DirectContent,
    ) {
        let kind = content.kind();
        let key = self.normalize(&target);
        let found = self.nicks.get(&key).and_then(|id| self.users.get(id)).cloned();
        let mut outcome = Outcome::default();

        let recipient = match found {
            Some(recipient) => recipient,
            None => {
                if kind != MessageKind::Notice {
                    outcome.to_origin(vec![Reply::ErrNoSuchNick {
                        nick: origin.nick(),
                        target,
                    }
                    .to_message(self.host())]);
                }
                deliver(outcome, &origin, label.as_deref(), self.host());
                return;
            }
        };

        let target_nick = recipient.nick();
        let payload = match content {
            DirectContent::Chat { kind, text, tags } => Payload::Chat {
                message: chat_message(&origin.identity, kind, &target_nick, text.as_deref(), &tags),
                sender: origin.id(),
            },
            DirectContent::Multiline(mut multiline) => {
                multiline.target = target_nick.clone();
                let tags = stamp(
                    Message::new("BATCH").with_tags(&multiline.tags),
                    origin.identity.account.as_deref(),
                )
                .tags()
                .clone();
                Payload::Multiline {
                    multiline,
                    source: origin.identity.mask(),
                    tags,
                    sender: origin.id(),
                }
            }
        };

        if recipient.id() == origin.id() {
            // talking to yourself always arrives once
            let to_self = match &payload {
                Payload::Chat { message, .. } => Payload::Plain(message.clone()),
                other => other.clone(),
            };
            outcome.direct(recipient.recipient.clone(), to_self);
        } else {
            outcome.direct(recipient.recipient.clone(), payload.clone());
            // rendered away unless the sender negotiated echo-message
            outcome.direct(origin.recipient.clone(), payload);
        }

        if kind == MessageKind::PrivMsg {
            if let Some(away) = &recipient.identity.away {
                outcome.to_origin(vec![Reply::Away {
                    nick: origin.nick(),
                    target: target_nick,
                    message: away.clone(),
                }
                .to_message(self.host())]);
            }
        }

        deliver(outcome, &origin, label.as_deref(), self.host());
    }

    fn whois(&self, origin: Origin, label: Option<String>, targets: Vec<String>) {
        let settings = &self.context.settings;
        let nick = origin.nick();
        let mut replies = vec![];

        for target in targets {
            let key = self.normalize(&target);
            let found = self.nicks.get(&key).and_then(|id| self.users.get(id));
            replies.extend(whois_replies(
                self.host(),
                &settings.network,
                &nick,
                &target,
                found.map(|user| &user.identity),
            ));
        }

        deliver(Outcome::reply(replies), &origin, label.as_deref(), self.host());
    }

    /// Asks every listed channel (all of them when `channels` is empty) for
    /// its summary. Channels that do not exist are skipped.
    async fn list(
        &mut self,
        origin: Origin,
        channels: Vec<String>,
    ) -> Vec<oneshot::Receiver<Option<ChannelSummary>>> {
        let names: Vec<String> = if channels.is_empty() {
            self.channels.keys().cloned().collect()
        } else {
            channels
                .into_iter()
                .filter(|name| self.channels.contains_key(&self.normalize(name)))
                .collect()
        };

        let mut pending = vec![];
        for name in names {
            let (reply, summary) = oneshot::channel();
            let request = ChannelRequest {
                origin: origin.clone(),
                label: None,
                action: ChannelAction::Summary { reply },
            };
            self.route(&name, request).await;
            pending.push(summary);
        }
        pending
    }

    fn who_nick(&self, origin: Origin, label: Option<String>, mask: String) {
        let key = self.normalize(&mask);
        let mut replies = vec![];

        if let Some(user) = self.nicks.get(&key).and_then(|id| self.users.get(id)) {
            let here = if user.identity.away.is_some() { "G" } else { "H" };
            replies.push(Reply::Who {
                nick: origin.nick(),
                channel: "*".to_string(),
                user: user.identity.username(),
                host: user.identity.client_host.clone(),
                target: user.nick(),
                flags: here.to_string(),
                realname: user.identity.real_name.clone().unwrap_or_default(),
            });
        }
        replies.push(Reply::EndOfWho {
            nick: origin.nick(),
            mask,
        });

        let outcome = Outcome::reply(replies.iter().map(|r| r.to_message(self.host())).collect());
        deliver(outcome, &origin, label.as_deref(), self.host());
    }
}

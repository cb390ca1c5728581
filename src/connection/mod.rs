//! Per-connection protocol state. The listener feeds it decoded lines,
//! membership events and availability changes; everything it says goes out
//! through the connection's outbound queue.

mod messaging;
mod registration;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    batch::{self, BatchAssembler, Routed},
    capabilities::{cap_lines, Availability, Capability, CapabilityId, CapabilitySet},
    context::{ConnectionContext, ServerContext},
    delivery::{filter_tags, Origin, Recipient},
    events::LifecycleEvent,
    message::{Message, ParseError, MAX_LINE_LENGTH},
    message_parsing::{Command, CommandError},
    registry::{RegistryRequest, Stats},
    replies::{self, Reply},
    sasl::SaslExchange,
};

/// Membership changes reported back by channel actors.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Joined { channel: String },
    JoinRejected { channel: String },
    Removed { channel: String },
    /// The outbound queue filled up because the client stopped reading.
    SendQExceeded,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Registering,
    /// Between `CAP LS`/`CAP REQ` and `CAP END`; welcome is held back.
    CapNegotiating,
    /// A SASL exchange inside capability negotiation.
    Authenticating(SaslExchange),
    Registered,
    Closing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Continue,
    Close(String),
}

pub struct Connection {
    context: Arc<ServerContext>,
    registry: mpsc::Sender<RegistryRequest>,
    identity: ConnectionContext,
    recipient: Recipient,
    state: ConnectionState,
    caps: CapabilitySet,
    caps_tx: watch::Sender<CapabilitySet>,
    cap_version: u32,
    cap_deadline: Option<Instant>,
    availability: Availability,
    password: Option<String>,
    certificate: Option<String>,
    nick_claimed: bool,
    batches: BatchAssembler,
    // normalized channel keys
    channels: HashSet<String>,
    pending_joins: HashSet<String>,
    read_markers: HashMap<String, DateTime<Utc>>,
}

impl Connection {
    pub fn new(
        context: Arc<ServerContext>,
        registry: mpsc::Sender<RegistryRequest>,
        client_host: &str,
        outbound: mpsc::Sender<Message>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let connection_id = Uuid::new_v4();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (caps_tx, caps_rx) = watch::channel(CapabilitySet::default());
        let availability = context.current_availability();
        let batches = BatchAssembler::new(context.multiline_limits());

        let connection = Connection {
            context,
            registry,
            identity: ConnectionContext::new(connection_id, client_host),
            recipient: Recipient {
                connection_id,
                outbound,
                events: events_tx,
                caps: caps_rx,
            },
            state: ConnectionState::Connecting,
            caps: CapabilitySet::default(),
            caps_tx,
            cap_version: 0,
            cap_deadline: None,
            availability,
            password: None,
            certificate: None,
            nick_claimed: false,
            batches,
            channels: HashSet::new(),
            pending_joins: HashSet::new(),
            read_markers: HashMap::new(),
        };

        (connection, events)
    }

    /// Fingerprint of the client certificate, for SASL EXTERNAL.
    pub fn with_certificate(mut self, fingerprint: Option<String>) -> Self {
        self.certificate = fingerprint;
        self
    }

    pub fn id(&self) -> Uuid {
        self.identity.connection_id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_registered(&self) -> bool {
        self.state == ConnectionState::Registered
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.caps
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// When an unfinished `CAP` negotiation gives up waiting for `CAP END`.
    pub fn cap_deadline(&self) -> Option<Instant> {
        self.cap_deadline
    }

    fn host(&self) -> &str {
        self.context.server_host()
    }

    fn nick(&self) -> String {
        self.identity.nick_or_star()
    }

    fn origin(&self) -> Origin {
        Origin {
            identity: self.identity.clone(),
            recipient: self.recipient.clone(),
        }
    }

    fn numeric(&self, reply: Reply) -> Message {
        reply.to_message(self.host())
    }

    fn set_caps(&mut self, caps: CapabilitySet) {
        self.caps = caps.clone();
        self.caps_tx.send_replace(caps);
    }

    fn send(&self, messages: Vec<Message>) {
        let messages = messages
            .into_iter()
            .map(|m| filter_tags(m, &self.caps))
            .collect();
        self.recipient.send(messages);
    }

    /// Sends replies to a command, honoring its label.
    fn reply(&self, label: Option<&str>, messages: Vec<Message>) {
        self.send(batch::labeled(label, self.host(), messages));
    }

    fn reply_numeric(&self, label: Option<&str>, reply: Reply) {
        let message = self.numeric(reply);
        self.reply(label, vec![message]);
    }

    async fn request(&self, request: RegistryRequest) {
        if self.registry.send(request).await.is_err() {
            warn!(connection_id = %self.id(), "registry is gone");
        }
    }

    async fn stats(&self) -> Stats {
        let (reply, result) = oneshot::channel();
        self.request(RegistryRequest::Stats { reply }).await;
        result.await.unwrap_or(Stats {
            users: 0,
            channels: 0,
        })
    }

    fn command_error(&self, error: CommandError) -> Reply {
        let nick = self.nick();
        match error {
            CommandError::NeedMoreParams(command) => Reply::ErrNeedMoreParams { nick, command },
            CommandError::NoRecipient(command) => Reply::ErrNoRecipient { nick, command },
            CommandError::NoTextToSend => Reply::ErrNoTextToSend { nick },
            CommandError::NoNicknameGiven => Reply::ErrNoNicknameGiven { nick },
        }
    }

    /// One decoded line from the client.
    pub async fn handle_message(&mut self, message: Message) -> Flow {
        match self.state {
            ConnectionState::Closing => return Flow::Continue,
            ConnectionState::Connecting => self.state = ConnectionState::Registering,
            _ => {}
        }

        let message = match self.batches.route(message) {
            Ok(Routed::Dispatch(message)) => message,
            Ok(Routed::Buffered) => return Flow::Continue,
            Err(error) => {
                debug!(connection_id = %self.id(), %error, "dropping batched line");
                let fail = replies::fail(self.host(), "BATCH", error.code(), &[], &error.to_string());
                self.send(vec![fail]);
                return Flow::Continue;
            }
        };

        let label = message
            .tag("label")
            .filter(|_| self.caps.has(Capability::LabeledResponse))
            .map(str::to_string);

        let command = match Command::from_message(&message) {
            Ok(command) => command,
            Err(error) => {
                let reply = self.command_error(error);
                self.reply_numeric(label.as_deref(), reply);
                return Flow::Continue;
            }
        };

        if !self.is_registered()
            && !command.allowed_before_registration(self.caps.has(Capability::PreAway))
        {
            let reply = Reply::ErrNotRegistered { nick: self.nick() };
            self.reply_numeric(label.as_deref(), reply);
            return Flow::Continue;
        }

        // several targets answer separately, so the label is acknowledged
        // up front
        let label = match label {
            Some(label) if command.target_count() > 1 => {
                self.reply(Some(&label), vec![]);
                None
            }
            label => label,
        };

        self.dispatch(command, message, label).await
    }

    async fn dispatch(&mut self, command: Command, message: Message, label: Option<String>) -> Flow {
        let label = label.as_deref();

        match command {
            Command::Cap { subcommand, args } => self.handle_cap(&subcommand, &args, label).await,
            Command::Nick { nick } => self.handle_nick(&nick, label).await,
            Command::User { user, realname, .. } => self.handle_user(user, realname, label).await,
            Command::Pass { password } => self.handle_pass(password, label),
            Command::Authenticate { payload } => self.handle_authenticate(&payload, label).await,
            Command::Ping { token } => {
                self.reply(label, vec![replies::pong(self.host(), &token)]);
                Flow::Continue
            }
            Command::Pong => Flow::Continue,
            Command::Quit { message } => Flow::Close(match message {
                Some(message) => format!("Quit: {}", message),
                None => "Client Quit".to_string(),
            }),
            command => {
                self.handle_registered(command, message, label).await;
                Flow::Continue
            }
        }
    }

    pub fn handle_event(&mut self, event: ConnectionEvent) -> Flow {
        match event {
            ConnectionEvent::Joined { channel } => {
                self.pending_joins.remove(&channel);
                self.channels.insert(channel);
            }
            ConnectionEvent::JoinRejected { channel } => {
                self.pending_joins.remove(&channel);
            }
            ConnectionEvent::Removed { channel } => {
                self.channels.remove(&channel);
            }
            ConnectionEvent::SendQExceeded => return Flow::Close("SendQ exceeded".to_string()),
        }
        Flow::Continue
    }

    /// A line the codec framed but could not parse.
    pub fn handle_parse_error(&mut self, error: ParseError) {
        match error {
            ParseError::LineTooLong { .. } | ParseError::TagsTooLong { .. } => {
                let reply = Reply::ErrInputTooLong { nick: self.nick() };
                self.send(vec![self.numeric(reply)]);
            }
            error => debug!(connection_id = %self.id(), %error, "dropping unparseable line"),
        }
    }

    /// Diffs a new availability snapshot into `CAP NEW`/`CAP DEL`. Withdrawn
    /// capabilities are disabled whether or not the client asked to hear.
    pub fn update_availability(&mut self, availability: Availability) {
        let (added, removed) =
            self.context
                .capabilities
                .diff(&self.availability, &availability, self.cap_version);
        self.availability = availability;

        if !removed.is_empty() {
            let mut caps = self.caps.clone();
            for name in &removed {
                if let Some(descriptor) = self.context.capabilities.get(name) {
                    caps.disable(&descriptor.id);
                }
            }
            self.set_caps(caps);
        }

        if !self.caps.has(Capability::CapNotify) {
            return;
        }

        let nick = self.nick();
        let mut lines = vec![];
        if !added.is_empty() {
            lines.extend(cap_lines(self.host(), &nick, "NEW", &added, self.cap_version, MAX_LINE_LENGTH));
        }
        if !removed.is_empty() {
            lines.extend(cap_lines(self.host(), &nick, "DEL", &removed, self.cap_version, MAX_LINE_LENGTH));
        }
        self.send(lines);
    }

    /// Negotiation ran out of time: behave as if `CAP END` arrived.
    pub async fn cap_timeout(&mut self) -> Flow {
        debug!(connection_id = %self.id(), "capability negotiation timed out");
        self.end_negotiation().await
    }

    /// Leaves the connection. Runs once; later calls do nothing.
    pub async fn close(&mut self, reason: &str) {
        if self.state == ConnectionState::Closing {
            return;
        }
        self.state = ConnectionState::Closing;
        info!(connection_id = %self.id(), nick = %self.nick(), reason, "closing connection");

        let error = replies::error(&format!("Closing Link: {} ({})", self.identity.client_host, reason));
        self.recipient.send(vec![error]);

        let channels = self
            .channels
            .drain()
            .chain(self.pending_joins.drain())
            .collect();
        self.request(RegistryRequest::Disconnect {
            origin: self.origin(),
            channels,
            message: reason.to_string(),
        })
        .await;

        self.context.events.publish(LifecycleEvent::ConnectionClosed {
            connection_id: self.id(),
            reason: reason.to_string(),
        });
    }

    fn enabled_names(&self) -> Vec<String> {
        self.caps
            .ids()
            .map(|id| self.context.capabilities.name_of(id))
            .collect()
    }

    fn enable(&mut self, capability: Capability) {
        let mut caps = self.caps.clone();
        caps.enable(CapabilityId::Known(capability), None);
        self.set_caps(caps);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use tokio::sync::broadcast;

    use super::*;
    use crate::{registry, settings::Settings};

    pub(crate) struct Client {
        pub connection: Connection,
        pub outbound: mpsc::Receiver<Message>,
        pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
    }

    pub(crate) struct Server {
        pub context: Arc<ServerContext>,
        pub registry: mpsc::Sender<RegistryRequest>,
        _shutdown: broadcast::Sender<()>,
    }

    impl Server {
        pub(crate) fn start(context: ServerContext) -> Self {
            let context = Arc::new(context);
            let (shutdown, shutdown_rx) = broadcast::channel(1);
            let (registry, _) = registry::spawn(context.clone(), shutdown_rx);
            Server {
                context,
                registry,
                _shutdown: shutdown,
            }
        }

        pub(crate) fn client(&self) -> Client {
            let (outbound_tx, outbound) = mpsc::channel(256);
            let (connection, events) =
                Connection::new(self.context.clone(), self.registry.clone(), "example.com", outbound_tx);
            Client {
                connection,
                outbound,
                events,
            }
        }
    }

    impl Client {
        pub(crate) async fn line(&mut self, line: &str) -> Flow {
            let flow = self.connection.handle_message(Message::parse(line).unwrap()).await;
            // membership events arrive asynchronously from channel actors
            while let Ok(event) = self.events.try_recv() {
                self.connection.handle_event(event);
            }
            flow
        }

        pub(crate) fn drain(&mut self) -> Vec<Message> {
            crate::delivery::tests::drain(&mut self.outbound)
        }

        pub(crate) async fn next(&mut self) -> Message {
            tokio::time::timeout(Duration::from_secs(1), self.outbound.recv())
                .await
                .unwrap()
                .unwrap()
        }

        pub(crate) async fn until(&mut self, command: &str) -> Vec<Message> {
            let mut seen = vec![];
            loop {
                let message = self.next().await;
                let done = message.command() == command
                    || (command == "376" && message.command() == "422");
                seen.push(message);
                if done {
                    return seen;
                }
            }
        }

        pub(crate) async fn register(&mut self, nick: &str) {
            self.line(&format!("NICK {}", nick)).await;
            self.line(&format!("USER {} 0 * :{} real", nick, nick)).await;
            self.until("376").await;
        }
    }

    fn commands(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.command()).collect()
    }

    #[tokio::test]
    async fn welcome_waits_for_cap_end() {
        // Arrange
        let server = Server::start(ServerContext::new(Settings::default()));
        let mut client = server.client();

        // Act
        client.line("CAP LS 302").await;
        client.line("NICK alice").await;
        client.line("USER alice 0 * :Alice").await;
        let before_end = client.drain();
        client.line("CAP END").await;
        let after_end = client.until("422").await;
        client.line("CAP END").await;
        let repeated = client.drain();

        // Assert
        assert!(commands(&before_end).iter().all(|c| *c == "CAP"));
        let welcome = commands(&after_end);
        assert_eq!(vec!["001", "002", "003", "004", "005"], welcome[..5].to_vec());
        assert_eq!(&ConnectionState::Registered, client.connection.state());
        assert!(repeated.is_empty());
    }

    #[tokio::test]
    async fn commands_before_registration_are_refused() {
        // Arrange
        let server = Server::start(ServerContext::new(Settings::default()));
        let mut client = server.client();

        // Act
        client.line("JOIN #a").await;
        client.line("AWAY :brb").await;

        // Assert
        let replies = client.drain();
        assert_eq!(vec!["451", "451"], commands(&replies));
        assert_eq!(0, client.connection.channel_count());
    }

    #[tokio::test]
    async fn cap_req_is_all_or_nothing() {
        // Arrange
        let server = Server::start(ServerContext::new(Settings::default()));
        let mut client = server.client();
        client.line("CAP LS 302").await;
        client.drain();

        // Act
        client.line("CAP REQ :server-time bogus-cap").await;
        let refused = client.drain();
        client.line("CAP REQ :server-time echo-message").await;
        let accepted = client.drain();

        // Assert
        assert_eq!(Some("NAK"), refused[0].param(1));
        assert!(!client.connection.capabilities().has(Capability::ServerTime));
        assert_eq!(Some("ACK"), accepted[0].param(1));
        assert_eq!(Some("server-time echo-message"), accepted[0].param(2));
        assert!(client.connection.capabilities().has(Capability::ServerTime));
        assert!(client.connection.capabilities().has(Capability::EchoMessage));
    }

    #[tokio::test]
    async fn cap_302_implies_cap_notify() {
        // Arrange
        let server = Server::start(ServerContext::new(Settings::default()));
        let mut client = server.client();
        let mut legacy = server.client();

        // Act
        client.line("CAP LS 302").await;
        legacy.line("CAP LS").await;

        // Assert
        assert!(client.connection.capabilities().has(Capability::CapNotify));
        assert!(!legacy.connection.capabilities().has(Capability::CapNotify));
    }

    #[tokio::test]
    async fn withdrawn_capability_is_disabled_and_announced() {
        // Arrange
        let server = Server::start(ServerContext::new(Settings::default()));
        let mut client = server.client();
        client.line("CAP LS 302").await;
        client.line("CAP REQ sasl").await;
        client.drain();

        // Act
        let mut availability = server.context.current_availability();
        availability.sasl_mechanisms.clear();
        client.connection.update_availability(availability);

        // Assert
        let lines = client.drain();
        assert_eq!(Some("DEL"), lines[0].param(1));
        assert_eq!(Some("sasl"), lines[0].param(2));
        assert!(!client.connection.capabilities().has(Capability::Sasl));
    }

    #[tokio::test]
    async fn nick_in_use_is_refused() {
        // Arrange
        let server = Server::start(ServerContext::new(Settings::default()));
        let mut alice = server.client();
        let mut other = server.client();
        alice.register("alice").await;

        // Act
        other.line("NICK ALICE").await;
        other.line("NICK 4lice").await;

        // Assert
        let replies = other.drain();
        assert_eq!(vec!["433", "432"], commands(&replies));
    }

    #[tokio::test]
    async fn labeled_ping_is_tagged() {
        // Arrange
        let server = Server::start(ServerContext::new(Settings::default()));
        let mut client = server.client();
        client.line("CAP REQ labeled-response").await;
        client.line("CAP END").await;
        client.register("alice").await;

        // Act
        client.line("@label=abc PING token").await;

        // Assert
        let pong = client.next().await;
        assert_eq!("PONG", pong.command());
        assert_eq!(Some("abc"), pong.tag("label"));
    }

    #[tokio::test]
    async fn close_runs_once() {
        // Arrange
        let server = Server::start(ServerContext::new(Settings::default()));
        let mut client = server.client();
        client.register("alice").await;

        // Act
        let flow = client.line("QUIT :bye").await;
        client.connection.close("Quit: bye").await;
        client.connection.close("Quit: bye").await;

        // Assert
        assert_eq!(Flow::Close("Quit: bye".to_string()), flow);
        let errors: Vec<_> = client
            .drain()
            .into_iter()
            .filter(|m| m.command() == "ERROR")
            .collect();
        assert_eq!(1, errors.len());
        assert_eq!(&ConnectionState::Closing, client.connection.state());
    }
}

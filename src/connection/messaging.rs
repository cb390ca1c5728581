use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::oneshot;
use tracing::debug;

use super::Connection;
use crate::{
    batch::{MessageKind, MultilineMessage, MULTILINE_BATCH},
    capabilities::Capability,
    channel_actor::{ChannelAction, ChannelRequest},
    handlers::list::list_replies,
    message::Message,
    message_parsing::Command,
    registry::{DirectContent, RegistryRequest},
    replies::{self, Reply},
    util,
};

impl Connection {
    async fn channel_request(&self, channel: &str, label: Option<&str>, action: ChannelAction) {
        self.request(RegistryRequest::Channel {
            channel: channel.to_string(),
            request: ChannelRequest {
                origin: self.origin(),
                label: label.map(str::to_string),
                action,
            },
        })
        .await;
    }

    fn fail(&self, label: Option<&str>, command: &str, code: &str, context: &[&str], description: &str) {
        let fail = replies::fail(self.host(), command, code, context, description);
        self.reply(label, vec![fail]);
    }

    /// Everything past registration, plus AWAY while registering.
    pub(super) async fn handle_registered(&mut self, command: Command, message: Message, label: Option<&str>) {
        match command {
            Command::Join { channels, keys } => self.handle_join(channels, keys, label).await,
            Command::Part { channels, message } => {
                for channel in channels {
                    let action = ChannelAction::Part {
                        reason: message.clone(),
                    };
                    self.channel_request(&channel, label, action).await;
                }
            }
            Command::Chat {
                kind,
                targets,
                text,
            } => {
                for target in targets {
                    self.send_chat(kind, target, text.clone(), &message, label).await;
                }
            }
            Command::Batch {
                reference,
                batch_type,
                params,
            } => self.handle_batch(&reference, batch_type, params, &message, label).await,
            Command::Redact {
                target,
                msgid,
                reason,
            } => {
                if util::is_channel_name(&target) {
                    let action = ChannelAction::Redact { msgid, reason };
                    self.channel_request(&target, label, action).await;
                } else {
                    let description = "Only channel messages can be redacted";
                    self.fail(label, "REDACT", "INVALID_TARGET", &[target.as_str()], description);
                }
            }
            Command::ChatHistory {
                subcommand,
                target,
                params,
            } => self.handle_chathistory(&subcommand, &target, &params, label).await,
            Command::MarkRead { target, timestamp } => {
                self.handle_markread(&target, timestamp.as_deref(), label)
            }
            Command::Away { message } => self.handle_away(message, label).await,
            Command::RelayMsg {
                channel,
                relay_nick,
                text,
            } => {
                let action = ChannelAction::Relay { relay_nick, text };
                self.channel_request(&channel, label, action).await;
            }
            Command::Mode { target, changes } => {
                if util::is_channel_name(&target) {
                    let action = ChannelAction::Mode { params: changes };
                    self.channel_request(&target, label, action).await;
                } else if self.context.casemapping().equals(&target, &self.nick()) {
                    // no user modes are settable
                    let reply = Reply::UModeIs {
                        nick: self.nick(),
                        modes: "+".to_string(),
                    };
                    self.reply_numeric(label, reply);
                } else {
                    let reply = Reply::ErrUsersDontMatch { nick: self.nick() };
                    self.reply_numeric(label, reply);
                }
            }
            Command::Topic { channel, topic } => {
                self.channel_request(&channel, label, ChannelAction::Topic { topic })
                    .await
            }
            Command::Names { channels } => {
                if channels.is_empty() {
                    let reply = Reply::EndOfNames {
                        nick: self.nick(),
                        channel: "*".to_string(),
                    };
                    self.reply_numeric(label, reply);
                }
                for channel in channels {
                    self.channel_request(&channel, label, ChannelAction::Names).await;
                }
            }
            Command::Who { mask } => {
                if util::is_channel_name(&mask) {
                    self.channel_request(&mask, label, ChannelAction::Who).await;
                } else {
                    self.request(RegistryRequest::Who {
                        origin: self.origin(),
                        label: label.map(str::to_string),
                        mask,
                    })
                    .await;
                }
            }
            Command::Whois { targets } => {
                self.request(RegistryRequest::Whois {
                    origin: self.origin(),
                    label: label.map(str::to_string),
                    targets,
                })
                .await;
            }
            Command::List { channels } => self.handle_list(channels, label).await,
            Command::Invite { nick, channel } => {
                self.request(RegistryRequest::Invite {
                    origin: self.origin(),
                    label: label.map(str::to_string),
                    target: nick,
                    channel,
                })
                .await;
            }
            Command::Kick {
                channel,
                targets,
                reason,
            } => {
                let action = ChannelAction::Kick { targets, reason };
                self.channel_request(&channel, label, action).await;
            }
            Command::Motd => {
                let motd = self.motd();
                self.reply(label, motd);
            }
            Command::Lusers => {
                let lusers = self.lusers().await;
                self.reply(label, lusers);
            }
            Command::Unhandled { command } => {
                debug!(connection_id = %self.id(), %command, "unknown command");
                let reply = Reply::ErrUnknownCommand {
                    nick: self.nick(),
                    command,
                };
                self.reply_numeric(label, reply);
            }
            // registration commands never get here
            _ => {}
        }
    }

    /// Channels answer for themselves, so visibility is decided with their
    /// current membership.
    async fn handle_list(&self, channels: Vec<String>, label: Option<&str>) {
        let (reply, result) = oneshot::channel();
        self.request(RegistryRequest::List {
            origin: self.origin(),
            channels,
            reply,
        })
        .await;

        let mut summaries = vec![];
        for pending in result.await.unwrap_or_default() {
            if let Ok(Some(summary)) = pending.await {
                summaries.push(summary);
            }
        }

        let replies = list_replies(self.host(), &self.nick(), summaries);
        self.reply(label, replies);
    }

    async fn handle_join(&mut self, channels: Vec<String>, keys: Vec<String>, label: Option<&str>) {
        if channels.len() == 1 && channels[0] == "0" {
            let joined: Vec<String> = self.channels.iter().cloned().collect();
            if joined.is_empty() {
                self.reply(label, vec![]);
            }
            for channel in joined {
                self.channel_request(&channel, label, ChannelAction::Part { reason: None })
                    .await;
            }
            return;
        }

        let limits = &self.context.settings.limits;
        for (i, name) in channels.into_iter().enumerate() {
            if !util::is_valid_channel_name(&name, limits.channel_len) {
                let reply = Reply::ErrBadChanMask {
                    nick: self.nick(),
                    channel: name,
                };
                self.reply_numeric(label, reply);
                continue;
            }

            let key = self.context.casemapping().normalize(&name);
            let already = self.channels.contains(&key) || self.pending_joins.contains(&key);
            if !already && self.channels.len() + self.pending_joins.len() >= limits.max_channels_per_connection {
                let reply = Reply::ErrTooManyChannels {
                    nick: self.nick(),
                    channel: name,
                };
                self.reply_numeric(label, reply);
                continue;
            }

            self.pending_joins.insert(key);
            let action = ChannelAction::Join {
                key: keys.get(i).cloned(),
            };
            self.channel_request(&name, label, action).await;
        }
    }

    async fn send_chat(
        &self,
        kind: MessageKind,
        target: String,
        text: Option<String>,
        message: &Message,
        label: Option<&str>,
    ) {
        let tags = message.tags().client_only();

        if util::is_channel_name(&target) {
            let action = ChannelAction::Message { kind, text, tags };
            self.channel_request(&target, label, action).await;
        } else {
            self.request(RegistryRequest::Direct {
                target,
                origin: self.origin(),
                label: label.map(str::to_string),
                content: DirectContent::Chat { kind, text, tags },
            })
            .await;
        }
    }

    async fn handle_batch(
        &mut self,
        reference: &str,
        batch_type: Option<String>,
        params: Vec<String>,
        message: &Message,
        label: Option<&str>,
    ) {
        if let Some(reference) = reference.strip_prefix('+') {
            let batch_type = batch_type.unwrap_or_default();
            if batch_type != MULTILINE_BATCH || !self.caps.has(Capability::Multiline) {
                let description = "Unsupported batch type";
                self.fail(label, "BATCH", "UNKNOWN_TYPE", &[batch_type.as_str()], description);
                return;
            }

            let opened = self
                .batches
                .open(reference, &batch_type, params, message.tags().clone());
            if let Err(error) = opened {
                self.fail(label, "BATCH", error.code(), &[], &error.to_string());
            }
            return;
        }

        let reference = match reference.strip_prefix('-') {
            Some(reference) => reference,
            None => {
                let description = "Batch reference must start with + or -";
                self.fail(label, "BATCH", "INVALID_REFTAG", &[], description);
                return;
            }
        };

        let context = match self.batches.close(reference) {
            Ok(context) if context.discarded => return,
            Ok(context) => context,
            Err(error) => {
                self.fail(label, "BATCH", error.code(), &[], &error.to_string());
                return;
            }
        };

        // the label rides on the opening line
        let label = context
            .tags
            .value("label")
            .filter(|_| self.caps.has(Capability::LabeledResponse))
            .map(str::to_string);
        let label = label.as_deref();

        let multiline = match MultilineMessage::assemble(context, &self.context.multiline_limits()) {
            Ok(multiline) => multiline,
            Err(error) => {
                debug!(connection_id = %self.id(), %error, "multiline batch refused");
                self.fail(label, "BATCH", error.code(), &[], &error.to_string());
                return;
            }
        };

        let target = multiline.target.clone();
        if util::is_channel_name(&target) {
            self.channel_request(&target, label, ChannelAction::Multiline(multiline))
                .await;
        } else {
            self.request(RegistryRequest::Direct {
                target,
                origin: self.origin(),
                label: label.map(str::to_string),
                content: DirectContent::Multiline(multiline),
            })
            .await;
        }
    }

    async fn handle_chathistory(&self, subcommand: &str, target: &str, params: &[String], label: Option<&str>) {
        if subcommand != "LATEST" {
            let description = "Only LATEST is supported";
            self.fail(label, "CHATHISTORY", "INVALID_PARAMS", &[subcommand], description);
            return;
        }
        if !util::is_channel_name(target) {
            let description = "History is only kept for channels";
            self.fail(label, "CHATHISTORY", "INVALID_TARGET", &[subcommand, target], description);
            return;
        }

        // LATEST <target> * <limit>
        let limit = match (params.first().map(String::as_str), params.get(1)) {
            (Some("*"), Some(limit)) => limit.parse::<usize>().ok(),
            _ => None,
        };
        match limit {
            Some(limit) => {
                let limit = limit.min(self.context.settings.limits.history_len);
                self.channel_request(target, label, ChannelAction::History { limit })
                    .await;
            }
            None => {
                let description = "Expected LATEST <target> * <limit>";
                self.fail(label, "CHATHISTORY", "INVALID_PARAMS", &[subcommand], description);
            }
        }
    }

    fn handle_markread(&mut self, target: &str, timestamp: Option<&str>, label: Option<&str>) {
        let key = self.context.casemapping().normalize(target);

        if let Some(timestamp) = timestamp {
            let parsed = timestamp
                .strip_prefix("timestamp=")
                .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
                .map(|value| value.with_timezone(&Utc));
            let parsed = match parsed {
                Some(parsed) => parsed,
                None => {
                    let description = "Timestamp must be timestamp=<RFC 3339>";
                    self.fail(label, "MARKREAD", "INVALID_PARAMS", &[target], description);
                    return;
                }
            };

            // markers only move forward
            let marker = self.read_markers.entry(key.clone()).or_insert(parsed);
            if parsed > *marker {
                *marker = parsed;
            }
        }

        let value = match self.read_markers.get(&key) {
            Some(marker) => format!(
                "timestamp={}",
                marker.to_rfc3339_opts(SecondsFormat::Millis, true)
            ),
            None => "*".to_string(),
        };
        let reply = Message::new("MARKREAD")
            .with_prefix(self.host())
            .with_param(target)
            .with_param(value);
        self.reply(label, vec![reply]);
    }

    async fn handle_away(&mut self, message: Option<String>, label: Option<&str>) {
        let nick = self.nick();
        let reply = match &message {
            Some(_) => Reply::NowAway { nick },
            None => Reply::UnAway { nick },
        };

        self.identity.away = message.clone();
        self.request(RegistryRequest::SetAway {
            connection_id: self.id(),
            away: message,
        })
        .await;
        self.reply_numeric(label, reply);
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        capabilities::Capability,
        connection::tests::{Client, Server},
        context::ServerContext,
        message::Message,
        settings::Settings,
    };

    fn server() -> Server {
        Server::start(ServerContext::new(Settings::default()))
    }

    async fn joined(server: &Server, nick: &str, caps: &str, channel: &str) -> Client {
        let mut client = server.client();
        if !caps.is_empty() {
            client.line(&format!("CAP REQ :{}", caps)).await;
            client.line("CAP END").await;
        }
        client.register(nick).await;
        client.line(&format!("JOIN {}", channel)).await;
        client.until("366").await;
        client
    }

    fn texts(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.to_string()).collect()
    }

    #[tokio::test]
    async fn join_tracks_membership() {
        // Arrange
        let server = server();
        let mut alice = joined(&server, "alice", "", "#a").await;

        // Act
        alice.line("JOIN #b").await;
        alice.until("366").await;
        while let Ok(event) = alice.events.try_recv() {
            alice.connection.handle_event(event);
        }

        // Assert
        assert_eq!(2, alice.connection.channel_count());
    }

    #[tokio::test]
    async fn join_zero_parts_everything() {
        // Arrange
        let server = server();
        let mut alice = joined(&server, "alice", "", "#a").await;
        alice.line("JOIN #b").await;
        alice.until("366").await;
        while let Ok(event) = alice.events.try_recv() {
            alice.connection.handle_event(event);
        }

        // Act
        alice.line("JOIN 0").await;
        let first = alice.until("PART").await;
        let second = alice.until("PART").await;

        // Assert
        assert_eq!(1, first.len());
        assert_eq!(1, second.len());
    }

    #[tokio::test]
    async fn too_many_channels() {
        // Arrange
        let mut settings = Settings::default();
        settings.limits.max_channels_per_connection = 1;
        let server = Server::start(ServerContext::new(settings));
        let mut alice = server.client();
        alice.register("alice").await;

        // Act
        alice.line("JOIN #a,#b").await;
        let replies = alice.until("405").await;

        // Assert
        assert_eq!(Some("#b"), replies.last().unwrap().param(1));
    }

    #[tokio::test]
    async fn invalid_channel_name() {
        // Arrange
        let server = server();
        let mut alice = server.client();
        alice.register("alice").await;

        // Act
        alice.line("JOIN nochannel").await;

        // Assert
        assert_eq!("476", alice.next().await.command());
    }

    #[tokio::test]
    async fn channel_message_reaches_members() {
        // Arrange
        let server = server();
        let mut alice = joined(&server, "alice", "", "#a").await;
        let mut bob = joined(&server, "bob", "", "#a").await;
        alice.until("JOIN").await;

        // Act
        bob.line("PRIVMSG #a :hello there").await;

        // Assert
        let received = alice.next().await;
        assert_eq!(":bob!~bob@example.com PRIVMSG #a :hello there", received.to_string());
    }

    #[tokio::test]
    async fn echo_message_returns_to_sender() {
        // Arrange
        let server = server();
        let mut alice = joined(&server, "alice", "echo-message", "#a").await;

        // Act
        alice.line("PRIVMSG #a :me too").await;

        // Assert
        let echo = alice.next().await;
        assert_eq!("PRIVMSG", echo.command());
        assert_eq!(Some("me too"), echo.param(1));
    }

    #[tokio::test]
    async fn labeled_join_is_batched() {
        // Arrange
        let server = server();
        let mut alice = server.client();
        alice.line("CAP REQ :labeled-response batch").await;
        alice.line("CAP END").await;
        alice.register("alice").await;

        // Act
        alice.line("@label=j1 JOIN #a").await;
        let lines = alice.until("BATCH").await;
        let rest = alice.until("BATCH").await;

        // Assert
        assert_eq!(Some("j1"), lines[0].tag("label"));
        assert_eq!(Some("labeled-response"), lines[0].param(1));
        assert!(rest.iter().any(|m| m.command() == "366"));
    }

    #[tokio::test]
    async fn multiline_batch_reaches_members_as_one_message() {
        // Arrange
        let server = server();
        let mut alice = joined(&server, "alice", "draft/multiline batch", "#a").await;
        let mut legacy = joined(&server, "legacy", "", "#a").await;
        alice.until("JOIN").await;

        // Act
        alice.line("BATCH +b1 draft/multiline #a").await;
        alice.line("@batch=b1 PRIVMSG #a :first line").await;
        alice.line("@batch=b1 PRIVMSG #a :second line").await;
        alice.line("BATCH -b1").await;

        // Assert
        let first = legacy.next().await;
        let second = legacy.next().await;
        assert_eq!(
            vec![
                ":alice!~alice@example.com PRIVMSG #a :first line",
                ":alice!~alice@example.com PRIVMSG #a :second line",
            ],
            texts(&[first, second])
        );
        assert!(legacy.drain().is_empty());
    }

    #[tokio::test]
    async fn unopened_batch_reference_is_an_error() {
        // Arrange
        let server = server();
        let mut alice = joined(&server, "alice", "draft/multiline batch", "#a").await;

        // Act
        alice.line("@batch=nope PRIVMSG #a :stray").await;

        // Assert
        let fail = alice.next().await;
        assert_eq!("FAIL", fail.command());
        assert_eq!(Some("INVALID_REFTAG"), fail.param(1));
    }

    #[tokio::test]
    async fn multiline_limits_are_enforced_as_lines_arrive() {
        // Arrange
        let mut settings = Settings::default();
        settings.multiline.max_lines = 1;
        let server = Server::start(ServerContext::new(settings));
        let mut alice = server.client();
        alice.line("CAP REQ :draft/multiline batch").await;
        alice.line("CAP END").await;
        alice.register("alice").await;

        // Act
        alice.line("BATCH +b1 draft/multiline #a").await;
        alice.line("@batch=b1 PRIVMSG #a :one").await;
        let within_limit = alice.drain();
        alice.line("@batch=b1 PRIVMSG #a :two").await;
        let over_limit = alice.drain();
        alice.line("@batch=b1 PRIVMSG #a :three").await;
        alice.line("BATCH -b1").await;

        // Assert
        assert!(within_limit.is_empty());
        assert_eq!(1, over_limit.len());
        assert_eq!(Some("MULTILINE_MAX_LINES"), over_limit[0].param(1));
        assert!(alice.drain().is_empty());
    }

    #[tokio::test]
    async fn private_message_and_away() {
        // Arrange
        let server = server();
        let mut alice = server.client();
        let mut bob = server.client();
        alice.register("alice").await;
        bob.register("bob").await;

        // Act
        bob.line("AWAY :lunch").await;
        let now_away = bob.next().await;
        alice.line("PRIVMSG bob :ping?").await;

        // Assert
        assert_eq!("306", now_away.command());
        assert_eq!(":alice!~alice@example.com PRIVMSG bob ping?", bob.next().await.to_string());
        let away = alice.next().await;
        assert_eq!("301", away.command());
        assert_eq!(Some("lunch"), away.param(2));
    }

    #[tokio::test]
    async fn user_mode_queries() {
        // Arrange
        let server = server();
        let mut alice = server.client();
        alice.register("alice").await;

        // Act
        alice.line("MODE alice").await;
        alice.line("MODE bob +i").await;

        // Assert
        assert_eq!("221", alice.next().await.command());
        assert_eq!("502", alice.next().await.command());
    }

    #[tokio::test]
    async fn markread_only_moves_forward() {
        // Arrange
        let server = server();
        let mut alice = server.client();
        alice.line("CAP REQ draft/read-marker").await;
        alice.line("CAP END").await;
        alice.register("alice").await;

        // Act
        alice.line("MARKREAD #a").await;
        let unset = alice.next().await;
        alice.line("MARKREAD #a timestamp=2024-05-01T10:00:00.000Z").await;
        alice.next().await;
        alice.line("MARKREAD #a timestamp=2024-04-01T10:00:00.000Z").await;
        let kept = alice.next().await;

        // Assert
        assert_eq!(Some("*"), unset.param(1));
        assert_eq!(Some("timestamp=2024-05-01T10:00:00.000Z"), kept.param(1));
        assert!(alice.connection.capabilities().has(Capability::ReadMarker));
    }

    #[tokio::test]
    async fn chathistory_latest_replays_in_a_batch() {
        // Arrange
        let server = server();
        let mut alice = joined(&server, "alice", "batch chathistory", "#a").await;
        let mut bob = joined(&server, "bob", "", "#a").await;
        alice.until("JOIN").await;
        bob.line("PRIVMSG #a :one").await;
        bob.line("PRIVMSG #a :two").await;
        alice.until("PRIVMSG").await;
        alice.until("PRIVMSG").await;

        // Act
        alice.line("CHATHISTORY LATEST #a * 10").await;
        let replay = alice.until("BATCH").await;
        let rest = alice.until("BATCH").await;

        // Assert
        assert_eq!(Some("chathistory"), replay[0].param(1));
        let replayed: Vec<_> = rest
            .iter()
            .filter(|m| m.command() == "PRIVMSG")
            .map(|m| m.param(1).unwrap().to_string())
            .collect();
        assert_eq!(vec!["one", "two"], replayed);
    }

    #[tokio::test]
    async fn unknown_command() {
        // Arrange
        let server = server();
        let mut alice = server.client();
        alice.register("alice").await;

        // Act
        alice.line("FROB x").await;

        // Assert
        let reply = alice.next().await;
        assert_eq!("421", reply.command());
        assert_eq!(Some("FROB"), reply.param(1));
    }
}

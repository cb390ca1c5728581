use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, info};

use super::{Connection, ConnectionState, Flow};
use crate::{
    capabilities::{cap_lines, Capability},
    delivery::stamp,
    events::LifecycleEvent,
    handlers::mode::{CHANMODES_TOKEN, CHANNEL_MODES},
    message::{Message, MAX_LINE_LENGTH},
    registry::RegistryRequest,
    replies::Reply,
    sasl::{parse_plain, Mechanism, SaslError, SaslExchange},
    util,
};

impl Connection {
    pub(super) async fn handle_cap(&mut self, subcommand: &str, args: &[String], label: Option<&str>) -> Flow {
        let nick = self.nick();

        match subcommand {
            "LS" => {
                let version = args
                    .first()
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(301);
                self.cap_version = self.cap_version.max(version);
                if self.cap_version >= 302 {
                    self.enable(Capability::CapNotify);
                }
                self.begin_negotiation();

                let tokens = self
                    .context
                    .capabilities
                    .ls_tokens(&self.availability, self.cap_version);
                let lines = cap_lines(self.host(), &nick, "LS", &tokens, self.cap_version, MAX_LINE_LENGTH);
                self.reply(label, lines);
            }
            "LIST" => {
                let names = self.enabled_names();
                let lines = cap_lines(self.host(), &nick, "LIST", &names, self.cap_version, MAX_LINE_LENGTH);
                self.reply(label, lines);
            }
            "REQ" => {
                self.begin_negotiation();
                let request = args.join(" ");
                let result = self
                    .context
                    .capabilities
                    .validate_request(&request, &self.availability);

                let verdict = match result {
                    Ok(changes) => {
                        let mut caps = self.caps.clone();
                        caps.apply(&changes);
                        self.set_caps(caps);
                        "ACK"
                    }
                    Err(rejected) => {
                        debug!(connection_id = %self.id(), %rejected, "refusing capability request");
                        "NAK"
                    }
                };

                let line = Message::new("CAP")
                    .with_prefix(self.host())
                    .with_param(nick)
                    .with_param(verdict)
                    .with_param(request);
                self.reply(label, vec![line]);
            }
            "END" => return self.end_negotiation().await,
            other => {
                let reply = Reply::ErrInvalidCapCmd {
                    nick,
                    subcommand: other.to_string(),
                };
                self.reply_numeric(label, reply);
            }
        }

        Flow::Continue
    }

    fn begin_negotiation(&mut self) {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Registering) {
            self.state = ConnectionState::CapNegotiating;
            self.cap_deadline = Some(Instant::now() + self.context.settings.cap_negotiation_timeout());
        }
    }

    pub(super) async fn end_negotiation(&mut self) -> Flow {
        self.cap_deadline = None;
        match std::mem::replace(&mut self.state, ConnectionState::Registering) {
            ConnectionState::CapNegotiating => {}
            ConnectionState::Authenticating(_) => {
                let reply = Reply::ErrSaslAborted { nick: self.nick() };
                self.reply_numeric(None, reply);
            }
            other => {
                self.state = other;
                return Flow::Continue;
            }
        }

        self.try_complete_registration().await
    }

    pub(super) async fn handle_nick(&mut self, nick: &str, label: Option<&str>) -> Flow {
        if !util::is_valid_nick(nick, self.context.settings.limits.nick_len) {
            let reply = Reply::ErrErroneousNickname {
                nick: self.nick(),
                attempted: nick.to_string(),
            };
            self.reply_numeric(label, reply);
            return Flow::Continue;
        }

        if self.identity.nick.as_deref() == Some(nick) {
            return Flow::Continue;
        }

        let registered = self.is_registered();
        let (reply, result) = oneshot::channel();
        self.request(RegistryRequest::Nick {
            origin: self.origin(),
            new_nick: nick.to_string(),
            channels: if registered {
                self.channels.iter().cloned().collect()
            } else {
                vec![]
            },
            reply,
        })
        .await;

        if !result.await.unwrap_or(false) {
            let reply = Reply::ErrNicknameInUse {
                nick: self.nick(),
                attempted: nick.to_string(),
            };
            self.reply_numeric(label, reply);
            return Flow::Continue;
        }

        if registered {
            let change = Message::new("NICK")
                .with_prefix(self.identity.mask())
                .with_param(nick);
            let change = stamp(change, self.identity.account.as_deref());
            self.identity.nick = Some(nick.to_string());
            self.reply(label, vec![change]);
            return Flow::Continue;
        }

        self.identity.nick = Some(nick.to_string());
        self.nick_claimed = true;
        self.try_complete_registration().await
    }

    pub(super) async fn handle_user(&mut self, user: String, realname: String, label: Option<&str>) -> Flow {
        if self.is_registered() || self.identity.user.is_some() {
            let reply = Reply::ErrAlreadyRegistered { nick: self.nick() };
            self.reply_numeric(label, reply);
            return Flow::Continue;
        }

        self.identity.user = Some(user);
        self.identity.real_name = Some(realname);
        self.try_complete_registration().await
    }

    pub(super) fn handle_pass(&mut self, password: String, label: Option<&str>) -> Flow {
        if self.is_registered() {
            let reply = Reply::ErrAlreadyRegistered { nick: self.nick() };
            self.reply_numeric(label, reply);
            return Flow::Continue;
        }
        self.password = Some(password);
        Flow::Continue
    }

    pub(super) async fn handle_authenticate(&mut self, payload: &str, label: Option<&str>) -> Flow {
        let nick = self.nick();

        if !self.caps.has(Capability::Sasl) {
            self.reply_numeric(label, Reply::ErrSaslFail { nick });
            return Flow::Continue;
        }
        if self.identity.account.is_some() {
            self.reply_numeric(label, Reply::ErrSaslAlready { nick });
            return Flow::Continue;
        }
        if self.is_registered() {
            self.reply_numeric(label, Reply::ErrAlreadyRegistered { nick });
            return Flow::Continue;
        }
        if payload == "*" {
            if matches!(self.state, ConnectionState::Authenticating(_)) {
                self.state = ConnectionState::CapNegotiating;
            }
            self.reply_numeric(label, Reply::ErrSaslAborted { nick });
            return Flow::Continue;
        }

        // an exchange only runs inside negotiation and returns to it
        let mut exchange = match std::mem::replace(&mut self.state, ConnectionState::CapNegotiating) {
            ConnectionState::Authenticating(exchange) => exchange,
            ConnectionState::CapNegotiating => {
                let offered = &self.availability.sasl_mechanisms;
                match Mechanism::parse(payload).filter(|m| offered.iter().any(|o| o == m.name())) {
                    Some(mechanism) => {
                        self.state = ConnectionState::Authenticating(SaslExchange::new(mechanism));
                        let challenge = Message::new("AUTHENTICATE").with_param("+");
                        self.reply(label, vec![challenge]);
                    }
                    None => {
                        let mechanisms = Reply::SaslMechs {
                            nick: nick.clone(),
                            mechanisms: offered.join(","),
                        };
                        let failed = Reply::ErrSaslFail { nick };
                        let lines = vec![self.numeric(mechanisms), self.numeric(failed)];
                        self.reply(label, lines);
                    }
                }
                return Flow::Continue;
            }
            other => {
                self.state = other;
                self.reply_numeric(label, Reply::ErrSaslFail { nick });
                return Flow::Continue;
            }
        };

        match exchange.feed(payload) {
            Ok(None) => self.state = ConnectionState::Authenticating(exchange),
            Ok(Some(decoded)) => self.finish_sasl(exchange.mechanism(), decoded, label).await,
            Err(SaslError::ChunkTooLong) | Err(SaslError::PayloadTooLong) => {
                self.reply_numeric(label, Reply::ErrSaslTooLong { nick });
            }
            Err(error) => {
                debug!(connection_id = %self.id(), %error, "SASL exchange failed");
                self.reply_numeric(label, Reply::ErrSaslFail { nick });
            }
        }

        Flow::Continue
    }

    async fn finish_sasl(&mut self, mechanism: Mechanism, payload: Vec<u8>, label: Option<&str>) {
        let result = match mechanism {
            Mechanism::Plain => match parse_plain(&payload) {
                // authorizing as someone else is not supported
                Ok((authzid, authcid, _)) if !authzid.is_empty() && authzid != authcid => {
                    Err(SaslError::InvalidCredentials)
                }
                Ok((_, authcid, password)) => self.context.verifier.verify_plain(&authcid, &password).await,
                Err(error) => Err(error),
            },
            Mechanism::External => self
                .certificate
                .as_deref()
                .and_then(|fingerprint| self.context.certificates.account_for(fingerprint))
                .ok_or(SaslError::UnknownCertificate),
        };

        let nick = self.nick();
        match result {
            Ok(account) => {
                info!(connection_id = %self.id(), %account, mechanism = mechanism.name(), "SASL login");
                self.identity.account = Some(account.clone());
                let lines = vec![
                    self.numeric(Reply::LoggedIn {
                        nick: nick.clone(),
                        mask: self.identity.mask(),
                        account,
                    }),
                    self.numeric(Reply::SaslSuccess { nick }),
                ];
                self.reply(label, lines);
            }
            Err(error) => {
                debug!(connection_id = %self.id(), %error, mechanism = mechanism.name(), "SASL login refused");
                self.reply_numeric(label, Reply::ErrSaslFail { nick });
            }
        }
    }

    async fn try_complete_registration(&mut self) -> Flow {
        if self.state != ConnectionState::Registering
            || !self.nick_claimed
            || self.identity.user.is_none()
        {
            return Flow::Continue;
        }

        if let Some(expected) = &self.context.settings.password {
            if self.password.as_ref() != Some(expected) {
                let reply = Reply::ErrPasswdMismatch { nick: self.nick() };
                self.reply_numeric(None, reply);
                return Flow::Close("Bad password".to_string());
            }
        }

        self.state = ConnectionState::Registered;
        self.cap_deadline = None;
        self.request(RegistryRequest::Registered {
            origin: self.origin(),
        })
        .await;

        let nick = self.nick();
        if let Some(account) = &self.identity.account {
            self.context.store.account_login(account, &nick).await;
        }
        self.context.events.publish(LifecycleEvent::ConnectionRegistered {
            connection_id: self.id(),
            nick: nick.clone(),
            account: self.identity.account.clone(),
        });
        info!(connection_id = %self.id(), %nick, "registered");

        let welcome = self.welcome().await;
        self.send(welcome);
        Flow::Continue
    }

    fn isupport_tokens(&self) -> Vec<String> {
        let settings = &self.context.settings;
        let mut tokens = vec![
            format!("CASEMAPPING={}", settings.casemapping.token()),
            format!("CHANNELLEN={}", settings.limits.channel_len),
            format!("CHANLIMIT=#&:{}", settings.limits.max_channels_per_connection),
            "CHANTYPES=#&".to_string(),
            CHANMODES_TOKEN.to_string(),
            format!("NETWORK={}", settings.network),
            format!("NICKLEN={}", settings.limits.nick_len),
            "PREFIX=(ov)@+".to_string(),
            format!("TOPICLEN={}", settings.limits.topic_len),
        ];
        if settings.limits.utf8_only {
            tokens.push("UTF8ONLY".to_string());
        }
        tokens
    }

    /// 001-005, then LUSERS and MOTD.
    async fn welcome(&self) -> Vec<Message> {
        let settings = &self.context.settings;
        let nick = self.nick();

        let mut lines: Vec<Message> = vec![
            Reply::Welcome {
                nick: nick.clone(),
                network: settings.network.clone(),
                mask: self.identity.mask(),
            },
            Reply::YourHost {
                nick: nick.clone(),
                version: settings.version.clone(),
            },
            Reply::Created {
                nick: nick.clone(),
                created_at: self.context.start_time,
            },
            Reply::MyInfo {
                nick: nick.clone(),
                version: settings.version.clone(),
                user_modes: "i".to_string(),
                channel_modes: CHANNEL_MODES.to_string(),
            },
            Reply::ISupport {
                nick,
                tokens: self.isupport_tokens(),
            },
        ]
        .into_iter()
        .map(|reply| self.numeric(reply))
        .collect();

        lines.extend(self.lusers().await);
        lines.extend(self.motd());
        lines
    }

    pub(super) async fn lusers(&self) -> Vec<Message> {
        let stats = self.stats().await;
        let nick = self.nick();
        vec![
            self.numeric(Reply::LuserClient {
                nick: nick.clone(),
                users: stats.users,
                servers: 1,
            }),
            self.numeric(Reply::LuserChannels {
                nick: nick.clone(),
                channels: stats.channels,
            }),
            self.numeric(Reply::LuserMe {
                nick,
                clients: stats.users,
            }),
        ]
    }

    pub(super) fn motd(&self) -> Vec<Message> {
        let nick = self.nick();
        let lines = &self.context.settings.motd_lines;
        if lines.is_empty() {
            return vec![self.numeric(Reply::ErrNoMotd { nick })];
        }

        let mut motd = vec![self.numeric(Reply::MotdStart { nick: nick.clone() })];
        motd.extend(lines.iter().map(|line| {
            self.numeric(Reply::Motd {
                nick: nick.clone(),
                line: line.clone(),
            })
        }));
        motd.push(self.numeric(Reply::EndOfMotd { nick }));
        motd
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use base64::{engine::general_purpose::STANDARD, Engine};

    use crate::{
        capabilities::Capability,
        connection::{tests::Server, ConnectionState, Flow},
        context::ServerContext,
        sasl::StaticCredentials,
        settings::Settings,
    };

    fn with_account() -> ServerContext {
        let mut accounts = HashMap::new();
        accounts.insert("alice".to_string(), "hunter2".to_string());
        let mut fingerprints = HashMap::new();
        fingerprints.insert("ab:cd".to_string(), "alice".to_string());
        let credentials = Arc::new(StaticCredentials::new(accounts, fingerprints));
        ServerContext::new(Settings::default())
            .with_verifier(credentials.clone())
            .with_certificates(credentials)
    }

    #[tokio::test]
    async fn sasl_plain_logs_in() {
        // Arrange
        let server = Server::start(with_account());
        let mut client = server.client();
        client.line("CAP LS 302").await;
        client.line("CAP REQ sasl").await;
        client.drain();

        // Act
        client.line("AUTHENTICATE PLAIN").await;
        let challenge = client.drain();
        let payload = STANDARD.encode(b"\0alice\0hunter2");
        client.line(&format!("AUTHENTICATE {}", payload)).await;
        let outcome = client.drain();

        // Assert
        assert_eq!("AUTHENTICATE +", challenge[0].to_string());
        assert_eq!(vec!["900", "903"], outcome.iter().map(|m| m.command()).collect::<Vec<_>>());
        assert_eq!(Some("alice"), outcome[0].param(2));
    }

    #[tokio::test]
    async fn sasl_plain_wrong_password() {
        // Arrange
        let server = Server::start(with_account());
        let mut client = server.client();
        client.line("CAP REQ sasl").await;
        client.drain();

        // Act
        client.line("AUTHENTICATE PLAIN").await;
        let payload = STANDARD.encode(b"\0alice\0wrong");
        client.line(&format!("AUTHENTICATE {}", payload)).await;
        let outcome = client.drain();

        // Assert
        assert_eq!("904", outcome.last().unwrap().command());
    }

    #[tokio::test]
    async fn sasl_external_uses_certificate() {
        // Arrange
        let server = Server::start(with_account());
        let mut client = server.client();
        client.connection = client.connection.with_certificate(Some("AB:CD".to_string()));
        client.line("CAP REQ sasl").await;
        client.drain();

        // Act
        client.line("AUTHENTICATE EXTERNAL").await;
        client.line("AUTHENTICATE +").await;
        let outcome = client.drain();

        // Assert
        assert_eq!("903", outcome.last().unwrap().command());
    }

    #[tokio::test]
    async fn unknown_mechanism_lists_mechanisms() {
        // Arrange
        let server = Server::start(with_account());
        let mut client = server.client();
        client.line("CAP REQ sasl").await;
        client.drain();

        // Act
        client.line("AUTHENTICATE SCRAM-SHA-256").await;
        let outcome = client.drain();

        // Assert
        assert_eq!("908", outcome[0].command());
        assert_eq!(Some("PLAIN,EXTERNAL"), outcome[0].param(1));
        assert_eq!("904", outcome[1].command());
    }

    #[tokio::test]
    async fn cap_end_aborts_unfinished_sasl() {
        // Arrange
        let server = Server::start(with_account());
        let mut client = server.client();
        client.line("CAP REQ sasl").await;
        client.line("AUTHENTICATE PLAIN").await;
        client.drain();

        // Act
        client.line("CAP END").await;

        // Assert
        assert_eq!("906", client.drain()[0].command());
    }

    #[tokio::test]
    async fn negotiation_and_sasl_are_connection_states() {
        // Arrange
        let server = Server::start(with_account());
        let mut client = server.client();

        // Act
        client.line("CAP LS 302").await;
        let negotiating = matches!(client.connection.state(), ConnectionState::CapNegotiating);
        client.line("CAP REQ sasl").await;
        client.line("AUTHENTICATE PLAIN").await;
        let authenticating = matches!(client.connection.state(), ConnectionState::Authenticating(_));
        client.line("AUTHENTICATE *").await;
        let aborted = matches!(client.connection.state(), ConnectionState::CapNegotiating);
        client.line("NICK alice").await;
        client.line("USER alice 0 * :Alice").await;
        let held = matches!(client.connection.state(), ConnectionState::CapNegotiating);
        client.line("CAP END").await;

        // Assert
        assert!(negotiating);
        assert!(authenticating);
        assert!(aborted);
        assert!(held);
        assert_eq!(&ConnectionState::Registered, client.connection.state());
    }

    #[tokio::test]
    async fn authenticate_after_registration_is_refused() {
        // Arrange
        let server = Server::start(with_account());
        let mut client = server.client();
        client.line("CAP REQ sasl").await;
        client.line("NICK alice").await;
        client.line("USER alice 0 * :Alice").await;
        client.line("CAP END").await;
        client.drain();

        // Act
        client.line("AUTHENTICATE PLAIN").await;

        // Assert
        assert_eq!("462", client.drain()[0].command());
        assert_eq!(&ConnectionState::Registered, client.connection.state());
    }

    #[tokio::test]
    async fn server_password_is_checked() {
        // Arrange
        let settings = Settings {
            password: Some("letmein".to_string()),
            ..Settings::default()
        };
        let server = Server::start(ServerContext::new(settings));
        let mut client = server.client();

        // Act
        client.line("PASS wrong").await;
        client.line("NICK alice").await;
        let flow = client.line("USER alice 0 * :Alice").await;

        // Assert
        assert_eq!(Flow::Close("Bad password".to_string()), flow);
        assert_eq!("464", client.drain()[0].command());
    }

    #[tokio::test]
    async fn registered_clients_cannot_reregister() {
        // Arrange
        let server = Server::start(ServerContext::new(Settings::default()));
        let mut client = server.client();
        client.register("alice").await;

        // Act
        client.line("USER again 0 * :Again").await;
        client.line("PASS whatever").await;

        // Assert
        let replies = client.drain();
        assert_eq!(vec!["462", "462"], replies.iter().map(|m| m.command()).collect::<Vec<_>>());
        assert_eq!(&ConnectionState::Registered, client.connection.state());
    }

    #[tokio::test]
    async fn welcome_advertises_isupport() {
        // Arrange
        let server = Server::start(ServerContext::new(Settings::default()));
        let mut client = server.client();

        // Act
        client.line("NICK alice").await;
        client.line("USER alice 0 * :Alice").await;
        let welcome = client.until("376").await;

        // Assert
        let isupport = welcome.iter().find(|m| m.command() == "005").unwrap();
        assert!(isupport.params().iter().any(|p| p == "CASEMAPPING=rfc1459"));
        assert!(isupport.params().iter().any(|p| p == "PREFIX=(ov)@+"));
        let lusers = welcome.iter().find(|m| m.command() == "251").unwrap();
        assert_eq!(
            Some("There are 1 users and 0 invisible on 1 servers"),
            lusers.param(1)
        );
        assert!(!client.connection.capabilities().has(Capability::CapNotify));
    }

    #[tokio::test]
    async fn nick_change_after_registration_is_echoed() {
        // Arrange
        let server = Server::start(ServerContext::new(Settings::default()));
        let mut client = server.client();
        client.register("alice").await;

        // Act
        client.line("NICK alicia").await;

        // Assert
        let change = client.next().await;
        assert_eq!(":alice!~alice@example.com NICK alicia", change.to_string());
    }
}

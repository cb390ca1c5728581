use std::time::Duration;

use ircv3d::{context::ServerContext, message::Message, server::Server, settings::Settings};
use tokio::{
    io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf},
    time::timeout,
};

struct TestClient {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl TestClient {
    fn connect(server: &Server) -> TestClient {
        TestClient::connect_buffered(server, 64 * 1024)
    }

    /// `buffer` bounds how much the server can write before this client
    /// reads.
    fn connect_buffered(server: &Server, buffer: usize) -> TestClient {
        let (client, served) = duplex(buffer);
        server.connect(served, "127.0.0.1", None);
        let (reader, writer) = tokio::io::split(client);
        TestClient {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    /// The next line from the server, or `None` once it hangs up.
    async fn recv(&mut self) -> Option<Message> {
        let line = timeout(Duration::from_secs(3), self.lines.next_line())
            .await
            .unwrap()
            .unwrap()?;
        Some(Message::parse(line.trim_end_matches('\r')).unwrap())
    }

    async fn until(&mut self, command: &str) -> Vec<Message> {
        let mut seen = vec![];
        loop {
            let message = self.recv().await.unwrap();
            let done = message.command() == command;
            seen.push(message);
            if done {
                return seen;
            }
        }
    }

    async fn register(&mut self, nick: &str) {
        self.send(&format!("NICK {}", nick)).await;
        self.send(&format!("USER {} 0 * :{}", nick, nick)).await;
        // no MOTD configured
        self.until("422").await;
    }

    async fn register_with_caps(&mut self, nick: &str, caps: &str) {
        self.send(&format!("CAP REQ :{}", caps)).await;
        let ack = self.until("CAP").await;
        assert_eq!(Some("ACK"), ack.last().unwrap().param(1));
        self.send(&format!("NICK {}", nick)).await;
        self.send(&format!("USER {} 0 * :{}", nick, nick)).await;
        self.send("CAP END").await;
        self.until("422").await;
    }

    async fn join(&mut self, channel: &str) {
        self.send(&format!("JOIN {}", channel)).await;
        self.until("366").await;
    }

    /// Every `PRIVMSG` up to and including the one carrying `text`.
    async fn privmsgs_until(&mut self, text: &str) -> Vec<Message> {
        let mut seen = vec![];
        loop {
            let message = self.recv().await.unwrap();
            let done = message.command() == "PRIVMSG" && message.param(1) == Some(text);
            seen.push(message);
            if done {
                return seen;
            }
        }
    }
}

fn default_server() -> Server {
    Server::start(ServerContext::new(Settings::default()))
}

fn unthrottled() -> Settings {
    let mut settings = Settings::default();
    settings.flood.messages = 1000;
    settings.flood.queue_depth = 1000;
    settings
}

#[tokio::test]
async fn registration_with_cap_negotiation() {
    // Arrange
    let server = default_server();
    let mut client = TestClient::connect(&server);

    // Act
    client.send("CAP LS 302").await;
    let ls = client.until("CAP").await;
    client.send("CAP REQ :server-time message-tags").await;
    let ack = client.until("CAP").await;
    client.send("NICK jim").await;
    client.send("USER jim 0 * :Jim").await;
    client.send("CAP END").await;
    let welcome = client.until("422").await;

    // Assert
    assert_eq!(Some("LS"), ls[0].param(1));
    assert_eq!(Some("ACK"), ack[0].param(1));
    assert_eq!("001", welcome[0].command());
    assert!(welcome.iter().any(|m| m.command() == "005"));
}

#[tokio::test]
async fn channel_conversation_and_quit() {
    // Arrange
    let server = default_server();
    let mut alice = TestClient::connect(&server);
    let mut bob = TestClient::connect(&server);
    alice.register("alice").await;
    bob.register("bob").await;
    alice.send("JOIN #rust").await;
    alice.until("366").await;
    bob.send("JOIN #rust").await;
    bob.until("366").await;
    alice.until("JOIN").await;

    // Act
    bob.send("PRIVMSG #rust :hello alice").await;
    let heard = alice.until("PRIVMSG").await;
    bob.send("QUIT :bye").await;
    let quit = alice.until("QUIT").await;

    // Assert
    assert_eq!(Some("hello alice"), heard.last().unwrap().param(1));
    assert_eq!(Some("bob"), quit.last().unwrap().source_nick());
    assert_eq!(Some("Quit: bye"), quit.last().unwrap().param(0));
    let closing = bob.until("ERROR").await;
    assert!(closing.last().unwrap().param(0).unwrap().contains("Quit: bye"));
    assert!(bob.recv().await.is_none());
}

#[tokio::test]
async fn oversized_line_is_refused_but_connection_survives() {
    // Arrange
    let server = default_server();
    let mut client = TestClient::connect(&server);
    client.register("jim").await;

    // Act
    client
        .send(&format!("PRIVMSG #rust :{}", "x".repeat(600)))
        .await;
    let refused = client.recv().await.unwrap();
    client.send("PING still-here").await;
    let pong = client.recv().await.unwrap();

    // Assert
    assert_eq!("417", refused.command());
    assert_eq!("PONG", pong.command());
    assert_eq!(Some("still-here"), pong.param(1));
}

#[tokio::test]
async fn excess_flood_closes_the_connection() {
    // Arrange
    let mut settings = Settings::default();
    settings.flood.messages = 1;
    settings.flood.interval_secs = 60;
    settings.flood.queue_depth = 1;
    let server = Server::start(ServerContext::new(settings));
    let mut client = TestClient::connect(&server);
    client.register("jim").await;

    // Act
    for _ in 0..4 {
        client.send("MOTD").await;
    }
    let closing = client.until("ERROR").await;

    // Assert
    assert!(closing
        .last()
        .unwrap()
        .param(0)
        .unwrap()
        .contains("Excess Flood"));
}

#[tokio::test]
async fn idle_client_is_pinged_then_dropped() {
    // Arrange
    let mut settings = Settings::default();
    settings.ping_frequency_secs = 1;
    settings.ping_timeout_secs = 1;
    let server = Server::start(ServerContext::new(settings));
    let mut client = TestClient::connect(&server);
    client.register("jim").await;

    // Act
    let ping = client.until("PING").await;
    let closing = client.until("ERROR").await;

    // Assert
    assert_eq!(Some("localhost"), ping.last().unwrap().param(0));
    assert!(closing
        .last()
        .unwrap()
        .param(0)
        .unwrap()
        .contains("Ping timeout"));
}

#[tokio::test]
async fn shutdown_closes_every_connection() {
    // Arrange
    let server = default_server();
    let mut client = TestClient::connect(&server);
    client.register("jim").await;

    // Act
    server.shutdown().await.unwrap();
    let closing = client.until("ERROR").await;

    // Assert
    assert!(closing
        .last()
        .unwrap()
        .param(0)
        .unwrap()
        .contains("Server shutting down"));
}

#[tokio::test]
async fn concurrent_senders_are_seen_in_one_order() {
    // Arrange
    let server = Server::start(ServerContext::new(unthrottled()));
    let mut clients = vec![];
    for nick in ["ann", "ben", "cat"] {
        let mut client = TestClient::connect(&server);
        client.register_with_caps(nick, "echo-message").await;
        client.join("#order").await;
        clients.push(client);
    }
    let (first, rest) = clients.split_at_mut(1);
    let (second, third) = rest.split_at_mut(1);
    let (ann, ben, cat) = (&mut first[0], &mut second[0], &mut third[0]);

    // Act
    let burst = |nick: &'static str| (0..20).map(move |n| format!("PRIVMSG #order :{} {}", nick, n));
    tokio::join!(
        async {
            for line in burst("ann") {
                ann.send(&line).await;
            }
        },
        async {
            for line in burst("ben") {
                ben.send(&line).await;
            }
        },
        async {
            for line in burst("cat") {
                cat.send(&line).await;
            }
        },
    );
    let mut seen = vec![];
    for client in [ann, ben, cat] {
        let mut order = vec![];
        while order.len() < 60 {
            let message = client.recv().await.unwrap();
            if message.command() == "PRIVMSG" {
                order.push(message.param(1).unwrap().to_string());
            }
        }
        seen.push(order);
    }

    // Assert
    assert_eq!(seen[0], seen[1]);
    assert_eq!(seen[1], seen[2]);
    for nick in ["ann", "ben", "cat"] {
        let own: Vec<_> = seen[0].iter().filter(|t| t.starts_with(nick)).cloned().collect();
        let sent: Vec<_> = (0..20).map(|n| format!("{} {}", nick, n)).collect();
        assert_eq!(sent, own);
    }
}

#[tokio::test]
async fn multiline_recipient_gets_a_single_envelope() {
    // Arrange
    let server = default_server();
    let mut alice = TestClient::connect(&server);
    let mut bob = TestClient::connect(&server);
    alice.register_with_caps("alice", "draft/multiline batch").await;
    bob.register_with_caps("bob", "draft/multiline batch").await;
    alice.join("#ml").await;
    bob.join("#ml").await;

    // Act
    alice.send("BATCH +m1 draft/multiline #ml").await;
    alice.send("@batch=m1 PRIVMSG #ml :first").await;
    alice.send("@batch=m1 PRIVMSG #ml :second").await;
    alice.send("BATCH -m1").await;
    alice.send("PRIVMSG #ml :after").await;
    let seen = bob.privmsgs_until("after").await;

    // Assert
    let openings: Vec<_> = seen
        .iter()
        .filter(|m| m.command() == "BATCH" && m.param(0).map_or(false, |r| r.starts_with('+')))
        .collect();
    assert_eq!(1, openings.len());
    assert_eq!(Some("draft/multiline"), openings[0].param(1));
    assert_eq!(Some("#ml"), openings[0].param(2));
    let reference = &openings[0].param(0).unwrap()[1..];
    let inside: Vec<_> = seen
        .iter()
        .filter(|m| m.tag("batch") == Some(reference))
        .map(|m| m.param(1).unwrap())
        .collect();
    assert_eq!(vec!["first", "second"], inside);
    let closings = seen
        .iter()
        .filter(|m| m.command() == "BATCH" && m.param(0) == Some(&format!("-{}", reference)[..]))
        .count();
    assert_eq!(1, closings);
}

#[tokio::test]
async fn stalled_reader_is_dropped_without_holding_up_others() {
    // Arrange
    let mut settings = unthrottled();
    settings.limits.outbound_queue = 8;
    let server = Server::start(ServerContext::new(settings));
    let mut alice = TestClient::connect(&server);
    let mut stalled = TestClient::connect_buffered(&server, 1024);
    alice.register("alice").await;
    stalled.register("stalled").await;
    alice.join("#busy").await;
    stalled.join("#busy").await;
    alice.until("JOIN").await;

    // Act
    // stalled never reads again
    let filler = "x".repeat(100);
    for n in 0..100 {
        alice.send(&format!("PRIVMSG #busy :{} {}", n, filler)).await;
    }
    let quit = alice.until("QUIT").await;
    alice.send("PING still-here").await;
    let pong = alice.until("PONG").await;

    // Assert
    let quit = quit.last().unwrap();
    assert_eq!(Some("stalled"), quit.source_nick());
    assert_eq!(Some("SendQ exceeded"), quit.param(0));
    assert_eq!(Some("still-here"), pong.last().unwrap().param(1));
}

use chrono::{DateTime, Utc};

use crate::message::Message;

/// Server numerics. `nick` is always the nick of the client being answered,
/// or `*` before it has one.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Welcome {
        nick: String,
        network: String,
        mask: String,
    },
    YourHost {
        nick: String,
        version: String,
    },
    Created {
        nick: String,
        created_at: DateTime<Utc>,
    },
    MyInfo {
        nick: String,
        version: String,
        user_modes: String,
        channel_modes: String,
    },
    ISupport {
        nick: String,
        tokens: Vec<String>,
    },
    UModeIs {
        nick: String,
        modes: String,
    },
    LuserClient {
        nick: String,
        users: usize,
        servers: usize,
    },
    LuserChannels {
        nick: String,
        channels: usize,
    },
    LuserMe {
        nick: String,
        clients: usize,
    },
    TryAgain {
        nick: String,
        command: String,
    },
    Away {
        nick: String,
        target: String,
        message: String,
    },
    UnAway {
        nick: String,
    },
    NowAway {
        nick: String,
    },
    WhoisUser {
        nick: String,
        target: String,
        user: String,
        host: String,
        realname: String,
    },
    WhoisServer {
        nick: String,
        target: String,
        info: String,
    },
    EndOfWho {
        nick: String,
        mask: String,
    },
    EndOfWhois {
        nick: String,
        target: String,
    },
    ListStart {
        nick: String,
    },
    List {
        nick: String,
        channel: String,
        visible: usize,
        topic: String,
    },
    ListEnd {
        nick: String,
    },
    ChannelModeIs {
        nick: String,
        channel: String,
        modes: String,
        arguments: Vec<String>,
    },
    CreationTime {
        nick: String,
        channel: String,
        created_at: DateTime<Utc>,
    },
    WhoisAccount {
        nick: String,
        target: String,
        account: String,
    },
    NoTopic {
        nick: String,
        channel: String,
    },
    Topic {
        nick: String,
        channel: String,
        topic: String,
    },
    TopicWhoTime {
        nick: String,
        channel: String,
        set_by: String,
        set_at: DateTime<Utc>,
    },
    Inviting {
        nick: String,
        target: String,
        channel: String,
    },
    Who {
        nick: String,
        channel: String,
        user: String,
        host: String,
        target: String,
        flags: String,
        realname: String,
    },
    NamReply {
        nick: String,
        channel: String,
        names: Vec<String>,
    },
    EndOfNames {
        nick: String,
        channel: String,
    },
    BanList {
        nick: String,
        channel: String,
        mask: String,
    },
    EndOfBanList {
        nick: String,
        channel: String,
    },
    ExceptList {
        nick: String,
        channel: String,
        mask: String,
    },
    EndOfExceptList {
        nick: String,
        channel: String,
    },
    Motd {
        nick: String,
        line: String,
    },
    MotdStart {
        nick: String,
    },
    EndOfMotd {
        nick: String,
    },
    ErrNoSuchNick {
        nick: String,
        target: String,
    },
    ErrNoSuchChannel {
        nick: String,
        channel: String,
    },
    ErrCannotSendToChan {
        nick: String,
        channel: String,
    },
    ErrTooManyChannels {
        nick: String,
        channel: String,
    },
    ErrNoOrigin {
        nick: String,
    },
    ErrInvalidCapCmd {
        nick: String,
        subcommand: String,
    },
    ErrNoRecipient {
        nick: String,
        command: String,
    },
    ErrNoTextToSend {
        nick: String,
    },
    ErrInputTooLong {
        nick: String,
    },
    ErrUnknownCommand {
        nick: String,
        command: String,
    },
    ErrNoMotd {
        nick: String,
    },
    ErrNoNicknameGiven {
        nick: String,
    },
    ErrErroneousNickname {
        nick: String,
        attempted: String,
    },
    ErrNicknameInUse {
        nick: String,
        attempted: String,
    },
    ErrUserNotInChannel {
        nick: String,
        target: String,
        channel: String,
    },
    ErrNotOnChannel {
        nick: String,
        channel: String,
    },
    ErrUserOnChannel {
        nick: String,
        target: String,
        channel: String,
    },
    ErrNotRegistered {
        nick: String,
    },
    ErrNeedMoreParams {
        nick: String,
        command: String,
    },
    ErrAlreadyRegistered {
        nick: String,
    },
    ErrPasswdMismatch {
        nick: String,
    },
    ErrChannelIsFull {
        nick: String,
        channel: String,
    },
    ErrUnknownMode {
        nick: String,
        mode: char,
    },
    ErrInviteOnlyChan {
        nick: String,
        channel: String,
    },
    ErrBannedFromChan {
        nick: String,
        channel: String,
    },
    ErrBadChannelKey {
        nick: String,
        channel: String,
    },
    ErrBadChanMask {
        nick: String,
        channel: String,
    },
    ErrChanOPrivsNeeded {
        nick: String,
        channel: String,
    },
    ErrUsersDontMatch {
        nick: String,
    },
    LoggedIn {
        nick: String,
        mask: String,
        account: String,
    },
    SaslSuccess {
        nick: String,
    },
    ErrSaslFail {
        nick: String,
    },
    ErrSaslTooLong {
        nick: String,
    },
    ErrSaslAborted {
        nick: String,
    },
    ErrSaslAlready {
        nick: String,
    },
    SaslMechs {
        nick: String,
        mechanisms: String,
    },
}

fn numeric(server_host: &str, code: &str, nick: &str) -> Message {
    Message::new(code).with_prefix(server_host).with_param(nick)
}

impl Reply {
    pub fn to_message(&self, server_host: &str) -> Message {
        match self {
            Reply::Welcome {
                nick,
                network,
                mask,
            } => numeric(server_host, "001", nick).with_param(format!(
                "Welcome to the {} Internet Relay Chat Network {}",
                network, mask
            )),
            Reply::YourHost { nick, version } => numeric(server_host, "002", nick).with_param(
                format!("Your host is {}, running version {}", server_host, version),
            ),
            Reply::Created { nick, created_at } => numeric(server_host, "003", nick)
                .with_param(format!("This server was created {}", created_at.to_rfc2822())),
            Reply::MyInfo {
                nick,
                version,
                user_modes,
                channel_modes,
            } => numeric(server_host, "004", nick)
                .with_param(server_host)
                .with_param(version)
                .with_param(user_modes)
                .with_param(channel_modes),
            Reply::ISupport { nick, tokens } => numeric(server_host, "005", nick)
                .with_params(tokens.iter().cloned())
                .with_param("are supported by this server"),
            Reply::UModeIs { nick, modes } => numeric(server_host, "221", nick).with_param(modes),
            Reply::LuserClient {
                nick,
                users,
                servers,
            } => numeric(server_host, "251", nick).with_param(format!(
                "There are {} users and 0 invisible on {} servers",
                users, servers
            )),
            Reply::LuserChannels { nick, channels } => numeric(server_host, "254", nick)
                .with_param(channels.to_string())
                .with_param("channels formed"),
            Reply::LuserMe { nick, clients } => numeric(server_host, "255", nick)
                .with_param(format!("I have {} clients and 0 servers", clients)),
            Reply::TryAgain { nick, command } => numeric(server_host, "263", nick)
                .with_param(command)
                .with_param("Please wait a while and try again."),
            Reply::Away {
                nick,
                target,
                message,
            } => numeric(server_host, "301", nick)
                .with_param(target)
                .with_param(message),
            Reply::UnAway { nick } => numeric(server_host, "305", nick)
                .with_param("You are no longer marked as being away"),
            Reply::NowAway { nick } => numeric(server_host, "306", nick)
                .with_param("You have been marked as being away"),
            Reply::WhoisUser {
                nick,
                target,
                user,
                host,
                realname,
            } => numeric(server_host, "311", nick)
                .with_param(target)
                .with_param(user)
                .with_param(host)
                .with_param("*")
                .with_param(realname),
            Reply::WhoisServer { nick, target, info } => numeric(server_host, "312", nick)
                .with_param(target)
                .with_param(server_host)
                .with_param(info),
            Reply::EndOfWho { nick, mask } => numeric(server_host, "315", nick)
                .with_param(mask)
                .with_param("End of /WHO list."),
            Reply::EndOfWhois { nick, target } => numeric(server_host, "318", nick)
                .with_param(target)
                .with_param("End of /WHOIS list."),
            Reply::ListStart { nick } => numeric(server_host, "321", nick)
                .with_param("Channel")
                .with_param("Users  Name"),
            Reply::List {
                nick,
                channel,
                visible,
                topic,
            } => numeric(server_host, "322", nick)
                .with_param(channel)
                .with_param(visible.to_string())
                .with_param(topic),
            Reply::ListEnd { nick } => {
                numeric(server_host, "323", nick).with_param("End of /LIST")
            }
            Reply::ChannelModeIs {
                nick,
                channel,
                modes,
                arguments,
            } => numeric(server_host, "324", nick)
                .with_param(channel)
                .with_param(modes)
                .with_params(arguments.iter().cloned()),
            Reply::CreationTime {
                nick,
                channel,
                created_at,
            } => numeric(server_host, "329", nick)
                .with_param(channel)
                .with_param(created_at.timestamp().to_string()),
            Reply::WhoisAccount {
                nick,
                target,
                account,
            } => numeric(server_host, "330", nick)
                .with_param(target)
                .with_param(account)
                .with_param("is logged in as"),
            Reply::NoTopic { nick, channel } => numeric(server_host, "331", nick)
                .with_param(channel)
                .with_param("No topic is set"),
            Reply::Topic {
                nick,
                channel,
                topic,
            } => numeric(server_host, "332", nick)
                .with_param(channel)
                .with_param(topic),
            Reply::TopicWhoTime {
                nick,
                channel,
                set_by,
                set_at,
            } => numeric(server_host, "333", nick)
                .with_param(channel)
                .with_param(set_by)
                .with_param(set_at.timestamp().to_string()),
            Reply::Inviting {
                nick,
                target,
                channel,
            } => numeric(server_host, "341", nick)
                .with_param(target)
                .with_param(channel),
            Reply::Who {
                nick,
                channel,
                user,
                host,
                target,
                flags,
                realname,
            } => numeric(server_host, "352", nick)
                .with_param(channel)
                .with_param(user)
                .with_param(host)
                .with_param(server_host)
                .with_param(target)
                .with_param(flags)
                .with_param(format!("0 {}", realname)),
            Reply::NamReply {
                nick,
                channel,
                names,
            } => numeric(server_host, "353", nick)
                .with_param("=")
                .with_param(channel)
                .with_param(names.join(" ")),
            Reply::EndOfNames { nick, channel } => numeric(server_host, "366", nick)
                .with_param(channel)
                .with_param("End of /NAMES list."),
            Reply::BanList {
                nick,
                channel,
                mask,
            } => numeric(server_host, "367", nick)
                .with_param(channel)
                .with_param(mask),
            Reply::EndOfBanList { nick, channel } => numeric(server_host, "368", nick)
                .with_param(channel)
                .with_param("End of channel ban list"),
            Reply::ExceptList {
                nick,
                channel,
                mask,
            } => numeric(server_host, "348", nick)
                .with_param(channel)
                .with_param(mask),
            Reply::EndOfExceptList { nick, channel } => numeric(server_host, "349", nick)
                .with_param(channel)
                .with_param("End of channel exception list"),
            Reply::Motd { nick, line } => {
                numeric(server_host, "372", nick).with_param(format!("- {}", line))
            }
            Reply::MotdStart { nick } => numeric(server_host, "375", nick)
                .with_param(format!("- {} Message of the day - ", server_host)),
            Reply::EndOfMotd { nick } => {
                numeric(server_host, "376", nick).with_param("End of /MOTD command.")
            }
            Reply::ErrNoSuchNick { nick, target } => numeric(server_host, "401", nick)
                .with_param(target)
                .with_param("No such nick/channel"),
            Reply::ErrNoSuchChannel { nick, channel } => numeric(server_host, "403", nick)
                .with_param(channel)
                .with_param("No such channel"),
            Reply::ErrCannotSendToChan { nick, channel } => numeric(server_host, "404", nick)
                .with_param(channel)
                .with_param("Cannot send to channel"),
            Reply::ErrTooManyChannels { nick, channel } => numeric(server_host, "405", nick)
                .with_param(channel)
                .with_param("You have joined too many channels"),
            Reply::ErrNoOrigin { nick } => {
                numeric(server_host, "409", nick).with_param("No origin specified")
            }
            Reply::ErrInvalidCapCmd { nick, subcommand } => numeric(server_host, "410", nick)
                .with_param(subcommand)
                .with_param("Invalid CAP command"),
            Reply::ErrNoRecipient { nick, command } => numeric(server_host, "411", nick)
                .with_param(format!("No recipient given ({})", command)),
            Reply::ErrNoTextToSend { nick } => {
                numeric(server_host, "412", nick).with_param("No text to send")
            }
            Reply::ErrInputTooLong { nick } => {
                numeric(server_host, "417", nick).with_param("Input line was too long")
            }
            Reply::ErrUnknownCommand { nick, command } => numeric(server_host, "421", nick)
                .with_param(command)
                .with_param("Unknown command"),
            Reply::ErrNoMotd { nick } => {
                numeric(server_host, "422", nick).with_param("MOTD File is missing")
            }
            Reply::ErrNoNicknameGiven { nick } => {
                numeric(server_host, "431", nick).with_param("No nickname given")
            }
            Reply::ErrErroneousNickname { nick, attempted } => numeric(server_host, "432", nick)
                .with_param(attempted)
                .with_param("Erroneous nickname"),
            Reply::ErrNicknameInUse { nick, attempted } => numeric(server_host, "433", nick)
                .with_param(attempted)
                .with_param("Nickname is already in use"),
            Reply::ErrUserNotInChannel {
                nick,
                target,
                channel,
            } => numeric(server_host, "441", nick)
                .with_param(target)
                .with_param(channel)
                .with_param("They aren't on that channel"),
            Reply::ErrNotOnChannel { nick, channel } => numeric(server_host, "442", nick)
                .with_param(channel)
                .with_param("You're not on that channel"),
            Reply::ErrUserOnChannel {
                nick,
                target,
                channel,
            } => numeric(server_host, "443", nick)
                .with_param(target)
                .with_param(channel)
                .with_param("is already on channel"),
            Reply::ErrNotRegistered { nick } => {
                numeric(server_host, "451", nick).with_param("You have not registered")
            }
            Reply::ErrNeedMoreParams { nick, command } => numeric(server_host, "461", nick)
                .with_param(command)
                .with_param("Not enough parameters"),
            Reply::ErrAlreadyRegistered { nick } => {
                numeric(server_host, "462", nick).with_param("You may not reregister")
            }
            Reply::ErrPasswdMismatch { nick } => {
                numeric(server_host, "464", nick).with_param("Password incorrect")
            }
            Reply::ErrChannelIsFull { nick, channel } => numeric(server_host, "471", nick)
                .with_param(channel)
                .with_param("Cannot join channel (+l)"),
            Reply::ErrUnknownMode { nick, mode } => numeric(server_host, "472", nick)
                .with_param(mode.to_string())
                .with_param("is unknown mode char to me"),
            Reply::ErrInviteOnlyChan { nick, channel } => numeric(server_host, "473", nick)
                .with_param(channel)
                .with_param("Cannot join channel (+i)"),
            Reply::ErrBannedFromChan { nick, channel } => numeric(server_host, "474", nick)
                .with_param(channel)
                .with_param("Cannot join channel (+b)"),
            Reply::ErrBadChannelKey { nick, channel } => numeric(server_host, "475", nick)
                .with_param(channel)
                .with_param("Cannot join channel (+k)"),
            Reply::ErrBadChanMask { nick, channel } => numeric(server_host, "476", nick)
                .with_param(channel)
                .with_param("Bad Channel Mask"),
            Reply::ErrChanOPrivsNeeded { nick, channel } => numeric(server_host, "482", nick)
                .with_param(channel)
                .with_param("You're not channel operator"),
            Reply::ErrUsersDontMatch { nick } => numeric(server_host, "502", nick)
                .with_param("Cant change mode for other users"),
            Reply::LoggedIn {
                nick,
                mask,
                account,
            } => numeric(server_host, "900", nick)
                .with_param(mask)
                .with_param(account)
                .with_param(format!("You are now logged in as {}", account)),
            Reply::SaslSuccess { nick } => {
                numeric(server_host, "903", nick).with_param("SASL authentication successful")
            }
            Reply::ErrSaslFail { nick } => {
                numeric(server_host, "904", nick).with_param("SASL authentication failed")
            }
            Reply::ErrSaslTooLong { nick } => {
                numeric(server_host, "905", nick).with_param("SASL message too long")
            }
            Reply::ErrSaslAborted { nick } => {
                numeric(server_host, "906", nick).with_param("SASL authentication aborted")
            }
            Reply::ErrSaslAlready { nick } => numeric(server_host, "907", nick)
                .with_param("You have already authenticated using SASL"),
            Reply::SaslMechs { nick, mechanisms } => numeric(server_host, "908", nick)
                .with_param(mechanisms)
                .with_param("are available SASL mechanisms"),
        }
    }
}

// non-numeric server lines

pub fn ping(server_host: &str) -> Message {
    Message::new("PING").with_param(server_host)
}

pub fn pong(server_host: &str, token: &str) -> Message {
    Message::new("PONG")
        .with_prefix(server_host)
        .with_param(server_host)
        .with_param(token)
}

pub fn error(text: &str) -> Message {
    Message::new("ERROR").with_param(text)
}

/// Standard reply `FAIL <command> <code> [<context>...] :<description>`.
pub fn fail(server_host: &str, command: &str, code: &str, context: &[&str], description: &str) -> Message {
    Message::new("FAIL")
        .with_prefix(server_host)
        .with_param(command)
        .with_param(code)
        .with_params(context.iter().copied())
        .with_param(description)
}

#[test]
fn welcome_prints_correctly() {
    let reply = Reply::Welcome {
        nick: "JIM".to_string(),
        network: "ExampleNet".to_string(),
        mask: "JIM!~jim@127.0.0.1".to_string(),
    };
    let actual = reply.to_message("localhost").to_string();
    let expected =
        ":localhost 001 JIM :Welcome to the ExampleNet Internet Relay Chat Network JIM!~jim@127.0.0.1";
    assert_eq!(expected, actual);
}

#[test]
fn yourhost_prints_correctly() {
    let reply = Reply::YourHost {
        nick: "JIM".to_string(),
        version: "0.1.0".to_string(),
    };
    let actual = reply.to_message("localhost").to_string();
    let expected = ":localhost 002 JIM :Your host is localhost, running version 0.1.0";
    assert_eq!(expected, actual);
}

#[test]
fn myinfo_prints_correctly() {
    let reply = Reply::MyInfo {
        nick: "JIM".to_string(),
        version: "0.1.0".to_string(),
        user_modes: "i".to_string(),
        channel_modes: "beiklmnostv".to_string(),
    };
    let actual = reply.to_message("localhost").to_string();
    let expected = ":localhost 004 JIM localhost 0.1.0 i beiklmnostv";
    assert_eq!(expected, actual);
}

#[test]
fn isupport_prints_correctly() {
    let reply = Reply::ISupport {
        nick: "JIM".to_string(),
        tokens: vec!["CHANNELLEN=50".to_string(), "NICKLEN=30".to_string()],
    };
    let actual = reply.to_message("localhost").to_string();
    let expected = ":localhost 005 JIM CHANNELLEN=50 NICKLEN=30 :are supported by this server";
    assert_eq!(expected, actual);
}

#[test]
fn luserclient_prints_correctly() {
    let reply = Reply::LuserClient {
        nick: "JIM".to_string(),
        users: 4,
        servers: 1,
    };
    let actual = reply.to_message("localhost").to_string();
    let expected = ":localhost 251 JIM :There are 4 users and 0 invisible on 1 servers";
    assert_eq!(expected, actual);
}

#[test]
fn channelmodeis_prints_correctly() {
    let reply = Reply::ChannelModeIs {
        nick: "JIM".to_string(),
        channel: "#foobar".to_string(),
        modes: "+klnt".to_string(),
        arguments: vec!["secret".to_string(), "10".to_string()],
    };
    let actual = reply.to_message("localhost").to_string();
    let expected = ":localhost 324 JIM #foobar +klnt secret 10";
    assert_eq!(expected, actual);
}

#[test]
fn topicwhotime_prints_correctly() {
    let set_at = DateTime::parse_from_rfc3339("2021-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc);
    let reply = Reply::TopicWhoTime {
        nick: "JIM".to_string(),
        channel: "#foobar".to_string(),
        set_by: "bob!~bob@host".to_string(),
        set_at,
    };
    let actual = reply.to_message("localhost").to_string();
    let expected = ":localhost 333 JIM #foobar bob!~bob@host 1609459200";
    assert_eq!(expected, actual);
}

#[test]
fn topic_prints_correctly() {
    let reply = Reply::Topic {
        nick: "JIM".to_string(),
        channel: "#foobar".to_string(),
        topic: "hELLO WORLD".to_string(),
    };
    let actual = reply.to_message("localhost").to_string();
    let expected = ":localhost 332 JIM #foobar :hELLO WORLD";
    assert_eq!(expected, actual);
}

#[test]
fn who_prints_correctly() {
    let reply = Reply::Who {
        nick: "JIM".to_string(),
        channel: "#foobar".to_string(),
        user: "~bob".to_string(),
        host: "127.0.0.1".to_string(),
        target: "bob".to_string(),
        flags: "H@".to_string(),
        realname: "Bob Smith".to_string(),
    };
    let actual = reply.to_message("localhost").to_string();
    let expected = ":localhost 352 JIM #foobar ~bob 127.0.0.1 localhost bob H@ :0 Bob Smith";
    assert_eq!(expected, actual);
}

#[test]
fn namreply_prints_correctly() {
    let reply = Reply::NamReply {
        nick: "JIM".to_string(),
        channel: "#foobar".to_string(),
        names: vec!["@bob".to_string(), "JIM".to_string()],
    };
    let actual = reply.to_message("localhost").to_string();
    let expected = ":localhost 353 JIM = #foobar :@bob JIM";
    assert_eq!(expected, actual);
}

#[test]
fn endofnames_prints_correctly() {
    let reply = Reply::EndOfNames {
        nick: "JIM".to_string(),
        channel: "#foobar".to_string(),
    };
    let actual = reply.to_message("localhost").to_string();
    let expected = ":localhost 366 JIM #foobar :End of /NAMES list.";
    assert_eq!(expected, actual);
}

#[test]
fn motd_prints_correctly() {
    let reply = Reply::Motd {
        nick: "JIM".to_string(),
        line: "Foobar".to_string(),
    };
    let actual = reply.to_message("localhost").to_string();
    let expected = ":localhost 372 JIM :- Foobar";
    assert_eq!(expected, actual);
}

#[test]
fn nicknameinuse_prints_correctly() {
    let reply = Reply::ErrNicknameInUse {
        nick: "*".to_string(),
        attempted: "JIM".to_string(),
    };
    let actual = reply.to_message("localhost").to_string();
    let expected = ":localhost 433 * JIM :Nickname is already in use";
    assert_eq!(expected, actual);
}

#[test]
fn needmoreparams_prints_correctly() {
    let reply = Reply::ErrNeedMoreParams {
        nick: "JIM".to_string(),
        command: "JOIN".to_string(),
    };
    let actual = reply.to_message("localhost").to_string();
    let expected = ":localhost 461 JIM JOIN :Not enough parameters";
    assert_eq!(expected, actual);
}

#[test]
fn loggedin_prints_correctly() {
    let reply = Reply::LoggedIn {
        nick: "JIM".to_string(),
        mask: "JIM!~jim@host".to_string(),
        account: "jim".to_string(),
    };
    let actual = reply.to_message("localhost").to_string();
    let expected = ":localhost 900 JIM JIM!~jim@host jim :You are now logged in as jim";
    assert_eq!(expected, actual);
}

#[test]
fn pong_prints_correctly() {
    let actual = pong("localhost", "LAG1238948394").to_string();
    let expected = ":localhost PONG localhost LAG1238948394";
    assert_eq!(expected, actual);
}

#[test]
fn fail_prints_correctly() {
    let actual = fail("localhost", "BATCH", "MULTILINE_MAX_LINES", &["24"], "Too many lines").to_string();
    let expected = ":localhost FAIL BATCH MULTILINE_MAX_LINES 24 :Too many lines";
    assert_eq!(expected, actual);
}

#[test]
fn list_prints_correctly() {
    let reply = Reply::List {
        nick: "JIM".to_string(),
        channel: "#foobar".to_string(),
        visible: 3,
        topic: "Rust talk".to_string(),
    };
    let actual = reply.to_message("localhost").to_string();
    let expected = ":localhost 322 JIM #foobar 3 :Rust talk";
    assert_eq!(expected, actual);
}

#[test]
fn whoisuser_prints_correctly() {
    let reply = Reply::WhoisUser {
        nick: "JIM".to_string(),
        target: "bob".to_string(),
        user: "~bob".to_string(),
        host: "example.com".to_string(),
        realname: "Bob Smith".to_string(),
    };
    let actual = reply.to_message("localhost").to_string();
    let expected = ":localhost 311 JIM bob ~bob example.com * :Bob Smith";
    assert_eq!(expected, actual);
}

#[test]
fn tryagain_prints_correctly() {
    let reply = Reply::TryAgain {
        nick: "JIM".to_string(),
        command: "PRIVMSG".to_string(),
    };
    let actual = reply.to_message("localhost").to_string();
    let expected = ":localhost 263 JIM PRIVMSG :Please wait a while and try again.";
    assert_eq!(expected, actual);
}

use crate::{context::ConnectionContext, message::Message, replies::Reply};

/// The WHOIS block for one target: 311, 312, then 301 and 330 when they
/// apply, closed by 318. An unknown nick gets 401 before the 318.
pub fn whois_replies(
    server_host: &str,
    network: &str,
    nick: &str,
    target: &str,
    found: Option<&ConnectionContext>,
) -> Vec<Message> {
    let nick = nick.to_string();
    let mut replies = vec![];

    match found {
        Some(user) => {
            let target = user.nick_or_star();
            replies.push(Reply::WhoisUser {
                nick: nick.clone(),
                target: target.clone(),
                user: user.username(),
                host: user.client_host.clone(),
                realname: user.real_name.clone().unwrap_or_default(),
            });
            replies.push(Reply::WhoisServer {
                nick: nick.clone(),
                target: target.clone(),
                info: network.to_string(),
            });
            if let Some(away) = &user.away {
                replies.push(Reply::Away {
                    nick: nick.clone(),
                    target: target.clone(),
                    message: away.clone(),
                });
            }
            if let Some(account) = &user.account {
                replies.push(Reply::WhoisAccount {
                    nick: nick.clone(),
                    target: target.clone(),
                    account: account.clone(),
                });
            }
            replies.push(Reply::EndOfWhois { nick, target });
        }
        None => {
            replies.push(Reply::ErrNoSuchNick {
                nick: nick.clone(),
                target: target.to_string(),
            });
            replies.push(Reply::EndOfWhois {
                nick,
                target: target.to_string(),
            });
        }
    }

    replies.iter().map(|r| r.to_message(server_host)).collect()
}

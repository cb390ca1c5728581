use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    context::ConnectionContext,
    delivery::Recipient,
    message::Message,
    store::PersistedChannel,
    util::{match_mask, CaseMapping},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberModes {
    pub operator: bool,
    pub voice: bool,
}

impl MemberModes {
    /// NAMES/WHO prefix: highest only, or all with multi-prefix.
    pub fn prefix(&self, multi_prefix: bool) -> String {
        let mut prefix = String::new();
        if self.operator {
            prefix.push('@');
        }
        if self.voice && (multi_prefix || !self.operator) {
            prefix.push('+');
        }
        prefix
    }
}

#[derive(Debug, Clone)]
pub struct Member {
    pub identity: ConnectionContext,
    pub modes: MemberModes,
    pub recipient: Recipient,
}

impl Member {
    pub fn nick(&self) -> String {
        self.identity.nick_or_star()
    }
}

/// Text, setter and time always change together.
#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub text: String,
    pub set_by: String,
    pub set_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelModes {
    pub moderated: bool,
    pub no_external: bool,
    pub topic_lock: bool,
    pub invite_only: bool,
    pub private: bool,
    pub secret: bool,
    pub key: Option<String>,
    pub limit: Option<usize>,
}

impl ChannelModes {
    /// Parses flag-only modes such as `nt` for new channels.
    pub fn from_flags(flags: &str) -> Self {
        let mut modes = ChannelModes::default();
        for flag in flags.chars() {
            match flag {
                'm' => modes.moderated = true,
                'n' => modes.no_external = true,
                't' => modes.topic_lock = true,
                'i' => modes.invite_only = true,
                'p' => modes.private = true,
                's' => modes.secret = true,
                _ => {}
            }
        }
        modes
    }

    /// `+flags` and their arguments; the key is masked for non-members.
    pub fn mode_string(&self, reveal_key: bool) -> (String, Vec<String>) {
        let mut flags = String::from("+");
        let mut arguments = vec![];

        if self.invite_only {
            flags.push('i');
        }
        if let Some(key) = &self.key {
            flags.push('k');
            arguments.push(if reveal_key {
                key.clone()
            } else {
                "*".to_string()
            });
        }
        if let Some(limit) = self.limit {
            flags.push('l');
            arguments.push(limit.to_string());
        }
        if self.moderated {
            flags.push('m');
        }
        if self.no_external {
            flags.push('n');
        }
        if self.private {
            flags.push('p');
        }
        if self.secret {
            flags.push('s');
        }
        if self.topic_lock {
            flags.push('t');
        }

        (flags, arguments)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("channel is full")]
    Full,
    #[error("channel is invite only")]
    InviteOnly,
    #[error("wrong channel key")]
    BadKey,
    #[error("banned from channel")]
    Banned,
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub msgid: String,
    pub sender: Uuid,
    pub messages: Vec<Message>,
    pub redacted: bool,
}

/// State owned by one channel actor. Nothing else touches it.
#[derive(Debug)]
pub struct Channel {
    name: String,
    key: String,
    created_at: DateTime<Utc>,
    pub topic: Option<Topic>,
    pub modes: ChannelModes,
    members: HashMap<Uuid, Member>,
    order: Vec<Uuid>,
    pub bans: Vec<String>,
    pub exceptions: Vec<String>,
    invites: HashSet<Uuid>,
    history: VecDeque<HistoryEntry>,
    history_len: usize,
}

impl Channel {
    pub fn new(name: &str, key: &str, modes: ChannelModes, history_len: usize) -> Self {
        Channel {
            name: name.to_string(),
            key: key.to_string(),
            created_at: Utc::now(),
            topic: None,
            modes,
            members: HashMap::new(),
            order: vec![],
            bans: vec![],
            exceptions: vec![],
            invites: HashSet::new(),
            history: VecDeque::new(),
            history_len,
        }
    }

    pub fn restore(&mut self, state: PersistedChannel) {
        self.topic = state.topic;
        self.modes = state.modes;
    }

    pub fn snapshot(&self) -> PersistedChannel {
        PersistedChannel {
            topic: self.topic.clone(),
            modes: self.modes.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalized name, as the registry knows it.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_member(&self, id: Uuid) -> bool {
        self.members.contains_key(&id)
    }

    pub fn member(&self, id: Uuid) -> Option<&Member> {
        self.members.get(&id)
    }

    pub fn member_mut(&mut self, id: Uuid) -> Option<&mut Member> {
        self.members.get_mut(&id)
    }

    /// `+s` and `+p` channels are only listed to their members.
    pub fn is_visible_to(&self, id: Uuid) -> bool {
        !(self.modes.secret || self.modes.private) || self.is_member(id)
    }

    pub fn is_operator(&self, id: Uuid) -> bool {
        self.members.get(&id).map_or(false, |m| m.modes.operator)
    }

    pub fn can_speak(&self, id: Uuid) -> bool {
        match self.members.get(&id) {
            Some(member) => {
                if member.modes.operator || member.modes.voice {
                    return true;
                }
                !self.modes.moderated && !self.is_banned(&member.identity)
            }
            None => !self.modes.no_external && !self.modes.moderated,
        }
    }

    pub fn find_by_nick(&self, nick: &str, casemapping: CaseMapping) -> Option<&Member> {
        let wanted = casemapping.normalize(nick);
        self.members.values().find(|m| {
            m.identity
                .nick
                .as_deref()
                .map_or(false, |n| casemapping.normalize(n) == wanted)
        })
    }

    /// Members in join order.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.order.iter().filter_map(move |id| self.members.get(id))
    }

    pub fn recipients(&self) -> Vec<Recipient> {
        self.members().map(|m| m.recipient.clone()).collect()
    }

    fn matches(&self, mask: &str, identity: &ConnectionContext) -> bool {
        match mask.strip_prefix("$a:") {
            Some(account) => identity
                .account
                .as_deref()
                .map_or(false, |a| match_mask(a, account)),
            None if mask == "$a" => identity.account.is_some(),
            None => match_mask(&identity.mask(), mask),
        }
    }

    pub fn is_banned(&self, identity: &ConnectionContext) -> bool {
        self.bans.iter().any(|mask| self.matches(mask, identity))
            && !self.exceptions.iter().any(|mask| self.matches(mask, identity))
    }

    /// An invitation only lifts `+i`; the key, limit and bans still apply.
    pub fn check_join(&self, identity: &ConnectionContext, key: Option<&str>) -> Result<(), JoinError> {
        if self.modes.invite_only && !self.invites.contains(&identity.connection_id) {
            return Err(JoinError::InviteOnly);
        }
        if let Some(expected) = &self.modes.key {
            if key != Some(expected.as_str()) {
                return Err(JoinError::BadKey);
            }
        }
        if let Some(limit) = self.modes.limit {
            if self.members.len() >= limit {
                return Err(JoinError::Full);
            }
        }
        if self.is_banned(identity) {
            return Err(JoinError::Banned);
        }
        Ok(())
    }

    /// Adds a member; the first one in gets operator. Returns whether the
    /// member was made operator.
    pub fn add_member(&mut self, identity: ConnectionContext, recipient: Recipient) -> bool {
        let id = identity.connection_id;
        let founder = self.members.is_empty();

        self.invites.remove(&id);
        if self.members.contains_key(&id) {
            return false;
        }

        self.members.insert(
            id,
            Member {
                identity,
                modes: MemberModes {
                    operator: founder,
                    voice: false,
                },
                recipient,
            },
        );
        self.order.push(id);
        founder
    }

    pub fn remove_member(&mut self, id: Uuid) -> Option<Member> {
        let member = self.members.remove(&id)?;
        self.order.retain(|other| *other != id);
        Some(member)
    }

    pub fn invite(&mut self, id: Uuid) {
        self.invites.insert(id);
    }

    pub fn set_topic(&mut self, text: String, set_by: String) -> &Topic {
        self.topic.insert(Topic {
            text,
            set_by,
            set_at: Utc::now(),
        })
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        if self.history_len == 0 {
            return;
        }
        while self.history.len() >= self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }

    /// Up to `limit` most recent unredacted entries, oldest first.
    pub fn latest(&self, limit: usize) -> Vec<&HistoryEntry> {
        let mut entries: Vec<&HistoryEntry> = self
            .history
            .iter()
            .rev()
            .filter(|e| !e.redacted)
            .take(limit)
            .collect();
        entries.reverse();
        entries
    }

    pub fn find_history_mut(&mut self, msgid: &str) -> Option<&mut HistoryEntry> {
        self.history.iter_mut().find(|e| e.msgid == msgid)
    }
}

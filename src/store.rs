use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::channel::{ChannelModes, Topic};

/// What survives a channel going empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedChannel {
    pub topic: Option<Topic>,
    pub modes: ChannelModes,
}

/// Optional durable state keyed by normalized channel name or account.
/// The server runs the same with `NoopStore`.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn load_channel(&self, channel: &str) -> Option<PersistedChannel>;
    async fn save_channel(&self, channel: &str, state: PersistedChannel);
    async fn account_login(&self, account: &str, nick: &str);
}

#[derive(Debug, Default)]
pub struct NoopStore;

#[async_trait]
impl PersistenceStore for NoopStore {
    async fn load_channel(&self, _channel: &str) -> Option<PersistedChannel> {
        None
    }

    async fn save_channel(&self, _channel: &str, _state: PersistedChannel) {}

    async fn account_login(&self, _account: &str, _nick: &str) {}
}

/// Process-local store, lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    channels: Mutex<HashMap<String, PersistedChannel>>,
    last_nick: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn last_nick(&self, account: &str) -> Option<String> {
        self.last_nick
            .lock()
            .ok()
            .and_then(|nicks| nicks.get(account).cloned())
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn load_channel(&self, channel: &str) -> Option<PersistedChannel> {
        self.channels
            .lock()
            .ok()
            .and_then(|channels| channels.get(channel).cloned())
    }

    async fn save_channel(&self, channel: &str, state: PersistedChannel) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.insert(channel.to_string(), state);
        }
    }

    async fn account_login(&self, account: &str, nick: &str) {
        if let Ok(mut nicks) = self.last_nick.lock() {
            nicks.insert(account.to_string(), nick.to_string());
        }
    }
}

#[tokio::test]
async fn memory_store_round_trips_channel_state() {
    // Arrange
    let store = MemoryStore::default();
    let state = PersistedChannel {
        topic: None,
        modes: ChannelModes {
            moderated: true,
            ..ChannelModes::default()
        },
    };

    // Act
    store.save_channel("#a", state.clone()).await;
    store.account_login("jim", "Jim").await;

    // Assert
    assert_eq!(Some(state), store.load_channel("#a").await);
    assert_eq!(None, store.load_channel("#b").await);
    assert_eq!(Some("Jim".to_string()), store.last_nick("jim"));
}

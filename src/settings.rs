use std::{collections::HashMap, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde_derive::Deserialize;

use crate::util::CaseMapping;

/// Server settings, read from an optional `Settings.{toml,json,yaml}` file in
/// the working directory and then from `IRCD_*` environment variables
/// (`IRCD_LIMITS__NICK_LEN=20` sets `limits.nick_len`). Anything missing
/// falls back to the defaults below.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub server_host: String,
    pub network: String,
    pub version: String,
    pub password: Option<String>,
    pub motd_lines: Vec<String>,
    pub ping_frequency_secs: u64,
    pub ping_timeout_secs: u64,
    pub cap_negotiation_timeout_secs: u64,
    pub casemapping: CaseMapping,
    pub default_channel_modes: String,
    pub limits: LimitSettings,
    pub flood: FloodSettings,
    pub multiline: MultilineSettings,
    pub sasl: SaslSettings,
    pub capabilities: CapabilitySettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub nick_len: usize,
    pub channel_len: usize,
    pub topic_len: usize,
    pub max_channels_per_connection: usize,
    pub tag_bytes: usize,
    pub line_bytes: usize,
    pub utf8_only: bool,
    pub history_len: usize,
    pub outbound_queue: usize,
    pub channel_mailbox: usize,
    pub registry_mailbox: usize,
    pub event_feed: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FloodSettings {
    pub messages: u32,
    pub interval_secs: u64,
    pub queue_depth: usize,
    pub connections_per_address: u32,
    pub connection_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MultilineSettings {
    pub max_bytes: usize,
    pub max_lines: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SaslSettings {
    pub mechanisms: Vec<String>,
    /// account name to password, checked by the built-in PLAIN verifier
    pub accounts: HashMap<String, String>,
    /// certificate fingerprint to account name, for EXTERNAL
    pub fingerprints: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CapabilitySettings {
    pub disabled: Vec<String>,
    pub relaymsg: bool,
    pub metadata: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            host: "127.0.0.1".to_string(),
            port: 6667,
            server_host: "localhost".to_string(),
            network: "ExampleNet".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            password: None,
            motd_lines: vec![],
            ping_frequency_secs: 120,
            ping_timeout_secs: 60,
            cap_negotiation_timeout_secs: 60,
            casemapping: CaseMapping::Rfc1459,
            default_channel_modes: "nt".to_string(),
            limits: LimitSettings::default(),
            flood: FloodSettings::default(),
            multiline: MultilineSettings::default(),
            sasl: SaslSettings::default(),
            capabilities: CapabilitySettings::default(),
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        LimitSettings {
            nick_len: 30,
            channel_len: 50,
            topic_len: 390,
            max_channels_per_connection: 25,
            tag_bytes: 8191,
            line_bytes: 512,
            utf8_only: false,
            history_len: 100,
            outbound_queue: 512,
            channel_mailbox: 256,
            registry_mailbox: 1024,
            event_feed: 256,
        }
    }
}

impl Default for FloodSettings {
    fn default() -> Self {
        FloodSettings {
            messages: 10,
            interval_secs: 1,
            queue_depth: 20,
            connections_per_address: 5,
            connection_interval_secs: 10,
        }
    }
}

impl Default for MultilineSettings {
    fn default() -> Self {
        MultilineSettings {
            max_bytes: 4096,
            max_lines: 24,
        }
    }
}

impl Default for SaslSettings {
    fn default() -> Self {
        SaslSettings {
            mechanisms: vec!["PLAIN".to_string(), "EXTERNAL".to_string()],
            accounts: HashMap::new(),
            fingerprints: HashMap::new(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let mut s = Config::new();
        s.merge(File::with_name("Settings").required(false))?;
        s.merge(Environment::with_prefix("IRCD").separator("__"))?;
        s.try_into()
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let mut s = Config::new();
        s.merge(File::with_name(path))?;
        s.merge(Environment::with_prefix("IRCD").separator("__"))?;
        s.try_into()
    }

    pub fn ping_frequency(&self) -> Duration {
        Duration::from_secs(self.ping_frequency_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn cap_negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.cap_negotiation_timeout_secs)
    }
}

#[test]
fn defaults_match_documented_limits() {
    let settings = Settings::default();
    assert_eq!(30, settings.limits.nick_len);
    assert_eq!(50, settings.limits.channel_len);
    assert_eq!(390, settings.limits.topic_len);
    assert_eq!(10, settings.flood.messages);
    assert_eq!(1, settings.flood.interval_secs);
    assert_eq!(Duration::from_secs(120), settings.ping_frequency());
}

#[test]
fn partial_file_keeps_defaults() {
    let mut s = Config::new();
    s.merge(File::from_str(
        "port = 7000\n[limits]\nnick_len = 12\n[flood]\nmessages = 4\n",
        config::FileFormat::Toml,
    ))
    .unwrap();
    let settings: Settings = s.try_into().unwrap();

    assert_eq!(7000, settings.port);
    assert_eq!(12, settings.limits.nick_len);
    assert_eq!(50, settings.limits.channel_len);
    assert_eq!(4, settings.flood.messages);
    assert_eq!(CaseMapping::Rfc1459, settings.casemapping);
}

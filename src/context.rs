use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    batch::MultilineLimits,
    capabilities::{Availability, CapabilityDescriptor, CapabilityRegistry},
    events::EventFeed,
    message::LineLimits,
    sasl::{CertificateValidator, CredentialVerifier, StaticCredentials},
    settings::Settings,
    store::{NoopStore, PersistenceStore},
    util::CaseMapping,
};

/// Everything shared read-only by all actors, plus the availability feed.
pub struct ServerContext {
    pub start_time: DateTime<Utc>,
    pub settings: Settings,
    pub capabilities: CapabilityRegistry,
    pub availability: watch::Sender<Availability>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub certificates: Arc<dyn CertificateValidator>,
    pub store: Arc<dyn PersistenceStore>,
    pub events: EventFeed,
}

impl ServerContext {
    pub fn new(settings: Settings) -> Self {
        let credentials = Arc::new(StaticCredentials::new(
            settings.sasl.accounts.clone(),
            settings.sasl.fingerprints.clone(),
        ));
        let (availability, _) = watch::channel(Availability::from_settings(&settings));

        ServerContext {
            start_time: Utc::now(),
            capabilities: CapabilityRegistry::new(&settings),
            availability,
            verifier: credentials.clone(),
            certificates: credentials,
            store: Arc::new(NoopStore),
            events: EventFeed::new(settings.limits.event_feed),
            settings,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn CredentialVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_certificates(mut self, certificates: Arc<dyn CertificateValidator>) -> Self {
        self.certificates = certificates;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_capability(mut self, descriptor: CapabilityDescriptor) -> Self {
        self.capabilities.register(descriptor);
        self
    }

    pub fn server_host(&self) -> &str {
        &self.settings.server_host
    }

    pub fn casemapping(&self) -> CaseMapping {
        self.settings.casemapping
    }

    pub fn line_limits(&self) -> LineLimits {
        LineLimits {
            tags: self.settings.limits.tag_bytes,
            body: self.settings.limits.line_bytes,
        }
    }

    pub fn multiline_limits(&self) -> MultilineLimits {
        MultilineLimits {
            max_bytes: self.settings.multiline.max_bytes,
            max_lines: self.settings.multiline.max_lines,
        }
    }

    pub fn ping_frequency(&self) -> Duration {
        self.settings.ping_frequency()
    }

    pub fn current_availability(&self) -> Availability {
        self.availability.borrow().clone()
    }

    /// Replaces the availability snapshot; every connection diffs it into
    /// `CAP NEW`/`CAP DEL`.
    pub fn set_availability(&self, availability: Availability) {
        self.availability.send_replace(availability);
    }
}

/// Identity of one client connection. Channels hold a snapshot of this taken
/// when the request was made.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionContext {
    pub connection_id: Uuid,
    pub nick: Option<String>,
    pub user: Option<String>,
    pub real_name: Option<String>,
    pub client_host: String,
    pub account: Option<String>,
    pub away: Option<String>,
}

impl ConnectionContext {
    pub fn new(connection_id: Uuid, client_host: &str) -> Self {
        ConnectionContext {
            connection_id,
            client_host: client_host.to_string(),
            ..ConnectionContext::default()
        }
    }

    pub fn nick_or_star(&self) -> String {
        self.nick.clone().unwrap_or_else(|| "*".to_string())
    }

    pub fn username(&self) -> String {
        format!("~{}", self.user.as_deref().unwrap_or("*"))
    }

    /// `nick!~user@host`
    pub fn mask(&self) -> String {
        format!(
            "{}!{}@{}",
            self.nick_or_star(),
            self.username(),
            self.client_host
        )
    }
}

#[test]
fn mask_uses_placeholders_before_registration() {
    let context = ConnectionContext::new(Uuid::new_v4(), "127.0.0.1");
    assert_eq!("*!~*@127.0.0.1", context.mask());
}

#[test]
fn mask_after_registration() {
    let context = ConnectionContext {
        nick: Some("jim".to_string()),
        user: Some("jimmy".to_string()),
        ..ConnectionContext::new(Uuid::new_v4(), "10.0.0.1")
    };
    assert_eq!("jim!~jimmy@10.0.0.1", context.mask());
}

//! SASL exchange state and the credential collaborators behind it.
//!
//! Flow:
//! 1. Client sends `AUTHENTICATE <mechanism>`
//! 2. Server answers `AUTHENTICATE +`
//! 3. Client sends base64 payload in 400-byte chunks; a chunk shorter than
//!    400 bytes (or a lone `+` after an exact multiple) ends it
//! 4. Server verifies and sends 900/903, or 904

use std::collections::HashMap;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;

pub const CHUNK_LEN: usize = 400;
const MAX_PAYLOAD_LEN: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    External,
}

impl Mechanism {
    pub fn parse(name: &str) -> Option<Mechanism> {
        match name.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Mechanism::Plain),
            "EXTERNAL" => Some(Mechanism::External),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Mechanism::Plain => "PLAIN",
            Mechanism::External => "EXTERNAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaslError {
    #[error("AUTHENTICATE chunk is longer than {CHUNK_LEN} bytes")]
    ChunkTooLong,
    #[error("SASL payload is too long")]
    PayloadTooLong,
    #[error("SASL payload is not valid base64")]
    InvalidEncoding,
    #[error("SASL payload is malformed")]
    Malformed,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("no account is bound to this certificate")]
    UnknownCertificate,
}

/// One in-progress exchange.
#[derive(Debug, PartialEq, Eq)]
pub struct SaslExchange {
    mechanism: Mechanism,
    buffer: String,
}

impl SaslExchange {
    pub fn new(mechanism: Mechanism) -> Self {
        SaslExchange {
            mechanism,
            buffer: String::new(),
        }
    }

    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    /// Feeds one `AUTHENTICATE` argument. `Ok(None)` means more chunks are
    /// expected; `Ok(Some(bytes))` is the decoded payload.
    pub fn feed(&mut self, chunk: &str) -> Result<Option<Vec<u8>>, SaslError> {
        if chunk.len() > CHUNK_LEN {
            return Err(SaslError::ChunkTooLong);
        }

        if chunk != "+" {
            self.buffer.push_str(chunk);
            if self.buffer.len() > MAX_PAYLOAD_LEN {
                return Err(SaslError::PayloadTooLong);
            }
            if chunk.len() == CHUNK_LEN {
                return Ok(None);
            }
        }

        let encoded = std::mem::take(&mut self.buffer);
        if encoded.is_empty() {
            return Ok(Some(vec![]));
        }

        STANDARD
            .decode(encoded.as_bytes())
            .map(Some)
            .map_err(|_| SaslError::InvalidEncoding)
    }
}

/// Splits a PLAIN payload `authzid \0 authcid \0 password`.
pub fn parse_plain(payload: &[u8]) -> Result<(String, String, String), SaslError> {
    let text = std::str::from_utf8(payload).map_err(|_| SaslError::Malformed)?;
    let mut fields = text.split('\0');

    match (fields.next(), fields.next(), fields.next(), fields.next()) {
        (Some(authzid), Some(authcid), Some(password), None) if !authcid.is_empty() => Ok((
            authzid.to_string(),
            authcid.to_string(),
            password.to_string(),
        )),
        _ => Err(SaslError::Malformed),
    }
}

/// Checks PLAIN credentials and names the account they log in to.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify_plain(&self, authcid: &str, password: &str) -> Result<String, SaslError>;
}

/// Maps a TLS client certificate fingerprint to an account, for EXTERNAL.
pub trait CertificateValidator: Send + Sync {
    fn account_for(&self, fingerprint: &str) -> Option<String>;
}

/// Accounts and certificate bindings taken straight from the settings file.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    accounts: HashMap<String, String>,
    fingerprints: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(accounts: HashMap<String, String>, fingerprints: HashMap<String, String>) -> Self {
        StaticCredentials {
            accounts: accounts
                .into_iter()
                .map(|(name, password)| (name.to_lowercase(), password))
                .collect(),
            fingerprints: fingerprints
                .into_iter()
                .map(|(fp, account)| (fp.to_lowercase(), account))
                .collect(),
        }
    }
}

#[async_trait]
impl CredentialVerifier for StaticCredentials {
    async fn verify_plain(&self, authcid: &str, password: &str) -> Result<String, SaslError> {
        match self.accounts.get(&authcid.to_lowercase()) {
            Some(expected) if expected == password => Ok(authcid.to_string()),
            _ => Err(SaslError::InvalidCredentials),
        }
    }
}

impl CertificateValidator for StaticCredentials {
    fn account_for(&self, fingerprint: &str) -> Option<String> {
        self.fingerprints.get(&fingerprint.to_lowercase()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(raw: &[u8]) -> String {
        STANDARD.encode(raw)
    }

    #[test]
    fn single_short_chunk_completes() {
        let mut exchange = SaslExchange::new(Mechanism::Plain);
        let payload = encode(b"\0jim\0secret");
        let decoded = exchange.feed(&payload).unwrap().unwrap();
        assert_eq!(b"\0jim\0secret".to_vec(), decoded);
    }

    #[test]
    fn exact_multiple_needs_plus_terminator() {
        let raw = vec![b'a'; 300];
        let payload = encode(&raw);
        assert_eq!(400, payload.len());

        let mut exchange = SaslExchange::new(Mechanism::Plain);
        assert_eq!(None, exchange.feed(&payload).unwrap());
        assert_eq!(Some(raw), exchange.feed("+").unwrap());
    }

    #[test]
    fn chunks_are_concatenated() {
        let raw = vec![b'z'; 500];
        let payload = encode(&raw);
        let (first, rest) = payload.split_at(CHUNK_LEN);

        let mut exchange = SaslExchange::new(Mechanism::Plain);
        assert_eq!(None, exchange.feed(first).unwrap());
        assert_eq!(Some(raw), exchange.feed(rest).unwrap());
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let mut exchange = SaslExchange::new(Mechanism::Plain);
        assert_eq!(
            Err(SaslError::ChunkTooLong),
            exchange.feed(&"A".repeat(401))
        );
    }

    #[test]
    fn empty_response_for_external() {
        let mut exchange = SaslExchange::new(Mechanism::External);
        assert_eq!(Some(vec![]), exchange.feed("+").unwrap());
    }

    #[test]
    fn plain_payload_fields() {
        let (authzid, authcid, password) = parse_plain(b"\0jim\0hunter2").unwrap();
        assert_eq!("", authzid);
        assert_eq!("jim", authcid);
        assert_eq!("hunter2", password);
        assert_eq!(Err(SaslError::Malformed), parse_plain(b"jim hunter2"));
    }

    #[tokio::test]
    async fn static_credentials_verify() {
        // Arrange
        let mut accounts = HashMap::new();
        accounts.insert("jim".to_string(), "hunter2".to_string());
        let credentials = StaticCredentials::new(accounts, HashMap::new());

        // Act
        let good = credentials.verify_plain("JIM", "hunter2").await;
        let bad = credentials.verify_plain("jim", "nope").await;

        // Assert
        assert_eq!(Ok("JIM".to_string()), good);
        assert_eq!(Err(SaslError::InvalidCredentials), bad);
    }
}

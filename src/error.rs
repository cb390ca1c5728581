use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{0} mailbox is closed")]
    MailboxClosed(&'static str),
    #[error("{0} did not answer")]
    NoReply(&'static str),
}

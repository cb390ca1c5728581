use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::message::{strip_line_ending, LineLimits, Message, ParseError};

/// Fatal framing errors. Anything recoverable is handed up as a
/// `ParseError` item so the connection can answer it and keep going.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("client sent invalid UTF-8 while the server is UTF-8 only")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frames a byte stream into IRC lines. CRLF and bare LF are both accepted
/// as terminators; blank lines are ignored.
#[derive(Debug, Clone)]
pub struct IrcCodec {
    limits: LineLimits,
    utf8_only: bool,
    // discarding the tail of an oversized line until the next terminator
    skipping: bool,
}

impl IrcCodec {
    pub fn new(limits: LineLimits, utf8_only: bool) -> Self {
        IrcCodec {
            limits,
            utf8_only,
            skipping: false,
        }
    }
}

impl Default for IrcCodec {
    fn default() -> Self {
        IrcCodec::new(LineLimits::default(), false)
    }
}

impl Decoder for IrcCodec {
    type Item = Result<Message, ParseError>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src.iter().position(|b| *b == b'\n');

            if self.skipping {
                match newline {
                    Some(pos) => {
                        src.advance(pos + 1);
                        self.skipping = false;
                        continue;
                    }
                    None => {
                        src.clear();
                        return Ok(None);
                    }
                }
            }

            let pos = match newline {
                Some(pos) => pos,
                None if src.len() > self.limits.frame() => {
                    warn!(bytes = src.len(), "discarding oversized partial line");
                    src.clear();
                    self.skipping = true;
                    return Ok(Some(Err(ParseError::LineTooLong {
                        limit: self.limits.body,
                    })));
                }
                None => return Ok(None),
            };

            let raw = src.split_to(pos + 1);
            let line = strip_line_ending(&raw);
            if line.iter().all(|b| *b == b' ' || *b == b'\r') {
                continue;
            }

            return match Message::decode(line, &self.limits, self.utf8_only) {
                Ok(message) => Ok(Some(Ok(message))),
                Err(ParseError::InvalidUtf8) => Err(CodecError::InvalidUtf8),
                Err(error) => Ok(Some(Err(error))),
            };
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // an unterminated trailing fragment is dropped
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

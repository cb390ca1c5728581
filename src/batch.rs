use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::atomic::{AtomicU64, Ordering},
};

use thiserror::Error;

use crate::message::{Message, Tags};

pub const MULTILINE_BATCH: &str = "draft/multiline";
pub const CONCAT_TAG: &str = "draft/multiline-concat";
pub const LABELED_RESPONSE_BATCH: &str = "labeled-response";

/// Client batches one connection may have open at once.
pub const MAX_OPEN_BATCHES: usize = 4;
/// How many closed references a connection is kept from reusing.
pub const REMEMBERED_REFERENCES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("batch {0} is already open")]
    AlreadyOpen(String),
    #[error("batch reference {0} was already used on this connection")]
    ReferenceReused(String),
    #[error("no open batch {0}")]
    UnknownReference(String),
    #[error("at most {0} batches may be open")]
    TooManyOpen(usize),
    #[error("multiline batch exceeds {0} bytes")]
    MaxBytes(usize),
    #[error("multiline batch exceeds {0} lines")]
    MaxLines(usize),
    #[error("multiline batch has an invalid target")]
    InvalidTarget,
    #[error("invalid multiline batch: {0}")]
    Invalid(&'static str),
}

impl BatchError {
    pub fn code(&self) -> &'static str {
        match self {
            BatchError::AlreadyOpen(_)
            | BatchError::ReferenceReused(_)
            | BatchError::UnknownReference(_)
            | BatchError::TooManyOpen(_) => "INVALID_REFTAG",
            BatchError::MaxBytes(_) => "MULTILINE_MAX_BYTES",
            BatchError::MaxLines(_) => "MULTILINE_MAX_LINES",
            BatchError::InvalidTarget => "MULTILINE_INVALID_TARGET",
            BatchError::Invalid(_) => "MULTILINE_INVALID",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchContext {
    pub reference: String,
    pub batch_type: String,
    pub params: Vec<String>,
    pub tags: Tags,
    pub messages: Vec<Message>,
    /// Composed multiline size so far.
    pub bytes: usize,
    /// Went over a limit while open; later lines are dropped and closing
    /// it says nothing more.
    pub discarded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultilineLimits {
    pub max_bytes: usize,
    pub max_lines: usize,
}

impl Default for MultilineLimits {
    fn default() -> Self {
        MultilineLimits {
            max_bytes: 4096,
            max_lines: 24,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum Routed {
    Dispatch(Message),
    Buffered,
}

/// Inbound client batches for one connection. A reference cannot be reused
/// while it is among the last `REMEMBERED_REFERENCES` opened.
#[derive(Debug, Default)]
pub struct BatchAssembler {
    limits: MultilineLimits,
    open: HashMap<String, BatchContext>,
    used: HashSet<String>,
    used_order: VecDeque<String>,
}

impl BatchAssembler {
    pub fn new(limits: MultilineLimits) -> Self {
        BatchAssembler {
            limits,
            ..BatchAssembler::default()
        }
    }

    pub fn open(
        &mut self,
        reference: &str,
        batch_type: &str,
        params: Vec<String>,
        tags: Tags,
    ) -> Result<(), BatchError> {
        if self.open.contains_key(reference) {
            return Err(BatchError::AlreadyOpen(reference.to_string()));
        }
        if self.open.len() >= MAX_OPEN_BATCHES {
            return Err(BatchError::TooManyOpen(MAX_OPEN_BATCHES));
        }
        if !self.used.insert(reference.to_string()) {
            return Err(BatchError::ReferenceReused(reference.to_string()));
        }
        self.used_order.push_back(reference.to_string());
        if self.used_order.len() > REMEMBERED_REFERENCES {
            if let Some(oldest) = self.used_order.pop_front() {
                self.used.remove(&oldest);
            }
        }

        self.open.insert(
            reference.to_string(),
            BatchContext {
                reference: reference.to_string(),
                batch_type: batch_type.to_string(),
                params,
                tags,
                messages: vec![],
                bytes: 0,
                discarded: false,
            },
        );
        Ok(())
    }

    /// Buffers messages tagged with an open batch reference. The multiline
    /// limits are enforced line by line; the first line over a limit
    /// reports it and discards what was buffered.
    pub fn route(&mut self, message: Message) -> Result<Routed, BatchError> {
        let reference = match message.tag("batch") {
            Some(reference) => reference.to_string(),
            None => return Ok(Routed::Dispatch(message)),
        };

        let limits = self.limits;
        let context = match self.open.get_mut(&reference) {
            Some(context) => context,
            None => return Err(BatchError::UnknownReference(reference)),
        };
        if context.discarded {
            return Ok(Routed::Buffered);
        }

        let text = message.param(1).unwrap_or_default().len();
        let separator = usize::from(!context.messages.is_empty() && !message.has_tag(CONCAT_TAG));
        let bytes = context.bytes + separator + text;

        let exceeded = if context.messages.len() >= limits.max_lines {
            Some(BatchError::MaxLines(limits.max_lines))
        } else if bytes > limits.max_bytes {
            Some(BatchError::MaxBytes(limits.max_bytes))
        } else {
            None
        };
        if let Some(error) = exceeded {
            context.discarded = true;
            context.messages.clear();
            return Err(error);
        }

        context.bytes = bytes;
        context.messages.push(message.without_tag("batch"));
        Ok(Routed::Buffered)
    }

    pub fn close(&mut self, reference: &str) -> Result<BatchContext, BatchError> {
        self.open
            .remove(reference)
            .ok_or_else(|| BatchError::UnknownReference(reference.to_string()))
    }

    pub fn is_open(&self, reference: &str) -> bool {
        self.open.contains_key(reference)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    PrivMsg,
    Notice,
    TagMsg,
}

impl MessageKind {
    pub fn command(self) -> &'static str {
        match self {
            MessageKind::PrivMsg => "PRIVMSG",
            MessageKind::Notice => "NOTICE",
            MessageKind::TagMsg => "TAGMSG",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultilinePart {
    pub text: String,
    pub concat: bool,
}

/// A completed `draft/multiline` batch, validated against the limits.
#[derive(Debug, Clone, PartialEq)]
pub struct MultilineMessage {
    pub kind: MessageKind,
    pub target: String,
    pub parts: Vec<MultilinePart>,
    pub tags: Tags,
}

impl MultilineMessage {
    pub fn assemble(context: BatchContext, limits: &MultilineLimits) -> Result<Self, BatchError> {
        let target = match context.params.first() {
            Some(target) if !target.is_empty() && !target.contains(',') => target.clone(),
            _ => return Err(BatchError::InvalidTarget),
        };

        if context.messages.is_empty() {
            return Err(BatchError::Invalid("batch is empty"));
        }

        let mut kind = None;
        let mut parts = Vec::with_capacity(context.messages.len());

        for message in &context.messages {
            let this_kind = match message.command() {
                "PRIVMSG" => MessageKind::PrivMsg,
                "NOTICE" => MessageKind::Notice,
                _ => return Err(BatchError::Invalid("only PRIVMSG and NOTICE may be batched")),
            };
            if *kind.get_or_insert(this_kind) != this_kind {
                return Err(BatchError::Invalid("batch mixes PRIVMSG and NOTICE"));
            }

            match message.param(0) {
                Some(t) if t.eq_ignore_ascii_case(&target) => {}
                _ => return Err(BatchError::InvalidTarget),
            }

            let text = message.param(1).unwrap_or_default().to_string();
            let concat = message.has_tag(CONCAT_TAG);
            if concat && text.is_empty() {
                return Err(BatchError::Invalid("concatenated line is blank"));
            }

            parts.push(MultilinePart { text, concat });
        }

        let multiline = MultilineMessage {
            kind: kind.unwrap_or(MessageKind::PrivMsg),
            target,
            parts,
            tags: context.tags.client_only(),
        };

        if multiline.parts.len() > limits.max_lines {
            return Err(BatchError::MaxLines(limits.max_lines));
        }
        if multiline.compose().len() > limits.max_bytes {
            return Err(BatchError::MaxBytes(limits.max_bytes));
        }

        Ok(multiline)
    }

    /// The logical message: concat parts join directly, others on `\n`.
    pub fn compose(&self) -> String {
        let mut out = String::new();
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 && !part.concat {
                out.push('\n');
            }
            out.push_str(&part.text);
        }
        out
    }

    /// One line per logical line, for recipients without multiline support.
    pub fn fallback_lines(&self) -> Vec<String> {
        self.compose().split('\n').map(str::to_string).collect()
    }
}

static NEXT_REFERENCE: AtomicU64 = AtomicU64::new(1);

/// Server-side batch reference, unique for the life of the process.
pub fn next_reference() -> String {
    format!("{:x}", NEXT_REFERENCE.fetch_add(1, Ordering::Relaxed))
}

/// Frames `messages` in `BATCH +ref` / `BATCH -ref`, tagging each member.
/// `start_tags` go on the opening line only.
pub fn wrap(
    source: &str,
    reference: &str,
    batch_type: &str,
    params: &[String],
    start_tags: &Tags,
    messages: Vec<Message>,
) -> Vec<Message> {
    let mut wrapped = Vec::with_capacity(messages.len() + 2);

    wrapped.push(
        Message::new("BATCH")
            .with_tags(start_tags)
            .with_prefix(source)
            .with_param(format!("+{}", reference))
            .with_param(batch_type)
            .with_params(params.iter().cloned()),
    );
    // members of a nested batch keep their own reference
    wrapped.extend(messages.into_iter().map(|m| {
        if m.has_tag("batch") {
            m
        } else {
            m.with_tag("batch", Some(reference.to_string()))
        }
    }));
    wrapped.push(
        Message::new("BATCH")
            .with_prefix(source)
            .with_param(format!("-{}", reference)),
    );

    wrapped
}

/// Applies labeled-response to everything produced for one labeled command:
/// nothing becomes `ACK`, one message carries the label, more are batched.
pub fn labeled(label: Option<&str>, server_host: &str, messages: Vec<Message>) -> Vec<Message> {
    let label = match label {
        Some(label) => label,
        None => return messages,
    };

    match messages.len() {
        0 => vec![Message::new("ACK")
            .with_tag("label", Some(label.to_string()))
            .with_prefix(server_host)],
        1 => messages
            .into_iter()
            .map(|m| m.with_tag("label", Some(label.to_string())))
            .collect(),
        _ => {
            let mut start = Tags::new();
            start.insert("label", Some(label.to_string()));
            wrap(
                server_host,
                &next_reference(),
                LABELED_RESPONSE_BATCH,
                &[],
                &start,
                messages,
            )
        }
    }
}

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

use crate::{message::Message, settings::Settings};

/// Capabilities this server knows how to implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    MessageTags,
    ServerTime,
    Batch,
    EchoMessage,
    Sasl,
    AccountNotify,
    AccountTag,
    ExtendedJoin,
    MultiPrefix,
    LabeledResponse,
    CapNotify,
    Chathistory,
    Multiline,
    Typing,
    ReadMarker,
    MessageRedaction,
    AccountExtban,
    Metadata,
    RelayMsg,
    PreAway,
}

impl Capability {
    pub const ALL: [Capability; 20] = [
        Capability::MessageTags,
        Capability::ServerTime,
        Capability::Batch,
        Capability::EchoMessage,
        Capability::Sasl,
        Capability::AccountNotify,
        Capability::AccountTag,
        Capability::ExtendedJoin,
        Capability::MultiPrefix,
        Capability::LabeledResponse,
        Capability::CapNotify,
        Capability::Chathistory,
        Capability::Multiline,
        Capability::Typing,
        Capability::ReadMarker,
        Capability::MessageRedaction,
        Capability::AccountExtban,
        Capability::Metadata,
        Capability::RelayMsg,
        Capability::PreAway,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Capability::MessageTags => "message-tags",
            Capability::ServerTime => "server-time",
            Capability::Batch => "batch",
            Capability::EchoMessage => "echo-message",
            Capability::Sasl => "sasl",
            Capability::AccountNotify => "account-notify",
            Capability::AccountTag => "account-tag",
            Capability::ExtendedJoin => "extended-join",
            Capability::MultiPrefix => "multi-prefix",
            Capability::LabeledResponse => "labeled-response",
            Capability::CapNotify => "cap-notify",
            Capability::Chathistory => "chathistory",
            Capability::Multiline => "draft/multiline",
            Capability::Typing => "draft/typing",
            Capability::ReadMarker => "draft/read-marker",
            Capability::MessageRedaction => "draft/message-redaction",
            Capability::AccountExtban => "account-extban",
            Capability::Metadata => "draft/metadata-2",
            Capability::RelayMsg => "draft/relaymsg",
            Capability::PreAway => "draft/pre-away",
        }
    }

    pub fn from_name(name: &str) -> Option<Capability> {
        Capability::ALL.iter().copied().find(|c| c.name() == name)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Known capabilities are matched exhaustively; anything registered at
/// startup by an embedder lands in `Extension`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CapabilityId {
    Known(Capability),
    Extension(String),
}

/// Runtime facts that decide which capabilities are on offer and what their
/// values are. Published over a watch channel; every change is diffed into
/// `CAP NEW`/`CAP DEL` for cap-notify clients.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Availability {
    pub sasl_mechanisms: Vec<String>,
    pub disabled: BTreeSet<String>,
    pub relaymsg: bool,
    pub metadata: bool,
}

impl Availability {
    pub fn from_settings(settings: &Settings) -> Self {
        Availability {
            sasl_mechanisms: settings
                .sasl
                .mechanisms
                .iter()
                .map(|m| m.to_ascii_uppercase())
                .collect(),
            disabled: settings.capabilities.disabled.iter().cloned().collect(),
            relaymsg: settings.capabilities.relaymsg,
            metadata: settings.capabilities.metadata,
        }
    }
}

pub type OfferPredicate = fn(&Availability) -> bool;
pub type ValueFn = fn(&Availability) -> Option<String>;

#[derive(Clone)]
pub enum CapabilityValue {
    None,
    Static(String),
    Dynamic(ValueFn),
}

#[derive(Clone)]
pub struct CapabilityDescriptor {
    pub id: CapabilityId,
    pub name: String,
    pub value: CapabilityValue,
    pub offerable: OfferPredicate,
}

impl fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

fn always(_: &Availability) -> bool {
    true
}

impl CapabilityDescriptor {
    pub fn known(capability: Capability) -> Self {
        CapabilityDescriptor {
            id: CapabilityId::Known(capability),
            name: capability.name().to_string(),
            value: CapabilityValue::None,
            offerable: always,
        }
    }

    pub fn extension(name: &str) -> Self {
        CapabilityDescriptor {
            id: CapabilityId::Extension(name.to_string()),
            name: name.to_string(),
            value: CapabilityValue::None,
            offerable: always,
        }
    }

    pub fn with_value(mut self, value: CapabilityValue) -> Self {
        self.value = value;
        self
    }

    pub fn offered_when(mut self, offerable: OfferPredicate) -> Self {
        self.offerable = offerable;
        self
    }

    pub fn is_offerable(&self, availability: &Availability) -> bool {
        !availability.disabled.contains(&self.name) && (self.offerable)(availability)
    }

    pub fn value(&self, availability: &Availability) -> Option<String> {
        match &self.value {
            CapabilityValue::None => None,
            CapabilityValue::Static(value) => Some(value.clone()),
            CapabilityValue::Dynamic(compute) => compute(availability),
        }
    }

    /// `name` or `name=value`; values are only shown to 302+ clients.
    pub fn token(&self, availability: &Availability, version: u32) -> String {
        match self.value(availability) {
            Some(value) if version >= 302 => format!("{}={}", self.name, value),
            _ => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapChange {
    pub id: CapabilityId,
    pub enable: bool,
    pub value: Option<String>,
}

/// Read-only after startup; shared through `Arc` by every connection.
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    descriptors: Vec<CapabilityDescriptor>,
    by_name: HashMap<String, usize>,
}

impl CapabilityRegistry {
    pub fn empty() -> Self {
        CapabilityRegistry {
            descriptors: vec![],
            by_name: HashMap::new(),
        }
    }

    pub fn new(settings: &Settings) -> Self {
        let mut registry = CapabilityRegistry::empty();
        let multiline = format!(
            "max-bytes={},max-lines={}",
            settings.multiline.max_bytes, settings.multiline.max_lines
        );

        for capability in Capability::ALL {
            let descriptor = CapabilityDescriptor::known(capability);
            let descriptor = match capability {
                Capability::Sasl => descriptor
                    .with_value(CapabilityValue::Dynamic(|a| {
                        Some(a.sasl_mechanisms.join(","))
                    }))
                    .offered_when(|a| !a.sasl_mechanisms.is_empty()),
                Capability::Multiline => {
                    descriptor.with_value(CapabilityValue::Static(multiline.clone()))
                }
                Capability::RelayMsg => descriptor
                    .with_value(CapabilityValue::Static("/".to_string()))
                    .offered_when(|a| a.relaymsg),
                Capability::Metadata => descriptor.offered_when(|a| a.metadata),
                _ => descriptor,
            };
            registry.register(descriptor);
        }

        registry
    }

    /// Adds or replaces a descriptor. Only meaningful before the registry is
    /// shared.
    pub fn register(&mut self, descriptor: CapabilityDescriptor) {
        match self.by_name.get(&descriptor.name) {
            Some(index) => self.descriptors[*index] = descriptor,
            None => {
                self.by_name
                    .insert(descriptor.name.clone(), self.descriptors.len());
                self.descriptors.push(descriptor);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityDescriptor> {
        self.by_name.get(name).map(|index| &self.descriptors[*index])
    }

    pub fn offered<'a>(
        &'a self,
        availability: &'a Availability,
    ) -> impl Iterator<Item = &'a CapabilityDescriptor> + 'a {
        self.descriptors
            .iter()
            .filter(move |d| d.is_offerable(availability))
    }

    pub fn ls_tokens(&self, availability: &Availability, version: u32) -> Vec<String> {
        self.offered(availability)
            .map(|d| d.token(availability, version))
            .collect()
    }

    /// All-or-nothing: every token must name an offered capability (or a
    /// known one, when disabling) or the whole request is refused.
    pub fn validate_request(
        &self,
        request: &str,
        availability: &Availability,
    ) -> Result<Vec<CapChange>, String> {
        let mut changes = vec![];

        for token in request.split_whitespace() {
            let (enable, name) = match token.strip_prefix('-') {
                Some(name) => (false, name),
                None => (true, token),
            };

            let descriptor = match self.get(name) {
                Some(descriptor) => descriptor,
                None => return Err(token.to_string()),
            };

            if enable && !descriptor.is_offerable(availability) {
                return Err(token.to_string());
            }

            changes.push(CapChange {
                id: descriptor.id.clone(),
                enable,
                value: if enable {
                    descriptor.value(availability)
                } else {
                    None
                },
            });
        }

        if changes.is_empty() {
            return Err(String::new());
        }

        Ok(changes)
    }

    /// Tokens newly offered and names withdrawn between two availability
    /// snapshots. A changed value counts as newly offered.
    pub fn diff(
        &self,
        before: &Availability,
        after: &Availability,
        version: u32,
    ) -> (Vec<String>, Vec<String>) {
        let mut added = vec![];
        let mut removed = vec![];

        for descriptor in &self.descriptors {
            match (
                descriptor.is_offerable(before),
                descriptor.is_offerable(after),
            ) {
                (false, true) => added.push(descriptor.token(after, version)),
                (true, false) => removed.push(descriptor.name.clone()),
                (true, true) if descriptor.value(before) != descriptor.value(after) => {
                    added.push(descriptor.token(after, version))
                }
                _ => {}
            }
        }

        (added, removed)
    }

    pub fn name_of(&self, id: &CapabilityId) -> String {
        match id {
            CapabilityId::Known(capability) => capability.name().to_string(),
            CapabilityId::Extension(name) => name.clone(),
        }
    }
}

/// Per-connection negotiated set, with the value seen at ACK time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilitySet {
    enabled: BTreeMap<CapabilityId, Option<String>>,
}

impl CapabilitySet {
    pub fn has(&self, capability: Capability) -> bool {
        self.enabled.contains_key(&CapabilityId::Known(capability))
    }

    pub fn has_id(&self, id: &CapabilityId) -> bool {
        self.enabled.contains_key(id)
    }

    pub fn enable(&mut self, id: CapabilityId, value: Option<String>) {
        self.enabled.insert(id, value);
    }

    pub fn disable(&mut self, id: &CapabilityId) {
        self.enabled.remove(id);
    }

    pub fn apply(&mut self, changes: &[CapChange]) {
        for change in changes {
            if change.enable {
                self.enable(change.id.clone(), change.value.clone());
            } else {
                self.disable(&change.id);
            }
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &CapabilityId> {
        self.enabled.keys()
    }

    pub fn len(&self) -> usize {
        self.enabled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_empty()
    }
}

/// Greedy packing of whole tokens into space-joined chunks no longer than
/// `budget` bytes. A token longer than the budget gets a chunk to itself.
pub fn chunk_tokens(tokens: &[String], budget: usize) -> Vec<String> {
    let mut chunks: Vec<String> = vec![];
    let mut current = String::new();

    for token in tokens {
        if !current.is_empty() && current.len() + 1 + token.len() > budget {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(token);
    }

    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// `CAP <nick> <subcommand> [*] :<tokens>` lines, each within `line_limit`
/// bytes on the wire whatever the client's CAP version. All but the last
/// carry the `*` continuation marker when the client speaks 302; older
/// clients just get several lines.
pub fn cap_lines(
    server_host: &str,
    nick: &str,
    subcommand: &str,
    tokens: &[String],
    version: u32,
    line_limit: usize,
) -> Vec<Message> {
    let overhead = format!(":{} CAP {} {} * :\r\n", server_host, nick, subcommand).len();
    let budget = line_limit.saturating_sub(overhead).max(1);
    let chunks = chunk_tokens(tokens, budget);
    let last = if version >= 302 {
        chunks.len().saturating_sub(1)
    } else {
        chunks.len()
    };

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let message = Message::new("CAP")
                .with_prefix(server_host)
                .with_param(nick)
                .with_param(subcommand);
            let message = if i < last {
                message.with_param("*")
            } else {
                message
            };
            message.with_param(chunk)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn registry() -> (CapabilityRegistry, Availability) {
        let settings = Settings::default();
        (
            CapabilityRegistry::new(&settings),
            Availability::from_settings(&settings),
        )
    }

    #[test]
    fn ls_hides_values_before_302() {
        let (registry, availability) = registry();
        let old = registry.ls_tokens(&availability, 301);
        let new = registry.ls_tokens(&availability, 302);

        assert!(old.contains(&"sasl".to_string()));
        assert!(new.contains(&"sasl=PLAIN,EXTERNAL".to_string()));
        assert!(new.contains(&"draft/multiline=max-bytes=4096,max-lines=24".to_string()));
        assert!(!new.iter().any(|t| t.starts_with("draft/relaymsg")));
    }

    #[test]
    fn disabled_capability_is_not_offered() {
        let (registry, mut availability) = registry();
        availability.disabled.insert("echo-message".to_string());
        assert!(!registry
            .ls_tokens(&availability, 302)
            .contains(&"echo-message".to_string()));
    }

    #[test_case("server-time message-tags" => true ; "all known")]
    #[test_case("server-time bogus-cap" => false ; "one unknown")]
    #[test_case("-batch" => true ; "disable known")]
    #[test_case("draft/relaymsg" => false ; "not offered")]
    #[test_case("" => false ; "empty request")]
    fn request_is_all_or_nothing(request: &str) -> bool {
        let (registry, availability) = registry();
        registry.validate_request(request, &availability).is_ok()
    }

    #[test]
    fn rejected_request_changes_nothing() {
        let (registry, availability) = registry();
        let mut set = CapabilitySet::default();
        set.apply(&registry.validate_request("batch", &availability).unwrap());

        if let Ok(changes) = registry.validate_request("server-time nope", &availability) {
            set.apply(&changes);
        }

        assert!(set.has(Capability::Batch));
        assert!(!set.has(Capability::ServerTime));
        assert_eq!(1, set.len());
    }

    #[test]
    fn request_records_negotiated_value() {
        let (registry, availability) = registry();
        let changes = registry.validate_request("sasl", &availability).unwrap();
        assert_eq!(Some("PLAIN,EXTERNAL".to_string()), changes[0].value);
    }

    #[test]
    fn diff_reports_new_and_deleted() {
        let (registry, before) = registry();
        let mut after = before.clone();
        after.relaymsg = true;
        after.sasl_mechanisms.clear();

        let (added, removed) = registry.diff(&before, &after, 302);
        assert_eq!(vec!["draft/relaymsg=/".to_string()], added);
        assert_eq!(vec!["sasl".to_string()], removed);
    }

    #[test]
    fn extension_capability_can_be_registered() {
        let (mut registry, availability) = registry();
        registry.register(CapabilityDescriptor::extension("vendor.example/widgets"));
        let changes = registry
            .validate_request("vendor.example/widgets", &availability)
            .unwrap();
        assert_eq!(
            CapabilityId::Extension("vendor.example/widgets".to_string()),
            changes[0].id
        );
    }

    #[test]
    fn chunks_never_split_tokens() {
        let tokens: Vec<String> = (0..40).map(|i| format!("token-number-{}", i)).collect();
        let chunks = chunk_tokens(&tokens, 100);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 100));
        let rejoined: Vec<String> = chunks
            .iter()
            .flat_map(|c| c.split(' ').map(str::to_string))
            .collect();
        assert_eq!(tokens, rejoined);
    }

    #[test]
    fn cap_lines_fit_and_mark_continuation() {
        let tokens: Vec<String> = (0..60).map(|i| format!("vendor/cap-{}", i)).collect();
        let lines = cap_lines("irc.example.com", "nick", "LS", &tokens, 302, 512);

        assert!(lines.len() > 1);
        for line in &lines[..lines.len() - 1] {
            assert_eq!(Some("*"), line.param(2));
        }
        assert_ne!(Some("*"), lines[lines.len() - 1].param(2));
        assert!(lines.iter().all(|l| l.encode().len() <= 512));
    }

    #[test]
    fn cap_lines_fit_for_pre_302_clients() {
        let tokens: Vec<String> = (0..60).map(|i| format!("vendor/cap-{}", i)).collect();
        let lines = cap_lines("irc.example.com", "nick", "LS", &tokens, 0, 512);

        assert!(lines.len() > 1);
        assert!(lines.iter().all(|l| l.encode().len() <= 512));
        assert!(lines.iter().all(|l| l.param(2) != Some("*")));
        let rejoined: Vec<String> = lines
            .iter()
            .flat_map(|l| l.param(2).unwrap_or_default().split(' ').map(str::to_string).collect::<Vec<_>>())
            .collect();
        assert_eq!(tokens, rejoined);
    }
}

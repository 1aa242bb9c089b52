// relay-protocol: wire contract and event/filter data model for the relay.
//
// Client -> server and server -> client frames are JSON arrays tagged by
// their first element (`EVENT`, `REQ`, `COUNT`, `CLOSE`, `OK`, `EOSE`,
// `CLOSED`, `NOTICE`), not internally-tagged objects, so `ClientMessage`
// and `RelayMessage` carry hand-written `Serialize`/`Deserialize` impls
// instead of a `#[serde(tag = ...)]` derive.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A single tag: an ordered sequence of strings, e.g. `["e", "<id>", "wss://..."]`.
pub type Tag = Vec<String>;

/// Immutable signed record. See spec.md §3 for field invariants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: i64,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: String,
}

/// Event classes derived from `kind` (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Regular,
    Replaceable,
    Ephemeral,
    Addressable,
    Deletion,
}

impl Event {
    /// Classify this event by its `kind`, per spec.md §3.
    #[must_use]
    pub fn class(&self) -> EventClass {
        classify(self.kind)
    }

    /// The value of the first `d` tag, or `""` if absent. Only meaningful
    /// for addressable events, but well-defined for any event.
    #[must_use]
    pub fn d_tag(&self) -> &str {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some("d"))
            .and_then(|t| t.get(1))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Values of every tag named `name` at position 1 (the tag's "value" slot).
    pub fn tag_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1))
            .map(String::as_str)
    }

    /// Canonical preimage bytes used to compute `id`: the compact JSON
    /// serialization of `[0, pubkey, created_at, kind, tags, content]`.
    #[must_use]
    pub fn canonical_preimage(&self) -> Vec<u8> {
        let arr = serde_json::json!([0, self.pubkey, self.created_at, self.kind, self.tags, self.content]);
        serde_json::to_vec(&arr).expect("canonical form is always serializable")
    }

    /// SHA-256 of the canonical preimage, lowercase hex. Callers compare
    /// this against `id` as part of structural validation.
    #[must_use]
    pub fn computed_id(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_preimage()))
    }

    /// `true` if `id` is a lowercase-hex SHA-256 of the canonical form.
    #[must_use]
    pub fn id_matches_canonical_hash(&self) -> bool {
        self.id == self.computed_id()
    }
}

/// Classify a `kind` value by spec.md §3's ranges. Out-of-range kinds
/// (negative or > 65535) classify as `Regular`; the Validator is
/// responsible for rejecting those before classification matters.
#[must_use]
pub fn classify(kind: i64) -> EventClass {
    match kind {
        5 => EventClass::Deletion,
        0 | 3 | 41 => EventClass::Replaceable,
        k if (10_000..20_000).contains(&k) => EventClass::Replaceable,
        k if (20_000..30_000).contains(&k) => EventClass::Ephemeral,
        k if (30_000..40_000).contains(&k) => EventClass::Addressable,
        _ => EventClass::Regular,
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Conjunction of optional clauses, per spec.md §3. Tag clauses (`#e`,
/// `#p`, ...) are captured via `#[serde(flatten)]` into `tags`, keyed by
/// the full `#<letter>` wire key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(flatten)]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    /// `true` iff every present clause is satisfied by `event`.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (key, values) in &self.tags {
            let Some(letter) = tag_letter(key) else {
                continue;
            };
            let event_values: Vec<&str> = event.tag_values(&letter.to_string()).collect();
            if !values.iter().any(|v| event_values.contains(&v.as_str())) {
                return false;
            }
        }
        true
    }
}

/// `"#e"` -> `Some('e')`; anything else (unrecognized extra field) -> `None`.
fn tag_letter(key: &str) -> Option<char> {
    let mut chars = key.strip_prefix('#')?.chars();
    let letter = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    Some(letter)
}

// ---------------------------------------------------------------------------
// Client -> server messages
// ---------------------------------------------------------------------------

/// A command frame received from a client (spec.md §4.1).
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Event(Box<Event>),
    Req { sub_id: String, filters: Vec<Filter> },
    Count { sub_id: String, filters: Vec<Filter> },
    Close { sub_id: String },
}

impl ClientMessage {
    fn from_value(value: serde_json::Value) -> Result<Self, String> {
        let arr = value
            .as_array()
            .ok_or_else(|| "expected a JSON array frame".to_owned())?;
        let tag = arr
            .first()
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| "frame is missing a command tag".to_owned())?;
        match tag {
            "EVENT" => {
                let raw = arr
                    .get(1)
                    .ok_or_else(|| "EVENT frame missing event body".to_owned())?;
                let event: Event =
                    serde_json::from_value(raw.clone()).map_err(|e| e.to_string())?;
                Ok(Self::Event(Box::new(event)))
            }
            "REQ" | "COUNT" => {
                let sub_id = arr
                    .get(1)
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| format!("{tag} frame missing subscription id"))?
                    .to_owned();
                let mut filters = Vec::with_capacity(arr.len().saturating_sub(2));
                for raw in &arr[2.min(arr.len())..] {
                    filters.push(serde_json::from_value(raw.clone()).map_err(|e| e.to_string())?);
                }
                if tag == "REQ" {
                    Ok(Self::Req { sub_id, filters })
                } else {
                    Ok(Self::Count { sub_id, filters })
                }
            }
            "CLOSE" => {
                let sub_id = arr
                    .get(1)
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| "CLOSE frame missing subscription id".to_owned())?
                    .to_owned();
                Ok(Self::Close { sub_id })
            }
            other => Err(format!("unknown command tag: {other}")),
        }
    }

    fn to_value(&self) -> serde_json::Value {
        match self {
            Self::Event(event) => serde_json::json!(["EVENT", event]),
            Self::Req { sub_id, filters } => {
                let mut arr = vec![serde_json::json!("REQ"), serde_json::json!(sub_id)];
                arr.extend(filters.iter().map(|f| serde_json::to_value(f).unwrap()));
                serde_json::Value::Array(arr)
            }
            Self::Count { sub_id, filters } => {
                let mut arr = vec![serde_json::json!("COUNT"), serde_json::json!(sub_id)];
                arr.extend(filters.iter().map(|f| serde_json::to_value(f).unwrap()));
                serde_json::Value::Array(arr)
            }
            Self::Close { sub_id } => serde_json::json!(["CLOSE", sub_id]),
        }
    }
}

impl Serialize for ClientMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ClientMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Server -> client messages
// ---------------------------------------------------------------------------

/// A reply frame sent to a client (spec.md §4.1).
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        sub_id: String,
        event: Box<Event>,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Eose {
        sub_id: String,
    },
    Count {
        sub_id: String,
        count: u64,
    },
    Closed {
        sub_id: String,
        reason: String,
    },
    Notice {
        message: String,
    },
}

impl RelayMessage {
    #[must_use]
    pub fn event(sub_id: impl Into<String>, event: Event) -> Self {
        Self::Event {
            sub_id: sub_id.into(),
            event: Box::new(event),
        }
    }

    #[must_use]
    pub fn ok(event_id: impl Into<String>, accepted: bool, message: impl Into<String>) -> Self {
        Self::Ok {
            event_id: event_id.into(),
            accepted,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn eose(sub_id: impl Into<String>) -> Self {
        Self::Eose { sub_id: sub_id.into() }
    }

    #[must_use]
    pub fn count(sub_id: impl Into<String>, count: u64) -> Self {
        Self::Count { sub_id: sub_id.into(), count }
    }

    #[must_use]
    pub fn closed(sub_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Closed { sub_id: sub_id.into(), reason: reason.into() }
    }

    #[must_use]
    pub fn notice(message: impl Into<String>) -> Self {
        Self::Notice { message: message.into() }
    }

    fn from_value(value: serde_json::Value) -> Result<Self, String> {
        let arr = value
            .as_array()
            .ok_or_else(|| "expected a JSON array frame".to_owned())?;
        let tag = arr
            .first()
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| "frame is missing a reply tag".to_owned())?;
        match tag {
            "EVENT" => {
                let sub_id = arr
                    .get(1)
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| "EVENT reply missing subscription id".to_owned())?
                    .to_owned();
                let event: Event = serde_json::from_value(
                    arr.get(2)
                        .cloned()
                        .ok_or_else(|| "EVENT reply missing event body".to_owned())?,
                )
                .map_err(|e| e.to_string())?;
                Ok(Self::Event { sub_id, event: Box::new(event) })
            }
            "OK" => {
                let event_id = arr
                    .get(1)
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| "OK reply missing event id".to_owned())?
                    .to_owned();
                let accepted = arr
                    .get(2)
                    .and_then(serde_json::Value::as_bool)
                    .ok_or_else(|| "OK reply missing accepted flag".to_owned())?;
                let message = arr
                    .get(3)
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                Ok(Self::Ok { event_id, accepted, message })
            }
            "EOSE" => {
                let sub_id = arr
                    .get(1)
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| "EOSE reply missing subscription id".to_owned())?
                    .to_owned();
                Ok(Self::Eose { sub_id })
            }
            "COUNT" => {
                let sub_id = arr
                    .get(1)
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| "COUNT reply missing subscription id".to_owned())?
                    .to_owned();
                let count = arr
                    .get(2)
                    .and_then(|v| v.get("count"))
                    .and_then(serde_json::Value::as_u64)
                    .ok_or_else(|| "COUNT reply missing count".to_owned())?;
                Ok(Self::Count { sub_id, count })
            }
            "CLOSED" => {
                let sub_id = arr
                    .get(1)
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| "CLOSED reply missing subscription id".to_owned())?
                    .to_owned();
                let reason = arr
                    .get(2)
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                Ok(Self::Closed { sub_id, reason })
            }
            "NOTICE" => {
                let message = arr
                    .get(1)
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| "NOTICE reply missing message".to_owned())?
                    .to_owned();
                Ok(Self::Notice { message })
            }
            other => Err(format!("unknown reply tag: {other}")),
        }
    }

    fn to_value(&self) -> serde_json::Value {
        match self {
            Self::Event { sub_id, event } => serde_json::json!(["EVENT", sub_id, event]),
            Self::Ok { event_id, accepted, message } => {
                serde_json::json!(["OK", event_id, accepted, message])
            }
            Self::Eose { sub_id } => serde_json::json!(["EOSE", sub_id]),
            Self::Count { sub_id, count } => {
                serde_json::json!(["COUNT", sub_id, { "count": count }])
            }
            Self::Closed { sub_id, reason } => serde_json::json!(["CLOSED", sub_id, reason]),
            Self::Notice { message } => serde_json::json!(["NOTICE", message]),
        }
    }
}

impl Serialize for RelayMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RelayMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        let mut e = Event {
            id: String::new(),
            pubkey: "a".repeat(64),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![],
            content: "hi".to_owned(),
            sig: "b".repeat(128),
        };
        e.id = e.computed_id();
        e
    }

    #[test]
    fn classify_matches_spec_ranges() {
        assert_eq!(classify(1), EventClass::Regular);
        assert_eq!(classify(0), EventClass::Replaceable);
        assert_eq!(classify(3), EventClass::Replaceable);
        assert_eq!(classify(41), EventClass::Replaceable);
        assert_eq!(classify(10_000), EventClass::Replaceable);
        assert_eq!(classify(19_999), EventClass::Replaceable);
        assert_eq!(classify(20_000), EventClass::Ephemeral);
        assert_eq!(classify(29_999), EventClass::Ephemeral);
        assert_eq!(classify(30_000), EventClass::Addressable);
        assert_eq!(classify(39_999), EventClass::Addressable);
        assert_eq!(classify(5), EventClass::Deletion);
        assert_eq!(classify(40_000), EventClass::Regular);
    }

    #[test]
    fn computed_id_is_deterministic_and_detects_tampering() {
        let mut e = sample_event();
        assert!(e.id_matches_canonical_hash());
        e.content.push('!');
        assert!(!e.id_matches_canonical_hash());
    }

    #[test]
    fn d_tag_defaults_to_empty_string() {
        let e = sample_event();
        assert_eq!(e.d_tag(), "");
        let mut e2 = e.clone();
        e2.tags.push(vec!["d".to_owned(), "profile".to_owned()]);
        assert_eq!(e2.d_tag(), "profile");
    }

    #[test]
    fn filter_combines_clauses_conjunctively() {
        let e = sample_event();
        let f = Filter {
            kinds: Some(vec![1]),
            authors: Some(vec![e.pubkey.clone()]),
            ..Default::default()
        };
        assert!(f.matches(&e));

        let f2 = Filter { kinds: Some(vec![2]), ..f.clone() };
        assert!(!f2.matches(&e));
    }

    #[test]
    fn filter_since_after_until_matches_nothing_for_any_created_at() {
        let e = sample_event();
        let f = Filter { since: Some(2_000_000_000), until: Some(1), ..Default::default() };
        assert!(!f.matches(&e));
    }

    #[test]
    fn filter_tag_clause_matches_first_element_letter() {
        let mut e = sample_event();
        e.tags.push(vec!["e".to_owned(), "deadbeef".to_owned()]);
        let mut tags = HashMap::new();
        tags.insert("#e".to_owned(), vec!["deadbeef".to_owned()]);
        let f = Filter { tags, ..Default::default() };
        assert!(f.matches(&e));

        let mut tags2 = HashMap::new();
        tags2.insert("#e".to_owned(), vec!["other".to_owned()]);
        let f2 = Filter { tags: tags2, ..Default::default() };
        assert!(!f2.matches(&e));
    }

    #[test]
    fn client_message_event_round_trips_through_json_array() {
        let e = sample_event();
        let msg = ClientMessage::Event(Box::new(e.clone()));
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::Event(parsed_event) => assert_eq!(*parsed_event, e),
            other => panic!("expected Event, got {other:?}"),
        }
    }

    #[test]
    fn client_message_req_parses_subscription_and_filters() {
        let json = r#"["REQ", "sub1", {"kinds": [1]}, {"authors": ["abc"]}]"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ClientMessage::Req { sub_id, filters } => {
                assert_eq!(sub_id, "sub1");
                assert_eq!(filters.len(), 2);
                assert_eq!(filters[0].kinds, Some(vec![1]));
                assert_eq!(filters[1].authors, Some(vec!["abc".to_owned()]));
            }
            other => panic!("expected Req, got {other:?}"),
        }
    }

    #[test]
    fn client_message_close_parses_subscription_id() {
        let json = r#"["CLOSE", "sub1"]"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, ClientMessage::Close { sub_id: "sub1".to_owned() });
    }

    #[test]
    fn relay_message_ok_serializes_as_four_element_array() {
        let msg = RelayMessage::ok("deadbeef", true, "");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!(["OK", "deadbeef", true, ""]));
    }

    #[test]
    fn relay_message_count_serializes_as_object_payload() {
        let msg = RelayMessage::count("sub1", 3);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!(["COUNT", "sub1", {"count": 3}]));
    }

    #[test]
    fn relay_message_round_trips_for_every_variant() {
        let e = sample_event();
        let variants = vec![
            RelayMessage::event("s", e.clone()),
            RelayMessage::ok(&e.id, false, "invalid: bad signature"),
            RelayMessage::eose("s"),
            RelayMessage::count("s", 7),
            RelayMessage::closed("s", "rate-limited"),
            RelayMessage::notice("server busy"),
        ];
        for msg in variants {
            let json = serde_json::to_string(&msg).unwrap();
            let parsed: RelayMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, msg);
        }
    }
}

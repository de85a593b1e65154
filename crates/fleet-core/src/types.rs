use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Organization (tenant) identifier.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(pub Uuid);

impl OrgId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OrgId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OrgId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// User identifier.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique event identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tenant scope of a configuration row: the platform default or one org.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "org_id", rename_all = "snake_case")]
pub enum Scope {
    Platform,
    Org(OrgId),
}

impl Scope {
    pub fn org_id(&self) -> Option<OrgId> {
        match self {
            Scope::Platform => None,
            Scope::Org(id) => Some(*id),
        }
    }

    pub fn is_org(&self) -> bool {
        matches!(self, Scope::Org(_))
    }

    /// Lookup order for an org: its own scope first, then the platform default.
    pub fn lookup_order(org_id: OrgId) -> [Scope; 2] {
        [Scope::Org(org_id), Scope::Platform]
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::Platform
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Platform => write!(f, "platform"),
            Scope::Org(id) => write!(f, "org:{}", id),
        }
    }
}

/// Delivery channel for notifications and approval requests.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Slack,
    InApp,
    Email,
}

impl Default for Channel {
    fn default() -> Self {
        Channel::Slack
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slack => write!(f, "slack"),
            Self::InApp => write!(f, "in_app"),
            Self::Email => write!(f, "email"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "slack" => Ok(Self::Slack),
            "in_app" | "in-app" | "inapp" => Ok(Self::InApp),
            "email" => Ok(Self::Email),
            other => Err(format!("unknown delivery channel: {}", other)),
        }
    }
}

/// Key/value context carried through a run and into skills.
///
/// Context tiers (e.g. "tier1", "tier3:news") are top-level keys; a tier is
/// present when its key holds a non-null value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    data: BTreeMap<String, serde_json::Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: BTreeMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    /// Build a context from any JSON value. Objects become the key space;
    /// anything else is stored under `value`.
    pub fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(obj) => Self {
                data: obj.into_iter().collect(),
            },
            serde_json::Value::Null => Self::default(),
            other => {
                let mut ctx = Self::default();
                ctx.set("value", other);
                ctx
            }
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Whether a context tier is present (key exists and is not null).
    pub fn has_tier(&self, tier: &str) -> bool {
        self.data.get(tier).is_some_and(|v| !v.is_null())
    }

    /// Resolve a dotted path (`deal.owner.email`, `items.0`) against the context.
    pub fn lookup(&self, path: &str) -> Option<&serde_json::Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.data.get(first)?;
        for part in parts {
            current = match current {
                serde_json::Value::Object(map) => map.get(part)?,
                serde_json::Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Merge another context into this one (overwrites on conflict).
    pub fn merge(&mut self, other: &Context) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.data.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.data.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.data
    }
}

/// Links an event produced by a handoff back to the chain that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Causation {
    /// Run id of the first run in the chain.
    pub chain_id: String,
    /// Number of handoffs between the chain root and this event.
    pub depth: u32,
    pub parent_run_id: RunId,
    pub parent_sequence_key: String,
}

/// A business event entering the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: EventId,
    pub event_type: String,
    pub org_id: OrgId,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub payload: Context,
    /// Caller-supplied idempotency key; the payload hash is used when absent.
    #[serde(default)]
    pub dedup_key: Option<String>,
    #[serde(default)]
    pub causation: Option<Causation>,
    /// Run this exact sequence version instead of the current one.
    #[serde(default)]
    pub pinned_version: Option<u32>,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, org_id: OrgId, payload: Context) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            org_id,
            user_id: None,
            payload,
            dedup_key: None,
            causation: None,
            pinned_version: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn with_causation(mut self, causation: Causation) -> Self {
        self.causation = Some(causation);
        self
    }

    pub fn pin_version(mut self, version: u32) -> Self {
        self.pinned_version = Some(version);
        self
    }

    /// Entity the event is about, used for per-sequence debouncing.
    pub fn entity_id(&self) -> Option<String> {
        match self.payload.get("entity_id")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_basic_operations() {
        let mut ctx = Context::new();
        ctx.set_str("name", "Acme");
        ctx.set("count", serde_json::json!(42));

        assert_eq!(ctx.get_str("name"), Some("Acme"));
        assert_eq!(ctx.get("count"), Some(&serde_json::json!(42)));
        assert_eq!(ctx.get("missing"), None);
    }

    #[test]
    fn test_context_merge_overwrites() {
        let mut a = Context::new();
        a.set_str("a", "1");
        a.set_str("b", "2");
        let mut b = Context::new();
        b.set_str("b", "overwritten");
        b.set_str("c", "3");

        a.merge(&b);
        assert_eq!(a.get_str("a"), Some("1"));
        assert_eq!(a.get_str("b"), Some("overwritten"));
        assert_eq!(a.get_str("c"), Some("3"));
    }

    #[test]
    fn test_has_tier_ignores_null() {
        let ctx = Context::from_value(serde_json::json!({
            "tier1": {"company": "Acme"},
            "tier2": null,
        }));
        assert!(ctx.has_tier("tier1"));
        assert!(!ctx.has_tier("tier2"));
        assert!(!ctx.has_tier("tier3:news"));
    }

    #[test]
    fn test_lookup_dotted_path() {
        let ctx = Context::from_value(serde_json::json!({
            "deal": {"owner": {"email": "rep@acme.test"}, "tags": ["hot", "q3"]},
        }));
        assert_eq!(
            ctx.lookup("deal.owner.email"),
            Some(&serde_json::json!("rep@acme.test"))
        );
        assert_eq!(ctx.lookup("deal.tags.1"), Some(&serde_json::json!("q3")));
        assert_eq!(ctx.lookup("deal.missing"), None);
        assert_eq!(ctx.lookup("deal.owner.email.x"), None);
    }

    #[test]
    fn test_from_value_non_object() {
        let ctx = Context::from_value(serde_json::json!("plain"));
        assert_eq!(ctx.get_str("value"), Some("plain"));
        assert!(Context::from_value(serde_json::Value::Null).is_empty());
    }

    #[test]
    fn test_scope_lookup_order_and_serde() {
        let org = OrgId::new();
        assert_eq!(Scope::lookup_order(org), [Scope::Org(org), Scope::Platform]);

        let json = serde_json::to_value(Scope::Platform).unwrap();
        assert_eq!(json, serde_json::json!({"type": "platform"}));
        let parsed: Scope = serde_json::from_value(serde_json::to_value(Scope::Org(org)).unwrap()).unwrap();
        assert_eq!(parsed, Scope::Org(org));
    }

    #[test]
    fn test_channel_parse() {
        assert_eq!("slack".parse::<Channel>().unwrap(), Channel::Slack);
        assert_eq!("in-app".parse::<Channel>().unwrap(), Channel::InApp);
        assert!("pager".parse::<Channel>().is_err());
    }

    #[test]
    fn test_event_entity_id() {
        let org = OrgId::new();
        let ev = Event::new(
            "deal_stale",
            org,
            Context::from_value(serde_json::json!({"entity_id": 991})),
        );
        assert_eq!(ev.entity_id().as_deref(), Some("991"));

        let ev = Event::new("deal_stale", org, Context::new());
        assert!(ev.entity_id().is_none());
    }
}

//! Join/assembly of split payloads across sources.
//!
//! "Defragmentation" here means combining partial payloads received on
//! different sources (e.g. raw AIS + enriched AIS) into one final payload,
//! keyed by a correlation field chosen by the caller. Fragments wait in a
//! pending table until every required source has contributed, or until they
//! age out.
//!
//! The defragmenter is deliberately not thread-safe and holds no clock of
//! its own: every [`push`](JoinDefragmenter::push) takes the current
//! [`Instant`] from the caller, so tests drive time explicitly and the
//! pipeline serialises access behind its mutex.
use crate::{Payload, Value};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt::Display;
use std::time::{Duration, Instant};

/// How long an incomplete join waits for its missing fragments.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, PartialEq)]
pub enum JoinError {
    /// The defragmenter was constructed without any sources.
    NoSources,

    /// The join-key field is absent (or nil) in a fragment.
    MissingKey(String),

    /// The join-key value has a shape that cannot serve as a key.
    KeyNotHashable {
        field: String,
        kind: &'static str,
    },

    /// A fragment was pushed for a source the defragmenter does not know.
    UnknownSource(String),
}

impl Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::NoSources => "at least one source must be provided",
            Self::MissingKey(field) => &format!("join key {field:?} missing"),
            Self::KeyNotHashable { field, kind } => {
                &format!("join key {field:?} must be a string, integer, float or binary, got {kind}")
            }
            Self::UnknownSource(source) => &format!("source {source:?} is not part of this join"),
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for JoinError {}

/// The extracted value of the correlation field, in a hashable shape.
///
/// Floats key by their bit pattern; integers above `i64::MAX` keep their own
/// variant, so they never collide with the signed range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JoinKey {
    Str(String),
    Int(i64),
    UInt(u64),
    Float(u64),
    Bin(Vec<u8>),
}

// The parts of one key that arrived so far, dated by the first arrival.
struct Inflight {
    created_at: Instant,
    parts: HashMap<String, Payload>,
}

type Build = Box<dyn Fn(&IndexMap<String, Payload>) -> Payload + Send>;

/// Collects per-source payloads by key and emits a merged payload once every
/// required source has contributed.
///
/// # Example
///
/// ```
/// use std::time::Instant;
/// use sterne::{JoinDefragmenter, Payload, Value};
///
/// let mut join = JoinDefragmenter::new(["raw", "enriched"], "msg_uuid").unwrap();
///
/// let mut raw = Payload::new();
/// raw.insert("msg_uuid".to_string(), Value::from("1"));
/// raw.insert("x".to_string(), Value::Int(1));
///
/// let mut enriched = Payload::new();
/// enriched.insert("msg_uuid".to_string(), Value::from("1"));
/// enriched.insert("y".to_string(), Value::Int(2));
///
/// assert!(join.push("raw", raw, Instant::now()).unwrap().is_empty());
/// let merged = join.push("enriched", enriched, Instant::now()).unwrap();
/// assert_eq!(merged.len(), 1);
/// assert_eq!(merged[0].get("x"), Some(&Value::Int(1)));
/// assert_eq!(merged[0].get("y"), Some(&Value::Int(2)));
/// ```
pub struct JoinDefragmenter {
    sources: Vec<String>,
    key: String,
    max_age: Option<Duration>,
    build: Option<Build>,
    pending: HashMap<JoinKey, Inflight>,
}

impl JoinDefragmenter {
    /// Create a defragmenter over the given sources, in declaration order,
    /// joining on the field `key`.
    pub fn new(
        sources: impl IntoIterator<Item = impl Into<String>>,
        key: impl Into<String>,
    ) -> Result<Self, JoinError> {
        let sources: Vec<String> = sources.into_iter().map(Into::into).collect();
        if sources.is_empty() {
            return Err(JoinError::NoSources);
        }

        Ok(Self {
            sources,
            key: key.into(),
            max_age: Some(DEFAULT_MAX_AGE),
            build: None,
            pending: HashMap::new(),
        })
    }

    /// Replace the default TTL. `None` or a zero duration disables eviction,
    /// which keeps tests deterministic.
    pub fn max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age.filter(|age| !age.is_zero());
        self
    }

    /// Replace the default merge with a custom build function. It receives
    /// the parts keyed by source name, in source-declaration order.
    pub fn build_with(
        mut self,
        build: impl Fn(&IndexMap<String, Payload>) -> Payload + Send + 'static,
    ) -> Self {
        self.build = Some(Box::new(build));
        self
    }

    /// The number of keys currently waiting for fragments.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Record `payload` as the fragment of `source` for its key, and return
    /// the merges this completes.
    ///
    /// Stale entries are evicted first, so the pending table stays bounded
    /// by the first-fragment rate times the TTL. A second fragment from the
    /// same source replaces the first one; broker re-deliveries must not
    /// block completion.
    pub fn push(
        &mut self,
        source: &str,
        payload: Payload,
        now: Instant,
    ) -> Result<Vec<Payload>, JoinError> {
        self.evict(now);

        if !self.sources.iter().any(|name| name == source) {
            return Err(JoinError::UnknownSource(source.to_string()));
        }
        let join_key = self.extract_key(&payload)?;

        let inflight = self
            .pending
            .entry(join_key.clone())
            .or_insert_with(|| Inflight {
                created_at: now,
                parts: HashMap::new(),
            });
        inflight.parts.insert(source.to_string(), payload);

        if inflight.parts.len() < self.sources.len() {
            return Ok(Vec::new());
        }

        // The entry is complete. Remove it before handing the merge out, so
        // a late re-delivery starts a fresh entry instead of re-emitting.
        let inflight = self
            .pending
            .remove(&join_key)
            .expect("a complete entry exists, it was touched just above");
        Ok(vec![self.merge(inflight.parts)])
    }

    fn merge(&self, parts: HashMap<String, Payload>) -> Payload {
        let ordered = self.ordered(parts);
        match &self.build {
            Some(build) => build(&ordered),
            None => {
                // Overlay in source-declaration order; the last source wins
                // on conflicting fields.
                let mut merged = Payload::new();
                for (_, part) in ordered {
                    for (field, value) in part {
                        merged.insert(field, value);
                    }
                }
                merged
            }
        }
    }

    // Re-key the arrival-ordered parts into source-declaration order.
    fn ordered(&self, mut parts: HashMap<String, Payload>) -> IndexMap<String, Payload> {
        let mut ordered = IndexMap::with_capacity(parts.len());
        for source in &self.sources {
            if let Some(part) = parts.remove(source) {
                ordered.insert(source.clone(), part);
            }
        }
        ordered
    }

    fn extract_key(&self, payload: &Payload) -> Result<JoinKey, JoinError> {
        let value = payload
            .get(&self.key)
            .filter(|value| !value.is_nil())
            .ok_or_else(|| JoinError::MissingKey(self.key.clone()))?;

        match value {
            Value::Str(value) => Ok(JoinKey::Str(value.clone())),
            Value::Int(value) => Ok(JoinKey::Int(*value)),
            Value::UInt(value) => Ok(JoinKey::UInt(*value)),
            Value::F64(value) => Ok(JoinKey::Float(value.to_bits())),
            Value::Bin(value) => Ok(JoinKey::Bin(value.clone())),
            other => Err(JoinError::KeyNotHashable {
                field: self.key.clone(),
                kind: other.kind(),
            }),
        }
    }

    fn evict(&mut self, now: Instant) {
        let Some(max_age) = self.max_age else { return };
        self.pending
            .retain(|_, inflight| now.duration_since(inflight.created_at) <= max_age);
    }
}

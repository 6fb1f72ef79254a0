//! The bilateral trust registry.
//!
//! Trust between instances is a directed graph: an edge `(source, target)`
//! authorizes `source` to consume data and tokens from `target` under the
//! capability grants recorded on the edge.  Every cross-instance call checks
//! this registry before touching the wire.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::attrs::clearance::Clearance;

//----------- InstanceCode -----------------------------------------------------

/// The alpha-3 code identifying a hub or spoke instance.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceCode([u8; 3]);

impl InstanceCode {
    pub fn as_str(&self) -> &str {
        // The constructor only admits ASCII uppercase letters.
        std::str::from_utf8(&self.0).unwrap()
    }
}

impl FromStr for InstanceCode {
    type Err = InvalidInstanceCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        let bytes = upper.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_uppercase()) {
            return Err(InvalidInstanceCode);
        }
        Ok(InstanceCode([bytes[0], bytes[1], bytes[2]]))
    }
}

impl fmt::Display for InstanceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for InstanceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceCode({})", self.as_str())
    }
}

impl Serialize for InstanceCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for InstanceCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An error parsing an instance code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidInstanceCode;

impl std::error::Error for InvalidInstanceCode {}

impl fmt::Display for InvalidInstanceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("instance codes are three ASCII letters")
    }
}

//----------- TrustLevel -------------------------------------------------------

/// The tier of a trust relationship.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    #[default]
    Development,
    Partner,
    Bilateral,
    Coalition,
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrustLevel::Development => "development",
            TrustLevel::Partner => "partner",
            TrustLevel::Bilateral => "bilateral",
            TrustLevel::Coalition => "coalition",
        })
    }
}

//----------- DataIsolation ----------------------------------------------------

/// How much of the local data plane a trusted peer may see.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataIsolation {
    Minimal,
    #[default]
    Filtered,
    Full,
}

//----------- TrustEdge --------------------------------------------------------

/// A directed trust relationship between two instances.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TrustEdge {
    pub source: InstanceCode,
    pub target: InstanceCode,

    pub trust_level: TrustLevel,

    /// The ceiling for any data crossing this edge.  It dominates the
    /// classification caps of both endpoints.
    pub max_classification: Clearance,

    /// The policy scopes the source may exercise against the target.
    pub allowed_scopes: BTreeSet<String>,

    pub data_isolation: DataIsolation,

    /// A disabled edge is indistinguishable from an absent one.
    pub enabled: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<Timestamp>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<Timestamp>,
}

impl TrustEdge {
    /// Whether the edge authorizes anything at the given time.
    fn active_at(&self, now: Timestamp) -> bool {
        if !self.enabled {
            return false;
        }
        if self.valid_from.is_some_and(|from| now < from) {
            return false;
        }
        if self.valid_to.is_some_and(|to| now > to) {
            return false;
        }
        true
    }
}

//----------- TrustRegistry ----------------------------------------------------

/// The default lifetime of a cached verification result.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// The directed graph of trust edges, with a verification cache.
///
/// The cache is invalidated by the mutation that changes the underlying
/// edge, before the write is acknowledged; TTL expiry is only a backstop.
#[derive(Debug)]
pub struct TrustRegistry {
    state: Mutex<TrustState>,
}

#[derive(Debug)]
struct TrustState {
    edges: foldhash::HashMap<(InstanceCode, InstanceCode), TrustEdge>,
    cache: foldhash::HashMap<(InstanceCode, InstanceCode), CacheEntry>,
    cache_ttl: Duration,
}

#[derive(Clone, Debug)]
struct CacheEntry {
    verdict: Option<TrustEdge>,
    expires: Instant,
}

impl TrustRegistry {
    pub fn new() -> Self {
        Self::with_cache_ttl(DEFAULT_CACHE_TTL)
    }

    pub fn with_cache_ttl(cache_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(TrustState {
                edges: Default::default(),
                cache: Default::default(),
                cache_ttl,
            }),
        }
    }

    /// Verify that `source` is trusted to consume from `target`.
    ///
    /// Returns the edge's grants, or [`None`] if either endpoint is unknown,
    /// the edge is absent or disabled, the validity window excludes now, or
    /// the pair is a self-edge.
    pub fn verify(&self, source: InstanceCode, target: InstanceCode) -> Option<TrustEdge> {
        self.verify_at(source, target, Timestamp::now())
    }

    pub fn verify_at(
        &self,
        source: InstanceCode,
        target: InstanceCode,
        now: Timestamp,
    ) -> Option<TrustEdge> {
        // A self-edge never exists.
        if source == target {
            return None;
        }

        let mut state = self.state.lock().unwrap();
        let key = (source, target);
        let mono_now = Instant::now();

        if let Some(entry) = state.cache.get(&key) {
            if entry.expires > mono_now {
                return entry.verdict.clone();
            }
        }

        let verdict = state
            .edges
            .get(&key)
            .filter(|edge| edge.active_at(now))
            .cloned();
        let expires = mono_now + state.cache_ttl;
        state.cache.insert(
            key,
            CacheEntry {
                verdict: verdict.clone(),
                expires,
            },
        );
        verdict
    }

    /// Insert or replace an edge.
    ///
    /// Self-edges are rejected.  The cached verdict for the pair is dropped
    /// before the new edge becomes visible.
    pub fn upsert(&self, edge: TrustEdge) -> Result<(), SelfEdge> {
        if edge.source == edge.target {
            return Err(SelfEdge);
        }
        let mut state = self.state.lock().unwrap();
        let key = (edge.source, edge.target);
        state.cache.remove(&key);
        state.edges.insert(key, edge);
        Ok(())
    }

    /// Remove an edge.  Returns whether one existed.
    pub fn remove(&self, source: InstanceCode, target: InstanceCode) -> bool {
        let mut state = self.state.lock().unwrap();
        state.cache.remove(&(source, target));
        state.edges.remove(&(source, target)).is_some()
    }

    /// Remove every edge touching an instance (both directions).
    pub fn remove_all_for(&self, code: InstanceCode) -> usize {
        let mut state = self.state.lock().unwrap();
        state.cache.retain(|(s, t), _| *s != code && *t != code);
        let before = state.edges.len();
        state.edges.retain(|(s, t), _| *s != code && *t != code);
        before - state.edges.len()
    }

    /// Fetch an edge without the activity filter (for the admin API).
    pub fn get(&self, source: InstanceCode, target: InstanceCode) -> Option<TrustEdge> {
        let state = self.state.lock().unwrap();
        state.edges.get(&(source, target)).cloned()
    }

    /// All edges, for persistence and listing.
    pub fn edges(&self) -> Vec<TrustEdge> {
        let state = self.state.lock().unwrap();
        let mut edges: Vec<_> = state.edges.values().cloned().collect();
        edges.sort_by_key(|e| (e.source, e.target));
        edges
    }

    /// Replace the whole graph (state-file load).
    pub fn replace_all(&self, edges: impl IntoIterator<Item = TrustEdge>) {
        let mut state = self.state.lock().unwrap();
        state.cache.clear();
        state.edges = edges
            .into_iter()
            .filter(|e| e.source != e.target)
            .map(|e| ((e.source, e.target), e))
            .collect();
    }
}

impl Default for TrustRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//----------- SelfEdge ---------------------------------------------------------

/// An error inserting a self-referential trust edge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelfEdge;

impl std::error::Error for SelfEdge {}

impl fmt::Display for SelfEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an instance cannot hold a trust edge to itself")
    }
}

//============ Tests ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> InstanceCode {
        s.parse().unwrap()
    }

    fn edge(source: &str, target: &str) -> TrustEdge {
        TrustEdge {
            source: code(source),
            target: code(target),
            trust_level: TrustLevel::Bilateral,
            max_classification: Clearance::Secret,
            allowed_scopes: BTreeSet::from(["policy:base".to_owned()]),
            data_isolation: DataIsolation::Filtered,
            enabled: true,
            valid_from: None,
            valid_to: None,
        }
    }

    #[test]
    fn codes_normalize_case() {
        assert_eq!(code("usa"), code("USA"));
        assert!("US".parse::<InstanceCode>().is_err());
        assert!("USAX".parse::<InstanceCode>().is_err());
        assert!("U1A".parse::<InstanceCode>().is_err());
    }

    #[test]
    fn verify_requires_an_edge() {
        let reg = TrustRegistry::new();
        assert!(reg.verify(code("USA"), code("FRA")).is_none());

        reg.upsert(edge("USA", "FRA")).unwrap();
        assert!(reg.verify(code("USA"), code("FRA")).is_some());

        // Edges are directed.
        assert!(reg.verify(code("FRA"), code("USA")).is_none());
    }

    #[test]
    fn self_edges_never_verify() {
        let reg = TrustRegistry::new();
        assert!(reg.upsert(edge("USA", "USA")).is_err());
        for c in ["USA", "FRA", "ZZZ"] {
            assert!(reg.verify(code(c), code(c)).is_none());
        }
    }

    #[test]
    fn disabled_edge_is_absent() {
        let reg = TrustRegistry::new();
        let mut e = edge("USA", "FRA");
        e.enabled = false;
        reg.upsert(e).unwrap();
        assert!(reg.verify(code("USA"), code("FRA")).is_none());
    }

    #[test]
    fn validity_window_is_enforced() {
        let reg = TrustRegistry::with_cache_ttl(Duration::ZERO);
        let now = Timestamp::now();
        let mut e = edge("USA", "FRA");
        e.valid_from = Some(now + Duration::from_secs(60));
        reg.upsert(e.clone()).unwrap();
        assert!(reg.verify_at(code("USA"), code("FRA"), now).is_none());
        assert!(reg
            .verify_at(code("USA"), code("FRA"), now + Duration::from_secs(120))
            .is_some());

        e.valid_from = None;
        e.valid_to = Some(now - Duration::from_secs(1));
        reg.upsert(e).unwrap();
        assert!(reg.verify_at(code("USA"), code("FRA"), now).is_none());
    }

    #[test]
    fn mutation_invalidates_the_cache() {
        // A very long TTL, so only explicit invalidation can explain a
        // changed verdict.
        let reg = TrustRegistry::with_cache_ttl(Duration::from_secs(3600));
        reg.upsert(edge("USA", "FRA")).unwrap();
        assert!(reg.verify(code("USA"), code("FRA")).is_some());

        reg.remove(code("USA"), code("FRA"));
        assert!(reg.verify(code("USA"), code("FRA")).is_none());

        reg.upsert(edge("USA", "FRA")).unwrap();
        assert!(reg.verify(code("USA"), code("FRA")).is_some());
    }

    #[test]
    fn remove_all_for_strips_both_directions() {
        let reg = TrustRegistry::new();
        reg.upsert(edge("USA", "FRA")).unwrap();
        reg.upsert(edge("FRA", "USA")).unwrap();
        reg.upsert(edge("USA", "CAN")).unwrap();

        assert_eq!(reg.remove_all_for(code("FRA")), 2);
        assert!(reg.verify(code("USA"), code("FRA")).is_none());
        assert!(reg.verify(code("FRA"), code("USA")).is_none());
        assert!(reg.verify(code("USA"), code("CAN")).is_some());
    }
}

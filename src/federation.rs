//! Shareable resource descriptors and federation sync state.
//!
//! Each realm keeps a catalog of resource descriptors it may share with
//! paired realms.  Sync cycles push eligible local descriptors out and pull
//! the peer's in; conflicts resolve deterministically, with the origin realm
//! always authoritative for its own resources.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::attrs::clearance::Clearance;
use crate::attrs::CountryCode;
use crate::trust::InstanceCode;

/// Sync results are kept this long.
const SYNC_LOG_TTL: Duration = Duration::from_secs(90 * 24 * 60 * 60);

//----------- FederatedResource ------------------------------------------------

/// Per-peer sync bookkeeping on a resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncStatusEntry {
    pub synced: bool,
    pub timestamp: Timestamp,
    pub version: u64,
}

/// A shareable resource descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederatedResource {
    pub resource_id: String,
    pub title: String,
    pub classification: Clearance,

    /// The countries this resource may be released to.
    pub releasability_to: BTreeSet<CountryCode>,

    /// Community-of-interest tags gating access.
    #[serde(default)]
    pub coi: BTreeSet<String>,

    /// The realm that owns this resource.
    pub origin_realm: InstanceCode,

    /// Monotonic per-resource version.
    pub version: u64,

    pub last_modified: Timestamp,

    /// The peer this copy was imported from, if not locally created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_from: Option<InstanceCode>,

    /// Per-peer sync state.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sync_status: BTreeMap<InstanceCode, SyncStatusEntry>,
}

impl FederatedResource {
    /// Whether this resource may be federated at all.
    ///
    /// TOP_SECRET material never leaves, and a resource releasable to a
    /// single country has no one to go to.
    pub fn eligible(&self) -> bool {
        self.classification < Clearance::TopSecret && self.releasability_to.len() > 1
    }
}

//----------- Conflict records -------------------------------------------------

/// How a conflicting inbound resource was resolved.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    LocalWins,
    RemoteWins,
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictResolution::LocalWins => "local_wins",
            ConflictResolution::RemoteWins => "remote_wins",
        })
    }
}

/// A structured conflict report.  Conflicts are never silently dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub resource_id: String,
    pub local_version: u64,
    pub remote_version: u64,
    pub resolution: ConflictResolution,
    pub reason: String,
}

//----------- SyncResult -------------------------------------------------------

/// The record of one sync cycle against one peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub correlation_id: String,
    pub timestamp: Timestamp,
    pub source: InstanceCode,
    pub target: InstanceCode,

    /// Newly inserted resources.
    pub synced: u32,

    /// Resources where the remote copy won.
    pub updated: u32,

    /// Resources where the local copy won.
    pub conflicted: u32,

    pub conflicts: Vec<ConflictRecord>,

    pub duration_ms: u64,

    /// Whether the cycle was cut short by its deadline.
    #[serde(default)]
    pub partial: bool,
}

/// The inbound half of a cycle, before it is wrapped into a [`SyncResult`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub synced: u32,
    pub updated: u32,
    pub conflicted: u32,
    pub conflicts: Vec<ConflictRecord>,
}

//----------- ResourceStore ----------------------------------------------------

/// The local resource catalog, sync log, and per-pair sync leases.
#[derive(Debug)]
pub struct ResourceStore {
    state: Mutex<StoreState>,
}

#[derive(Debug, Default)]
struct StoreState {
    resources: BTreeMap<String, FederatedResource>,
    sync_log: VecDeque<SyncResult>,
    /// Per-peer sync leases; an expired lease auto-releases.
    leases: foldhash::HashMap<InstanceCode, Instant>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
        }
    }

    //--- Catalog

    /// Insert or update a locally-managed resource, bumping its version.
    pub fn put(&self, mut resource: FederatedResource) -> FederatedResource {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.resources.get(&resource.resource_id) {
            resource.version = existing.version.max(resource.version) + 1;
        }
        state
            .resources
            .insert(resource.resource_id.clone(), resource.clone());
        resource
    }

    pub fn get(&self, resource_id: &str) -> Option<FederatedResource> {
        let state = self.state.lock().unwrap();
        state.resources.get(resource_id).cloned()
    }

    pub fn all(&self) -> Vec<FederatedResource> {
        let state = self.state.lock().unwrap();
        state.resources.values().cloned().collect()
    }

    /// Local-origin resources eligible for push toward a peer realm.
    pub fn eligible_for(
        &self,
        local_realm: InstanceCode,
        peer: InstanceCode,
    ) -> Vec<FederatedResource> {
        // The peer realm code doubles as its country for releasability.
        let peer_country: Option<CountryCode> = peer.as_str().parse().ok();
        let state = self.state.lock().unwrap();
        state
            .resources
            .values()
            .filter(|r| r.origin_realm == local_realm)
            .filter(|r| r.eligible())
            .filter(|r| peer_country.is_some_and(|c| r.releasability_to.contains(&c)))
            .cloned()
            .collect()
    }

    /// Resources releasable to a requesting realm, excluding those that
    /// originated there (the peer-facing GET).
    pub fn releasable_to(
        &self,
        realm: InstanceCode,
        exclude_origin: Option<InstanceCode>,
    ) -> Vec<FederatedResource> {
        let country: Option<CountryCode> = realm.as_str().parse().ok();
        let state = self.state.lock().unwrap();
        state
            .resources
            .values()
            .filter(|r| r.eligible())
            .filter(|r| country.is_some_and(|c| r.releasability_to.contains(&c)))
            .filter(|r| exclude_origin.is_none_or(|code| r.origin_realm != code))
            .cloned()
            .collect()
    }

    //--- Inbound application

    /// Apply the resources pulled from a peer.
    ///
    /// Resolution order, per resource:
    /// 1. unknown locally: insert, marked imported from the peer;
    /// 2. locally-originated: local wins (origin authority);
    /// 3. higher remote version: remote wins;
    /// 4. equal versions: the more recent `last_modified` wins;
    /// 5. otherwise: local wins.
    ///
    /// Identical copies (same version and timestamp) are not counted at all,
    /// so `synced + updated + conflicted` equals the number of inbound
    /// resources that were actually acted on.
    pub fn apply_inbound(
        &self,
        local_realm: InstanceCode,
        peer: InstanceCode,
        inbound: Vec<FederatedResource>,
        now: Timestamp,
    ) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        let mut state = self.state.lock().unwrap();

        for mut remote in inbound {
            match state.resources.get_mut(&remote.resource_id) {
                None => {
                    remote.imported_from = Some(peer);
                    remote.sync_status.insert(
                        peer,
                        SyncStatusEntry {
                            synced: true,
                            timestamp: now,
                            version: remote.version,
                        },
                    );
                    state.resources.insert(remote.resource_id.clone(), remote);
                    outcome.synced += 1;
                }
                Some(local) => {
                    if remote.version == local.version && remote.last_modified == local.last_modified
                    {
                        // An identical copy; nothing to act on.
                        continue;
                    }

                    if local.origin_realm == local_realm {
                        outcome.conflicted += 1;
                        outcome.conflicts.push(ConflictRecord {
                            resource_id: remote.resource_id,
                            local_version: local.version,
                            remote_version: remote.version,
                            resolution: ConflictResolution::LocalWins,
                            reason: "origin realm is authoritative".into(),
                        });
                        continue;
                    }

                    let remote_wins = remote.version > local.version
                        || (remote.version == local.version
                            && remote.last_modified > local.last_modified);

                    if remote_wins {
                        let reason = if remote.version > local.version {
                            "higher remote version"
                        } else {
                            "same version, newer remote timestamp"
                        };
                        outcome.updated += 1;
                        outcome.conflicts.push(ConflictRecord {
                            resource_id: remote.resource_id.clone(),
                            local_version: local.version,
                            remote_version: remote.version,
                            resolution: ConflictResolution::RemoteWins,
                            reason: reason.into(),
                        });
                        remote.imported_from = Some(peer);
                        remote.sync_status = local.sync_status.clone();
                        *local = remote;
                    } else {
                        outcome.conflicted += 1;
                        outcome.conflicts.push(ConflictRecord {
                            resource_id: remote.resource_id,
                            local_version: local.version,
                            remote_version: remote.version,
                            resolution: ConflictResolution::LocalWins,
                            reason: "local copy is newer".into(),
                        });
                    }
                }
            }
        }

        outcome
    }

    /// Mark resources as pushed to a peer.
    pub fn mark_pushed(&self, peer: InstanceCode, resource_ids: &[String], now: Timestamp) {
        let mut state = self.state.lock().unwrap();
        for id in resource_ids {
            if let Some(resource) = state.resources.get_mut(id) {
                let version = resource.version;
                resource.sync_status.insert(
                    peer,
                    SyncStatusEntry {
                        synced: true,
                        timestamp: now,
                        version,
                    },
                );
            }
        }
    }

    //--- Sync leases

    /// Try to take the sync lease for a peer pair.
    ///
    /// Returns `false` while another cycle holds an unexpired lease.  An
    /// expired lease auto-releases, so a crashed worker cannot wedge the
    /// pair.
    pub fn acquire_sync_lease(&self, peer: InstanceCode, ttl: Duration, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.leases.get(&peer) {
            Some(&expires) if expires > now => false,
            _ => {
                state.leases.insert(peer, now + ttl);
                true
            }
        }
    }

    pub fn release_sync_lease(&self, peer: InstanceCode) {
        let mut state = self.state.lock().unwrap();
        state.leases.remove(&peer);
    }

    //--- Sync log

    /// Append a sync result, pruning entries past their retention.
    pub fn record_sync_result(&self, result: SyncResult) {
        let mut state = self.state.lock().unwrap();
        let cutoff = result.timestamp - SYNC_LOG_TTL;
        while let Some(front) = state.sync_log.front() {
            if front.timestamp < cutoff {
                state.sync_log.pop_front();
            } else {
                break;
            }
        }
        state.sync_log.push_back(result);
    }

    pub fn sync_log(&self) -> Vec<SyncResult> {
        let state = self.state.lock().unwrap();
        state.sync_log.iter().cloned().collect()
    }

    /// The number of trailing sync failures per peer is derived elsewhere;
    /// here we only expose the most recent result per peer.
    pub fn last_sync(&self, peer: InstanceCode) -> Option<SyncResult> {
        let state = self.state.lock().unwrap();
        state
            .sync_log
            .iter()
            .rev()
            .find(|r| r.target == peer)
            .cloned()
    }

    //--- Persistence

    pub fn snapshot(&self) -> (Vec<FederatedResource>, Vec<SyncResult>) {
        let state = self.state.lock().unwrap();
        (
            state.resources.values().cloned().collect(),
            state.sync_log.iter().cloned().collect(),
        )
    }

    pub fn replace_all(&self, resources: Vec<FederatedResource>, sync_log: Vec<SyncResult>) {
        let mut state = self.state.lock().unwrap();
        state.resources = resources
            .into_iter()
            .map(|r| (r.resource_id.clone(), r))
            .collect();
        state.sync_log = sync_log.into();
        state.leases.clear();
    }
}

impl Default for ResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

//============ Tests ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> InstanceCode {
        s.parse().unwrap()
    }

    fn country(s: &str) -> CountryCode {
        s.parse().unwrap()
    }

    fn resource(id: &str, origin: &str, version: u64) -> FederatedResource {
        FederatedResource {
            resource_id: id.into(),
            title: format!("resource {id}"),
            classification: Clearance::Secret,
            releasability_to: BTreeSet::from([country("USA"), country("FRA")]),
            coi: BTreeSet::new(),
            origin_realm: code(origin),
            version,
            last_modified: "2026-07-01T00:00:00Z".parse().unwrap(),
            imported_from: None,
            sync_status: BTreeMap::new(),
        }
    }

    #[test]
    fn top_secret_is_never_federated() {
        let mut r = resource("r1", "FRA", 1);
        r.classification = Clearance::TopSecret;
        assert!(!r.eligible());
    }

    #[test]
    fn single_country_is_never_federated() {
        let mut r = resource("r1", "FRA", 1);
        r.releasability_to = BTreeSet::from([country("FRA")]);
        assert!(!r.eligible());
    }

    #[test]
    fn eligible_for_filters_origin_and_releasability() {
        let store = ResourceStore::new();
        store.put(resource("mine", "FRA", 1));
        store.put(resource("theirs", "USA", 1));
        let mut narrow = resource("narrow", "FRA", 1);
        narrow.releasability_to = BTreeSet::from([country("FRA"), country("DEU")]);
        store.put(narrow);

        let eligible = store.eligible_for(code("FRA"), code("USA"));
        let ids: Vec<&str> = eligible.iter().map(|r| r.resource_id.as_str()).collect();
        assert_eq!(ids, ["mine"]);
    }

    #[test]
    fn new_inbound_resources_are_inserted() {
        let store = ResourceStore::new();
        let now = Timestamp::now();

        let outcome =
            store.apply_inbound(code("FRA"), code("USA"), vec![resource("r1", "USA", 2)], now);
        assert_eq!((outcome.synced, outcome.updated, outcome.conflicted), (1, 0, 0));

        let imported = store.get("r1").unwrap();
        assert_eq!(imported.imported_from, Some(code("USA")));
    }

    #[test]
    fn origin_realm_is_authoritative() {
        let store = ResourceStore::new();
        store.put(resource("r1", "FRA", 3));
        let now = Timestamp::now();

        // A peer echoes back a higher version of our own resource.
        let mut remote = resource("r1", "FRA", 9);
        remote.last_modified = now;
        let outcome = store.apply_inbound(code("FRA"), code("USA"), vec![remote], now);

        assert_eq!((outcome.synced, outcome.updated, outcome.conflicted), (0, 0, 1));
        assert_eq!(outcome.conflicts[0].resolution, ConflictResolution::LocalWins);
        assert_eq!(store.get("r1").unwrap().version, 3);
    }

    #[test]
    fn higher_remote_version_wins() {
        // Scenario S6: local FRA-origin copy at USA realm, remote newer.
        let store = ResourceStore::new();
        let mut local = resource("r1", "FRA", 3);
        local.imported_from = Some(code("FRA"));
        store.replace_all(vec![local], Vec::new());

        let t2: Timestamp = "2026-07-15T00:00:00Z".parse().unwrap();
        let mut remote = resource("r1", "FRA", 5);
        remote.last_modified = t2;

        let outcome = store.apply_inbound(code("USA"), code("FRA"), vec![remote], Timestamp::now());
        assert_eq!((outcome.synced, outcome.updated, outcome.conflicted), (0, 1, 0));
        assert_eq!(
            outcome.conflicts[0].resolution,
            ConflictResolution::RemoteWins
        );

        let updated = store.get("r1").unwrap();
        assert_eq!(updated.version, 5);
        assert_eq!(updated.last_modified, t2);
    }

    #[test]
    fn equal_versions_compare_timestamps() {
        let store = ResourceStore::new();
        let mut local = resource("r1", "FRA", 3);
        local.imported_from = Some(code("FRA"));
        store.replace_all(vec![local.clone()], Vec::new());

        // Older remote timestamp: local wins.
        let mut remote = local.clone();
        remote.last_modified = local.last_modified - Duration::from_secs(3600);
        let outcome = store.apply_inbound(
            code("USA"),
            code("FRA"),
            vec![remote],
            Timestamp::now(),
        );
        assert_eq!((outcome.synced, outcome.updated, outcome.conflicted), (0, 0, 1));

        // Newer remote timestamp: remote wins.
        let mut remote = local.clone();
        remote.last_modified = local.last_modified + Duration::from_secs(3600);
        let outcome = store.apply_inbound(
            code("USA"),
            code("FRA"),
            vec![remote],
            Timestamp::now(),
        );
        assert_eq!((outcome.synced, outcome.updated, outcome.conflicted), (0, 1, 0));
    }

    #[test]
    fn identical_copies_are_not_counted() {
        let store = ResourceStore::new();
        let mut local = resource("r1", "FRA", 3);
        local.imported_from = Some(code("FRA"));
        store.replace_all(vec![local.clone()], Vec::new());

        let outcome = store.apply_inbound(
            code("USA"),
            code("FRA"),
            vec![local],
            Timestamp::now(),
        );
        assert_eq!(outcome, SyncOutcome::default());
    }

    #[test]
    fn outcome_counters_partition_the_inbound_set() {
        let store = ResourceStore::new();
        store.put(resource("ours", "USA", 5));
        let mut imported = resource("import", "FRA", 2);
        imported.imported_from = Some(code("FRA"));
        store.replace_all(
            vec![store.get("ours").unwrap(), imported],
            Vec::new(),
        );

        let now = Timestamp::now();
        let mut newer = resource("import", "FRA", 4);
        newer.last_modified = now;
        let mut echo = resource("ours", "USA", 9);
        echo.last_modified = now;
        let inbound = vec![resource("fresh", "FRA", 1), newer, echo];
        let accepted = inbound.len() as u32;

        let outcome = store.apply_inbound(code("USA"), code("FRA"), inbound, now);
        assert_eq!(
            outcome.synced + outcome.updated + outcome.conflicted,
            accepted
        );
    }

    #[test]
    fn leases_coalesce_overlapping_cycles() {
        let store = ResourceStore::new();
        let now = Instant::now();
        let ttl = Duration::from_secs(120);

        assert!(store.acquire_sync_lease(code("FRA"), ttl, now));
        assert!(!store.acquire_sync_lease(code("FRA"), ttl, now + Duration::from_secs(1)));

        // A different pair is unaffected.
        assert!(store.acquire_sync_lease(code("DEU"), ttl, now));

        // Expired leases auto-release.
        assert!(store.acquire_sync_lease(code("FRA"), ttl, now + Duration::from_secs(121)));

        store.release_sync_lease(code("DEU"));
        assert!(store.acquire_sync_lease(code("DEU"), ttl, now + Duration::from_secs(1)));
    }

    #[test]
    fn sync_log_prunes_by_age() {
        let store = ResourceStore::new();
        let old: Timestamp = "2026-01-01T00:00:00Z".parse().unwrap();
        let fresh: Timestamp = "2026-07-01T00:00:00Z".parse().unwrap();

        let result = |ts: Timestamp| SyncResult {
            correlation_id: "c".into(),
            timestamp: ts,
            source: code("USA"),
            target: code("FRA"),
            synced: 0,
            updated: 0,
            conflicted: 0,
            conflicts: Vec::new(),
            duration_ms: 10,
            partial: false,
        };

        store.record_sync_result(result(old));
        store.record_sync_result(result(fresh));
        let log = store.sync_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].timestamp, fresh);

        assert_eq!(store.last_sync(code("FRA")).unwrap().timestamp, fresh);
        assert!(store.last_sync(code("DEU")).is_none());
    }

    #[test]
    fn mark_pushed_updates_sync_status() {
        let store = ResourceStore::new();
        store.put(resource("r1", "FRA", 1));
        let now = Timestamp::now();

        store.mark_pushed(code("USA"), &["r1".to_owned()], now);
        let r = store.get("r1").unwrap();
        let entry = r.sync_status.get(&code("USA")).unwrap();
        assert!(entry.synced);
        assert_eq!(entry.version, 1);
    }
}

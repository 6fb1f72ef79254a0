//! The hub's central command.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

use crate::attrs::clearance::ClearanceStore;
use crate::attrs::Normalizer;
use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::bundle::{BuildError, BundleBuilder, BundleOptions, BundlePointer, VersionCursor};
use crate::config::Config;
use crate::exchange::ExchangeEngine;
use crate::federation::ResourceStore;
use crate::manager::{ApplicationCommand, Update};
use crate::metrics::MetricsCollection;
use crate::spoke::cert::CertificateWarning;
use crate::spoke::{
    ApproveError, HeartbeatStats, RegisterError, RegisterRequest, RevokeError, SpokeId,
    SpokeRecord, SpokeRegistry, SuspendError, TrustGrant,
};
use crate::trust::{InstanceCode, TrustEdge, TrustRegistry};

//----------- Center -----------------------------------------------------------

/// The hub's central command.
///
/// Each registry component owns its state behind its own coarse mutex;
/// nothing here holds a lock across I/O.
#[derive(Debug)]
pub struct Center {
    /// The configuration.
    pub config: Config,

    /// The spoke registry.
    pub spokes: Arc<SpokeRegistry>,

    /// The bilateral trust registry.
    pub trust: Arc<TrustRegistry>,

    /// Per-target circuit breakers.
    pub breakers: Arc<BreakerRegistry>,

    /// The clearance equivalency store.
    pub clearance: Arc<ClearanceStore>,

    /// The attribute normalizer.
    pub normalizer: Normalizer,

    /// The federated resource catalog.
    pub resources: Arc<ResourceStore>,

    /// The metrics collection.
    pub metrics: MetricsCollection,

    /// The token exchange engine.
    pub exchange: ExchangeEngine,

    /// The bundle builder.
    pub builder: BundleBuilder,

    /// The bundle version cursor and current-pointer commit point.
    pub bundles: Mutex<BundleState>,

    /// The latest published bundle pointer, for lock-free readers.
    pub current_bundle: ArcSwapOption<BundlePointer>,

    /// The trusted-issuers snapshot derived from approved spokes.
    pub trusted_issuers: ArcSwap<TrustedIssuers>,

    /// An enqueued save of the global state.
    pub persist: Mutex<PersistState>,

    /// A channel to send units commands.
    pub app_cmd_tx: mpsc::UnboundedSender<(String, ApplicationCommand)>,

    /// A channel to send the central command updates.
    pub update_tx: mpsc::UnboundedSender<Update>,
}

/// Bundle sequencing state.
#[derive(Debug, Default)]
pub struct BundleState {
    /// The daily version sequence.
    pub cursor: VersionCursor,

    /// The current bundle, as durably committed.
    pub current: Option<BundlePointer>,
}

/// Persistence bookkeeping.
#[derive(Debug, Default)]
pub struct PersistState {
    /// The enqueued save operation will persist the current state in a
    /// short duration of time.  If the field is `None`, and the state is
    /// changed, a new save operation should be enqueued.
    pub enqueued_save: Option<tokio::task::JoinHandle<()>>,
}

impl Center {
    /// Assemble the hub from its configuration.
    ///
    /// The signing key is loaded by the caller (it may legitimately be
    /// absent; signed builds then fail with a fatal error).
    pub fn new(
        config: Config,
        signing_key: Option<ring::signature::Ed25519KeyPair>,
        app_cmd_tx: mpsc::UnboundedSender<(String, ApplicationCommand)>,
        update_tx: mpsc::UnboundedSender<Update>,
    ) -> Arc<Self> {
        let spokes = Arc::new(SpokeRegistry::new(config.federation.heartbeat_interval));
        let trust = Arc::new(TrustRegistry::new());
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
        let clearance = Arc::new(ClearanceStore::with_defaults());

        let exchange = ExchangeEngine::new(
            config.instance_code,
            &config.federation,
            trust.clone(),
            breakers.clone(),
            spokes.clone(),
        );
        let builder = BundleBuilder::new(
            config.policy_dir.clone(),
            config.artifact_dir(),
            signing_key,
            config.signing.key_id.clone(),
        );

        Arc::new(Center {
            normalizer: Normalizer::new(clearance.clone()),
            spokes,
            trust,
            breakers,
            clearance,
            resources: Arc::new(ResourceStore::new()),
            metrics: MetricsCollection::new(),
            exchange,
            builder,
            bundles: Mutex::new(BundleState::default()),
            current_bundle: ArcSwapOption::empty(),
            trusted_issuers: ArcSwap::from_pointee(TrustedIssuers::default()),
            persist: Mutex::new(PersistState::default()),
            app_cmd_tx,
            update_tx,
            config,
        })
    }

    /// Mark the global state as dirty.
    ///
    /// A persistence operation for the global state will be enqueued (unless
    /// one already exists), so that it will be saved in the near future.
    pub fn mark_dirty(self: &Arc<Self>) {
        let mut persist = self.persist.lock().unwrap();
        if persist.enqueued_save.is_some() {
            // A save is already enqueued; nothing to do.
            return;
        }

        // Enqueue a new save.
        let center = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;

            let (path, spec);
            {
                let mut persist = center.persist.lock().unwrap();
                let Some(_) = persist
                    .enqueued_save
                    .take_if(|s| s.id() == tokio::task::id())
                else {
                    // 'enqueued_save' does not match what we set, so somebody
                    // else set it to 'None' first.  Don't do anything.
                    trace!("Ignoring enqueued save due to race");
                    return;
                };

                path = center.config.state_file();
                spec = crate::state::Spec::build(&center);
            }

            match spec.save(&path) {
                Ok(()) => debug!("Saved global state (to '{path}')"),
                Err(err) => {
                    error!("Could not save global state to '{path}': {err}");
                }
            }
        });
        persist.enqueued_save = Some(task);
    }

    /// Persist the global state immediately.
    pub fn save_state_now(self: &Arc<Self>) {
        let path = self.config.state_file();
        {
            let mut persist = self.persist.lock().unwrap();
            if let Some(save) = persist.enqueued_save.take() {
                save.abort();
            }
        }
        let spec = crate::state::Spec::build(self);
        match spec.save(&path) {
            Ok(()) => debug!("Saved global state (to '{path}')"),
            Err(err) => error!("Could not save global state to '{path}': {err}"),
        }
    }

    fn emit(&self, change: Change) {
        // The receiver lives for the whole daemon; a send failure means we
        // are shutting down and the event is moot.
        let _ = self.update_tx.send(Update::Changed(change));
    }
}

//----------- TrustedIssuers ---------------------------------------------------

/// The ground-truth list of identity providers peers may accept.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TrustedIssuers {
    /// Bumped on every rebuild.
    pub revision: u64,

    pub issuers: Vec<TrustedIssuer>,
}

/// One approved spoke's identity provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TrustedIssuer {
    pub instance_code: InstanceCode,
    pub name: String,
    pub idp_url: url::Url,
    pub certificate_fingerprint: String,
}

//--- Actions

/// Register a new spoke.
pub fn register_spoke(
    center: &Arc<Center>,
    req: RegisterRequest,
) -> Result<(SpokeRecord, Vec<CertificateWarning>), RegisterError> {
    let (record, warnings) = center.spokes.register(req)?;

    for warning in &warnings {
        info!(
            "Certificate warning for spoke '{}': {warning}",
            record.spoke_id
        );
    }

    center.emit(Change::SpokeRegistered(record.spoke_id.clone()));
    center.mark_dirty();
    info!(
        "Registered spoke '{}' for instance {}",
        record.spoke_id, record.instance_code
    );
    Ok((record, warnings))
}

/// Approve a pending spoke.
///
/// Approval writes the capability grant, creates the bilateral trust edges,
/// refreshes the trusted-issuers snapshot, and kicks off a bundle rebuild
/// and publish via the central command.
pub fn approve_spoke(
    center: &Arc<Center>,
    spoke_id: &SpokeId,
    approver: &str,
    grant: TrustGrant,
) -> Result<SpokeRecord, ApproveError> {
    let record = center.spokes.approve(spoke_id, approver, grant.clone())?;
    let hub = center.config.instance_code;
    let spoke = record.instance_code;

    // Bilateral agreement: both directions carry the approved grant.  The
    // upserts invalidate the trust cache before anyone can observe the new
    // status.
    for (source, target) in [(hub, spoke), (spoke, hub)] {
        let edge = TrustEdge {
            source,
            target,
            trust_level: grant.trust_level,
            max_classification: grant.max_classification,
            allowed_scopes: grant.allowed_scopes.clone(),
            data_isolation: Default::default(),
            enabled: true,
            valid_from: None,
            valid_to: None,
        };
        if let Err(err) = center.trust.upsert(edge) {
            // Only reachable if a spoke registered the hub's own code.
            error!("Could not create trust edge {source} -> {target}: {err}");
        }
    }

    rebuild_trusted_issuers(center);
    center.emit(Change::SpokeApproved {
        spoke_id: record.spoke_id.clone(),
        instance_code: spoke,
    });
    center.mark_dirty();
    info!("Approved spoke '{}' ({spoke})", record.spoke_id);
    Ok(record)
}

/// Suspend an approved spoke.
///
/// Tokens die with the status change; the trust edges are disabled (which
/// is indistinguishable from absent to every authorization check) and the
/// issuer list shrinks.
pub fn suspend_spoke(
    center: &Arc<Center>,
    spoke_id: &SpokeId,
    reason: &str,
) -> Result<SpokeRecord, SuspendError> {
    let record = center.spokes.suspend(spoke_id, reason)?;
    let hub = center.config.instance_code;
    let spoke = record.instance_code;

    for (source, target) in [(hub, spoke), (spoke, hub)] {
        if let Some(mut edge) = center.trust.get(source, target) {
            edge.enabled = false;
            let _ = center.trust.upsert(edge);
        }
    }

    rebuild_trusted_issuers(center);
    center.emit(Change::SpokeSuspended {
        spoke_id: record.spoke_id.clone(),
        instance_code: spoke,
        reason: reason.to_owned(),
    });
    center.mark_dirty();
    info!("Suspended spoke '{}' ({spoke}): {reason}", record.spoke_id);
    Ok(record)
}

/// Revoke a spoke.  Terminal.
pub fn revoke_spoke(
    center: &Arc<Center>,
    spoke_id: &SpokeId,
    reason: &str,
) -> Result<SpokeRecord, RevokeError> {
    let record = center.spokes.revoke(spoke_id, reason)?;
    let spoke = record.instance_code;

    center.trust.remove_all_for(spoke);
    rebuild_trusted_issuers(center);
    center.emit(Change::SpokeRevoked {
        spoke_id: record.spoke_id.clone(),
        instance_code: spoke,
        reason: reason.to_owned(),
    });
    center.mark_dirty();
    info!("Revoked spoke '{}' ({spoke}): {reason}", record.spoke_id);
    Ok(record)
}

/// Record a spoke heartbeat.
pub fn record_heartbeat(
    center: &Arc<Center>,
    spoke_id: &SpokeId,
    stats: HeartbeatStats,
) -> Result<(), crate::spoke::HeartbeatError> {
    let result = center.spokes.record_heartbeat(spoke_id, stats);
    center
        .metrics
        .record_heartbeat(result.is_ok() && stats.data_plane_connected);
    result
}

/// Insert or replace a trust edge by admin request.
pub fn upsert_trust_edge(center: &Arc<Center>, edge: TrustEdge) -> Result<(), crate::trust::SelfEdge> {
    let (source, target) = (edge.source, edge.target);
    center.trust.upsert(edge)?;
    center.emit(Change::TrustEdgeChanged { source, target });
    center.mark_dirty();
    info!("Trust edge {source} -> {target} updated");
    Ok(())
}

/// Remove a trust edge by admin request.  Returns whether one existed.
pub fn remove_trust_edge(
    center: &Arc<Center>,
    source: InstanceCode,
    target: InstanceCode,
) -> bool {
    let removed = center.trust.remove(source, target);
    if removed {
        center.emit(Change::TrustEdgeChanged { source, target });
        center.mark_dirty();
        info!("Trust edge {source} -> {target} removed");
    }
    removed
}

/// Atomically replace a country's clearance vocabulary.
pub fn replace_clearance_vocabulary(
    center: &Arc<Center>,
    country: crate::attrs::CountryCode,
    entries: std::collections::BTreeMap<
        crate::attrs::clearance::Clearance,
        crate::attrs::clearance::EquivalencyEntry,
    >,
) -> Result<(), crate::attrs::clearance::EquivalencyError> {
    center.clearance.replace_country(country, entries)?;
    center.mark_dirty();
    info!("Replaced the clearance vocabulary for {country}");
    Ok(())
}

/// Rebuild the trusted-issuers snapshot from the approved spokes.
pub fn rebuild_trusted_issuers(center: &Arc<Center>) -> Arc<TrustedIssuers> {
    let mut issuers: Vec<TrustedIssuer> = center
        .spokes
        .with_status(crate::spoke::SpokeStatus::Approved)
        .into_iter()
        .map(|s| TrustedIssuer {
            instance_code: s.instance_code,
            name: s.name,
            idp_url: s.idp_url,
            certificate_fingerprint: s.certificate.fingerprint,
        })
        .collect();
    issuers.sort_by_key(|i| i.instance_code);

    let revision = center.trusted_issuers.load().revision + 1;
    let snapshot = Arc::new(TrustedIssuers { revision, issuers });
    center.trusted_issuers.store(snapshot.clone());
    snapshot
}

/// Build a bundle and commit it as current.
///
/// The version is allocated under the bundle lock, the filesystem work runs
/// without it, and the pointer commit re-takes the lock with a monotonicity
/// check, so a slow build can never roll the current pointer backwards.
pub fn build_bundle(
    center: &Arc<Center>,
    options: &BundleOptions,
) -> Result<BundlePointer, BuildError> {
    let now = Timestamp::now();
    let version = {
        let mut bundles = center.bundles.lock().unwrap();
        bundles.cursor.allocate(now)
    };

    let inline_data = ground_truth_data(center);
    let pointer = center
        .builder
        .build(options, version, &inline_data, now)?;

    {
        let mut bundles = center.bundles.lock().unwrap();
        let stale = bundles
            .current
            .as_ref()
            .is_some_and(|current| current.version >= pointer.version);
        if stale {
            // A later build committed while we were hashing; keep it.
            debug!(
                "Not repointing: current bundle is newer than {}",
                pointer.version
            );
        } else {
            bundles.current = Some(pointer.clone());
            center.current_bundle.store(Some(Arc::new(pointer.clone())));
        }
    }

    center.emit(Change::BundleBuilt {
        version: pointer.version.clone(),
        hash: pointer.hash.clone(),
    });
    center.mark_dirty();
    info!(
        "Built bundle {} ({}, {} files)",
        pointer.version, pointer.bundle_id, pointer.file_count
    );
    Ok(pointer)
}

/// The ground-truth data files embedded in bundles and pushed inline.
///
/// Serialized from ordered structures, so identical state produces
/// byte-identical files (and therefore identical bundle hashes).
pub fn ground_truth_data(center: &Arc<Center>) -> Vec<(String, Vec<u8>)> {
    let issuers = center.trusted_issuers.load();
    let edges = center.trust.edges();
    let equivalency = center.clearance.snapshot();

    [
        ("trusted-issuers.json", serde_json::to_vec_pretty(&issuers.issuers)),
        ("federation-matrix.json", serde_json::to_vec_pretty(&edges)),
        (
            "clearance-equivalency.json",
            serde_json::to_vec_pretty(&equivalency),
        ),
    ]
    .into_iter()
    .map(|(path, bytes)| {
        (
            path.to_owned(),
            bytes.expect("ground-truth data structures serialize"),
        )
    })
    .collect()
}

/// Note a fresh policy snapshot toward a target, for degraded-mode
/// decisions while its circuit is open.
pub fn note_policy_cache(center: &Arc<Center>, target: InstanceCode, ttl: Duration) {
    center
        .breakers
        .note_policy_cache(target, Instant::now() + ttl);
}

//----------- Change -----------------------------------------------------------

/// A change to global state.
#[derive(Clone, Debug)]
pub enum Change {
    /// A spoke has been registered.
    SpokeRegistered(SpokeId),

    /// A spoke has been approved.
    SpokeApproved {
        spoke_id: SpokeId,
        instance_code: InstanceCode,
    },

    /// A spoke has been suspended.
    SpokeSuspended {
        spoke_id: SpokeId,
        instance_code: InstanceCode,
        reason: String,
    },

    /// A spoke has been revoked.
    SpokeRevoked {
        spoke_id: SpokeId,
        instance_code: InstanceCode,
        reason: String,
    },

    /// A trust edge was created, updated or removed by the admin API.
    TrustEdgeChanged {
        source: InstanceCode,
        target: InstanceCode,
    },

    /// A bundle has been built and committed as current.
    BundleBuilt { version: String, hash: String },

    /// The current bundle has been pushed to the data plane.
    BundlePublished { version: String },

    /// A circuit breaker opened toward a target.
    CircuitOpened(InstanceCode),

    /// A circuit breaker closed toward a target.
    CircuitClosed(InstanceCode),

    /// A target entered maintenance mode.
    MaintenanceEntered(InstanceCode),

    /// A target left maintenance mode.
    MaintenanceExited(InstanceCode),
}

//============ Tests ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::clearance::Clearance;
    use crate::trust::TrustLevel;
    use camino::Utf8PathBuf;
    use std::collections::BTreeSet;

    struct Fixture {
        _tmp: tempfile::TempDir,
        center: Arc<Center>,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();

        let policy_dir = root.join("policies");
        std::fs::create_dir_all(policy_dir.join("base").as_std_path()).unwrap();
        std::fs::write(
            policy_dir.join("base/access.rego").as_std_path(),
            "package base.access\n",
        )
        .unwrap();

        let mut config = crate::config::Spec::default().parse().unwrap();
        config.instance_code = "HUB".parse().unwrap();
        config.data_dir = root.join("data");
        config.policy_dir = policy_dir;
        config.federation.jwt_secret = "test-secret".into();

        let (app_cmd_tx, _app_cmd_rx) = mpsc::unbounded_channel();
        let (update_tx, _update_rx) = mpsc::unbounded_channel();
        let center = Center::new(config, None, app_cmd_tx, update_tx);
        Fixture { _tmp: tmp, center }
    }

    fn register_request(code: &str) -> RegisterRequest {
        let pem = rcgen::generate_simple_self_signed(vec!["spoke.example".to_owned()])
            .unwrap()
            .cert
            .pem();
        RegisterRequest {
            instance_code: code.parse().unwrap(),
            name: format!("{code} instance"),
            base_url: "https://spoke.example".parse().unwrap(),
            api_url: "https://api.spoke.example".parse().unwrap(),
            idp_url: "https://idp.spoke.example".parse().unwrap(),
            certificate_pem: pem,
            contact_email: "ops@spoke.example".into(),
        }
    }

    fn grant() -> TrustGrant {
        TrustGrant {
            trust_level: TrustLevel::Bilateral,
            max_classification: Clearance::Secret,
            allowed_scopes: BTreeSet::from(["policy:base".to_owned()]),
        }
    }

    #[tokio::test]
    async fn approval_creates_bilateral_edges_and_issuers() {
        let f = fixture();
        let hub: InstanceCode = "HUB".parse().unwrap();
        let fra: InstanceCode = "FRA".parse().unwrap();

        let (record, _) = register_spoke(&f.center, register_request("FRA")).unwrap();
        // A pending spoke grants nothing yet.
        assert!(f.center.trust.verify(hub, fra).is_none());
        assert!(f.center.trusted_issuers.load().issuers.is_empty());

        approve_spoke(&f.center, &record.spoke_id, "admin", grant()).unwrap();

        let edge = f.center.trust.verify(hub, fra).unwrap();
        assert_eq!(edge.max_classification, Clearance::Secret);
        assert!(f.center.trust.verify(fra, hub).is_some());

        let issuers = f.center.trusted_issuers.load();
        assert_eq!(issuers.issuers.len(), 1);
        assert_eq!(issuers.issuers[0].instance_code, fra);
    }

    #[tokio::test]
    async fn suspension_disables_trust_and_tokens() {
        let f = fixture();
        let hub: InstanceCode = "HUB".parse().unwrap();
        let fra: InstanceCode = "FRA".parse().unwrap();

        let (record, _) = register_spoke(&f.center, register_request("FRA")).unwrap();
        approve_spoke(&f.center, &record.spoke_id, "admin", grant()).unwrap();
        let token = f.center.spokes.generate_token(&record.spoke_id).unwrap();

        suspend_spoke(&f.center, &record.spoke_id, "incident").unwrap();

        // The downgrade is immediately visible to authorization, despite
        // the trust cache.
        assert!(f.center.trust.verify(hub, fra).is_none());
        assert!(f.center.trust.verify(fra, hub).is_none());
        assert!(!f.center.spokes.validate_token(&token.token).valid);
        assert!(f.center.trusted_issuers.load().issuers.is_empty());
    }

    #[tokio::test]
    async fn revocation_removes_edges_and_frees_the_code() {
        let f = fixture();
        let fra: InstanceCode = "FRA".parse().unwrap();

        let (record, _) = register_spoke(&f.center, register_request("FRA")).unwrap();
        approve_spoke(&f.center, &record.spoke_id, "admin", grant()).unwrap();
        revoke_spoke(&f.center, &record.spoke_id, "compromised").unwrap();

        assert!(f.center.trust.verify("HUB".parse().unwrap(), fra).is_none());

        // The code is free for a fresh registration.
        let (fresh, _) = register_spoke(&f.center, register_request("FRA")).unwrap();
        assert_ne!(fresh.spoke_id, record.spoke_id);
        assert!(fresh.allowed_scopes.is_empty());
    }

    #[tokio::test]
    async fn bundle_builds_are_reproducible_and_monotonic() {
        let f = fixture();
        let options = BundleOptions {
            sign: false,
            ..Default::default()
        };

        let a = build_bundle(&f.center, &options).unwrap();
        let b = build_bundle(&f.center, &options).unwrap();

        // Identical inputs: identical content, advancing version.
        assert_eq!(a.hash, b.hash);
        assert!(b.version > a.version);
        assert!(a.version.ends_with("-001"));
        assert!(b.version.ends_with("-002"));

        let current = f.center.current_bundle.load_full().unwrap();
        assert_eq!(current.version, b.version);
    }

    #[tokio::test]
    async fn state_spec_round_trips_through_the_center() {
        let f = fixture();
        let (record, _) = register_spoke(&f.center, register_request("FRA")).unwrap();
        approve_spoke(&f.center, &record.spoke_id, "admin", grant()).unwrap();
        let token = f.center.spokes.generate_token(&record.spoke_id).unwrap();

        let path = f.center.config.state_file();
        let spec = crate::state::Spec::build(&f.center);
        spec.save(&path).unwrap();

        let other = fixture();
        crate::state::Spec::load(&path).unwrap().parse_into(&other.center);

        assert!(other.center.spokes.validate_token(&token.token).valid);
        assert!(other
            .center
            .trust
            .verify("HUB".parse().unwrap(), "FRA".parse().unwrap())
            .is_some());
        assert_eq!(other.center.trusted_issuers.load().issuers.len(), 1);
    }
}

//! Maintaining and outputting metrics.
//!
//! Relevant sources for selecting metrics, metric names, and labels:
//! - https://prometheus.io/docs/practices/naming/
//! - https://prometheus.io/docs/instrumenting/writing_exporters/#labels
//! - https://prometheus.io/docs/practices/instrumentation/

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::metrics::info::Info;
use prometheus_client::registry::{Registry, Unit};
use serde::Serialize;

use crate::center::Center;
use crate::spoke::SpokeStatus;

/// The application prefix to use in the names of Prometheus metrics.
const PROMETHEUS_PREFIX: &str = "trellis";

/// The rolling window health signals are scored over.
const HEALTH_WINDOW: Duration = Duration::from_secs(300);

//------------ MetricsCollection ---------------------------------------------

/// The metrics registry for all metrics in Trellis.  Components record into
/// the live families; gauges derived from registry state are assembled on
/// each scrape.
pub struct MetricsCollection {
    registry: Registry,

    /// The metrics assemble time, only relevant for metrics that get built
    /// from state on each scrape.
    assemble_time_metric: Gauge<u64, AtomicU64>,

    state_metrics: StateMetrics,

    /// Authorization decisions (token validation, introspection, exchange).
    authorizations: Family<OutcomeLabels, Counter>,

    /// Spoke heartbeat results.
    heartbeats: Family<OutcomeLabels, Counter>,

    /// Federation sync cycles per peer and outcome.
    sync_cycles: Family<SyncLabels, Counter>,

    /// Remote introspection latency.
    introspection_latency: Histogram,

    /// Rolling signals feeding the health score.
    health: HealthTracker,
}

impl MetricsCollection {
    pub fn new() -> Self {
        let mut col = Self {
            registry: Registry::with_prefix(PROMETHEUS_PREFIX),
            assemble_time_metric: Default::default(),
            state_metrics: Default::default(),
            authorizations: Default::default(),
            heartbeats: Default::default(),
            sync_cycles: Default::default(),
            introspection_latency: Histogram::new(exponential_buckets(1.0, 2.0, 12)),
            health: HealthTracker::new(),
        };

        let build_info = Info::new(vec![("version", clap::crate_version!())]);
        col.registry
            .register("build", "Trellis build information", build_info);

        col.registry.register_with_unit(
            "metrics_assemble_duration",
            "The time taken in milliseconds to assemble the last metric snapshot",
            Unit::Other("milliseconds".into()),
            col.assemble_time_metric.clone(),
        );

        col.registry.register(
            "authorizations",
            "Authorization decisions by outcome",
            col.authorizations.clone(),
        );
        col.registry.register(
            "spoke_heartbeats",
            "Spoke heartbeat results by outcome",
            col.heartbeats.clone(),
        );
        col.registry.register(
            "federation_sync_cycles",
            "Federation sync cycles by peer and outcome",
            col.sync_cycles.clone(),
        );
        col.registry.register_with_unit(
            "introspection_latency",
            "Latency of remote token introspection",
            Unit::Other("milliseconds".into()),
            col.introspection_latency.clone(),
        );

        col.state_metrics.register_metrics(&mut col.registry);

        col
    }

    //--- Recording

    pub fn record_authorization(&self, success: bool) {
        self.authorizations
            .get_or_create(&OutcomeLabels::from(success))
            .inc();
        self.health.record_authorization(success, Instant::now());
    }

    pub fn record_heartbeat(&self, success: bool) {
        self.heartbeats
            .get_or_create(&OutcomeLabels::from(success))
            .inc();
        self.health.record_heartbeat(success, Instant::now());
    }

    pub fn record_sync_cycle(&self, peer: &str, success: bool) {
        self.sync_cycles
            .get_or_create(&SyncLabels {
                peer: peer.to_owned(),
                outcome: Outcome::from(success),
            })
            .inc();
        self.health.record_sync(success);
    }

    pub fn observe_introspection_latency(&self, latency_ms: u64) {
        self.introspection_latency.observe(latency_ms as f64);
    }

    //--- Exposition

    /// Turn metrics into a [`String`] (and fetch metrics from state that
    /// aren't updated live during the running system).
    pub fn assemble(&self, center: &Arc<Center>) -> Result<String, fmt::Error> {
        let start_time = Instant::now();
        let metrics = &self.state_metrics;

        let spokes = center.spokes.all();
        let count = |status: SpokeStatus| -> i64 {
            spokes.iter().filter(|s| s.status == status).count() as i64
        };
        metrics.spokes_configured.set(spokes.len() as i64);
        metrics.spokes_pending.set(count(SpokeStatus::Pending));
        metrics.spokes_approved.set(count(SpokeStatus::Approved));
        metrics.spokes_suspended.set(count(SpokeStatus::Suspended));
        metrics.spokes_unhealthy.set(center.spokes.unhealthy().len() as i64);

        metrics.trust_edges.set(center.trust.edges().len() as i64);

        // Using Family::clear() to delete all metrics and label sets.
        metrics.circuits.clear();
        for (target, state) in center.breakers.states() {
            metrics
                .circuits
                .get_or_create(&CircuitLabels {
                    target: target.to_string(),
                    state: state.to_string(),
                })
                .set(1);
        }

        metrics
            .health_score
            .set(self.health.report(Instant::now()).overall as i64);

        // u64::MAX milliseconds is around 585_000_000 years
        let assemble_ms = start_time.elapsed().as_millis() as u64;
        self.assemble_time_metric.set(assemble_ms);
        String::try_from(self)
    }

    /// The current rolling health report.
    pub fn health_report(&self) -> HealthReport {
        self.health.report(Instant::now())
    }
}

impl TryFrom<&MetricsCollection> for String {
    type Error = fmt::Error;

    fn try_from(metrics: &MetricsCollection) -> Result<Self, Self::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry)?;
        Ok(buffer)
    }
}

impl Default for MetricsCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for MetricsCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCollection").finish_non_exhaustive()
    }
}

//------------ Labels --------------------------------------------------------

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelValue)]
enum Outcome {
    Success,
    Error,
}

impl From<bool> for Outcome {
    fn from(success: bool) -> Self {
        if success {
            Outcome::Success
        } else {
            Outcome::Error
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: Outcome,
}

impl From<bool> for OutcomeLabels {
    fn from(success: bool) -> Self {
        Self {
            outcome: Outcome::from(success),
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SyncLabels {
    peer: String,
    outcome: Outcome,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CircuitLabels {
    target: String,
    state: String,
}

//------------ StateMetrics --------------------------------------------------

#[derive(Debug, Default)]
struct StateMetrics {
    spokes_configured: Gauge,
    spokes_pending: Gauge,
    spokes_approved: Gauge,
    spokes_suspended: Gauge,
    spokes_unhealthy: Gauge,
    trust_edges: Gauge,
    circuits: Family<CircuitLabels, Gauge>,
    health_score: Gauge,
}

impl StateMetrics {
    pub fn register_metrics(&self, reg: &mut Registry) {
        reg.register(
            "spokes_configured",
            "Number of spokes known to the hub",
            self.spokes_configured.clone(),
        );
        reg.register(
            "spokes_pending",
            "Number of spokes awaiting approval",
            self.spokes_pending.clone(),
        );
        reg.register(
            "spokes_approved",
            "Number of approved spokes",
            self.spokes_approved.clone(),
        );
        reg.register(
            "spokes_suspended",
            "Number of suspended spokes",
            self.spokes_suspended.clone(),
        );
        reg.register(
            "spokes_unhealthy",
            "Number of approved spokes with stale heartbeats",
            self.spokes_unhealthy.clone(),
        );
        reg.register(
            "trust_edges",
            "Number of bilateral trust edges",
            self.trust_edges.clone(),
        );
        reg.register(
            "circuit_state",
            "Circuit breaker state per target",
            self.circuits.clone(),
        );
        reg.register(
            "health_score",
            "The overall rolling health score",
            self.health_score.clone(),
        );
    }
}

//------------ Health scoring ------------------------------------------------

/// The summary health status.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

/// A point-in-time health report over the rolling window.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub overall: u8,
    pub authorization: u8,
    pub connectivity: u8,
    pub policy_sync: u8,
}

/// Rolling signal windows behind the health score.
#[derive(Debug)]
struct HealthTracker {
    windows: Mutex<Windows>,
    consecutive_sync_failures: AtomicU32,
}

#[derive(Debug, Default)]
struct Windows {
    authorizations: VecDeque<(Instant, bool)>,
    heartbeats: VecDeque<(Instant, bool)>,
}

impl HealthTracker {
    fn new() -> Self {
        Self {
            windows: Mutex::new(Windows::default()),
            consecutive_sync_failures: AtomicU32::new(0),
        }
    }

    fn record_authorization(&self, success: bool, now: Instant) {
        let mut windows = self.windows.lock().unwrap();
        windows.authorizations.push_back((now, success));
        prune(&mut windows.authorizations, now);
    }

    fn record_heartbeat(&self, success: bool, now: Instant) {
        let mut windows = self.windows.lock().unwrap();
        windows.heartbeats.push_back((now, success));
        prune(&mut windows.heartbeats, now);
    }

    fn record_sync(&self, success: bool) {
        if success {
            self.consecutive_sync_failures.store(0, Ordering::Relaxed);
        } else {
            self.consecutive_sync_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn report(&self, now: Instant) -> HealthReport {
        let (authorization, connectivity) = {
            let mut windows = self.windows.lock().unwrap();
            prune(&mut windows.authorizations, now);
            prune(&mut windows.heartbeats, now);
            (score(&windows.authorizations), score(&windows.heartbeats))
        };

        let failures = self.consecutive_sync_failures.load(Ordering::Relaxed);
        let policy_sync = 100u32.saturating_sub(failures.saturating_mul(20)) as u8;

        let overall = authorization.min(connectivity).min(policy_sync);
        let status = if overall >= 90 {
            HealthStatus::Healthy
        } else if overall >= 60 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        HealthReport {
            status,
            overall,
            authorization,
            connectivity,
            policy_sync,
        }
    }
}

fn prune(window: &mut VecDeque<(Instant, bool)>, now: Instant) {
    while let Some((at, _)) = window.front() {
        if now.duration_since(*at) > HEALTH_WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}

/// `100 * successes / total`, or 100 with no traffic.
fn score(window: &VecDeque<(Instant, bool)>) -> u8 {
    if window.is_empty() {
        return 100;
    }
    let successes = window.iter().filter(|(_, ok)| *ok).count();
    ((successes * 100) / window.len()) as u8
}

//============ Tests ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_windows_score_healthy() {
        let tracker = HealthTracker::new();
        let report = tracker.report(Instant::now());
        assert_eq!(report.overall, 100);
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[test]
    fn authorization_errors_drag_the_score() {
        let tracker = HealthTracker::new();
        let now = Instant::now();
        for i in 0..8 {
            tracker.record_authorization(true, now + Duration::from_millis(i));
        }
        tracker.record_authorization(false, now + Duration::from_millis(8));
        tracker.record_authorization(false, now + Duration::from_millis(9));

        let report = tracker.report(now + Duration::from_millis(10));
        assert_eq!(report.authorization, 80);
        assert_eq!(report.overall, 80);
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[test]
    fn old_signals_fall_out_of_the_window() {
        let tracker = HealthTracker::new();
        let now = Instant::now();
        tracker.record_authorization(false, now);

        // Shortly after, the failure still counts.
        assert_eq!(tracker.report(now + Duration::from_secs(1)).authorization, 0);
        // Past the window, it is gone.
        assert_eq!(
            tracker.report(now + Duration::from_secs(301)).authorization,
            100
        );
    }

    #[test]
    fn sync_failures_are_twenty_points_each() {
        let tracker = HealthTracker::new();
        let now = Instant::now();
        assert_eq!(tracker.report(now).policy_sync, 100);

        tracker.record_sync(false);
        tracker.record_sync(false);
        assert_eq!(tracker.report(now).policy_sync, 60);
        assert_eq!(tracker.report(now).status, HealthStatus::Degraded);

        // The floor is zero.
        for _ in 0..10 {
            tracker.record_sync(false);
        }
        assert_eq!(tracker.report(now).policy_sync, 0);
        assert_eq!(tracker.report(now).status, HealthStatus::Unhealthy);

        // One success resets the run.
        tracker.record_sync(true);
        assert_eq!(tracker.report(now).policy_sync, 100);
    }

    #[test]
    fn overall_is_the_minimum_component() {
        let tracker = HealthTracker::new();
        let now = Instant::now();
        tracker.record_heartbeat(false, now);
        tracker.record_heartbeat(true, now);
        tracker.record_sync(false);

        let report = tracker.report(now + Duration::from_millis(1));
        assert_eq!(report.authorization, 100);
        assert_eq!(report.connectivity, 50);
        assert_eq!(report.policy_sync, 80);
        assert_eq!(report.overall, 50);
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }
}

//! Per-target circuit breaking and failover.
//!
//! Every outbound call to a peer instance flows through a breaker.  Failures
//! inside a sliding window are the only opening signal; successes only count
//! toward closing while the breaker is half-open.  State transitions happen
//! under the registry lock, but recording always happens *after* the network
//! call returns, never across it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::trust::InstanceCode;

//----------- BreakerConfig ----------------------------------------------------

/// Tunables for one breaker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures within the window that open the circuit.
    pub failure_threshold: usize,

    /// The sliding failure window.
    pub failure_window: Duration,

    /// How long an open circuit waits before probing.
    pub recovery_timeout: Duration,

    /// Successes that close a half-open circuit.
    pub success_threshold: u32,

    /// The percentage of requests admitted while half-open.
    pub half_open_admit_pct: u8,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            half_open_admit_pct: 50,
        }
    }
}

//----------- CircuitState -----------------------------------------------------

/// The breaker's circuit position.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    #[default]
    Closed,
    HalfOpen,
    Open,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half-open",
            CircuitState::Open => "open",
        })
    }
}

//----------- OperationalMode --------------------------------------------------

/// The derived operational mode toward a target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationalMode {
    /// The circuit is closed (or probing); traffic flows.
    Normal,

    /// The circuit is open but a cached policy snapshot is still valid.
    Degraded,

    /// The circuit is open and the cache has expired.
    Offline,

    /// Maintenance blocks everything until explicitly lifted.
    Maintenance,
}

//----------- BreakerEvent -----------------------------------------------------

/// A state transition worth reporting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BreakerEvent {
    Opened,
    Closed,
    ForcedOpen { reason: String },
    ForcedClosed,
    MaintenanceEntered { reason: String },
    MaintenanceExited,
}

//----------- Breaker ----------------------------------------------------------

/// The breaker state for one target.
#[derive(Debug)]
pub struct Breaker {
    config: BreakerConfig,
    state: CircuitState,

    /// Failure timestamps within the window, oldest first.
    failures: VecDeque<Instant>,

    half_open_successes: u32,

    last_failure: Option<Instant>,
    last_success: Option<Instant>,

    opened_at: Option<Instant>,
    offline_since: Option<Instant>,

    /// Until when a cached policy snapshot can cover an open circuit.
    policy_cache_expiry: Option<Instant>,

    maintenance_reason: Option<String>,
}

impl Breaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            half_open_successes: 0,
            last_failure: None,
            last_success: None,
            opened_at: None,
            offline_since: None,
            policy_cache_expiry: None,
            maintenance_reason: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Decide whether a request may go out.
    ///
    /// `roll` is a uniform draw from `0..100`; while half-open, the request
    /// is admitted when `roll < half_open_admit_pct`.  (A counter-based
    /// admission would be deterministic; the weighted coin matches the
    /// deployed behavior.)
    pub fn admit(&mut self, now: Instant, roll: u8) -> bool {
        if self.maintenance_reason.is_some() {
            return false;
        }
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let ready = self
                    .opened_at
                    .is_none_or(|at| now.duration_since(at) >= self.config.recovery_timeout);
                if !ready {
                    return false;
                }
                // The recovery timer has elapsed; probe.
                self.state = CircuitState::HalfOpen;
                self.half_open_successes = 0;
                roll < self.config.half_open_admit_pct
            }
            CircuitState::HalfOpen => roll < self.config.half_open_admit_pct,
        }
    }

    /// Record a failed call.
    pub fn record_failure(&mut self, now: Instant) -> Option<BreakerEvent> {
        if self.maintenance_reason.is_some() {
            return None;
        }
        self.last_failure = Some(now);
        match self.state {
            CircuitState::Closed => {
                self.failures.push_back(now);
                self.prune(now);
                if self.failures.len() >= self.config.failure_threshold {
                    self.open(now);
                    return Some(BreakerEvent::Opened);
                }
                None
            }
            CircuitState::HalfOpen => {
                // One failed probe reopens and restarts the recovery timer.
                self.open(now);
                Some(BreakerEvent::Opened)
            }
            // Already open; the failure does not count toward anything.
            CircuitState::Open => None,
        }
    }

    /// Record a successful call.
    pub fn record_success(&mut self, now: Instant) -> Option<BreakerEvent> {
        if self.maintenance_reason.is_some() {
            return None;
        }
        self.last_success = Some(now);
        match self.state {
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.success_threshold {
                    self.close();
                    return Some(BreakerEvent::Closed);
                }
                None
            }
            // Successes outside half-open never close anything.
            CircuitState::Closed | CircuitState::Open => None,
        }
    }

    /// Open immediately, regardless of counters.
    pub fn force_open(&mut self, now: Instant, reason: &str) -> BreakerEvent {
        self.open(now);
        self.failures.clear();
        BreakerEvent::ForcedOpen {
            reason: reason.to_owned(),
        }
    }

    /// Close immediately, regardless of counters.
    pub fn force_close(&mut self) -> BreakerEvent {
        self.close();
        BreakerEvent::ForcedClosed
    }

    /// Enter maintenance.  Blocks all requests and freezes recording until
    /// explicitly exited.
    pub fn enter_maintenance(&mut self, reason: &str) -> BreakerEvent {
        self.maintenance_reason = Some(reason.to_owned());
        BreakerEvent::MaintenanceEntered {
            reason: reason.to_owned(),
        }
    }

    pub fn exit_maintenance(&mut self) -> Option<BreakerEvent> {
        self.maintenance_reason
            .take()
            .map(|_| BreakerEvent::MaintenanceExited)
    }

    /// Remember that a policy snapshot for this target is cached until the
    /// given instant; an open circuit is only degraded (not offline) while
    /// the cache holds.
    pub fn note_policy_cache(&mut self, expiry: Instant) {
        self.policy_cache_expiry = Some(expiry);
    }

    /// The derived operational mode.
    pub fn mode(&self, now: Instant) -> OperationalMode {
        if self.maintenance_reason.is_some() {
            return OperationalMode::Maintenance;
        }
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => OperationalMode::Normal,
            CircuitState::Open => match self.policy_cache_expiry {
                Some(expiry) if expiry > now => OperationalMode::Degraded,
                _ => OperationalMode::Offline,
            },
        }
    }

    pub fn maintenance_reason(&self) -> Option<&str> {
        self.maintenance_reason.as_deref()
    }

    pub fn offline_since(&self) -> Option<Instant> {
        self.offline_since
    }

    //--- Internals

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.offline_since.get_or_insert(now);
        self.half_open_successes = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failures.clear();
        self.half_open_successes = 0;
        self.opened_at = None;
        self.offline_since = None;
    }

    /// Drop failures outside `(now - window, now]`.
    fn prune(&mut self, now: Instant) {
        let window = self.config.failure_window;
        while let Some(front) = self.failures.front() {
            if now.duration_since(*front) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

//----------- BreakerRegistry --------------------------------------------------

/// All per-target breakers.
#[derive(Debug)]
pub struct BreakerRegistry {
    state: Mutex<foldhash::HashMap<InstanceCode, Breaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: Mutex::new(Default::default()),
            config,
        }
    }

    /// Decide whether a request toward `target` may go out.
    pub fn should_allow(&self, target: InstanceCode) -> bool {
        let roll = rand::thread_rng().gen_range(0..100);
        let mut state = self.state.lock().unwrap();
        self.entry(&mut state, target).admit(Instant::now(), roll)
    }

    pub fn record_failure(&self, target: InstanceCode) -> Option<BreakerEvent> {
        let mut state = self.state.lock().unwrap();
        self.entry(&mut state, target).record_failure(Instant::now())
    }

    pub fn record_success(&self, target: InstanceCode) -> Option<BreakerEvent> {
        let mut state = self.state.lock().unwrap();
        self.entry(&mut state, target).record_success(Instant::now())
    }

    pub fn force_open(&self, target: InstanceCode, reason: &str) -> BreakerEvent {
        let mut state = self.state.lock().unwrap();
        self.entry(&mut state, target).force_open(Instant::now(), reason)
    }

    pub fn force_close(&self, target: InstanceCode) -> BreakerEvent {
        let mut state = self.state.lock().unwrap();
        self.entry(&mut state, target).force_close()
    }

    pub fn enter_maintenance(&self, target: InstanceCode, reason: &str) -> BreakerEvent {
        let mut state = self.state.lock().unwrap();
        self.entry(&mut state, target).enter_maintenance(reason)
    }

    pub fn exit_maintenance(&self, target: InstanceCode) -> Option<BreakerEvent> {
        let mut state = self.state.lock().unwrap();
        self.entry(&mut state, target).exit_maintenance()
    }

    pub fn note_policy_cache(&self, target: InstanceCode, expiry: Instant) {
        let mut state = self.state.lock().unwrap();
        self.entry(&mut state, target).note_policy_cache(expiry);
    }

    pub fn circuit_state(&self, target: InstanceCode) -> CircuitState {
        let state = self.state.lock().unwrap();
        state
            .get(&target)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn mode(&self, target: InstanceCode) -> OperationalMode {
        let state = self.state.lock().unwrap();
        state
            .get(&target)
            .map(|b| b.mode(Instant::now()))
            .unwrap_or(OperationalMode::Normal)
    }

    /// The circuit state of every known target.
    pub fn states(&self) -> Vec<(InstanceCode, CircuitState)> {
        let state = self.state.lock().unwrap();
        let mut states: Vec<_> = state.iter().map(|(c, b)| (*c, b.state())).collect();
        states.sort_by_key(|(c, _)| *c);
        states
    }

    fn entry<'a>(
        &self,
        state: &'a mut foldhash::HashMap<InstanceCode, Breaker>,
        target: InstanceCode,
    ) -> &'a mut Breaker {
        state
            .entry(target)
            .or_insert_with(|| Breaker::new(self.config.clone()))
    }
}

//============ Tests ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig::default()
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn three_failures_in_window_open_the_circuit() {
        let mut b = Breaker::new(config());
        let t0 = Instant::now();

        assert_eq!(b.record_failure(t0), None);
        assert_eq!(b.record_failure(t0 + secs(10)), None);
        assert_eq!(b.state(), CircuitState::Closed);

        assert_eq!(b.record_failure(t0 + secs(20)), Some(BreakerEvent::Opened));
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.admit(t0 + secs(21), 0));
    }

    #[test]
    fn failures_outside_window_do_not_count() {
        let mut b = Breaker::new(config());
        let t0 = Instant::now();

        b.record_failure(t0);
        b.record_failure(t0 + secs(10));
        // The first failure has left the 60s window by now.
        assert_eq!(b.record_failure(t0 + secs(61)), None);
        assert_eq!(b.state(), CircuitState::Closed);

        // But two more within the window tip it over.
        assert_eq!(b.record_failure(t0 + secs(62)), Some(BreakerEvent::Opened));
    }

    #[test]
    fn window_boundary_is_half_open_interval() {
        let mut b = Breaker::new(config());
        let t0 = Instant::now();

        b.record_failure(t0);
        b.record_failure(t0 + secs(1));
        // Exactly window-aged failures are excluded: the failure at t0 is
        // outside (t-60, t] when t = t0 + 60.
        assert_eq!(b.record_failure(t0 + secs(60)), None);
    }

    #[test]
    fn recovery_timeout_leads_to_half_open() {
        let mut b = Breaker::new(config());
        let t0 = Instant::now();
        for i in 0..3 {
            b.record_failure(t0 + secs(i));
        }
        assert_eq!(b.state(), CircuitState::Open);

        // Too early to probe.
        assert!(!b.admit(t0 + secs(10), 0));
        assert_eq!(b.state(), CircuitState::Open);

        // After the recovery timeout the next admission probes.
        assert!(b.admit(t0 + secs(33), 0));
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_admission_is_weighted() {
        let mut b = Breaker::new(config());
        let t0 = Instant::now();
        for i in 0..3 {
            b.record_failure(t0 + secs(i));
        }
        let t = t0 + secs(40);
        assert!(b.admit(t, 0));

        // With a 50% admission rate, rolls below 50 pass and the rest fail.
        assert!(b.admit(t, 49));
        assert!(!b.admit(t, 50));
        assert!(!b.admit(t, 99));
    }

    #[test]
    fn successes_close_a_half_open_circuit() {
        let mut b = Breaker::new(config());
        let t0 = Instant::now();
        for i in 0..3 {
            b.record_failure(t0 + secs(i));
        }
        let t = t0 + secs(40);
        assert!(b.admit(t, 0));

        assert_eq!(b.record_success(t), None);
        assert_eq!(b.record_success(t + secs(1)), Some(BreakerEvent::Closed));
        assert_eq!(b.state(), CircuitState::Closed);
        // The counters were reset; a single new failure does not reopen.
        assert_eq!(b.record_failure(t + secs(2)), None);
    }

    #[test]
    fn a_half_open_failure_reopens() {
        let mut b = Breaker::new(config());
        let t0 = Instant::now();
        for i in 0..3 {
            b.record_failure(t0 + secs(i));
        }
        let t = t0 + secs(40);
        assert!(b.admit(t, 0));
        assert_eq!(b.record_success(t), None);

        assert_eq!(b.record_failure(t + secs(1)), Some(BreakerEvent::Opened));
        assert_eq!(b.state(), CircuitState::Open);

        // The recovery timer restarted at the reopen.
        assert!(!b.admit(t + secs(20), 0));
        assert!(b.admit(t + secs(32), 0));
    }

    #[test]
    fn successes_outside_half_open_never_close() {
        let mut b = Breaker::new(config());
        let t0 = Instant::now();
        for i in 0..3 {
            b.record_failure(t0 + secs(i));
        }
        // Successes while open are ignored.
        assert_eq!(b.record_success(t0 + secs(5)), None);
        assert_eq!(b.record_success(t0 + secs(6)), None);
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn failures_while_open_are_not_counted() {
        let mut b = Breaker::new(config());
        let t0 = Instant::now();
        for i in 0..3 {
            b.record_failure(t0 + secs(i));
        }
        assert_eq!(b.record_failure(t0 + secs(5)), None);
    }

    #[test]
    fn manual_overrides() {
        let mut b = Breaker::new(config());
        let t0 = Instant::now();

        let event = b.force_open(t0, "drill");
        assert_eq!(
            event,
            BreakerEvent::ForcedOpen {
                reason: "drill".into()
            }
        );
        assert!(!b.admit(t0, 0));

        assert_eq!(b.force_close(), BreakerEvent::ForcedClosed);
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.admit(t0, 0));
    }

    #[test]
    fn maintenance_blocks_and_freezes() {
        let mut b = Breaker::new(config());
        let t0 = Instant::now();

        b.enter_maintenance("planned window");
        assert!(!b.admit(t0, 0));
        assert_eq!(b.mode(t0), OperationalMode::Maintenance);

        // Recording is ignored entirely during maintenance.
        for i in 0..10 {
            assert_eq!(b.record_failure(t0 + secs(i)), None);
        }
        assert_eq!(b.state(), CircuitState::Closed);

        assert_eq!(b.exit_maintenance(), Some(BreakerEvent::MaintenanceExited));
        assert_eq!(b.exit_maintenance(), None);
        assert!(b.admit(t0, 0));
    }

    #[test]
    fn operational_modes() {
        let mut b = Breaker::new(config());
        let t0 = Instant::now();
        assert_eq!(b.mode(t0), OperationalMode::Normal);

        for i in 0..3 {
            b.record_failure(t0 + secs(i));
        }
        // Open with no cached policy: offline.
        assert_eq!(b.mode(t0 + secs(5)), OperationalMode::Offline);

        // A valid policy cache downgrades that to degraded.
        b.note_policy_cache(t0 + secs(600));
        assert_eq!(b.mode(t0 + secs(5)), OperationalMode::Degraded);
        assert_eq!(b.mode(t0 + secs(700)), OperationalMode::Offline);
    }

    #[test]
    fn registry_tracks_targets_independently() {
        let reg = BreakerRegistry::new(config());
        let usa: InstanceCode = "USA".parse().unwrap();
        let fra: InstanceCode = "FRA".parse().unwrap();

        for _ in 0..3 {
            reg.record_failure(usa);
        }
        assert_eq!(reg.circuit_state(usa), CircuitState::Open);
        assert_eq!(reg.circuit_state(fra), CircuitState::Closed);
        assert!(!reg.should_allow(usa));
        assert!(reg.should_allow(fra));
    }
}

//! The federation sync unit.
//!
//! "FS" runs one push-pull cycle per configured peer on a fixed interval.
//! A per-pair lease keeps cycles from overlapping (and auto-expires, so a
//! crashed cycle cannot wedge the pair), every cycle carries a deadline,
//! and trust and circuit state are checked before anything hits the wire.

use std::sync::Arc;
use std::time::{Duration, Instant};

use jiff::Timestamp;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::api::{FederationPush, FederationPushResult, FederationResources};
use crate::center::Center;
use crate::config::PeerConfig;
use crate::breaker::BreakerEvent;
use crate::federation::{SyncOutcome, SyncResult};
use crate::manager::{ApplicationCommand, Terminated};
use crate::util::join_url;

const UNIT_NAME: &str = "FS";

/// The per-cycle deadline.
const CYCLE_DEADLINE: Duration = Duration::from_secs(60);

/// The sync lease outlives the deadline so only a crashed worker's lease
/// ever expires under a live cycle.
const LEASE_TTL: Duration = Duration::from_secs(120);

pub struct FederationSync {
    pub center: Arc<Center>,
}

impl FederationSync {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ApplicationCommand>,
        ready_tx: oneshot::Sender<()>,
    ) -> Result<(), Terminated> {
        let client = reqwest::Client::new();
        let mut ticker = tokio::time::interval(self.center.config.federation.sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let _ = ready_tx.send(());

        loop {
            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(ApplicationCommand::Terminate) => return Err(Terminated),
                        Some(ApplicationCommand::SyncPeer { peer }) => {
                            let peers = self.center.config.federation.peers.clone();
                            match peers.into_iter().find(|p| p.code == peer) {
                                Some(peer) => self.sync_peer(&client, &peer).await,
                                None => debug!("[{UNIT_NAME}] No configured peer '{peer}'"),
                            }
                        }
                        Some(other) => {
                            debug!("[{UNIT_NAME}] Ignoring command: {other:?}");
                        }
                    }
                }

                _ = ticker.tick() => {
                    for peer in self.center.config.federation.peers.clone() {
                        self.sync_peer(&client, &peer).await;
                    }
                }
            }
        }
    }

    /// Run one sync cycle against a peer.
    async fn sync_peer(&self, client: &reqwest::Client, peer: &PeerConfig) {
        let local = self.center.config.instance_code;

        // Cross-instance traffic is gated like any other: trust first, then
        // the breaker.
        if self.center.trust.verify(local, peer.code).is_none() {
            debug!("[{UNIT_NAME}] No trust edge toward {}; skipping", peer.code);
            return;
        }
        if !self.center.breakers.should_allow(peer.code) {
            debug!(
                "[{UNIT_NAME}] Circuit open toward {}; skipping cycle",
                peer.code
            );
            return;
        }

        // Overlapping triggers coalesce on the pair lease.
        if !self
            .center
            .resources
            .acquire_sync_lease(peer.code, LEASE_TTL, Instant::now())
        {
            debug!("[{UNIT_NAME}] A sync toward {} is in flight", peer.code);
            return;
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();

        let outcome = tokio::time::timeout(
            CYCLE_DEADLINE,
            self.run_cycle(client, peer, &correlation_id),
        )
        .await;

        let (cycle, partial) = match outcome {
            Ok(cycle) => (cycle, false),
            Err(_) => {
                warn!(
                    "[{UNIT_NAME}] Sync toward {} hit the {CYCLE_DEADLINE:?} deadline",
                    peer.code
                );
                (Err("cycle deadline exceeded".to_owned()), true)
            }
        };

        let result = match cycle {
            Ok(outcome) => {
                if let Some(event) = self.center.breakers.record_success(peer.code) {
                    debug!("[{UNIT_NAME}] Breaker for {}: {event:?}", peer.code);
                    self.emit_breaker_event(peer.code, &event);
                }
                self.center
                    .metrics
                    .record_sync_cycle(peer.code.as_str(), true);
                SyncResult {
                    correlation_id,
                    timestamp: Timestamp::now(),
                    source: local,
                    target: peer.code,
                    synced: outcome.synced,
                    updated: outcome.updated,
                    conflicted: outcome.conflicted,
                    conflicts: outcome.conflicts,
                    duration_ms: started.elapsed().as_millis() as u64,
                    partial,
                }
            }
            Err(err) => {
                if let Some(event) = self.center.breakers.record_failure(peer.code) {
                    warn!("[{UNIT_NAME}] Breaker for {}: {event:?}", peer.code);
                    self.emit_breaker_event(peer.code, &event);
                }
                self.center
                    .metrics
                    .record_sync_cycle(peer.code.as_str(), false);
                warn!("[{UNIT_NAME}] Sync toward {} failed: {err}", peer.code);
                SyncResult {
                    correlation_id,
                    timestamp: Timestamp::now(),
                    source: local,
                    target: peer.code,
                    synced: 0,
                    updated: 0,
                    conflicted: 0,
                    conflicts: Vec::new(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    partial: true,
                }
            }
        };

        info!(
            "[{UNIT_NAME}] Sync {} -> {}: {} synced, {} updated, {} conflicted ({} ms)",
            result.source,
            result.target,
            result.synced,
            result.updated,
            result.conflicted,
            result.duration_ms
        );
        self.center.resources.record_sync_result(result);
        self.center.resources.release_sync_lease(peer.code);
    }

    /// Surface a circuit transition as a state change.
    fn emit_breaker_event(&self, target: crate::trust::InstanceCode, event: &BreakerEvent) {
        let change = match event {
            BreakerEvent::Opened | BreakerEvent::ForcedOpen { .. } => {
                crate::center::Change::CircuitOpened(target)
            }
            BreakerEvent::Closed | BreakerEvent::ForcedClosed => {
                crate::center::Change::CircuitClosed(target)
            }
            _ => return,
        };
        let _ = self.center.update_tx.send(crate::manager::Update::Changed(change));
    }

    /// Push then pull; either failing fails the cycle as a whole, but a
    /// single rejected resource does not.
    async fn run_cycle(
        &self,
        client: &reqwest::Client,
        peer: &PeerConfig,
        correlation_id: &str,
    ) -> Result<SyncOutcome, String> {
        let local = self.center.config.instance_code;
        let timeout = self.center.config.federation.request_timeout;
        let jwt = self
            .center
            .exchange
            .mint_federation_jwt(peer.code)
            .map_err(|err| err.to_string())?;

        // Push eligible local resources.
        let outbound = self.center.resources.eligible_for(local, peer.code);
        if !outbound.is_empty() {
            let ids: Vec<String> = outbound.iter().map(|r| r.resource_id.clone()).collect();
            let push = FederationPush {
                correlation_id: correlation_id.to_owned(),
                source_realm: local.to_string(),
                resources: outbound,
            };
            let url = join_url(&peer.endpoint, "federation/resources");
            let response: FederationPushResult = client
                .post(url)
                .bearer_auth(&jwt)
                .header("X-Correlation-ID", correlation_id)
                .header("X-Origin-Realm", local.as_str())
                .timeout(timeout)
                .json(&push)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|err| err.to_string())?
                .json()
                .await
                .map_err(|err| err.to_string())?;

            let accepted: Vec<String> = response
                .results
                .iter()
                .filter(|r| r.status != "conflicted")
                .map(|r| r.resource_id.clone())
                .collect();
            debug!(
                "[{UNIT_NAME}] Pushed {}/{} resources to {}",
                accepted.len(),
                ids.len(),
                peer.code
            );
            self.center
                .resources
                .mark_pushed(peer.code, &accepted, Timestamp::now());
        }

        // Pull what the peer will release to us, excluding our own echoes.
        let mut url = join_url(&peer.endpoint, "federation/resources");
        url.query_pairs_mut()
            .append_pair("releasableTo", local.as_str())
            .append_pair("excludeOrigin", local.as_str());
        let inbound: FederationResources = client
            .get(url)
            .bearer_auth(&jwt)
            .header("X-Correlation-ID", correlation_id)
            .header("X-Origin-Realm", local.as_str())
            .timeout(timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|err| err.to_string())?
            .json()
            .await
            .map_err(|err| err.to_string())?;

        Ok(self.center.resources.apply_inbound(
            local,
            peer.code,
            inbound.resources,
            Timestamp::now(),
        ))
    }
}

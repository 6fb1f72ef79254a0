//! The policy/data publisher unit.
//!
//! "PB" owns every write toward the data plane: bundle metadata, inline
//! ground-truth data (trusted issuers, federation matrix), and the refresh
//! broadcast that tells connected spokes to re-pull.  The data plane fetches
//! bundle artifacts itself, by content hash.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bundle::BundleOptions;
use crate::center::{self, Center, Change};
use crate::manager::{ApplicationCommand, Terminated, Update};
use crate::util::{hex_encode, join_url};

const UNIT_NAME: &str = "PB";

/// Refresh broadcast retry schedule: exponential from this base.
const REFRESH_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// The backoff ceiling.
const REFRESH_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Attempts before a refresh failure is surfaced.
const REFRESH_MAX_ATTEMPTS: u32 = 5;

/// How long a pushed bundle is assumed to cover a spoke in degraded mode.
const POLICY_CACHE_TTL: Duration = Duration::from_secs(6 * 60 * 60);

pub struct Publisher {
    pub center: Arc<Center>,
}

impl Publisher {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ApplicationCommand>,
        ready_tx: oneshot::Sender<()>,
    ) -> Result<(), Terminated> {
        let client = reqwest::Client::new();
        // Hashes of the last pushed value per data path, for idempotency.
        let mut pushed: HashMap<String, String> = HashMap::new();

        let _ = ready_tx.send(());

        loop {
            let Some(cmd) = cmd_rx.recv().await else {
                return Err(Terminated);
            };
            debug!("[{UNIT_NAME}] Received command: {cmd:?}");
            match cmd {
                ApplicationCommand::Terminate => return Err(Terminated),

                ApplicationCommand::BuildAndPublish { options, reason } => {
                    self.build_and_publish(&client, &mut pushed, options, &reason)
                        .await;
                }

                ApplicationCommand::PublishBundle => {
                    self.publish_bundle(&client).await;
                }

                ApplicationCommand::PublishTrustedIssuers { reason } => {
                    let issuers = self.center.trusted_issuers.load();
                    let data = serde_json::to_value(&issuers.issuers)
                        .expect("trusted issuers serialize");
                    self.publish_inline(
                        &client,
                        &mut pushed,
                        "federation/trusted-issuers",
                        data,
                        &reason,
                    )
                    .await;
                }

                ApplicationCommand::PublishInlineData { path, data, reason } => {
                    self.publish_inline(&client, &mut pushed, &path, data, &reason)
                        .await;
                }

                ApplicationCommand::TriggerRefresh => {
                    self.trigger_refresh(&client).await;
                }

                // Not for us.
                ApplicationCommand::SyncPeer { .. } => {}
            }
        }
    }

    /// Rebuild the bundle, push its metadata and the trusted issuers, and
    /// broadcast a refresh.
    async fn build_and_publish(
        &self,
        client: &reqwest::Client,
        pushed: &mut HashMap<String, String>,
        options: BundleOptions,
        reason: &str,
    ) {
        info!("[{UNIT_NAME}] Rebuilding bundle: {reason}");

        // The build hashes the whole tree; keep it off the async workers.
        let center = self.center.clone();
        let result =
            tokio::task::spawn_blocking(move || center::build_bundle(&center, &options)).await;

        match result {
            Ok(Ok(_pointer)) => {
                self.publish_bundle(client).await;
                let issuers = self.center.trusted_issuers.load();
                let data =
                    serde_json::to_value(&issuers.issuers).expect("trusted issuers serialize");
                self.publish_inline(
                    client,
                    pushed,
                    "federation/trusted-issuers",
                    data,
                    reason,
                )
                .await;
                self.trigger_refresh(client).await;
            }
            Ok(Err(err)) => {
                warn!("[{UNIT_NAME}] Bundle rebuild failed: {err}");
                self.center.metrics.record_sync_cycle("data-plane", false);
            }
            Err(err) => {
                warn!("[{UNIT_NAME}] Bundle rebuild task failed: {err}");
            }
        }
    }

    /// Emit the current bundle's metadata; the data plane pulls the
    /// artifact via its content hash.
    async fn publish_bundle(&self, client: &reqwest::Client) {
        let Some(pointer) = self.center.current_bundle.load_full() else {
            debug!("[{UNIT_NAME}] No current bundle to publish");
            return;
        };

        let Some(base) = self.center.config.federation.data_plane_url.clone() else {
            debug!(
                "[{UNIT_NAME}] No data plane configured; bundle {} is served locally only",
                pointer.version
            );
            self.note_policy_caches();
            let _ = self.center.update_tx.send(Update::Changed(Change::BundlePublished {
                version: pointer.version.clone(),
            }));
            return;
        };

        let url = join_url(&base, "policy/bundle");
        let body = serde_json::json!({
            "bundleId": pointer.bundle_id,
            "version": pointer.version,
            "hash": pointer.hash,
            "scopes": pointer.scopes,
            "signed": pointer.signed,
            "signedBy": pointer.signed_by,
            "manifest": pointer.manifest,
        });

        match client
            .post(url)
            .timeout(self.center.config.federation.request_timeout)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(_) => {
                info!("[{UNIT_NAME}] Published bundle {}", pointer.version);
                self.note_policy_caches();
                self.center.metrics.record_sync_cycle("data-plane", true);
                let _ = self.center.update_tx.send(Update::Changed(Change::BundlePublished {
                    version: pointer.version.clone(),
                }));
            }
            Err(err) => {
                warn!(
                    "[{UNIT_NAME}] Publishing bundle {} failed: {err}",
                    pointer.version
                );
                self.center.metrics.record_sync_cycle("data-plane", false);
            }
        }
    }

    /// Atomically update a named data path.  Idempotent on equal data.
    async fn publish_inline(
        &self,
        client: &reqwest::Client,
        pushed: &mut HashMap<String, String>,
        path: &str,
        data: Value,
        reason: &str,
    ) {
        let serialized = serde_json::to_vec(&data).expect("inline data serializes");
        let digest = hex_encode(
            ring::digest::digest(&ring::digest::SHA256, &serialized).as_ref(),
        );
        if pushed.get(path) == Some(&digest) {
            debug!("[{UNIT_NAME}] Data path '{path}' is unchanged; not pushing");
            return;
        }

        let Some(base) = self.center.config.federation.data_plane_url.clone() else {
            debug!("[{UNIT_NAME}] No data plane configured; '{path}' not pushed ({reason})");
            pushed.insert(path.to_owned(), digest);
            return;
        };

        let url = join_url(&base, "data/publish");
        let body = serde_json::json!({
            "path": path,
            "data": data,
            "reason": reason,
        });

        match client
            .post(url)
            .timeout(self.center.config.federation.request_timeout)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(_) => {
                info!("[{UNIT_NAME}] Published data path '{path}' ({reason})");
                pushed.insert(path.to_owned(), digest);
            }
            Err(err) => {
                warn!("[{UNIT_NAME}] Publishing data path '{path}' failed: {err}");
            }
        }
    }

    /// Best-effort refresh broadcast with exponential backoff.
    async fn trigger_refresh(&self, client: &reqwest::Client) {
        let Some(base) = self.center.config.federation.data_plane_url.clone() else {
            debug!("[{UNIT_NAME}] No data plane configured; refresh is a no-op");
            return;
        };
        let url = join_url(&base, "refresh");

        let mut backoff = REFRESH_BACKOFF_BASE;
        for attempt in 1..=REFRESH_MAX_ATTEMPTS {
            match client
                .post(url.clone())
                .timeout(self.center.config.federation.request_timeout)
                .send()
                .await
                .and_then(|r| r.error_for_status())
            {
                Ok(_) => {
                    debug!("[{UNIT_NAME}] Data plane acknowledged refresh");
                    return;
                }
                Err(err) => {
                    warn!(
                        "[{UNIT_NAME}] Refresh attempt {attempt}/{REFRESH_MAX_ATTEMPTS} \
                         failed: {err}"
                    );
                }
            }
            if attempt < REFRESH_MAX_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(REFRESH_BACKOFF_CAP);
            }
        }
        warn!("[{UNIT_NAME}] Refresh broadcast failed after {REFRESH_MAX_ATTEMPTS} attempts");
        self.center.metrics.record_sync_cycle("data-plane", false);
    }

    /// A freshly pushed bundle covers every approved spoke's degraded mode
    /// for a while.
    fn note_policy_caches(&self) {
        for spoke in self
            .center
            .spokes
            .with_status(crate::spoke::SpokeStatus::Approved)
        {
            center::note_policy_cache(&self.center, spoke.instance_code, POLICY_CACHE_TTL);
        }
    }
}

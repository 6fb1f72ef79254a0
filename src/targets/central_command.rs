//! The central command target.
//!
//! All state changes flow here as [`Update`]s; the central command decides
//! which units need to act on each and forwards application commands.  This
//! is where a spoke approval becomes a bundle rebuild and a trusted-issuers
//! publish.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::bundle::BundleOptions;
use crate::center::{Center, Change};
use crate::manager::{ApplicationCommand, TargetCommand, Terminated, Update};

pub struct CentralCommand {
    pub center: Arc<Center>,
}

impl CentralCommand {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<TargetCommand>,
        mut update_rx: mpsc::UnboundedReceiver<Update>,
    ) -> Result<(), Terminated> {
        loop {
            tokio::select! {
                // Disable tokio::select!() random branch selection.
                biased;

                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(TargetCommand::Terminate) => {
                            return Err(Terminated);
                        }
                    }
                }

                Some(update) = update_rx.recv() => {
                    self.direct_update(update);
                }
            }
        }
    }

    fn direct_update(&self, update: Update) {
        debug!("[CC]: Event received: {update:?}");
        let Update::Changed(change) = update;

        match change {
            Change::SpokeApproved {
                spoke_id,
                instance_code,
            } => {
                info!("[CC]: Spoke '{spoke_id}' ({instance_code}) approved; rebuilding bundle");
                self.send(
                    "PB",
                    ApplicationCommand::BuildAndPublish {
                        options: BundleOptions::default(),
                        reason: format!("spoke {instance_code} approved"),
                    },
                );
            }

            Change::SpokeRevoked {
                spoke_id,
                instance_code,
                ..
            } => {
                info!("[CC]: Spoke '{spoke_id}' ({instance_code}) revoked; rebuilding bundle");
                self.send(
                    "PB",
                    ApplicationCommand::BuildAndPublish {
                        options: BundleOptions::default(),
                        reason: format!("spoke {instance_code} revoked"),
                    },
                );
            }

            Change::SpokeSuspended { instance_code, .. } => {
                self.send(
                    "PB",
                    ApplicationCommand::PublishTrustedIssuers {
                        reason: format!("spoke {instance_code} suspended"),
                    },
                );
                self.send("PB", ApplicationCommand::TriggerRefresh);
            }

            Change::TrustEdgeChanged { source, target } => {
                self.send(
                    "PB",
                    ApplicationCommand::BuildAndPublish {
                        options: BundleOptions::default(),
                        reason: format!("trust edge {source} -> {target} changed"),
                    },
                );
            }

            Change::BundleBuilt { version, .. } => {
                debug!("[CC]: Bundle {version} built");
            }

            Change::BundlePublished { version } => {
                debug!("[CC]: Bundle {version} published");
            }

            // Observability-only events.
            Change::SpokeRegistered(_)
            | Change::CircuitOpened(_)
            | Change::CircuitClosed(_)
            | Change::MaintenanceEntered(_)
            | Change::MaintenanceExited(_) => {}
        }
    }

    fn send(&self, unit: &str, cmd: ApplicationCommand) {
        // The forwarding loop outlives every unit; a failed send only
        // happens during shutdown.
        let _ = self.center.app_cmd_tx.send((unit.into(), cmd));
    }
}

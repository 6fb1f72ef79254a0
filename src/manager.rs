//! Controlling the entire operation.

use std::fmt::{self, Display};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::bundle::BundleOptions;
use crate::center::{Center, Change};
use crate::targets::central_command::CentralCommand;
use crate::trust::InstanceCode;
use crate::units::federation_sync::FederationSync;
use crate::units::http_server::HttpServer;
use crate::units::publisher::Publisher;

//----------- Update -----------------------------------------------------------

/// An update sent to the central command.
#[derive(Clone, Debug)]
pub enum Update {
    /// Global state has changed.
    Changed(Change),
}

//----------- ApplicationCommand -----------------------------------------------

/// A command directed at a unit.
#[derive(Clone, Debug)]
pub enum ApplicationCommand {
    /// Shut the unit down.
    Terminate,

    /// Rebuild the bundle and push it, with refreshed ground-truth data.
    BuildAndPublish {
        options: BundleOptions,
        reason: String,
    },

    /// Push the current bundle's metadata to the data plane.
    PublishBundle,

    /// Push the trusted-issuers list to the data plane.
    PublishTrustedIssuers { reason: String },

    /// Atomically update a named data path in the data plane.
    PublishInlineData {
        path: String,
        data: serde_json::Value,
        reason: String,
    },

    /// Ask the data plane to fan a refresh out to connected spokes.
    TriggerRefresh,

    /// Run a federation sync cycle against one peer now.
    SyncPeer { peer: InstanceCode },
}

//----------- TargetCommand ----------------------------------------------------

/// A command directed at the central command target.
pub enum TargetCommand {
    Terminate,
}

impl Display for TargetCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetCommand::Terminate => f.write_str("Terminate"),
        }
    }
}

//----------- Terminated -------------------------------------------------------

/// A unit or target has terminated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Terminated;

impl std::error::Error for Terminated {}

impl Display for Terminated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("terminated")
    }
}

//----------- Spawning ---------------------------------------------------------

/// Spawn the central command and all units.
pub async fn spawn(
    center: &Arc<Center>,
    update_rx: mpsc::UnboundedReceiver<Update>,
    center_tx_slot: &mut Option<mpsc::UnboundedSender<TargetCommand>>,
    unit_tx_slots: &mut foldhash::HashMap<String, mpsc::UnboundedSender<ApplicationCommand>>,
) -> Result<(), Terminated> {
    // Spawn the central command.
    info!("Starting target 'CC'");
    let target = CentralCommand {
        center: center.clone(),
    };
    let (center_tx, center_rx) = mpsc::unbounded_channel();
    tokio::spawn(target.run(center_rx, update_rx));
    *center_tx_slot = Some(center_tx);

    let mut unit_ready_rxs = vec![];
    let mut unit_join_handles = foldhash::HashMap::default();

    // Spawn the policy/data publisher.
    info!("Starting unit 'PB'");
    let unit = Publisher {
        center: center.clone(),
    };
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    unit_ready_rxs.push(ready_rx);
    unit_join_handles.insert("PB", tokio::spawn(unit.run(cmd_rx, ready_tx)));
    unit_tx_slots.insert("PB".into(), cmd_tx);

    // Spawn the federation syncer.
    info!("Starting unit 'FS'");
    let unit = FederationSync {
        center: center.clone(),
    };
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    unit_ready_rxs.push(ready_rx);
    unit_join_handles.insert("FS", tokio::spawn(unit.run(cmd_rx, ready_tx)));
    unit_tx_slots.insert("FS".into(), cmd_tx);

    // Spawn the HTTP server.
    info!("Starting unit 'HS'");
    let unit = HttpServer {
        center: center.clone(),
    };
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    unit_ready_rxs.push(ready_rx);
    unit_join_handles.insert("HS", tokio::spawn(unit.run(cmd_rx, ready_tx)));
    unit_tx_slots.insert("HS".into(), cmd_tx);

    futures::future::join_all(unit_ready_rxs).await;

    // None of the units should have exited already.
    if let Some(failed_unit) = unit_join_handles
        .iter()
        .find_map(|(unit, handle)| handle.is_finished().then_some(unit))
    {
        error!("Unit '{failed_unit}' terminated unexpectedly. Aborting.");
        return Err(Terminated);
    }

    info!("All units report ready.");
    Ok(())
}

/// Forward application commands.
pub async fn forward_app_cmds(
    rx: &mut mpsc::UnboundedReceiver<(String, ApplicationCommand)>,
    unit_txs: &foldhash::HashMap<String, mpsc::UnboundedSender<ApplicationCommand>>,
) {
    while let Some((unit_name, data)) = rx.recv().await {
        if let Some(tx) = unit_txs.get(&*unit_name) {
            debug!("Forwarding application command to unit '{unit_name}'");
            if tx.send(data).is_err() {
                debug!("Unit '{unit_name}' is gone");
            }
        } else {
            debug!("Unrecognized unit: {unit_name}");
        }
    }
}

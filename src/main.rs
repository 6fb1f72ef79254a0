use std::io;
use std::process::ExitCode;

use clap::crate_authors;
use tokio::sync::mpsc;
use trellis::center::Center;
use trellis::config::Config;
use trellis::manager::{self, ApplicationCommand, TargetCommand};

fn main() -> ExitCode {
    // Initialize the logger in fallback mode.
    let logger = trellis::log::Logger::launch();

    // Set up the command-line interface.
    let cmd = clap::Command::new("trellisd")
        .version(env!("TRELLIS_BUILD_VERSION"))
        .author(crate_authors!())
        .next_line_help(true)
        .arg(
            clap::Arg::new("check_config")
                .long("check-config")
                .action(clap::ArgAction::SetTrue)
                .help("Check the configuration and exit"),
        );
    let cmd = Config::setup_cli(cmd);

    // Process command-line arguments.
    let matches = cmd.get_matches();

    // Construct the configuration.
    let config = match Config::init(&matches) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Trellis couldn't be configured: {error}");
            return ExitCode::from(1);
        }
    };

    if matches.get_flag("check_config") {
        return ExitCode::SUCCESS;
    }

    // Activate the configured logging setup.
    if let Err(error) = logger.apply(&config.logging) {
        eprintln!("Trellis couldn't set up logging: {error}");
        return ExitCode::from(1);
    }

    // Load the bundle signing key, if one is configured.
    let signing_key = match load_signing_key(&config) {
        Ok(key) => key,
        Err(error) => {
            tracing::error!("Could not load the bundle signing key: {error}");
            return ExitCode::from(1);
        }
    };

    // Prepare the hub.
    let (app_cmd_tx, mut app_cmd_rx) = mpsc::unbounded_channel();
    let (update_tx, update_rx) = mpsc::unbounded_channel();
    let center = Center::new(config, signing_key, app_cmd_tx, update_tx);

    // Load the global state file or start from scratch.
    let state_file = center.config.state_file();
    match trellis::state::Spec::load(&state_file) {
        Ok(spec) => {
            spec.parse_into(&center);
            tracing::info!("Successfully loaded the global state file");
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::info!("State file not found; starting from scratch");
        }
        Err(err) => {
            tracing::error!("Could not load the state file '{state_file}': {err}");
            return ExitCode::from(2);
        }
    }

    // Set up an async runtime.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("Couldn't start Tokio: {error}");
            return ExitCode::from(2);
        }
    };

    // Enter the runtime.
    runtime.block_on(async {
        // Spawn the units.
        let mut center_tx = None;
        let mut unit_txs = foldhash::HashMap::default();
        if let Err(err) =
            manager::spawn(&center, update_rx, &mut center_tx, &mut unit_txs).await
        {
            tracing::error!("Failed to spawn units: {err}");
            return ExitCode::from(2);
        }

        let result = loop {
            tokio::select! {
                // Watch for CTRL-C (SIGINT).
                res = tokio::signal::ctrl_c() => {
                    if let Err(error) = res {
                        tracing::error!(
                            "Listening for CTRL-C (SIGINT) failed: {error}"
                        );
                        break ExitCode::from(1);
                    }
                    break ExitCode::SUCCESS;
                }

                _ = manager::forward_app_cmds(&mut app_cmd_rx, &unit_txs) => {}
            }
        };

        // Shut the hub down.
        if let Some(center_tx) = center_tx {
            let _ = center_tx.send(TargetCommand::Terminate);
            center_tx.closed().await;
        }
        for (_name, tx) in unit_txs {
            let _ = tx.send(ApplicationCommand::Terminate);
            tx.closed().await;
        }

        // Persist the current state.
        center.save_state_now();

        result
    })
}

/// Load the configured Ed25519 signing key, if any.
fn load_signing_key(
    config: &Config,
) -> Result<Option<ring::signature::Ed25519KeyPair>, String> {
    let Some(path) = &config.signing.key_path else {
        return Ok(None);
    };
    let bytes =
        std::fs::read(path.as_std_path()).map_err(|err| format!("{path}: {err}"))?;
    let key = ring::signature::Ed25519KeyPair::from_pkcs8(&bytes)
        .map_err(|err| format!("{path}: not a PKCS#8 Ed25519 key: {err}"))?;
    Ok(Some(key))
}

mod config;
mod logging;

use std::{process::ExitCode, sync::Arc};

use config::SmokeConfig;
use lattice_client::{ReqwestTransport, spawn_client};
use lattice_core::{ClientCommand, ClientEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            eprintln!("Required: LATTICE_USER and LATTICE_PASSWORD, or LATTICE_TOKEN and LATTICE_USER_ID");
            return ExitCode::FAILURE;
        }
    };
    info!(homeserver = %config.client.homeserver, login = ?config.login, "starting lattice-smoke");

    let transport = match ReqwestTransport::new() {
        Ok(transport) => Arc::new(transport),
        Err(err) => {
            error!(error = %err, "failed to build HTTP transport");
            return ExitCode::FAILURE;
        }
    };
    let handle = match spawn_client(config.client, transport) {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "failed to start client");
            return ExitCode::FAILURE;
        }
    };

    let mut events = handle.subscribe();
    if let Err(err) = handle.send(config.login.into_command()).await {
        error!(error = %err, "client runtime is gone");
        return ExitCode::FAILURE;
    }

    let deadline = tokio::time::sleep(config.run_for);
    tokio::pin!(deadline);
    let mut status = ExitCode::SUCCESS;
    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("run time elapsed");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event);
                    if let ClientEvent::LoginFailed { .. } = event {
                        status = ExitCode::FAILURE;
                        break;
                    }
                    if let ClientEvent::SyncFailed { recoverable: false, .. } = event {
                        status = ExitCode::FAILURE;
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    if handle.send(ClientCommand::Disconnect).await.is_ok() {
        // Let the runtime report the status change before exiting.
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv()).await;
    }
    status
}

fn print_event(event: &ClientEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(err) => warn!(error = %err, "failed to serialize event"),
    }
}

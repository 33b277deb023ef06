//! `panelbridge` – connects cockpit panels to a flight simulator.
//!
//! 1. Initialises logging (and OTLP span export when configured).
//! 2. Loads `~/.panelbridge/config.toml`, falling back to built-in defaults.
//! 3. Opens every panel transport and the simulator exchange.
//! 4. Runs until Ctrl-C, then shuts every panel down cleanly.
//!
//! `panelbridge --init-config` writes the default configuration and exits.

mod config;
mod telemetry;
mod wiring;

use std::process::ExitCode;

use panelbridge_middleware::shutdown_channel;
use panelbridge_types::BridgeError;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::wiring::Wiring;

fn main() -> ExitCode {
    let _telemetry = telemetry::init_tracing("panelbridge");

    if std::env::args().skip(1).any(|arg| arg == "--init-config") {
        return match config::save(&Config::default()) {
            Ok(path) => {
                info!(path = %path.display(), "wrote default configuration");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "could not write configuration");
                ExitCode::FAILURE
            }
        };
    }

    let config = match config::load() {
        Ok(Some(config)) => config,
        Ok(None) => {
            info!(path = %config::config_path().display(), "no configuration file, using defaults");
            let mut config = Config::default();
            config::apply_env_overrides(&mut config);
            config
        }
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "could not start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => {
            info!("panelbridge stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "panelbridge failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), BridgeError> {
    let bridge = Wiring::new(config).build().await?;
    if let Some(addr) = bridge.exchange_addr() {
        info!(addr = %addr, "waiting for the simulator");
    }

    let (trigger, signal) = shutdown_channel();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Ctrl-C received, shutting down");
        trigger.trigger();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; stop the process with SIGKILL");
    }

    bridge.run(signal).await
}

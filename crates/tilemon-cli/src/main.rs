//! `tilemon-cli` – station supervisor binary
//!
//! This binary is the entry point of a station's supervisory core. It:
//!
//! 1. Initialises structured logging (and OTLP span export when
//!    `OTEL_EXPORTER_OTLP_ENDPOINT` is set).
//! 2. Loads the station configuration from the first argument,
//!    `TILEMON_CONFIG`, or `./tilemon.toml`; any error is fatal.
//! 3. Starts the station: one poller per device, the command executor and
//!    the orchestrators.
//! 4. Logs faults as they are published and a station health line at a
//!    fixed interval.
//! 5. On **Ctrl-C** cancels the pollers, joins them and exits.

mod config;

use std::process::ExitCode;

use tilemon_middleware::{Topic, TopicReceiver};
use tilemon_runtime::{Station, init_tracing};
use tilemon_types::{EventPayload, HealthVerdict};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let _telemetry = init_tracing("tilemon");

    let path = config::config_path(std::env::args().nth(1));
    let file = match config::load(&path) {
        Ok(file) => file,
        Err(e) => {
            error!(path = %path.display(), error = %e, "configuration rejected");
            return ExitCode::FAILURE;
        }
    };
    let interval = file.health_log_interval();
    let station = match file.build().and_then(|(registry, config)| Station::start(registry, config)) {
        Ok(station) => station,
        Err(e) => {
            error!(path = %path.display(), error = %e, "station failed to start");
            return ExitCode::FAILURE;
        }
    };
    info!(path = %path.display(), devices = station.registry().len(), "configuration loaded");

    let faults = tokio::spawn(log_faults(station.bus().subscribe_to(Topic::Faults)));

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "cannot listen for Ctrl-C, shutting down");
                }
                break;
            }
            _ = ticker.tick() => log_health(&station),
        }
    }

    info!("Ctrl-C received, shutting down");
    faults.abort();
    station.shutdown().await;
    ExitCode::SUCCESS
}

// ─────────────────────────────────────────────────────────────────────────────
// Reporting
// ─────────────────────────────────────────────────────────────────────────────

fn log_health(station: &Station) {
    let (verdict, violations) = station.aggregate(&[]);
    match verdict {
        HealthVerdict::Ok => info!(%verdict, "station health"),
        _ => {
            warn!(%verdict, violations = violations.len(), "station health");
            for violation in &violations {
                warn!(
                    device = %violation.device,
                    attribute = %violation.attribute,
                    verdict = %violation.verdict,
                    cause = %violation.cause,
                    "health violation"
                );
            }
        }
    }
}

async fn log_faults(mut faults: TopicReceiver) {
    loop {
        match faults.recv().await {
            Ok(event) => match event.payload {
                EventPayload::CommunicationFault {
                    device,
                    consecutive_failures,
                    details,
                } => error!(%device, consecutive_failures, %details, "communication fault"),
                EventPayload::CommunicationRestored { device } => {
                    info!(%device, "communication restored");
                }
                EventPayload::StuckTransition { device, expected } => {
                    error!(%device, %expected, "stuck programming transition");
                }
                _ => {}
            },
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "fault log lagging"),
            Err(RecvError::Closed) => break,
        }
    }
}

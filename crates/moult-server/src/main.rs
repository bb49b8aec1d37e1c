use std::process::ExitCode;

use anyhow::{Context, Result};
use moult::{FdHandoff, Handoff, HandoffError, Orchestrator, RestartConfig, Shutdown, SignalEvents};
use tracing::{error, info};

mod echo;
mod telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize telemetry
    let telemetry_init = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        telemetry::init()
    } else {
        telemetry::init_local()
    };
    if let Err(e) = telemetry_init {
        eprintln!("Failed to init telemetry: {e}");
        return ExitCode::FAILURE;
    }

    info!("moult-server starting...");
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "Process info");

    let code = match run().await {
        Ok(shutdown) => {
            info!(
                event = %shutdown.event,
                identity = ?shutdown.identity,
                drained = shutdown.drained,
                "moult-server exiting"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "moult-server failed");
            ExitCode::FAILURE
        }
    };

    telemetry::shutdown();
    code
}

async fn run() -> Result<Shutdown> {
    let config = RestartConfig::from_env().context("Failed to load restart configuration")?;
    config.log_config();

    let handoff = FdHandoff::from_config(&config);
    let events = SignalEvents::register().context("Failed to install signal handlers")?;

    // Exec discards buffered telemetry, so flush it when replacing the image.
    let orchestrator = Orchestrator::new(config, FlushingHandoff(handoff), events);
    let shutdown = orchestrator
        .run(echo::EchoHandler)
        .await
        .context("Restart lifecycle failed")?;

    Ok(shutdown)
}

/// Flushes telemetry right before the process image is replaced. The providers
/// keep running so a failed exec is still logged.
struct FlushingHandoff(FdHandoff);

impl Handoff for FlushingHandoff {
    fn try_inherit(&mut self) -> Result<Option<std::net::TcpListener>, HandoffError> {
        self.0.try_inherit()
    }

    fn notify_predecessor(&mut self) -> Result<(), HandoffError> {
        self.0.notify_predecessor()
    }

    fn replace_process_image(
        &mut self,
        socket: std::net::TcpListener,
    ) -> Result<std::convert::Infallible, HandoffError> {
        telemetry::flush();
        self.0.replace_process_image(socket)
    }

    fn spawn_successor(
        &mut self,
        socket: &std::net::TcpListener,
    ) -> Result<u32, HandoffError> {
        self.0.spawn_successor(socket)
    }
}

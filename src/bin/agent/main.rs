mod brain;
mod face;
mod hands;
mod reflex;

use anyhow::{Context, Result};
use canvas_pilot::{AgentConfig, SessionHost, SessionOutcome, SessionReport, UserRequest};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use face::UiEvent;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "agent", version, about = "Screenshot-driven automation for canvas web apps")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Attempts per step before recovery and fallback (1-3)
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    /// Pause after processing-likely actions, in milliseconds
    #[arg(long, global = true)]
    pause_ms: Option<u64>,

    /// Where to write the session history as JSON
    #[arg(long, global = true)]
    history_out: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Debug port of an already running Chrome to attach to
    #[arg(long, global = true, default_value_t = 9222)]
    chrome_port: u16,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the web UI and run requests typed there (default)
    Serve,
    /// Run a single request and exit
    Run { request: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut config = AgentConfig::from_env().context("invalid agent configuration")?;
    if let Some(attempts) = cli.max_attempts {
        config = config.max_attempts(attempts);
    }
    if let Some(ms) = cli.pause_ms {
        config = config.processing_pause(Duration::from_millis(ms));
    }

    let data_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("canvas-pilot");
    let profile_dir = data_dir.join("chrome-profile");
    let port = cli.chrome_port;

    info!("launching Chrome");
    let driver = tokio::task::spawn_blocking(move || hands::ChromeDriver::launch(port, &profile_dir))
        .await
        .context("browser launch panicked")??;
    let driver = Arc::new(driver);

    let perceiver = Arc::new(brain::VisionPerceiver::from_env()?);
    let secondary = Arc::new(reflex::ComputerUseModel::from_env(driver.clone())?);
    let host = SessionHost::new(driver, perceiver, secondary, config)?;

    let history = HistorySink {
        explicit: cli.history_out,
        dir: data_dir.join("history"),
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Run { request } => {
            let request = UserRequest::parse(&request)?;
            let report = run_with_ctrl_c(&host, &request).await?;
            history.save(&report);
            println!("{}", report.outcome);
            // returning keeps the drop order, so a Chrome the agent launched is closed
            ensure_completed(&report.outcome)?;
        }
        Command::Serve => serve(host, history).await?,
    }
    Ok(())
}

/// Non-zero exit for any outcome but Completed.
fn ensure_completed(outcome: &SessionOutcome) -> Result<()> {
    match outcome {
        SessionOutcome::Completed => Ok(()),
        other => Err(anyhow::anyhow!("session did not complete: {}", other)),
    }
}

fn init_tracing(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .with_target(false)
        .try_init();
}

async fn serve(host: SessionHost, history: HistorySink) -> Result<()> {
    let (mut cmd_rx, ui_tx) = face::start_server().await?;
    spawn_forwarder(&host, ui_tx.clone());
    info!("ready, waiting for commands");

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                let Some(command) = command else { break };
                info!(command = %command, "received command");
                let request = match UserRequest::parse(&command) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "rejected command");
                        let _ = ui_tx.send(UiEvent::Rejected { message: e.to_string() });
                        continue;
                    }
                };
                match run_with_ctrl_c(&host, &request).await {
                    Ok(report) => history.save(&report),
                    Err(e) => error!(error = %e, "session stopped"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}

fn spawn_forwarder(host: &SessionHost, ui_tx: broadcast::Sender<UiEvent>) {
    let mut events = host.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let _ = ui_tx.send(UiEvent::Session(event));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "UI lagging"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Ctrl-C while a session runs stops it at the next step boundary.
async fn run_with_ctrl_c(host: &SessionHost, request: &UserRequest) -> Result<SessionReport> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, stopping at the next step boundary");
                cancel.cancel();
            }
        })
    };
    let report = host.run_session(request, &cancel).await;
    watcher.abort();
    Ok(report?)
}

struct HistorySink {
    explicit: Option<PathBuf>,
    dir: PathBuf,
}

impl HistorySink {
    fn save(&self, report: &SessionReport) {
        let path = match &self.explicit {
            Some(path) => path.clone(),
            None => {
                if let Err(e) = std::fs::create_dir_all(&self.dir) {
                    warn!(error = %e, "could not create history dir");
                    return;
                }
                self.dir
                    .join(format!("{}.json", chrono::Utc::now().format("%Y%m%dT%H%M%S")))
            }
        };
        match report.history.save_json(&path) {
            Ok(()) => info!(path = %path.display(), entries = report.history.len(), "history saved"),
            Err(e) => warn!(error = %format!("{:#}", e), "could not save history"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_completed_sessions_exit_cleanly() {
        assert!(ensure_completed(&SessionOutcome::Completed).is_ok());
        let err = ensure_completed(&SessionOutcome::Aborted("cancelled by caller".into()))
            .unwrap_err();
        assert!(err.to_string().contains("cancelled by caller"));
    }
}

//! SpoolSync Agent - keeps a live link with every configured printer
//!
//! - Connects each printer of the config file over its local MQTT broker
//! - Logs print start / completion and AMS changes as they happen
//! - Reads the calibration profiles once the first connection is up
//! - Periodically asks every printer for a full status report

mod config;

use anyhow::{Context, Result};
use config::{AgentConfig, AgentSettings};
use spoolsync_printer::health::severity_label;
use spoolsync_printer::{PrinterClient, PrinterEvent};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "spoolsync_agent=info,spoolsync_printer=info";

struct Agent {
    settings: AgentSettings,
    printers: Vec<PrinterClient>,
    watchers: Vec<JoinHandle<()>>,
}

impl Agent {
    fn new(config: AgentConfig) -> Result<Self> {
        let mut printers = Vec::with_capacity(config.printers.len());
        for printer in config.printers {
            let name = printer.display_name().to_string();
            let client = PrinterClient::new(printer)
                .with_context(|| format!("Invalid printer {name}"))?;
            client.enable_logging(config.agent.message_log);
            printers.push(client);
        }
        Ok(Agent {
            settings: config.agent,
            printers,
            watchers: Vec::new(),
        })
    }

    fn start(&mut self) -> Result<()> {
        for client in &self.printers {
            let watcher = tokio::spawn(watch_printer(client.clone(), self.settings.clone()));
            self.watchers.push(watcher);
            client
                .connect()
                .with_context(|| format!("Failed to start link with {}", client.serial()))?;
        }
        info!("Started {} printer link(s)", self.printers.len());
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        self.start()?;

        let refresh_secs = self.settings.refresh_interval_secs;
        let mut refresh_timer = interval(Duration::from_secs(refresh_secs.max(1)));
        // first tick fires immediately; connect already sends pushall
        refresh_timer.tick().await;

        loop {
            tokio::select! {
                _ = refresh_timer.tick(), if refresh_secs > 0 => self.refresh(),

                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for Ctrl-C")?;
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    fn refresh(&self) {
        for client in self.printers.iter().filter(|c| c.is_connected()) {
            if !client.request_status_update() {
                warn!("[{}] status refresh not sent", client.serial());
            }
            let health = client.link_health();
            debug!(
                "[{}] link {:?}, {} reconnect(s)",
                client.serial(),
                health.status,
                health.reconnects
            );
        }
    }

    fn shutdown(&mut self) {
        for client in &self.printers {
            client.disconnect();
        }
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
        info!("All printer links closed");
    }
}

/// Logs the events of one printer until its channel closes.
async fn watch_printer(client: PrinterClient, settings: AgentSettings) {
    let serial = client.serial().to_string();
    let mut events = client.subscribe();
    let mut calibration_read = !settings.read_calibration_on_connect;
    let mut alerts_seen = 0;

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!("[{serial}] missed {n} events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            PrinterEvent::PrintStarted { job } => {
                info!("[{serial}] 🖨️ print started: {}", job.filename);
            }
            PrinterEvent::PrintCompleted { outcome, job } => {
                info!("[{serial}] print {}: {}", outcome.as_str(), job.filename);
            }
            PrinterEvent::AmsChanged { units } => {
                info!("[{serial}] AMS changed ({} unit(s))", units.len());
            }
            PrinterEvent::StateChanged { state } => {
                if state.hms_alerts.len() != alerts_seen {
                    alerts_seen = state.hms_alerts.len();
                    for alert in &state.hms_alerts {
                        warn!("[{serial}] HMS {} ({})", alert.code, severity_label(alert.severity));
                    }
                }

                if state.connected && !calibration_read {
                    calibration_read = true;
                    let client = client.clone();
                    let nozzle = settings.calibration_nozzle.clone();
                    tokio::spawn(async move {
                        let profiles = client.read_calibration(&nozzle).await;
                        info!(
                            "[{}] {} calibration profile(s) for nozzle {nozzle}",
                            client.serial(),
                            profiles.len()
                        );
                        for profile in profiles {
                            debug!(
                                "[{}] cali_idx {} {} k={}",
                                client.serial(),
                                profile.slot_id,
                                profile.name,
                                profile.k_value
                            );
                        }
                    });
                }
            }
        }
    }
    debug!("[{serial}] event watcher stopped");
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🧵 SpoolSync Agent starting...");

    let config = AgentConfig::load().await.context("Failed to load configuration")?;
    if config.printers.is_empty() {
        let path = AgentConfig::config_file_path()?;
        if AgentConfig::is_first_time_setup() {
            config.save().await.context("Failed to write default configuration")?;
            info!("Wrote default configuration to {}", path.display());
        }
        error!("No printer configured in {}", path.display());
        return Ok(());
    }

    let mut agent = Agent::new(config).context("Failed to create agent")?;
    agent.run().await.context("Agent execution failed")?;
    Ok(())
}

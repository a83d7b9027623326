mod bridge;
mod browser;
mod controller;
mod http;
mod i18n;
mod worker;

use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use scrobbler_proto::config::Config;
use scrobbler_proto::connectors::load_registry;
use scrobbler_proto::options::OptionsManager;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::bridge::BridgeHandle;
use crate::controller::PageControllerFactory;
use crate::worker::{Collaborators, TabWorker, WorkerEvent};

/// Forwards WARN/ERROR lines to the connected browser shim as `Log` frames.
struct BridgeLogLayer {
    lines: broadcast::Sender<String>,
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for BridgeLogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut line = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        event.record(&mut LineWriter(&mut line));

        // Nobody subscribed means no browser is connected.
        let _ = self.lines.send(line);
    }
}

struct LineWriter<'a>(&'a mut String);

impl tracing::field::Visit for LineWriter<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let _ = match field.name() {
            "message" => write!(self.0, "{:?}", value),
            name => write!(self.0, " {}={:?}", name, value),
        };
    }
}

async fn write_pid_file(config: &Config) -> anyhow::Result<()> {
    let pid = std::process::id().to_string();
    if let Some(parent) = config.daemon.pid_file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&config.daemon.pid_file, pid).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tx, _) = broadcast::channel::<String>(100);

    let data_dir = scrobbler_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BridgeLogLayer {
            lines: log_tx.clone(),
        })
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,scrobbler_daemon=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    write_pid_file(&config).await?;

    let registry = load_registry(&config.connectors.connectors_toml)?;
    info!("{} connectors available", registry.len());

    let options = OptionsManager::new(config.daemon.options_file.clone());
    let bridge = BridgeHandle::new(Duration::from_millis(config.bridge.call_timeout_ms));

    let collab = Collaborators {
        resolver: Arc::new(registry),
        injector: Arc::new(bridge.clone()),
        action: Arc::new(bridge.clone()),
        browser: Arc::new(bridge.clone()),
        options: Arc::new(options),
        controllers: Arc::new(PageControllerFactory),
    };

    // Every external input funnels into the worker.
    let (event_tx, event_rx) = mpsc::channel::<WorkerEvent>(256);
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();

    let _bridge_handle = bridge::start_server(
        config.bridge.bind_address.clone(),
        config.bridge.port,
        bridge,
        event_tx.clone(),
        log_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            event_tx.clone(),
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {}", e);
            return;
        }
        info!("Interrupted, shutting down");
        let _ = shutdown_tx.send(WorkerEvent::Shutdown).await;
    });
    drop(event_tx);

    info!("Daemon initialised, running tab worker");
    let result = TabWorker::new(collab, notice_tx).run(event_rx, notice_rx).await;

    let _ = tokio::fs::remove_file(&config.daemon.pid_file).await;
    result
}

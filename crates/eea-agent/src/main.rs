//! Edge agent hosting an embedded workflow bundle.

mod connectivity;
mod console;
mod mqtt;
mod sensor;
mod telemetry;

use anyhow::Result;
use clap::Parser;
use connectivity::ConnectivityManager;
use eea_core::{AgentConfig, InboundEvent, LatestReading, Router};
use eea_runtime::{DefaultSandbox, GuestHost, RuntimeConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "eea-agent", version, about = "Runs an embedded workflow bundle on this device")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "EEA_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "DEVICE_ID")]
    device_id: Option<String>,

    #[arg(long, env = "ACCESS_KEY")]
    access_key: Option<String>,

    #[arg(long, env = "ACCESS_SECRET", hide_env_values = true)]
    access_secret: Option<String>,

    #[arg(long, env = "EEA_BROKER_HOST")]
    broker_host: Option<String>,

    #[arg(long, env = "EEA_BROKER_PORT")]
    broker_port: Option<u16>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn load_config(&self) -> eea_core::Result<AgentConfig> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::from_toml_file(path)?,
            None => AgentConfig::default(),
        };

        if let Some(device_id) = &self.device_id {
            config.device_id = device_id.clone();
        }
        if let Some(access_key) = &self.access_key {
            config.access_key = access_key.clone();
        }
        if let Some(access_secret) = &self.access_secret {
            config.access_secret = access_secret.clone();
        }
        if let Some(host) = &self.broker_host {
            config.broker.host = host.clone();
        }
        if let Some(port) = self.broker_port {
            config.broker.port = port;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init_telemetry(args.log_json)?;

    let config = Arc::new(args.load_config()?);
    info!("Starting embedded workflow agent {}", config.guest.version);
    info!(
        device_id = %config.device_id,
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        bundle_path = ?config.guest.bundle_path,
        "Configuration loaded"
    );

    let router = Router::new();
    let running = Arc::new(AtomicBool::new(true));
    let sensor_slot = config.sensor.as_ref().map(|_| Arc::new(LatestReading::new()));

    let connectivity = ConnectivityManager::new(
        mqtt::RumqttTransport::new(&config),
        &config,
        router.clone(),
        running.clone(),
    );
    let connectivity_handle = thread::Builder::new()
        .name("connectivity".into())
        .spawn(move || connectivity.run())?;

    if let (Some(sensor_config), Some(slot)) = (config.sensor.clone(), sensor_slot.clone()) {
        let running = running.clone();
        thread::Builder::new()
            .name("sensor".into())
            .spawn(move || sensor::run(sensor_config, slot, running))?;
    }

    if config.console {
        let router = router.clone();
        thread::Builder::new()
            .name("console".into())
            .spawn(move || console::run(std::io::stdin().lock(), router))?;
    }

    let guest_config = config.clone();
    let guest_router = router.clone();
    let guest_handle = thread::Builder::new()
        .name("guest-host".into())
        .spawn(move || -> eea_core::Result<()> {
            let sandbox = DefaultSandbox::new(RuntimeConfig::from(&guest_config.guest))?;
            let mut host = GuestHost::new(sandbox, guest_config, guest_router);
            if let Some(slot) = sensor_slot {
                host = host.with_sensor(slot);
            }
            host.run();
            Ok(())
        })?;

    let guest_task = tokio::task::spawn_blocking(move || guest_handle.join());
    tokio::pin!(guest_task);

    let guest_result = tokio::select! {
        result = &mut guest_task => result,
        _ = shutdown_signal() => {
            router.notify(InboundEvent::Shutdown);
            guest_task.await
        }
    };

    match guest_result {
        Ok(Ok(Ok(()))) => info!("Guest host finished"),
        Ok(Ok(Err(e))) => error!("Guest host failed: {}", e),
        Ok(Err(_)) => error!("Guest host thread panicked"),
        Err(e) => error!("Guest host task failed: {}", e),
    }

    info!("Shutting down connectivity");
    running.store(false, Ordering::SeqCst);
    if connectivity_handle.join().is_err() {
        error!("Connectivity thread panicked");
    }

    info!("Agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

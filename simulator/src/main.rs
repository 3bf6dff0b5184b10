mod behavior;
mod device;
mod fleet;
mod reporter;
mod telemetry;

use clap::Parser;
use device::{DeviceConfig, DeviceTiming, Phase, SimulatedDevice};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transport::{MqttTransport, TransportConfig};

#[derive(Debug, Parser)]
#[command(name = "simulator", about = "Simulated MQTT field devices")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker_host: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    broker_port: u16,

    /// Device to simulate as ID:TYPE:INTERVAL:ON|OFF (repeatable).
    #[arg(long = "device", value_name = "DEVICE")]
    devices: Vec<DeviceConfig>,

    /// Seconds to wait for devices to go offline before forcing exit.
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    shutdown_grace_secs: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let fleet = if args.devices.is_empty() {
        fleet::default_fleet()
    } else {
        args.devices
    };

    info!("Starting device simulator");
    info!(
        "Broker: {}:{}, Devices: {}",
        args.broker_host,
        args.broker_port,
        fleet.len()
    );

    let mut devices = JoinSet::new();
    let mut handles = Vec::new();

    for config in fleet {
        // One session per device; the suffix keeps restarts from colliding.
        let client_id = format!("sim-{}-{}", config.device_id, uuid::Uuid::new_v4().simple());
        let transport = Arc::new(MqttTransport::for_device(
            TransportConfig::new(&args.broker_host, args.broker_port, client_id),
            config.device_id.clone(),
        ));
        let device = SimulatedDevice::new(
            config,
            DeviceTiming::default(),
            transport,
            CancellationToken::new(),
        );
        handles.push(device.handle());
        devices.spawn(device.run());
    }

    info!("{} simulated devices running. Press Ctrl+C to stop.", devices.len());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Received shutdown signal, stopping devices");
    for handle in &handles {
        handle.stop();
    }

    let deadline = Instant::now() + Duration::from_secs(args.shutdown_grace_secs);
    loop {
        match timeout_at(deadline, devices.join_next()).await {
            Ok(Some(Err(e))) => error!("Device task failed during shutdown: {}", e),
            Ok(Some(Ok(()))) => {}
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "Devices did not stop within {}s, aborting {} task(s)",
                    args.shutdown_grace_secs,
                    devices.len()
                );
                devices.abort_all();
                break;
            }
        }
    }

    for handle in &handles {
        if handle.phase() != Phase::Stopped {
            warn!("Device [{}] did not shut down cleanly", handle.device_id());
        } else {
            info!(
                "Device [{}] stopped (power was {})",
                handle.device_id(),
                if handle.is_on() { "ON" } else { "OFF" }
            );
        }
    }

    info!("Device simulator stopped");
}

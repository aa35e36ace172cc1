use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use neopixel_link::domain::models::{ScannedDevice, SessionEvent};
use neopixel_link::domain::settings::{LinkSettings, Settings, SettingsService};
use neopixel_link::infrastructure::bluetooth::protocol::{self, Rgb};
use neopixel_link::infrastructure::bluetooth::simulated::{SimulatedAdapter, SimulatedPeripheral};
use neopixel_link::infrastructure::bluetooth::transport::GattService;
use neopixel_link::infrastructure::bluetooth::{
    connect_first_named, BleAdapter, DiscoveryScanner, LinkHandle, LinkService, ScanFilter,
};
use neopixel_link::infrastructure::logging;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Give up on finding the target device after this long
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Give up waiting for service discovery after this long
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

/// NeoPixel Link - push colours and text to a Bluefruit NeoPixel board
#[derive(Parser)]
#[command(name = "neopixel-link")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "NeoPixel BLE link", long_about = None)]
struct Cli {
    /// Settings file to use instead of the per-user one
    #[arg(short, long, env = "NEOPIXEL_LINK_CONFIG")]
    config: Option<PathBuf>,

    /// Override a setting for this run only, e.g. `--set max_chunk_size=16`
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List advertising devices
    Scan {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Set the strip colour, e.g. `#FF8000`
    Color { color: Rgb },
    /// Send a line of text over the UART
    Text { text: String },
}

enum Payload {
    Color(Rgb),
    Text(String),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings_service = match cli.config {
        Some(path) => SettingsService::load_from(path),
        None => SettingsService::new()?,
    };
    let mut settings = settings_service.get().clone();
    for pair in &cli.overrides {
        settings.apply_override(pair)?;
    }

    let _log_guard = logging::init_logger(&settings.log_settings)?;
    info!(
        "Starting NeoPixel Link (settings: {})",
        settings_service.path().display()
    );

    let adapter: Arc<dyn BleAdapter> = Arc::new(simulated_radio());

    match cli.command {
        Command::Scan { seconds } => scan(adapter, &settings, Duration::from_secs(seconds)).await,
        Command::Color { color } => {
            deliver(adapter, &mut settings_service, &settings, Payload::Color(color)).await
        }
        Command::Text { text } => {
            deliver(adapter, &mut settings_service, &settings, Payload::Text(text)).await
        }
    }
}

/// The platform stack is not wired in; a Bluefruit board and two
/// unrelated peripherals are advertising instead.
fn simulated_radio() -> SimulatedAdapter {
    SimulatedAdapter::new()
        .with_peripheral(SimulatedPeripheral::bluefruit_uart("C0:FF:EE:00:00:01").with_rssi(-58))
        .with_peripheral(
            SimulatedPeripheral::new("D4:36:39:00:00:02", Some("Heart Rate"))
                .with_service(GattService::new(HEART_RATE_SERVICE))
                .with_rssi(-71),
        )
        .with_peripheral(SimulatedPeripheral::new("F0:0D:00:00:00:03", None).with_rssi(-90))
}

fn scan_filter(link: &LinkSettings) -> anyhow::Result<ScanFilter> {
    Ok(ScanFilter {
        service_uuid: Some(protocol::parse_uuid(&link.uart_service_uuid)?),
        name: None,
        show_all: link.show_all_devices,
    })
}

async fn scan(
    adapter: Arc<dyn BleAdapter>,
    settings: &Settings,
    window: Duration,
) -> anyhow::Result<()> {
    let mut scanner = DiscoveryScanner::new(adapter, settings.link.scan_period());
    let mut found = scanner.start(scan_filter(&settings.link)?);
    if !scanner.is_scanning() {
        bail!("Bluetooth is not available");
    }

    let deadline = Instant::now() + window;
    let mut devices: BTreeMap<String, ScannedDevice> = BTreeMap::new();
    while let Ok(Some(device)) = tokio::time::timeout_at(deadline, found.recv()).await {
        debug!("Advertisement from {}", device.address);
        devices.insert(device.address.clone(), device);
    }
    scanner.stop();

    for device in devices.values() {
        println!(
            "{}  {:>4} dBm  {}",
            device.address,
            device.signal_strength,
            device.display_name()
        );
    }
    info!("{} devices found", devices.len());
    Ok(())
}

async fn deliver(
    adapter: Arc<dyn BleAdapter>,
    settings_service: &mut SettingsService,
    settings: &Settings,
    payload: Payload,
) -> anyhow::Result<()> {
    let link = &settings.link;
    let (handle, mut events) = LinkService::spawn(Some(adapter.clone()), link.clone());
    let mut scanner = DiscoveryScanner::new(adapter, link.scan_period());

    let device = timeout(
        CONNECT_TIMEOUT,
        connect_first_named(
            &handle,
            &mut scanner,
            scan_filter(link)?,
            &link.target_device_name,
        ),
    )
    .await
    .with_context(|| format!("'{}' not found", link.target_device_name))??;

    let result = send(&handle, &mut events, payload).await;
    handle.shutdown().await?;
    result?;

    settings_service.add_known_address(&device.address)?;
    println!("Sent to {} ({})", device.display_name(), device.address);
    Ok(())
}

async fn send(
    handle: &LinkHandle,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    payload: Payload,
) -> anyhow::Result<()> {
    timeout(DISCOVERY_TIMEOUT, wait_for_services(events))
        .await
        .context("Service discovery timed out")??;

    handle.enable_uart_notifications().await?;
    match payload {
        Payload::Color(color) => handle.send_color(color).await?,
        Payload::Text(text) => handle.send_text(&text).await?,
    }
    handle.wait_idle().await?;
    Ok(())
}

async fn wait_for_services(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
) -> anyhow::Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::ServicesDiscovered { status } => {
                if !status.is_success() {
                    info!("Service discovery reported status {}", status);
                }
                return Ok(());
            }
            SessionEvent::Disconnected => bail!("Device disconnected before services were ready"),
            other => debug!("{:?}", other),
        }
    }
    bail!("Link service stopped")
}

//! LoRa gateway bridge daemon.
//!
//! Opens the RN2483/RN2903 transceiver's serial port and GPIO reset
//! line, drives the command state machine off every line the reader
//! thread hands it, and runs the service client, snapshot export, and
//! timer/watchdog supervisor alongside it. Every intentional exit goes
//! through [`exit_codes`] so the orchestrator's restart logs show why.

use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::{Arc, Mutex as StdMutex};

use tracing::{info, warn};

use ttgate_bridge::codec::RouterContext;
use ttgate_bridge::radio::{gpio, serial, CommandStateMachine};
use ttgate_bridge::service::{ipinfo, IpInfo, ServiceClient};
use ttgate_bridge::snapshot::SnapshotStore;
use ttgate_bridge::supervisor::{self, SupervisorContext};
use ttgate_bridge::{exit_codes, queue, GatewayConfig};

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = GatewayConfig::from_env();

    if config.halt {
        info!("HALT set, exiting without touching the radio");
        std::process::exit(exit_codes::HALT_REQUESTED);
    }

    info!(serial = %config.serial_path, region = ?config.region, "starting gateway bridge");

    let http = reqwest::Client::builder()
        .build()
        .expect("reqwest client construction with static config cannot fail");
    let ip_info: IpInfo = ipinfo::fetch(&http).await;
    info!(country = %ip_info.country_code, timezone = %ip_info.timezone, "fetched ip geolocation");

    let (serial_writer, mut lines) = match serial::open(&config.serial_path).await {
        Ok(handles) => handles,
        Err(e) => {
            // The state machine's own watchdogs will notice the silence
            // and drive a reinit cycle; nothing more to do here but log.
            warn!(error = %e, "failed to open serial port, radio will remain unreachable until restart");
            (serial::SerialWriter::disabled(), tokio::sync::mpsc::unbounded_channel().1)
        }
    };

    let gpio_reset: Box<dyn gpio::ResetLine> = match gpio::RadioReset::open() {
        Ok(pin) => Box::new(pin),
        Err(e) => {
            warn!(error = %e, "failed to open GPIO reset line, hardware resets will be no-ops");
            Box::new(gpio::NullReset)
        }
    };

    let (queue_tx, queue_rx) = queue::channel();

    let service = Arc::new(ServiceClient::new(config.service_host.clone()));
    if let Err(e) = service.refresh_target_ip().await {
        warn!(error = %e, "initial service address resolution failed, will retry on the 5-minute tick");
    }

    let snapshot = Arc::new(SnapshotStore::new());

    let router_ctx = RouterContext {
        queue: queue_tx.clone(),
        service: service.clone(),
        snapshot: snapshot.clone(),
        location: Arc::from(ip_info.location_string().as_str()),
        latitude: config.latitude,
        longitude: config.longitude,
        altitude: config.altitude,
        gateway_id: Arc::new(StdMutex::new(String::new())),
        last_device: Arc::new(AtomicU32::new(0)),
        messages_received: Arc::new(AtomicU64::new(0)),
    };

    let state_machine = CommandStateMachine::new(
        serial_writer,
        gpio_reset,
        queue_tx,
        queue_rx,
        router_ctx.clone(),
        config.region,
        config.debug_failover,
    );
    state_machine.init().await;

    {
        let state_machine = state_machine.clone();
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                state_machine.process(line).await;
            }
            warn!("serial reader channel closed, no more lines will be processed");
        });
    }

    supervisor::spawn(SupervisorContext {
        state_machine,
        service,
        snapshot,
        router_ctx,
        ip_info,
        snapshot_path: config.snapshot_path,
        resin_device_name: config.resin_device_name,
        restart_when_unreachable_minutes: config.restart_when_unreachable_minutes,
    });

    // Every further exit happens from inside the supervisor task.
    std::future::pending::<()>().await;
}

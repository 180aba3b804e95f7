//! Five-cadence timer/watchdog supervisor.
//!
//! Runs as a single task with one `tokio::select!` loop over four
//! `tokio::time::Interval`s plus a one-shot sleep, rather than five
//! independent tasks: each branch keeps its own schedule via
//! `MissedTickBehavior::Delay`, but since they share one loop a slow branch
//! (a hung POST, a forced reinit) delays every other cadence until it
//! returns. Trades that coupling for one `JoinHandle` to track and
//! watchdog log lines that come out in a single readable total order —
//! following `src/node.rs`'s `spawn_event_task` multi-branch `select!`
//! idiom, generalized from "announces/link-events" branches to
//! "5s/1m/5m/15m/7d" branches.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::codec::RouterContext;
use crate::exit_codes;
use crate::radio::CommandStateMachine;
use crate::service::{IpInfo, ServiceClient};
use crate::snapshot::{celsius_to_display, SnapshotStore};

const SERIAL_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);
const STATE_CHANGE_INTERVAL: Duration = Duration::from_secs(60);
const STATS_INTERVAL: Duration = Duration::from_secs(5 * 60);
const MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(15 * 60);
const RESTART_SAFEGUARD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Minutes of uptime during which stats POST runs on the 1-minute tick
/// instead of waiting for the 5-minute one.
const STATS_CATCHUP_MINUTES: u64 = 5;

/// Everything the supervisor needs to drive its five cadences. Built once
/// in `main` and moved into the spawned task.
pub struct SupervisorContext {
    pub state_machine: Arc<CommandStateMachine>,
    pub service: Arc<ServiceClient>,
    pub snapshot: Arc<SnapshotStore>,
    pub router_ctx: RouterContext,
    pub ip_info: IpInfo,
    pub snapshot_path: String,
    pub resin_device_name: Option<String>,
    pub restart_when_unreachable_minutes: u64,
}

/// Spawn the supervisor task. Runs for the lifetime of the process —
/// every exit path it can reach is a `std::process::exit`, not a return.
pub fn spawn(ctx: SupervisorContext) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(ctx))
}

async fn run(ctx: SupervisorContext) {
    let start = Instant::now();

    let mut serial_tick = interval(SERIAL_WATCHDOG_INTERVAL);
    serial_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut state_tick = interval(STATE_CHANGE_INTERVAL);
    state_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stats_tick = interval(STATS_INTERVAL);
    stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut memory_tick = interval(MEMORY_CHECK_INTERVAL);
    memory_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let restart_safeguard = tokio::time::sleep(RESTART_SAFEGUARD);
    tokio::pin!(restart_safeguard);

    loop {
        tokio::select! {
            _ = serial_tick.tick() => {
                if ctx.state_machine.reply_watchdog_tick() {
                    warn!("serial reply watchdog expired, exiting for restart");
                    std::process::exit(exit_codes::SERIAL_WATCHDOG);
                }
            }

            _ = state_tick.tick() => {
                ctx.state_machine.on_state_change_tick().await;
                export_snapshot(&ctx).await;
                if start.elapsed() < Duration::from_secs(STATS_CATCHUP_MINUTES * 60) {
                    post_stats(&ctx).await;
                }
            }

            _ = stats_tick.tick() => {
                post_stats(&ctx).await;
                if let Err(e) = ctx.service.refresh_target_ip().await {
                    warn!(error = %e, "failed to re-resolve service address");
                }
            }

            _ = memory_tick.tick() => {
                log_memory_stats();
                if ctx.service.should_restart(ctx.restart_when_unreachable_minutes) {
                    warn!("cloud service unreachable past the extended-outage threshold, exiting for restart");
                    std::process::exit(exit_codes::EXTENDED_OUTAGE);
                }
            }

            _ = &mut restart_safeguard => {
                info!("7-day uptime safeguard elapsed, exiting for a clean restart");
                std::process::exit(exit_codes::UPTIME_LIMIT);
            }
        }
    }
}

/// One entry in the exported snapshot JSON, with temperature already
/// localized to this gateway's country.
#[derive(serde::Serialize)]
struct ExportedDevice {
    device_id: u32,
    minutes_ago: u64,
    snr: Option<f32>,
    latitude: Option<f32>,
    longitude: Option<f32>,
    altitude: Option<f32>,
    cpm: Option<u32>,
    battery_voltage: Option<f32>,
    env_temp: Option<f32>,
    env_temp_unit: Option<char>,
    env_humid: Option<f32>,
}

async fn export_snapshot(ctx: &SupervisorContext) {
    let exported: Vec<ExportedDevice> = ctx
        .snapshot
        .export()
        .await
        .into_iter()
        .map(|entry| {
            let (env_temp, env_temp_unit) = match entry.env_temp_celsius {
                Some(celsius) => {
                    let (value, unit) = celsius_to_display(celsius, &ctx.ip_info.country_code);
                    (Some(value), Some(unit))
                }
                None => (None, None),
            };
            ExportedDevice {
                device_id: entry.device_id,
                minutes_ago: entry.minutes_ago,
                snr: entry.snr,
                latitude: entry.latitude,
                longitude: entry.longitude,
                altitude: entry.altitude,
                cpm: entry.cpm,
                battery_voltage: entry.battery_voltage,
                env_temp,
                env_temp_unit,
                env_humid: entry.env_humid,
            }
        })
        .collect();

    match serde_json::to_vec(&exported) {
        Ok(bytes) => {
            if let Err(e) = tokio::fs::write(&ctx.snapshot_path, bytes).await {
                warn!(error = %e, path = %ctx.snapshot_path, "failed to write device snapshot");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize device snapshot"),
    }
}

async fn post_stats(ctx: &SupervisorContext) {
    let identity = ctx.state_machine.identity().await;
    let device_ids = ctx.snapshot.device_ids().await;
    let body = serde_json::json!({
        "hweui": identity.hweui,
        "region": identity.region.map(|r| format!("{r:?}")),
        "timezone": ctx.ip_info.timezone,
        "country": ctx.ip_info.country_code,
        "ip": ctx.ip_info.query,
        "resin_device_name": ctx.resin_device_name,
        "messages_received": ctx.router_ctx.messages_received.load(Ordering::Relaxed),
        "device_ids": device_ids.iter().map(u32::to_string).collect::<Vec<_>>().join(","),
        "ever_unreachable": ctx.service.ever_unreachable(),
    });

    if let Err(e) = ctx.service.send_stats(&body).await {
        warn!(error = %e, "stats POST failed");
    }
}

/// Logs resident set size on Linux, where `/proc/self/status` is always
/// present; a no-op everywhere else rather than pulling in a platform
/// memory-stats crate for one log line every 15 minutes.
#[cfg(target_os = "linux")]
fn log_memory_stats() {
    let rss = std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| status.lines().find(|l| l.starts_with("VmRSS:")).map(str::to_string));
    match rss {
        Some(line) => info!(rss = %line.trim_start_matches("VmRSS:").trim(), "memory stats"),
        None => info!("memory stats unavailable"),
    }
}

#[cfg(not(target_os = "linux"))]
fn log_memory_stats() {
    info!("memory stats logging is only implemented on linux");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;
    use crate::radio::gpio::FakeResetLine;
    use crate::radio::{CommandStateMachine, SerialWriter};
    use std::sync::atomic::AtomicU32;

    fn test_ctx() -> SupervisorContext {
        let (writer, _written) = SerialWriter::for_test();
        let (gpio, _pulses) = FakeResetLine::new();
        let (queue_tx, queue_rx) = queue::channel();
        let router_ctx = RouterContext {
            queue: queue_tx,
            service: Arc::new(ServiceClient::new("example.invalid".to_string())),
            snapshot: Arc::new(SnapshotStore::new()),
            location: Arc::from(""),
            latitude: None,
            longitude: None,
            altitude: None,
            gateway_id: Arc::new(std::sync::Mutex::new(String::new())),
            last_device: Arc::new(AtomicU32::new(0)),
            messages_received: Arc::new(std::sync::atomic::AtomicU64::new(3)),
        };
        let sm = CommandStateMachine::new(
            writer,
            Box::new(gpio),
            router_ctx.queue.clone(),
            queue_rx,
            router_ctx.clone(),
            None,
            false,
        );

        SupervisorContext {
            state_machine: sm,
            service: router_ctx.service.clone(),
            snapshot: router_ctx.snapshot.clone(),
            router_ctx,
            ip_info: IpInfo::default(),
            snapshot_path: "/tmp/does-not-matter.json".to_string(),
            resin_device_name: Some("gw-1".to_string()),
            restart_when_unreachable_minutes: 120,
        }
    }

    #[tokio::test]
    async fn stats_body_includes_message_count_and_device_ids() {
        let ctx = test_ctx();
        ctx.snapshot
            .merge(
                &crate::telecast::Telecast {
                    device_id: 11,
                    ..Default::default()
                },
                5.0,
            )
            .await;

        let identity = ctx.state_machine.identity().await;
        let device_ids = ctx.snapshot.device_ids().await;
        let body = serde_json::json!({
            "hweui": identity.hweui,
            "messages_received": ctx.router_ctx.messages_received.load(Ordering::Relaxed),
            "device_ids": device_ids.iter().map(u32::to_string).collect::<Vec<_>>().join(","),
        });

        assert_eq!(body["messages_received"], 3);
        assert_eq!(body["device_ids"], "11");
    }

    #[test]
    fn exported_device_localizes_temperature_for_fahrenheit_country() {
        let (value, unit) = celsius_to_display(20.0, "US");
        assert_eq!(unit, 'F');
        assert!((value - 68.0).abs() < 0.01);
    }
}

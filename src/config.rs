//! Environment-variable configuration.
//!
//! Loaded once at startup into a single flat struct; nothing here is
//! reloaded or watched for changes. Every variable name and default
//! matches the original gateway's environment contract.

use crate::radio::Region;

/// Cloud ingestion hostname, matching the original gateway's hardcoded
/// `ttUploadAddress`. Not currently overridable by environment — no env
/// var for it exists in the original deployment's documented contract.
pub const DEFAULT_SERVICE_HOST: &str = "tt.safecast.org";

pub const DEFAULT_SERIAL_PATH: &str = "/dev/ttyS0";
pub const DEFAULT_SNAPSHOT_PATH: &str = "/var/run/ttgate/snapshot.json";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// `SERIAL` — path to the transceiver's serial device.
    pub serial_path: String,
    /// `VERBOSE` — coarse debug/info toggle, independent of `RUST_LOG`.
    pub verbose: bool,
    /// `LAT`/`LON`/`ALT` — static position override, used when the device
    /// itself doesn't report GPS coordinates.
    pub latitude: Option<f32>,
    pub longitude: Option<f32>,
    pub altitude: Option<f32>,
    /// `REGION` — pins `eu` or `us`; absent means infer from the
    /// transceiver's version banner.
    pub region: Option<Region>,
    /// `HALT` — if set, exit immediately after loading config, before
    /// touching the serial port. Used to park a container without
    /// tearing it down.
    pub halt: bool,
    /// `DEBUG_FAILOVER` — forces the service-down synthesis path to fire
    /// on the next message regardless of actual reachability, for
    /// exercising the failover notification without a real outage.
    pub debug_failover: bool,
    /// `RESIN_DEVICE_NAME_AT_INIT` — device name assigned by the resin.io
    /// (balenaCloud) supervisor, included in stats reporting when present.
    pub resin_device_name: Option<String>,
    pub service_host: String,
    pub snapshot_path: String,
    pub restart_when_unreachable_minutes: u64,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            serial_path: std::env::var("SERIAL").unwrap_or_else(|_| DEFAULT_SERIAL_PATH.to_string()),
            verbose: env_flag("VERBOSE"),
            latitude: env_f32("LAT"),
            longitude: env_f32("LON"),
            altitude: env_f32("ALT"),
            region: Region::from_env(),
            halt: env_flag("HALT"),
            debug_failover: env_flag("DEBUG_FAILOVER"),
            resin_device_name: std::env::var("RESIN_DEVICE_NAME_AT_INIT").ok(),
            service_host: DEFAULT_SERVICE_HOST.to_string(),
            snapshot_path: std::env::var("SNAPSHOT_PATH").unwrap_or_else(|_| DEFAULT_SNAPSHOT_PATH.to_string()),
            restart_when_unreachable_minutes: std::env::var("RESTART_WHEN_UNREACHABLE_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(crate::service::reachability::DEFAULT_RESTART_MINUTES),
        }
    }
}

/// Any non-empty value counts as "set", matching the original's plain
/// `os.Getenv(x) != ""` checks rather than requiring `true`/`1`.
fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| !v.is_empty())
}

fn env_f32(name: &str) -> Option<f32> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_flag_false_when_unset() {
        std::env::remove_var("GATEWAY_CONFIG_TEST_FLAG");
        assert!(!env_flag("GATEWAY_CONFIG_TEST_FLAG"));
    }

    #[test]
    fn env_flag_true_when_set_nonempty() {
        std::env::set_var("GATEWAY_CONFIG_TEST_FLAG2", "1");
        assert!(env_flag("GATEWAY_CONFIG_TEST_FLAG2"));
        std::env::remove_var("GATEWAY_CONFIG_TEST_FLAG2");
    }

    #[test]
    fn env_f32_parses_float() {
        std::env::set_var("GATEWAY_CONFIG_TEST_LAT", "37.7");
        assert_eq!(env_f32("GATEWAY_CONFIG_TEST_LAT"), Some(37.7));
        std::env::remove_var("GATEWAY_CONFIG_TEST_LAT");
    }
}

//! Device snapshot store.
//!
//! Keeps the most recently known state of every device that has ever sent
//! a message, merged field-by-field so a later message with some fields
//! absent doesn't blank out values reported earlier. Entries are never
//! evicted during the process lifetime — per spec, memory growth is
//! bounded by the number of distinct devices a gateway ever hears, which
//! in practice is small and slow-growing.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::telecast::Telecast;

/// Everything remembered about one device, merged across every message
/// it has sent.
#[derive(Debug, Clone)]
pub struct SeenDevice {
    pub device_id: u32,
    pub last_seen: Instant,
    pub snr: Option<f32>,
    pub latitude: Option<f32>,
    pub longitude: Option<f32>,
    pub altitude: Option<f32>,
    pub cpm0: Option<u32>,
    pub cpm1: Option<u32>,
    pub cpm: Option<u32>,
    pub battery_voltage: Option<f32>,
    pub battery_soc: Option<f32>,
    pub battery_current: Option<f32>,
    pub env_temp: Option<f32>,
    pub env_humid: Option<f32>,
    pub env_press: Option<f32>,
    pub pms_pm01_0: Option<u32>,
    pub pms_pm02_5: Option<u32>,
    pub pms_pm10_0: Option<u32>,
    pub opc_pm01_0: Option<u32>,
    pub opc_pm02_5: Option<u32>,
    pub opc_pm10_0: Option<u32>,
}

impl SeenDevice {
    fn new(device_id: u32, now: Instant) -> Self {
        Self {
            device_id,
            last_seen: now,
            snr: None,
            latitude: None,
            longitude: None,
            altitude: None,
            cpm0: None,
            cpm1: None,
            cpm: None,
            battery_voltage: None,
            battery_soc: None,
            battery_current: None,
            env_temp: None,
            env_humid: None,
            env_press: None,
            pms_pm01_0: None,
            pms_pm02_5: None,
            pms_pm10_0: None,
            opc_pm01_0: None,
            opc_pm02_5: None,
            opc_pm10_0: None,
        }
    }

    /// Overwrite every field present in `msg`/`snr`; leave absent fields
    /// (proto default `0.0`/`0`) as they were. `last_seen` always advances.
    fn merge(&mut self, msg: &Telecast, snr: f32, now: Instant) {
        self.last_seen = now;
        if snr != crate::telecast::INVALID_SNR {
            self.snr = Some(snr);
        }
        if msg.latitude != 0.0 {
            self.latitude = Some(msg.latitude);
        }
        if msg.longitude != 0.0 {
            self.longitude = Some(msg.longitude);
        }
        if msg.altitude != 0.0 {
            self.altitude = Some(msg.altitude);
        }
        if msg.cpm0 != 0 {
            self.cpm0 = Some(msg.cpm0);
        }
        if msg.cpm1 != 0 {
            self.cpm1 = Some(msg.cpm1);
        }
        if msg.cpm != 0 {
            self.cpm = Some(msg.cpm);
        }
        if msg.battery_voltage != 0.0 {
            self.battery_voltage = Some(msg.battery_voltage);
        }
        if msg.battery_soc != 0.0 {
            self.battery_soc = Some(msg.battery_soc);
        }
        if msg.battery_current != 0.0 {
            self.battery_current = Some(msg.battery_current);
        }
        if msg.env_temp != 0.0 {
            self.env_temp = Some(msg.env_temp);
        }
        if msg.env_humid != 0.0 {
            self.env_humid = Some(msg.env_humid);
        }
        if msg.env_press != 0.0 {
            self.env_press = Some(msg.env_press);
        }
        if msg.pms_pm01_0 != 0 {
            self.pms_pm01_0 = Some(msg.pms_pm01_0);
        }
        if msg.pms_pm02_5 != 0 {
            self.pms_pm02_5 = Some(msg.pms_pm02_5);
        }
        if msg.pms_pm10_0 != 0 {
            self.pms_pm10_0 = Some(msg.pms_pm10_0);
        }
        if msg.opc_pm01_0 != 0 {
            self.opc_pm01_0 = Some(msg.opc_pm01_0);
        }
        if msg.opc_pm02_5 != 0 {
            self.opc_pm02_5 = Some(msg.opc_pm02_5);
        }
        if msg.opc_pm10_0 != 0 {
            self.opc_pm10_0 = Some(msg.opc_pm10_0);
        }
    }

    /// Sort key: recency bucketed to 15-minute windows (older buckets
    /// sort after newer ones), then strongest SNR first, then device id
    /// for a stable tie-break.
    fn sort_key(&self, now: Instant) -> (u64, Reverse<i64>, u32) {
        let minutes_ago = now.saturating_duration_since(self.last_seen).as_secs() / 60;
        let bucket = minutes_ago / 15;
        // SNR is reported in tenths so the Reverse ordering stays exact
        // without pulling in float ordering.
        let snr_key = Reverse(self.snr.map(|s| (s * 10.0) as i64).unwrap_or(i64::MIN));
        (bucket, snr_key, self.device_id)
    }
}

#[derive(Serialize)]
pub struct SnapshotEntry {
    pub device_id: u32,
    pub minutes_ago: u64,
    pub snr: Option<f32>,
    pub latitude: Option<f32>,
    pub longitude: Option<f32>,
    pub altitude: Option<f32>,
    pub cpm: Option<u32>,
    pub battery_voltage: Option<f32>,
    pub env_temp_celsius: Option<f32>,
    pub env_humid: Option<f32>,
}

pub struct SnapshotStore {
    devices: Mutex<HashMap<u32, SeenDevice>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub async fn merge(&self, msg: &Telecast, snr: f32) {
        let now = Instant::now();
        let mut devices = self.devices.lock().await;
        devices
            .entry(msg.device_id)
            .or_insert_with(|| SeenDevice::new(msg.device_id, now))
            .merge(msg, snr, now);
    }

    /// Every device ever merged, ascending by id, for the supervisor's
    /// periodic stats POST's comma-separated list of seen device IDs.
    pub async fn device_ids(&self) -> Vec<u32> {
        let devices = self.devices.lock().await;
        let mut ids: Vec<u32> = devices.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// A recency/SNR-sorted snapshot, ready for export.
    pub async fn export(&self) -> Vec<SnapshotEntry> {
        let now = Instant::now();
        let devices = self.devices.lock().await;
        let mut entries: Vec<&SeenDevice> = devices.values().collect();
        entries.sort_by_key(|d| d.sort_key(now));

        entries
            .into_iter()
            .map(|d| SnapshotEntry {
                device_id: d.device_id,
                minutes_ago: now.saturating_duration_since(d.last_seen).as_secs() / 60,
                snr: d.snr,
                latitude: d.latitude,
                longitude: d.longitude,
                altitude: d.altitude,
                cpm: d.cpm,
                battery_voltage: d.battery_voltage,
                env_temp_celsius: d.env_temp,
                env_humid: d.env_humid,
            })
            .collect()
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Countries whose weather reporting convention is Fahrenheit. Everywhere
/// else gets Celsius. Open question resolved against ISO-3166 country
/// codes since the distilled spec didn't pin the set down.
const FAHRENHEIT_COUNTRIES: &[&str] = &["US", "BS", "KY", "LR"];

pub fn celsius_to_display(celsius: f32, country_code: &str) -> (f32, char) {
    if FAHRENHEIT_COUNTRIES.contains(&country_code) {
        (celsius * 9.0 / 5.0 + 32.0, 'F')
    } else {
        (celsius, 'C')
    }
}

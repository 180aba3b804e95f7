//! Region-specific radio programming.
//!
//! Narrowed to the two bands this point-to-point gateway actually ships
//! in: EU868 and US915. There is no duty-cycle limiter here — the
//! original device firmware enforces its own transmit cadence, and the
//! gateway's job is only to program the transceiver's frequency and
//! power once at boot.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Eu868,
    Us915,
}

impl Region {
    /// Region pinned by the `REGION` environment variable, if any.
    pub fn from_env() -> Option<Self> {
        match std::env::var("REGION").ok()?.to_lowercase().as_str() {
            "eu" => Some(Region::Eu868),
            "us" => Some(Region::Us915),
            _ => None,
        }
    }

    pub fn frequency_hz(self) -> u32 {
        match self {
            Region::Eu868 => 868_100_000,
            Region::Us915 => 915_000_000,
        }
    }

    pub fn power_dbm(self) -> i32 {
        match self {
            Region::Eu868 => 15,
            Region::Us915 => 20,
        }
    }

    /// The sequence of `radio set ...` commands sent to the transceiver
    /// during init/reinit to program this region. Sent after `radio set
    /// wdt`, one per `SET_WDT_REPLY` cycle, before falling through to the
    /// receive-start path.
    pub fn setup_commands(self) -> Vec<String> {
        vec![
            "radio set mod lora".to_string(),
            format!("radio set freq {}", self.frequency_hz()),
            format!("radio set pwr {}", self.power_dbm()),
        ]
    }

    /// Infer a region from the transceiver's version-banner prefix when
    /// no explicit `REGION` environment override was given.
    pub fn from_version_banner(banner: &str) -> Option<Self> {
        if banner.starts_with("RN2483") {
            Some(Region::Eu868)
        } else if banner.starts_with("RN2903") {
            Some(Region::Us915)
        } else {
            None
        }
    }
}

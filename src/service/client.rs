//! HTTP client for the cloud ingestion service.
//!
//! Every forwarded message is a single POST; the service may answer with
//! a reply payload that must reach the originating device inside its
//! receive window, so this client never retries and never waits longer
//! than `REQUEST_TIMEOUT`.

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::reachability::ReachabilityState;

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(text)
            .map_err(serde::de::Error::custom)
    }
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const USER_AGENT: &str = "TTGATE";
const DNS_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Body of a forwarded-message POST to `/send`, matching the original
/// gateway's `TTGateReq` wire shape exactly.
#[derive(Debug, Serialize)]
pub struct ForwardRequest {
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub received_at: String,
    pub gateway_id: String,
    pub longitude: f32,
    pub latitude: f32,
    pub altitude: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f32>,
    pub location: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct ForwardReply {
    /// Present only when the service has a payload to transmit back to
    /// the originating device within its reply window.
    #[serde(default, with = "base64_bytes_opt")]
    pub reply: Option<Vec<u8>>,
}

mod base64_bytes_opt {
    use base64::Engine;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(d)?;
        text.map(|t| {
            base64::engine::general_purpose::STANDARD
                .decode(t)
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

#[derive(Debug)]
pub enum ServiceError {
    Request(reqwest::Error),
    Status(reqwest::StatusCode),
    Decode(reqwest::Error),
    Dns,
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request(e) => write!(f, "request failed: {e}"),
            Self::Status(s) => write!(f, "service returned status {s}"),
            Self::Decode(e) => write!(f, "response decode failed: {e}"),
            Self::Dns => write!(f, "could not resolve service hostname"),
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request(e) | Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

pub struct ServiceClient {
    http: reqwest::Client,
    host: String,
    target_ip: Mutex<Option<IpAddr>>,
    reachability: Mutex<ReachabilityState>,
}

impl ServiceClient {
    pub fn new(host: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .expect("reqwest client construction with static config cannot fail");

        Self {
            http,
            host,
            target_ip: Mutex::new(None),
            reachability: Mutex::new(ReachabilityState::new()),
        }
    }

    /// True unless the service has been failing for long enough that
    /// devices should be told to fail over to cellular (§4.5 debounced
    /// predicate).
    pub fn is_reachable(&self) -> bool {
        let state = self.reachability.lock().expect("mutex poisoned");
        state.is_reachable() || !state.should_notify_down()
    }

    /// True once the outage has persisted past `restart_minutes` — the
    /// 15-minute supervisor tick consults this to decide whether to exit
    /// the process for an orchestrator-level restart.
    pub fn should_restart(&self, restart_minutes: u64) -> bool {
        self.reachability
            .lock()
            .expect("mutex poisoned")
            .should_restart(restart_minutes)
    }

    /// Whether this process has ever seen the service fail, even if it's
    /// reachable again now. Surfaced in the periodic stats report so an
    /// operator can tell a gateway with a clean history from one that
    /// recovered from an outage.
    pub fn ever_unreachable(&self) -> bool {
        self.reachability.lock().expect("mutex poisoned").ever_unreachable()
    }

    /// Re-resolve and cache the service's address. Deliberately pins to a
    /// single IP for `DNS_REFRESH_INTERVAL` rather than resolving on every
    /// request, so round-robin DNS doesn't fragment connection reuse.
    pub async fn refresh_target_ip(&self) -> Result<IpAddr, ServiceError> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), 80))
            .await
            .map_err(|_| ServiceError::Dns)?;
        let addr = addrs.next().ok_or(ServiceError::Dns)?.ip();
        *self.target_ip.lock().expect("mutex poisoned") = Some(addr);
        debug!(host = %self.host, ip = %addr, "resolved service address");
        Ok(addr)
    }

    pub fn dns_refresh_interval() -> Duration {
        DNS_REFRESH_INTERVAL
    }

    /// The address to actually connect to: the cached IP from the last
    /// successful `refresh_target_ip()`, or `host` itself before the first
    /// resolution (or if resolution has never succeeded). Requests always
    /// carry an explicit `Host` header, so pinning to the IP here doesn't
    /// change which virtual host the service sees.
    fn target_host(&self) -> String {
        match *self.target_ip.lock().expect("mutex poisoned") {
            Some(IpAddr::V6(ip)) => format!("[{ip}]"),
            Some(ip) => ip.to_string(),
            None => self.host.clone(),
        }
    }

    /// Forward a decoded message payload to the ingestion service. Every
    /// attempt, successful or not, feeds the reachability tracker that
    /// `is_reachable()`/`should_restart()` consult.
    pub async fn forward(&self, req: &ForwardRequest) -> Result<ForwardReply, ServiceError> {
        let result = self.do_forward(req).await;
        self.record_outcome(result.is_ok());
        result
    }

    async fn do_forward(&self, req: &ForwardRequest) -> Result<ForwardReply, ServiceError> {
        let url = format!("http://{}/send", self.target_host());
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::HOST, &self.host)
            .json(req)
            .send()
            .await
            .map_err(ServiceError::Request)?;

        if !response.status().is_success() {
            return Err(ServiceError::Status(response.status()));
        }

        response
            .json::<ForwardReply>()
            .await
            .map_err(ServiceError::Decode)
    }

    /// POST a periodic gateway stats heartbeat.
    pub async fn send_stats(&self, body: &serde_json::Value) -> Result<(), ServiceError> {
        let result = self.do_send_stats(body).await;
        self.record_outcome(result.is_ok());
        result
    }

    async fn do_send_stats(&self, body: &serde_json::Value) -> Result<(), ServiceError> {
        let url = format!("http://{}/gateway", self.target_host());
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::HOST, &self.host)
            .json(body)
            .send()
            .await
            .map_err(ServiceError::Request)?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "stats POST rejected by service");
            return Err(ServiceError::Status(response.status()));
        }
        Ok(())
    }

    fn record_outcome(&self, ok: bool) {
        self.reachability.lock().expect("mutex poisoned").record(ok);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_refresh_interval_is_five_minutes() {
        assert_eq!(ServiceClient::dns_refresh_interval(), Duration::from_secs(300));
    }

    #[test]
    fn forward_request_serializes_expected_shape() {
        let req = ForwardRequest {
            payload: vec![1, 2, 3],
            received_at: "2026-01-01T00:00:00Z".to_string(),
            gateway_id: "0004A30B001C0530".to_string(),
            longitude: -122.4,
            latitude: 37.7,
            altitude: 10,
            snr: Some(8.5),
            location: "US/Pacific".to_string(),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["payload"], serde_json::json!("AQID"));
        assert_eq!(value["latitude"], 37.7);
        assert_eq!(value["snr"], 8.5);
    }

    #[test]
    fn forward_request_omits_snr_when_absent() {
        let req = ForwardRequest {
            payload: vec![],
            received_at: "2026-01-01T00:00:00Z".to_string(),
            gateway_id: "0004A30B001C0530".to_string(),
            longitude: -122.4,
            latitude: 37.7,
            altitude: 10,
            snr: None,
            location: "US/Pacific".to_string(),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert!(value.get("snr").is_none());
    }
}

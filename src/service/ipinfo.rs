//! One-shot startup lookup of this gateway's public IP geolocation, used
//! to localize temperature units in the exported snapshot and to fill in
//! the forward request's `location` field.

use serde::Deserialize;

const IPINFO_URL: &str = "http://ip-api.com/json/";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct IpInfo {
    #[serde(default)]
    pub timezone: String,
    #[serde(rename = "countryCode", default)]
    pub country_code: String,
    #[serde(default)]
    pub query: String,
}

/// Fetch geolocation for this host's public IP. Best-effort: callers fall
/// back to `IpInfo::default()` on any failure rather than blocking
/// startup on a third-party service.
pub async fn fetch(http: &reqwest::Client) -> IpInfo {
    match http.get(IPINFO_URL).send().await {
        Ok(response) => response.json::<IpInfo>().await.unwrap_or_default(),
        Err(_) => IpInfo::default(),
    }
}

impl IpInfo {
    /// The `location` string embedded in every forward request body,
    /// e.g. "US/America/Los_Angeles".
    pub fn location_string(&self) -> String {
        if self.timezone.is_empty() {
            String::new()
        } else {
            format!("{}/{}", self.country_code, self.timezone)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_string_combines_country_and_timezone() {
        let info = IpInfo {
            timezone: "America/Los_Angeles".to_string(),
            country_code: "US".to_string(),
            query: "1.2.3.4".to_string(),
        };
        assert_eq!(info.location_string(), "US/America/Los_Angeles");
    }

    #[test]
    fn empty_timezone_yields_empty_location() {
        assert_eq!(IpInfo::default().location_string(), "");
    }
}

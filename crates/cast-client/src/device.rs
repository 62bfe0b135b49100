//! Device records handed in by discovery, and the HTTP setup endpoint.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cast_core::{CastError, CastResult};

/// Default control port.
pub const CONTROL_PORT: u16 = 8009;
/// Plain-HTTP setup port exposing `eureka_info`.
pub const SETUP_PORT: u16 = 8008;

/// Connection parameters for one receiver, as produced by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastDevice {
    pub address: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub status: String,
}

impl CastDevice {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            name: String::new(),
            uuid: String::new(),
            status: String::new(),
        }
    }
}

/// Subset of `/setup/eureka_info`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    pub name: String,
    #[serde(rename = "ip_address")]
    pub ip: String,
    pub locale: String,
    pub mac_address: String,
    pub ssid: String,
    pub timezone: String,
    #[serde(rename = "uptime")]
    pub uptime_secs: f64,
    pub ssdp_udn: String,
}

/// Fetch setup information from the device's HTTP endpoint.
pub async fn fetch_device_info(address: IpAddr, timeout: Duration) -> CastResult<DeviceInfo> {
    let base = format!("http://{}", std::net::SocketAddr::new(address, SETUP_PORT));
    fetch_device_info_from(&base, timeout).await
}

pub(crate) async fn fetch_device_info_from(base: &str, timeout: Duration) -> CastResult<DeviceInfo> {
    let url = format!("{base}/setup/eureka_info");
    tracing::debug!("fetching {}", url);

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CastError::Other(format!("http client: {e}")))?;

    let response = client
        .get(&url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| CastError::Connect(format!("GET {url}: {e}")))?;

    response
        .json::<DeviceInfo>()
        .await
        .map_err(|e| CastError::Serialization(format!("eureka_info: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use serde_json::json;

    #[tokio::test]
    async fn decodes_eureka_info() {
        let app = Router::new().route(
            "/setup/eureka_info",
            get(|| async {
                Json(json!({
                    "name": "Living Room",
                    "ip_address": "192.168.1.40",
                    "locale": "en-GB",
                    "mac_address": "AA:BB:CC:DD:EE:FF",
                    "ssid": "home",
                    "timezone": "Europe/London",
                    "uptime": 1234.5,
                    "ssdp_udn": "abc-123",
                    "build_version": "ignored"
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let info = fetch_device_info_from(&format!("http://{addr}"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(info.name, "Living Room");
        assert_eq!(info.ip, "192.168.1.40");
        assert_eq!(info.uptime_secs, 1234.5);
        assert_eq!(info.ssdp_udn, "abc-123");
    }

    #[tokio::test]
    async fn unreachable_device_is_a_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = fetch_device_info_from(&format!("http://{addr}"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, CastError::Connect(_)));
    }
}

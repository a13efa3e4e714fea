use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport a discovered camera is reachable over.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CameraProtocol {
    Rtsp,
    Http,
    Https,
    Onvif,
    Mjpeg,
}

impl CameraProtocol {
    pub fn all() -> Vec<CameraProtocol> {
        vec![
            CameraProtocol::Rtsp,
            CameraProtocol::Http,
            CameraProtocol::Onvif,
            CameraProtocol::Mjpeg,
        ]
    }
}

impl std::str::FromStr for CameraProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rtsp" => Ok(CameraProtocol::Rtsp),
            "http" => Ok(CameraProtocol::Http),
            "https" => Ok(CameraProtocol::Https),
            "onvif" => Ok(CameraProtocol::Onvif),
            "mjpeg" => Ok(CameraProtocol::Mjpeg),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

impl std::fmt::Display for CameraProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CameraProtocol::Rtsp => "rtsp",
            CameraProtocol::Http => "http",
            CameraProtocol::Https => "https",
            CameraProtocol::Onvif => "onvif",
            CameraProtocol::Mjpeg => "mjpeg",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CameraCapabilities {
    pub video_formats: Vec<String>,
    pub audio_support: bool,
    pub pan_tilt_zoom: bool,
    pub night_vision: bool,
    pub motion_detection: bool,
    pub max_resolution: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Basic,
    Digest,
    Token,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationInfo {
    pub required: bool,
    pub methods: Vec<AuthMethod>,
}

/// One camera found on the network, keyed by `ip:port`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredCamera {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub protocol: CameraProtocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub stream_url: String,
    pub capabilities: CameraCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthenticationInfo>,
}

/// Composite key used for every camera collection: `ip:port`.
pub fn camera_key(ip: &str, port: u16) -> String {
    format!("{ip}:{port}")
}

/// Scanner state machine phase.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryPhase {
    #[default]
    Initializing,
    ScanningNetwork,
    ProbingPorts,
    TestingRtsp,
    TestingHttp,
    OnvifDiscovery,
    ValidatingStreams,
    Completed,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryProgress {
    pub phase: DiscoveryPhase,
    #[serde(rename = "currentIP", skip_serializing_if = "Option::is_none")]
    pub current_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_port: Option<u16>,
    /// Overall completion, 0..=100.
    pub progress: u8,
    #[serde(rename = "totalIPs")]
    pub total_ips: u64,
    #[serde(rename = "scannedIPs")]
    pub scanned_ips: u64,
    pub found_cameras: u64,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResult {
    pub success: bool,
    pub cameras: Vec<DiscoveredCamera>,
    /// Milliseconds.
    pub duration: u64,
    pub network_range: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRange {
    /// CIDR notation, e.g. `192.168.1.0/24`.
    pub network: String,
    /// Dotted netmask, e.g. `255.255.255.0`.
    pub subnet: String,
    #[serde(rename = "startIP")]
    pub start_ip: String,
    #[serde(rename = "endIP")]
    pub end_ip: String,
    pub total_hosts: u64,
}

/// Fully resolved options for one discovery session. Immutable once a session starts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_range: Option<String>,
    /// Per-connection timeout in milliseconds.
    pub port_scan_timeout: u64,
    pub max_concurrent_scans: usize,
    pub skip_ping_test: bool,
    pub protocols: Vec<CameraProtocol>,
    pub deep_scan: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            network_range: None,
            port_scan_timeout: 2000,
            max_concurrent_scans: 20,
            skip_ping_test: false,
            protocols: CameraProtocol::all(),
            deep_scan: false,
        }
    }
}

impl DiscoveryOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.port_scan_timeout)
    }

    pub fn wants(&self, protocol: CameraProtocol) -> bool {
        self.protocols.contains(&protocol)
    }
}

/// Caller-supplied partial options; unset fields fall back to [`DiscoveryOptions::default`].
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryOverrides {
    pub network_range: Option<String>,
    pub port_scan_timeout: Option<u64>,
    pub max_concurrent_scans: Option<usize>,
    pub skip_ping_test: Option<bool>,
    pub protocols: Option<Vec<CameraProtocol>>,
    pub deep_scan: Option<bool>,
}

impl DiscoveryOverrides {
    pub fn merge_over(self, base: DiscoveryOptions) -> DiscoveryOptions {
        DiscoveryOptions {
            network_range: self.network_range.or(base.network_range),
            port_scan_timeout: self.port_scan_timeout.unwrap_or(base.port_scan_timeout),
            max_concurrent_scans: self.max_concurrent_scans.unwrap_or(base.max_concurrent_scans),
            skip_ping_test: self.skip_ping_test.unwrap_or(base.skip_ping_test),
            protocols: self.protocols.unwrap_or(base.protocols),
            deep_scan: self.deep_scan.unwrap_or(base.deep_scan),
        }
    }
}

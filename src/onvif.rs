//! ONVIF WS-Discovery over UDP multicast.
//!
//! One call sends a single SOAP `Probe` to `239.255.255.250:3702` and listens
//! for `ProbeMatches` until the discovery window closes.

use crate::error::{DiscoveryError, Result};
use crate::types::{camera_key, CameraCapabilities, CameraProtocol, DiscoveredCamera};
use indexmap::IndexMap;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const MULTICAST_PORT: u16 = 3702;
pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(5);
const MULTICAST_TTL: u32 = 128;
const DEFAULT_XADDR_PORT: u16 = 80;

/// First `ProbeMatch` of a `ProbeMatches` envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeMatch {
    pub xaddrs: Vec<String>,
    pub scopes: Vec<String>,
    pub types: Vec<String>,
}

/// A responding device, keyed by `address:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnvifDevice {
    pub address: IpAddr,
    pub port: u16,
    pub scopes: Vec<String>,
    pub xaddrs: Vec<String>,
}

impl OnvifDevice {
    pub fn key(&self) -> String {
        camera_key(&self.address.to_string(), self.port)
    }
}

#[derive(Debug, Clone)]
pub struct OnvifScanner {
    window: Duration,
    target: SocketAddr,
}

impl Default for OnvifScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl OnvifScanner {
    pub fn new() -> Self {
        Self {
            window: DISCOVERY_WINDOW,
            target: SocketAddr::new(IpAddr::V4(MULTICAST_ADDR), MULTICAST_PORT),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Send the probe somewhere other than the WS-Discovery multicast group.
    pub fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = target;
        self
    }

    pub async fn discover(&self) -> Result<Vec<DiscoveredCamera>> {
        self.discover_with_cancel(CancellationToken::new()).await
    }

    /// Run one discovery window. Cancelling ends the window early; devices
    /// collected so far are still returned.
    pub async fn discover_with_cancel(
        &self,
        cancel: CancellationToken,
    ) -> Result<Vec<DiscoveredCamera>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| DiscoveryError::socket("binding WS-Discovery socket", e))?;
        socket
            .set_broadcast(true)
            .map_err(|e| DiscoveryError::socket("enabling broadcast", e))?;
        socket
            .set_multicast_ttl_v4(MULTICAST_TTL)
            .map_err(|e| DiscoveryError::socket("setting multicast TTL", e))?;

        let probe = build_probe_message(Uuid::new_v4());
        socket
            .send_to(probe.as_bytes(), self.target)
            .await
            .map_err(|e| DiscoveryError::socket("sending WS-Discovery probe", e))?;
        debug!(target = %self.target, "sent WS-Discovery probe");

        let deadline = Instant::now() + self.window;
        let mut devices: IndexMap<String, OnvifDevice> = IndexMap::new();
        let mut buf = vec![0u8; 65_535];

        loop {
            let recv = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = time::sleep_until(deadline) => break,
                recv = socket.recv_from(&mut buf) => recv,
            };
            let (n, from) = match recv {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "WS-Discovery receive failed, closing window");
                    break;
                }
            };
            let message = String::from_utf8_lossy(&buf[..n]);
            if !message.contains("ProbeMatches") {
                continue;
            }
            match parse_probe_response(&message, from.ip()) {
                Ok(Some(device)) => {
                    devices.insert(device.key(), device);
                }
                Ok(None) => debug!(%from, "ProbeMatches without a ProbeMatch"),
                Err(e) => warn!(%from, error = %e, "skipping malformed ONVIF response"),
            }
        }
        drop(socket);

        info!(devices = devices.len(), "ONVIF discovery window closed");
        Ok(devices.values().map(device_to_camera).collect())
    }
}

/// WS-Discovery `Probe` envelope for ONVIF devices.
pub fn build_probe_message(message_id: Uuid) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope" xmlns:wsa="http://www.w3.org/2005/08/addressing" xmlns:wsdd="http://docs.oasis-open.org/ws-dd/ns/discovery/2009/01" xmlns:tds="http://www.onvif.org/ver10/device/wsdl">
  <soap:Header>
    <wsa:Action>http://docs.oasis-open.org/ws-dd/ns/discovery/2009/01/Probe</wsa:Action>
    <wsa:MessageID>uuid:{message_id}</wsa:MessageID>
    <wsa:ReplyTo>
      <wsa:Address>http://www.w3.org/2005/08/addressing/anonymous</wsa:Address>
    </wsa:ReplyTo>
    <wsa:To>urn:docs-oasis-open-org:ws-dd:ns:discovery:2009:01</wsa:To>
  </soap:Header>
  <soap:Body>
    <wsdd:Probe>
      <wsdd:Types>tds:Device</wsdd:Types>
    </wsdd:Probe>
  </soap:Body>
</soap:Envelope>"#
    )
}

fn parse_err(e: impl std::fmt::Display) -> DiscoveryError {
    DiscoveryError::Parse(e.to_string())
}

fn within_probe_matches(path: &[String]) -> bool {
    matches!(
        path,
        [root, .., body, parent]
            if root == "Envelope" && body == "Body" && parent == "ProbeMatches"
    )
}

/// Decode a SOAP envelope into its first `ProbeMatch`.
///
/// Element names are compared by local name, so `soap:Body`, `s:Body`,
/// `env:Body` and plain `Body` are all accepted.
pub fn parse_probe_matches(xml: &str) -> Result<Option<ProbeMatch>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut current: Option<ProbeMatch> = None;
    let mut first: Option<ProbeMatch> = None;

    loop {
        match reader.read_event().map_err(parse_err)? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "ProbeMatch" && first.is_none() && within_probe_matches(&path) {
                    current = Some(ProbeMatch::default());
                }
                path.push(name);
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"ProbeMatch"
                    && first.is_none()
                    && within_probe_matches(&path)
                {
                    first = Some(ProbeMatch::default());
                }
            }
            Event::End(_) => {
                if path.pop().as_deref() == Some("ProbeMatch") {
                    if let Some(m) = current.take() {
                        first.get_or_insert(m);
                    }
                }
            }
            Event::Text(t) => {
                if let Some(m) = current.as_mut() {
                    let text = t.unescape().map_err(parse_err)?;
                    let values = text.split_whitespace().map(str::to_string);
                    match path.last().map(String::as_str) {
                        Some("XAddrs") => m.xaddrs.extend(values),
                        Some("Scopes") => m.scopes.extend(values),
                        Some("Types") => m.types.extend(values),
                        _ => {}
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !path.is_empty() {
        return Err(DiscoveryError::Parse(format!(
            "unexpected end of document inside <{}>",
            path.join("/")
        )));
    }
    Ok(first)
}

/// Parse one datagram into a device seen from `source`.
pub fn parse_probe_response(xml: &str, source: IpAddr) -> Result<Option<OnvifDevice>> {
    Ok(parse_probe_matches(xml)?.map(|m| OnvifDevice {
        address: source,
        port: m
            .xaddrs
            .first()
            .and_then(|x| port_from_xaddr(x))
            .unwrap_or(DEFAULT_XADDR_PORT),
        scopes: m.scopes,
        xaddrs: m.xaddrs,
    }))
}

/// Explicit `:port` of an XAddr URL's authority, if any.
pub fn port_from_xaddr(xaddr: &str) -> Option<u16> {
    let rest = xaddr.split_once("://").map_or(xaddr, |(_, r)| r);
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let port = match host_port.rsplit_once(']') {
        Some((_, tail)) => tail.strip_prefix(':')?,
        None => host_port.rsplit_once(':')?.1,
    };
    port.parse().ok()
}

/// Segment following `token` in any scope URI (the last such scope wins).
fn scope_value<'a>(scopes: &'a [String], token: &str) -> Option<&'a str> {
    scopes
        .iter()
        .filter_map(|scope| {
            let segments: Vec<&str> = scope.split('/').collect();
            let idx = segments.iter().position(|s| s.eq_ignore_ascii_case(token))?;
            segments.get(idx + 1).copied().filter(|s| !s.is_empty())
        })
        .last()
}

pub fn device_to_camera(device: &OnvifDevice) -> DiscoveredCamera {
    let ip = device.address.to_string();
    let manufacturer = scope_value(&device.scopes, "hardware").unwrap_or("Unknown");
    let model = scope_value(&device.scopes, "type").map(str::to_string);
    let name = scope_value(&device.scopes, "name").map(|raw| {
        urlencoding::decode(raw)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| raw.to_string())
    });
    let stream_path = if device.xaddrs.iter().any(|x| x.contains(":554")) {
        "/onvif1"
    } else {
        "/stream1"
    };

    DiscoveredCamera {
        id: device.key(),
        stream_url: format!("rtsp://{ip}:554{stream_path}"),
        ip,
        port: device.port,
        protocol: CameraProtocol::Onvif,
        manufacturer: Some(manufacturer.to_string()),
        model,
        name,
        capabilities: CameraCapabilities {
            video_formats: vec!["H.264".into(), "H.265".into()],
            audio_support: true,
            pan_tilt_zoom: true,
            night_vision: false,
            motion_detection: true,
            max_resolution: "1080p".into(),
        },
        authentication: None,
    }
}

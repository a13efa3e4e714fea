use crate::error::{DiscoveryError, Result};
use crate::netdetect::{self, ResolvedRange};
use crate::patterns::{identify_manufacturer, Evidence};
use crate::ports::{Connector, TcpConnector, CAMERA_PORTS, HTTP_PORTS, LIVENESS_PORTS, RTSP_PORTS};
use crate::types::{
    camera_key, CameraCapabilities, CameraProtocol, DiscoveredCamera, DiscoveryOptions,
    DiscoveryPhase, DiscoveryProgress, DiscoveryResult,
};
use indexmap::IndexMap;
use rand::seq::SliceRandom;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// RTSP path suffixes tried, in order, on every RTSP candidate.
pub const RTSP_PROBE_PATHS: &[&str] = &[
    "/stream1",
    "/stream",
    "/live",
    "/cam/realmonitor?channel=1&subtype=0",
    "/h264Preview_01_main",
    "/video1",
    "/mjpeg/1",
    "/1",
];

/// Path appended to HTTP candidates.
pub const MJPEG_PATH: &str = "/video.mjpeg";

/// Progress callback, registered when the scanner is built.
///
/// Invoked with the scanner's state lock held so consumers observe updates
/// in order; it must not call back into the scanner.
pub type ProgressSink = Arc<dyn Fn(&DiscoveryProgress) + Send + Sync>;

/// Open `{ip, port}` pair found by the port prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Candidate {
    fn addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Finished,
}

#[derive(Debug)]
struct ScanState {
    run: RunState,
    progress: DiscoveryProgress,
    cameras: IndexMap<String, DiscoveredCamera>,
    started: Option<Instant>,
    finished: Option<Instant>,
    network: Option<String>,
    error: Option<String>,
}

/// Multi-phase network scanner. One instance supports exactly one run.
pub struct NetworkScanner {
    options: DiscoveryOptions,
    connector: Arc<dyn Connector>,
    sink: Option<ProgressSink>,
    cancel: CancellationToken,
    state: Mutex<ScanState>,
}

impl std::fmt::Debug for NetworkScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkScanner")
            .field("options", &self.options)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Reject option values that would make the scan meaningless, before any I/O.
pub fn validate_options(options: &DiscoveryOptions) -> Result<()> {
    if options.max_concurrent_scans == 0 {
        return Err(DiscoveryError::Configuration(
            "maxConcurrentScans must be at least 1".into(),
        ));
    }
    if options.port_scan_timeout == 0 {
        return Err(DiscoveryError::Configuration(
            "portScanTimeout must be at least 1 ms".into(),
        ));
    }
    if let Some(cidr) = options.network_range.as_deref() {
        netdetect::ensure_scannable(netdetect::parse_ipv4_cidr(cidr)?)?;
    }
    Ok(())
}

/// `base + span * done / total`, floored; a zero total counts as finished.
fn phase_percent(base: u8, span: u8, done: u64, total: u64) -> u8 {
    if total == 0 {
        return base + span;
    }
    let done = done.min(total);
    base + u8::try_from(u64::from(span) * done / total).unwrap_or(span)
}

fn advance(progress: &mut DiscoveryProgress, percent: u8) {
    progress.progress = progress.progress.max(percent.min(100));
}

impl NetworkScanner {
    pub fn new(options: DiscoveryOptions) -> Self {
        Self {
            options,
            connector: Arc::new(TcpConnector),
            sink: None,
            cancel: CancellationToken::new(),
            state: Mutex::new(ScanState {
                run: RunState::Idle,
                progress: DiscoveryProgress {
                    message: "Initializing network scan...".into(),
                    ..Default::default()
                },
                cameras: IndexMap::new(),
                started: None,
                finished: None,
                network: None,
                error: None,
            }),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_progress_sink(mut self, sink: ProgressSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn options(&self) -> &DiscoveryOptions {
        &self.options
    }

    /// Token cancelled by [`NetworkScanner::stop`]; shared with companion tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn state(&self) -> MutexGuard<'_, ScanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut DiscoveryProgress)) {
        let mut st = self.state();
        f(&mut st.progress);
        if let Some(sink) = &self.sink {
            sink(&st.progress);
        }
    }

    // After a stop only ERROR may still replace the "stopped" status.
    fn set_phase(&self, phase: DiscoveryPhase, message: impl Into<String>) {
        if self.cancel.is_cancelled() && phase != DiscoveryPhase::Error {
            return;
        }
        let message = message.into();
        self.update(|p| {
            p.phase = phase;
            p.message = message;
        });
    }

    // Status text written outside `set_phase` must not replace "stopped".
    fn update_unless_stopped(&self, f: impl FnOnce(&mut DiscoveryProgress)) {
        let mut st = self.state();
        if self.cancel.is_cancelled() {
            return;
        }
        f(&mut st.progress);
        if let Some(sink) = &self.sink {
            sink(&st.progress);
        }
    }

    fn complete(&self, message: impl Into<String>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let message = message.into();
        self.update(|p| {
            p.phase = DiscoveryPhase::Completed;
            p.message = message;
            advance(p, 100);
        });
    }

    /// Run the whole discovery pipeline to completion, cancellation or error.
    pub async fn start(&self) -> Result<()> {
        {
            let mut st = self.state();
            match st.run {
                RunState::Idle => {}
                RunState::Running => {
                    return Err(DiscoveryError::Concurrency(
                        "discovery already in progress".into(),
                    ))
                }
                RunState::Finished => {
                    return Err(DiscoveryError::Concurrency(
                        "scanner instance has already run".into(),
                    ))
                }
            }
            st.run = RunState::Running;
            st.started = Some(Instant::now());
            st.cameras.clear();
        }

        let outcome = self.scan_network().await;

        if let Err(e) = &outcome {
            warn!(error = %e, "network discovery failed");
            self.state().error = Some(e.to_string());
            self.set_phase(DiscoveryPhase::Error, format!("Discovery failed: {e}"));
        }

        let mut st = self.state();
        st.run = RunState::Finished;
        st.finished = Some(Instant::now());
        outcome
    }

    /// Request cooperative cancellation. The run ends at the next loop boundary.
    pub fn stop(&self) {
        self.cancel.cancel();
        info!("discovery stopped by user");
        self.update(|p| {
            if p.phase != DiscoveryPhase::Error {
                p.phase = DiscoveryPhase::Completed;
                p.message = "Discovery stopped by user".into();
            }
        });
    }

    pub fn is_running(&self) -> bool {
        self.state().run == RunState::Running
    }

    pub fn progress(&self) -> DiscoveryProgress {
        self.state().progress.clone()
    }

    pub fn results(&self) -> DiscoveryResult {
        let st = self.state();
        let duration = match (st.started, st.finished) {
            (Some(s), Some(f)) => f.duration_since(s),
            (Some(s), None) => s.elapsed(),
            _ => std::time::Duration::ZERO,
        };
        DiscoveryResult {
            success: st.run == RunState::Finished && st.progress.phase == DiscoveryPhase::Completed,
            cameras: st.cameras.values().cloned().collect(),
            duration: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            network_range: st
                .network
                .clone()
                .or_else(|| self.options.network_range.clone())
                .unwrap_or_else(|| "auto-detected".into()),
            error: st.error.clone(),
        }
    }

    /// Insert or overwrite cameras by `ip:port`.
    pub fn merge_cameras(&self, cameras: impl IntoIterator<Item = DiscoveredCamera>) {
        let mut st = self.state();
        for cam in cameras {
            st.cameras.insert(cam.id.clone(), cam);
        }
        st.progress.found_cameras = st.cameras.len() as u64;
        if let Some(sink) = &self.sink {
            sink(&st.progress);
        }
    }

    fn upsert(&self, camera: DiscoveredCamera) {
        debug!(id = %camera.id, stream = %camera.stream_url, "camera identified");
        self.merge_cameras(std::iter::once(camera));
    }

    async fn scan_network(&self) -> Result<()> {
        self.set_phase(DiscoveryPhase::Initializing, "Detecting network configuration...");
        validate_options(&self.options)?;
        let resolved = netdetect::resolve_network_range(self.options.network_range.as_deref())?;
        {
            let mut st = self.state();
            st.network = Some(resolved.range.network.clone());
            st.progress.total_ips = resolved.range.total_hosts;
        }
        info!(
            network = %resolved.range.network,
            hosts = resolved.range.total_hosts,
            "scanning network range"
        );

        self.set_phase(
            DiscoveryPhase::ScanningNetwork,
            format!("Scanning network range {}", resolved.range.network),
        );
        let live = self.scan_for_live_hosts(&resolved).await?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        if live.is_empty() {
            self.complete("No live hosts found on network");
            return Ok(());
        }

        self.set_phase(
            DiscoveryPhase::ProbingPorts,
            format!("Found {} live hosts, probing camera ports...", live.len()),
        );
        let candidates = self.probe_hosts_for_cameras(&live).await?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        if candidates.is_empty() {
            self.complete("No camera services found on network ports");
            return Ok(());
        }

        self.identify_protocols(&candidates).await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        if !self.state().cameras.is_empty() {
            self.set_phase(DiscoveryPhase::ValidatingStreams, "Validating camera streams...");
            self.validate_streams();
        }
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let found = self.state().cameras.len();
        info!(found, "network discovery completed");
        self.complete(format!("Discovery completed. Found {found} cameras."));
        Ok(())
    }

    /// Liveness phase (0-30%). Chunks of `maxConcurrentScans` run concurrently;
    /// each chunk is fully awaited before the next one starts.
    async fn scan_for_live_hosts(&self, resolved: &ResolvedRange) -> Result<Vec<Ipv4Addr>> {
        let hosts = resolved.hosts();
        let total = hosts.len() as u64;

        if self.options.skip_ping_test {
            self.update(|p| {
                p.scanned_ips = total;
                advance(p, 30);
            });
            return Ok(hosts);
        }

        let timeout = self.options.timeout();
        let mut live = Vec::new();
        let mut scanned = 0u64;

        for chunk in hosts.chunks(self.options.max_concurrent_scans) {
            if self.cancel.is_cancelled() {
                break;
            }

            let mut set = JoinSet::new();
            for (idx, &ip) in chunk.iter().enumerate() {
                let port = LIVENESS_PORTS
                    .choose(&mut rand::thread_rng())
                    .copied()
                    .unwrap_or(80);
                let connector = Arc::clone(&self.connector);
                let cancel = self.cancel.clone();
                set.spawn(async move {
                    if cancel.is_cancelled() {
                        return (idx, false);
                    }
                    let addr = SocketAddr::new(IpAddr::V4(ip), port);
                    (idx, connector.is_open(addr, timeout).await)
                });
            }

            let mut alive = vec![false; chunk.len()];
            while let Some(joined) = set.join_next().await {
                let (idx, is_live) = joined?;
                alive[idx] = is_live;
                scanned += 1;
                self.update(|p| {
                    p.current_ip = Some(chunk[idx].to_string());
                    p.scanned_ips = p.scanned_ips.max(scanned);
                    advance(p, phase_percent(0, 30, scanned, total));
                });
            }

            live.extend(
                chunk
                    .iter()
                    .zip(alive)
                    .filter_map(|(ip, is_live)| is_live.then_some(*ip)),
            );
        }

        debug!(live = live.len(), scanned, "liveness probe finished");
        Ok(live)
    }

    /// Port phase (30-70%). Every live host is checked against [`CAMERA_PORTS`].
    async fn probe_hosts_for_cameras(&self, hosts: &[Ipv4Addr]) -> Result<Vec<Candidate>> {
        let pairs: Vec<Candidate> = hosts
            .iter()
            .flat_map(|&ip| CAMERA_PORTS.iter().map(move |&port| Candidate { ip, port }))
            .collect();
        let total = pairs.len() as u64;
        let timeout = self.options.timeout();
        let mut candidates = Vec::new();
        let mut probed = 0u64;

        for chunk in pairs.chunks(self.options.max_concurrent_scans) {
            if self.cancel.is_cancelled() {
                break;
            }

            let mut set = JoinSet::new();
            for (idx, candidate) in chunk.iter().copied().enumerate() {
                let connector = Arc::clone(&self.connector);
                let cancel = self.cancel.clone();
                set.spawn(async move {
                    if cancel.is_cancelled() {
                        return (idx, false);
                    }
                    (idx, connector.is_open(candidate.addr(), timeout).await)
                });
            }

            let mut open = vec![false; chunk.len()];
            while let Some(joined) = set.join_next().await {
                let (idx, is_open) = joined?;
                open[idx] = is_open;
                probed += 1;
                self.update(|p| {
                    p.current_ip = Some(chunk[idx].ip.to_string());
                    p.current_port = Some(chunk[idx].port);
                    advance(p, phase_percent(30, 40, probed, total));
                });
            }

            candidates.extend(
                chunk
                    .iter()
                    .zip(open)
                    .filter_map(|(c, is_open)| is_open.then_some(*c)),
            );
        }

        debug!(candidates = candidates.len(), probed, "port probe finished");
        Ok(candidates)
    }

    /// Identification phase (70-95%). Reachability stands in for a protocol handshake.
    async fn identify_protocols(&self, candidates: &[Candidate]) {
        let total = candidates.len() as u64;

        for (i, candidate) in candidates.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }

            let camera = if RTSP_PORTS.contains(&candidate.port)
                && self.options.wants(CameraProtocol::Rtsp)
            {
                self.set_phase(
                    DiscoveryPhase::TestingRtsp,
                    format!("Testing protocols on {}:{}...", candidate.ip, candidate.port),
                );
                self.test_rtsp(candidate).await
            } else if HTTP_PORTS.contains(&candidate.port)
                && (self.options.wants(CameraProtocol::Http)
                    || self.options.wants(CameraProtocol::Mjpeg))
            {
                self.set_phase(
                    DiscoveryPhase::TestingHttp,
                    format!("Testing protocols on {}:{}...", candidate.ip, candidate.port),
                );
                Some(self.test_http(candidate).await)
            } else {
                None
            };

            if let Some(camera) = camera {
                self.upsert(camera);
            }

            let done = i as u64 + 1;
            self.update(|p| {
                p.current_ip = Some(candidate.ip.to_string());
                p.current_port = Some(candidate.port);
                advance(p, phase_percent(70, 25, done, total));
            });
        }
    }

    async fn test_rtsp(&self, candidate: &Candidate) -> Option<DiscoveredCamera> {
        for path in RTSP_PROBE_PATHS {
            if self.cancel.is_cancelled() {
                return None;
            }
            if self
                .connector
                .is_open(candidate.addr(), self.options.timeout())
                .await
            {
                return Some(rtsp_camera(candidate, path));
            }
        }
        None
    }

    async fn test_http(&self, candidate: &Candidate) -> DiscoveredCamera {
        let mut camera = http_camera(candidate);
        if self.options.deep_scan {
            if let Some(banner) = self
                .connector
                .http_banner(candidate.addr(), self.options.timeout())
                .await
            {
                let evidence = Evidence {
                    server_header: banner.server.as_deref(),
                    html: Some(banner.body.as_str()).filter(|b| !b.is_empty()),
                    ..Default::default()
                };
                camera.manufacturer = identify_manufacturer(&evidence).map(str::to_string);
            }
        }
        camera
    }

    /// Validation phase (95-100%). Never removes a discovered camera; the current
    /// implementation passes every entry through unchanged.
    fn validate_streams(&self) {
        let urls: Vec<String> = self
            .state()
            .cameras
            .values()
            .map(|c| c.stream_url.clone())
            .collect();
        let total = urls.len() as u64;

        for (i, url) in urls.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            let done = i as u64 + 1;
            self.update_unless_stopped(|p| {
                p.message = format!("Validating stream: {url}...");
                advance(p, phase_percent(95, 5, done, total));
            });
        }
    }
}

fn rtsp_camera(candidate: &Candidate, path: &str) -> DiscoveredCamera {
    let ip = candidate.ip.to_string();
    DiscoveredCamera {
        id: camera_key(&ip, candidate.port),
        stream_url: format!("rtsp://{ip}:{}{path}", candidate.port),
        ip,
        port: candidate.port,
        protocol: CameraProtocol::Rtsp,
        manufacturer: None,
        model: None,
        name: None,
        capabilities: CameraCapabilities {
            video_formats: vec!["H.264".into()],
            audio_support: false,
            pan_tilt_zoom: false,
            night_vision: false,
            motion_detection: false,
            max_resolution: "1080p".into(),
        },
        authentication: None,
    }
}

fn http_camera(candidate: &Candidate) -> DiscoveredCamera {
    let ip = candidate.ip.to_string();
    DiscoveredCamera {
        id: camera_key(&ip, candidate.port),
        stream_url: format!("http://{ip}:{}{MJPEG_PATH}", candidate.port),
        ip,
        port: candidate.port,
        protocol: CameraProtocol::Http,
        manufacturer: None,
        model: None,
        name: None,
        capabilities: CameraCapabilities {
            video_formats: vec!["MJPEG".into()],
            audio_support: false,
            pan_tilt_zoom: false,
            night_vision: false,
            motion_detection: false,
            max_resolution: "720p".into(),
        },
        authentication: None,
    }
}

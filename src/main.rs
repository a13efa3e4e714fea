use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use camscan::onvif::{OnvifScanner, DISCOVERY_WINDOW};
use camscan::server;
use camscan::types::{CameraProtocol, DiscoveredCamera, DiscoveryOverrides, DiscoveryResult};
use camscan::{DiscoveryEvent, DiscoveryService};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// camscan: find IP cameras on the local network without knowing their addresses.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "camscan",
    version,
    about = "Find IP cameras on the local network: TCP probing, RTSP/HTTP identification and ONVIF WS-Discovery.",
    long_about = None
)]
struct Cli {
    /// Range to scan (e.g. 192.168.1.0/24). If omitted, the primary interface's network is used.
    #[arg(long)]
    range: Option<String>,

    /// Per-connection timeout in milliseconds [default: 2000].
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Liveness/port probes run concurrently [default: 20].
    #[arg(long)]
    concurrency: Option<usize>,

    /// Treat every address as live instead of probing it first.
    #[arg(long = "skip-ping", default_value_t = false)]
    skip_ping: bool,

    /// Fetch HTTP banners to fingerprint manufacturers.
    #[arg(long = "deep-scan", default_value_t = false)]
    deep_scan: bool,

    /// Comma-separated protocols to look for (rtsp,http,onvif,mjpeg) [default: all].
    #[arg(long, value_delimiter = ',')]
    protocols: Vec<CameraProtocol>,

    /// Only run a single ONVIF WS-Discovery window.
    #[arg(long = "onvif-only", default_value_t = false)]
    onvif_only: bool,

    /// Write results as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Serve the discovery HTTP API on this address instead of scanning once.
    #[arg(long)]
    serve: Option<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn overrides(&self) -> DiscoveryOverrides {
        DiscoveryOverrides {
            network_range: self.range.clone(),
            port_scan_timeout: self.timeout_ms,
            max_concurrent_scans: self.concurrency,
            skip_ping_test: self.skip_ping.then_some(true),
            protocols: (!self.protocols.is_empty()).then(|| self.protocols.clone()),
            deep_scan: self.deep_scan.then_some(true),
        }
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let service = DiscoveryService::new();

    if let Some(bind) = cli.serve.as_deref() {
        println!("Serving discovery API at http://{bind}/api (Ctrl+C to stop)");
        return server::spawn_server(bind, service).await;
    }

    if cli.onvif_only {
        println!(
            "Running ONVIF WS-Discovery for {}s...",
            DISCOVERY_WINDOW.as_secs()
        );
        let started = std::time::Instant::now();
        let cameras = OnvifScanner::new()
            .discover()
            .await
            .context("ONVIF discovery failed")?;
        let result = DiscoveryResult {
            success: true,
            cameras,
            duration: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            network_range: "multicast".into(),
            error: None,
        };
        return report(&cli, &result);
    }

    let overrides = cli.overrides();
    println!("camscan configuration:");
    println!(
        "  range        : {}",
        cli.range.as_deref().unwrap_or("<auto-detect primary interface>")
    );
    println!("  timeout_ms   : {:?}", cli.timeout_ms.unwrap_or(2000));
    println!("  concurrency  : {:?}", cli.concurrency.unwrap_or(20));
    println!("  skip_ping    : {}", cli.skip_ping);
    println!("  deep_scan    : {}", cli.deep_scan);

    let result = run_session(&service, overrides).await?;
    report(&cli, &result)
}

async fn run_session(service: &DiscoveryService, overrides: DiscoveryOverrides) -> Result<DiscoveryResult> {
    let session_id = Uuid::new_v4().to_string();
    let mut events = service.subscribe();
    let handle = service.spawn(&session_id, overrides).await?;

    let mut stopping = false;
    let mut last_message = String::new();
    let result = loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Ok(ev) if ev.session_id() != session_id => {}
                Ok(DiscoveryEvent::Progress { progress, .. }) => {
                    if progress.message != last_message {
                        println!(
                            "[{:>3}%] {} ({}/{} hosts, {} cameras)",
                            progress.progress,
                            progress.message,
                            progress.scanned_ips,
                            progress.total_ips,
                            progress.found_cameras
                        );
                        last_message = progress.message;
                    }
                }
                Ok(DiscoveryEvent::Completed { result, .. }) => break Some(result),
                Ok(DiscoveryEvent::Error { error, .. }) => {
                    eprintln!("Discovery failed: {error}");
                    break None;
                }
                Ok(DiscoveryEvent::Stopped { .. }) => println!("Stopping..."),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break None,
            },
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                service.stop(&session_id).await?;
            }
        }
    };

    handle.await.context("discovery task panicked")??;
    result.context("discovery ended without a result")
}

fn report(cli: &Cli, results: &DiscoveryResult) -> Result<()> {
    print_results_table(results);
    if let Some(path) = cli.output.as_deref() {
        write_results_json(path, results)
            .with_context(|| format!("failed to write JSON to {}", path.display()))?;
        println!("Wrote JSON results to {}", path.display());
    }
    Ok(())
}

fn print_results_table(results: &DiscoveryResult) {
    let cell = |c: &DiscoveredCamera| c.manufacturer.clone().unwrap_or_default();
    let mut id_w = "id".len();
    let mut vendor_w = "manufacturer".len();
    for c in &results.cameras {
        id_w = id_w.max(c.id.len());
        vendor_w = vendor_w.max(cell(c).len().min(24));
    }
    let proto_w = "protocol".len();

    println!(
        "\nCameras found: {} in {:.1}s (range: {})",
        results.cameras.len(),
        Duration::from_millis(results.duration).as_secs_f64(),
        results.network_range
    );
    println!(
        "{:<id_w$}  {:<proto_w$}  {:<vendor_w$}  stream_url",
        "id", "protocol", "manufacturer"
    );
    println!("{:-<id_w$}  {:-<proto_w$}  {:-<vendor_w$}  {:-<10}", "", "", "", "");
    for c in &results.cameras {
        let mut vendor = cell(c);
        vendor.truncate(24);
        println!(
            "{:<id_w$}  {:<proto_w$}  {:<vendor_w$}  {}",
            c.id,
            c.protocol.to_string(),
            vendor,
            c.stream_url
        );
    }
}

fn write_results_json(path: &Path, results: &DiscoveryResult) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, results)?;
    Ok(())
}

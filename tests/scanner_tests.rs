mod support;

use camscan::scanner::{NetworkScanner, ProgressSink};
use camscan::types::{CameraProtocol, DiscoveryOptions, DiscoveryPhase, DiscoveryProgress};
use camscan::DiscoveryError;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::FakeNet;

fn options(range: &str) -> DiscoveryOptions {
    DiscoveryOptions {
        network_range: Some(range.to_string()),
        port_scan_timeout: 50,
        ..Default::default()
    }
}

fn camera_net() -> FakeNet {
    FakeNet::new().open("10.0.0.2", &[80, 443, 554, 8080])
}

#[tokio::test]
async fn finds_rtsp_and_http_services_on_live_host() {
    let scanner = NetworkScanner::new(options("10.0.0.0/30")).with_connector(Arc::new(camera_net()));
    scanner.start().await.unwrap();

    let res = scanner.results();
    assert!(res.success);
    assert_eq!(res.network_range, "10.0.0.0/30");
    assert!(res.error.is_none());

    let ids: Vec<&str> = res.cameras.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["10.0.0.2:554", "10.0.0.2:80", "10.0.0.2:8080"]);

    let rtsp = &res.cameras[0];
    assert_eq!(rtsp.protocol, CameraProtocol::Rtsp);
    assert_eq!(rtsp.stream_url, "rtsp://10.0.0.2:554/stream1");
    let http = &res.cameras[1];
    assert_eq!(http.protocol, CameraProtocol::Http);
    assert_eq!(http.stream_url, "http://10.0.0.2:80/video.mjpeg");
    assert!(http.manufacturer.is_none());

    let progress = scanner.progress();
    assert_eq!(progress.phase, DiscoveryPhase::Completed);
    assert_eq!(progress.progress, 100);
    assert_eq!(progress.found_cameras, 3);
    assert_eq!(progress.message, "Discovery completed. Found 3 cameras.");
    assert!(!scanner.is_running());
}

#[tokio::test]
async fn empty_network_completes_without_cameras() {
    let scanner = NetworkScanner::new(options("10.0.0.0/29")).with_connector(Arc::new(FakeNet::new()));
    scanner.start().await.unwrap();

    let progress = scanner.progress();
    assert_eq!(progress.phase, DiscoveryPhase::Completed);
    assert_eq!(progress.message, "No live hosts found on network");
    assert_eq!(progress.progress, 100);
    assert_eq!(progress.scanned_ips, 6);
    let res = scanner.results();
    assert!(res.success);
    assert!(res.cameras.is_empty());
}

#[tokio::test]
async fn live_host_without_camera_ports() {
    let net = FakeNet::new().open("10.0.0.1", &[80, 443, 554, 8080]);
    let opts = DiscoveryOptions {
        protocols: vec![CameraProtocol::Onvif],
        ..options("10.0.0.1/32")
    };
    let scanner = NetworkScanner::new(opts).with_connector(Arc::new(net));
    scanner.start().await.unwrap();
    // Ports are open but no selected protocol claims them.
    assert!(scanner.results().cameras.is_empty());
    assert_eq!(scanner.progress().phase, DiscoveryPhase::Completed);
}

#[tokio::test]
async fn skip_ping_probes_every_address_directly() {
    let net = Arc::new(camera_net());
    let opts = DiscoveryOptions {
        skip_ping_test: true,
        ..options("10.0.0.0/30")
    };
    let scanner = NetworkScanner::new(opts).with_connector(net.clone());
    scanner.start().await.unwrap();

    // Two hosts times ten candidate ports, plus one RTSP path check.
    assert_eq!(net.calls(), 21);
    assert!(net.probed().iter().all(|a| a.port() != 443));
    assert_eq!(scanner.results().cameras.len(), 3);
    assert_eq!(scanner.progress().scanned_ips, 2);
}

#[tokio::test]
async fn probes_never_exceed_concurrency_limit() {
    let net = Arc::new(FakeNet::new().delay(Duration::from_millis(2)));
    let opts = DiscoveryOptions {
        max_concurrent_scans: 5,
        ..options("10.1.0.0/26")
    };
    let scanner = NetworkScanner::new(opts).with_connector(net.clone());
    scanner.start().await.unwrap();

    assert_eq!(net.calls(), 62);
    assert!(net.max_in_flight() >= 1);
    assert!(net.max_in_flight() <= 5, "saw {} in flight", net.max_in_flight());
}

#[tokio::test]
async fn progress_is_monotonic() {
    let seen: Arc<Mutex<Vec<DiscoveryProgress>>> = Arc::default();
    let sink: ProgressSink = {
        let seen = seen.clone();
        Arc::new(move |p: &DiscoveryProgress| seen.lock().unwrap().push(p.clone()))
    };
    let opts = DiscoveryOptions {
        max_concurrent_scans: 3,
        ..options("10.0.0.0/28")
    };
    let scanner = NetworkScanner::new(opts)
        .with_connector(Arc::new(camera_net()))
        .with_progress_sink(sink);
    scanner.start().await.unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen.len() > 14);
    for pair in seen.windows(2) {
        assert!(pair[1].progress >= pair[0].progress);
        assert!(pair[1].scanned_ips >= pair[0].scanned_ips);
    }
    for p in seen.iter() {
        assert!(p.scanned_ips <= p.total_ips || p.total_ips == 0);
        assert!(p.progress <= 100);
    }
    assert_eq!(seen.last().unwrap().progress, 100);
}

#[tokio::test]
async fn protocol_filter_limits_identification() {
    let http_only = DiscoveryOptions {
        protocols: vec![CameraProtocol::Http],
        ..options("10.0.0.0/30")
    };
    let scanner = NetworkScanner::new(http_only).with_connector(Arc::new(camera_net()));
    scanner.start().await.unwrap();
    let ports: Vec<u16> = scanner.results().cameras.iter().map(|c| c.port).collect();
    assert_eq!(ports, vec![80, 8080]);

    let rtsp_only = DiscoveryOptions {
        protocols: vec![CameraProtocol::Rtsp],
        ..options("10.0.0.0/30")
    };
    let scanner = NetworkScanner::new(rtsp_only).with_connector(Arc::new(camera_net()));
    scanner.start().await.unwrap();
    let ports: Vec<u16> = scanner.results().cameras.iter().map(|c| c.port).collect();
    assert_eq!(ports, vec![554]);
}

#[tokio::test]
async fn deep_scan_labels_manufacturer_from_server_header() {
    let net = camera_net().banner("10.0.0.2", 80, "Vivotek-Http", "");
    let opts = DiscoveryOptions {
        deep_scan: true,
        ..options("10.0.0.0/30")
    };
    let scanner = NetworkScanner::new(opts).with_connector(Arc::new(net));
    scanner.start().await.unwrap();

    let res = scanner.results();
    let by_port = |port: u16| res.cameras.iter().find(|c| c.port == port).unwrap();
    assert_eq!(by_port(80).manufacturer.as_deref(), Some("Vivotek"));
    assert_eq!(by_port(8080).manufacturer, None);
    assert_eq!(by_port(554).manufacturer, None);
}

#[tokio::test]
async fn scanner_runs_only_once() {
    let scanner = NetworkScanner::new(options("10.0.0.0/30")).with_connector(Arc::new(FakeNet::new()));
    scanner.start().await.unwrap();
    let err = scanner.start().await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Concurrency(_)));
}

#[tokio::test]
async fn concurrent_start_is_rejected() {
    let net = FakeNet::new().delay(Duration::from_millis(20));
    let scanner = Arc::new(NetworkScanner::new(options("10.0.0.0/28")).with_connector(Arc::new(net)));
    let running = {
        let scanner = scanner.clone();
        tokio::spawn(async move { scanner.start().await })
    };
    while !scanner.is_running() {
        tokio::task::yield_now().await;
    }
    assert!(matches!(
        scanner.start().await,
        Err(DiscoveryError::Concurrency(_))
    ));
    scanner.stop();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_ends_scan_early() {
    let net = Arc::new(FakeNet::new().delay(Duration::from_millis(20)));
    let opts = DiscoveryOptions {
        max_concurrent_scans: 2,
        ..options("10.2.0.0/24")
    };
    let scanner = Arc::new(NetworkScanner::new(opts).with_connector(net.clone()));
    let running = {
        let scanner = scanner.clone();
        tokio::spawn(async move { scanner.start().await })
    };
    tokio::time::sleep(Duration::from_millis(60)).await;
    scanner.stop();
    running.await.unwrap().unwrap();

    let progress = scanner.progress();
    assert_eq!(progress.phase, DiscoveryPhase::Completed);
    assert_eq!(progress.message, "Discovery stopped by user");
    assert!(progress.scanned_ips < 254);
    assert!(net.calls() < 254);
    assert!(scanner.results().success);
    assert!(!scanner.is_running());
}

#[tokio::test]
async fn invalid_range_fails_before_any_probe() {
    let net = Arc::new(FakeNet::new());
    let scanner = NetworkScanner::new(options("192.168.1.0/40")).with_connector(net.clone());
    let err = scanner.start().await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Configuration(_)));
    assert_eq!(net.calls(), 0);

    let progress = scanner.progress();
    assert_eq!(progress.phase, DiscoveryPhase::Error);
    assert!(progress.message.starts_with("Discovery failed:"));
    let res = scanner.results();
    assert!(!res.success);
    assert!(res.error.is_some());
}

#[tokio::test]
async fn deep_scan_never_labels_from_port_alone() {
    let net = camera_net().banner("10.0.0.2", 80, "mini_httpd/1.30", "");
    let opts = DiscoveryOptions {
        deep_scan: true,
        protocols: vec![CameraProtocol::Http],
        ..options("10.0.0.0/30")
    };
    let scanner = NetworkScanner::new(opts).with_connector(Arc::new(net));
    scanner.start().await.unwrap();

    let res = scanner.results();
    let cam = res.cameras.iter().find(|c| c.port == 80).unwrap();
    assert_eq!(cam.manufacturer, None);
}

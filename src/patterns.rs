//! Manufacturer signature catalog and fingerprint matcher.
//!
//! The catalog is a `static` table: read-only, built at compile time and
//! shared by all scans without locking.

/// Vendor signature. An empty slice means "no evidence of this kind defined".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManufacturerPattern {
    pub manufacturer: &'static str,
    pub user_agent: &'static [&'static str],
    pub server_header: &'static [&'static str],
    pub html_keywords: &'static [&'static str],
    pub default_ports: &'static [u16],
    pub rtsp_paths: &'static [&'static str],
    pub http_paths: &'static [&'static str],
}

/// Evidence gathered about one device. Absent fields do not count toward the score.
#[derive(Debug, Clone, Copy, Default)]
pub struct Evidence<'a> {
    pub user_agent: Option<&'a str>,
    pub server_header: Option<&'a str>,
    pub html: Option<&'a str>,
    pub port: Option<u16>,
}

/// Stream paths known for a manufacturer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPaths {
    pub rtsp: &'static [&'static str],
    pub http: &'static [&'static str],
}

pub const GENERIC_STREAM_PATHS: StreamPaths = StreamPaths {
    rtsp: &[
        "/stream1",
        "/live",
        "/h264Preview_01_main",
        "/cam/realmonitor?channel=1&subtype=0",
    ],
    http: &[
        "/video.cgi",
        "/snapshot.cgi",
        "/axis-cgi/mjpg/video.cgi",
        "/cgi-bin/hi3510/snap.cgi",
    ],
};

pub const GENERIC_DEFAULT_PORTS: &[u16] = &[80, 554, 8080];

/// Match threshold on `score / max_score`.
const MATCH_RATIO: f64 = 0.5;

pub static MANUFACTURER_PATTERNS: &[ManufacturerPattern] = &[
    ManufacturerPattern {
        manufacturer: "Hikvision",
        user_agent: &["HIKVISION", "DS-", "iVMS"],
        server_header: &["HIKVISION-Webs", "App-webs/", "hikvision"],
        html_keywords: &["hikvision", "HIKVISION", "iVMS-4200", "DS-", "Network Camera"],
        default_ports: &[80, 554, 8000, 8080],
        rtsp_paths: &[
            "/h264Preview_01_main",
            "/h264Preview_01_sub",
            "/ISAPI/Streaming/channels/101/httpPreview",
            "/Streaming/Channels/101",
            "/cam1/h264",
        ],
        http_paths: &[
            "/ISAPI/System/deviceInfo",
            "/doc/page/login.asp",
            "/onvif/device_service",
        ],
    },
    ManufacturerPattern {
        manufacturer: "Dahua",
        user_agent: &["Dahua", "DAHUA", "DH-"],
        server_header: &["Dahua", "NetSurveillance WEB"],
        html_keywords: &["dahua", "DAHUA", "DH-", "Net Surveillance"],
        default_ports: &[80, 554, 37777],
        rtsp_paths: &[
            "/cam/realmonitor?channel=1&subtype=0",
            "/cam/realmonitor?channel=1&subtype=1",
            "/h264Preview_01_main",
            "/live",
        ],
        http_paths: &[
            "/cgi-bin/magicBox.cgi?action=getSystemInfo",
            "/doc/script/CrossBrowser.js",
        ],
    },
    ManufacturerPattern {
        manufacturer: "Axis",
        user_agent: &["AXIS", "Linux/2.6 UPnP/1.0 Axis"],
        server_header: &["lighttpd", "Axis"],
        html_keywords: &["AXIS", "axis", "Live view  - AXIS"],
        default_ports: &[80, 554],
        rtsp_paths: &[
            "/axis-media/media.amp",
            "/mjpg/video.mjpg",
            "/axis-cgi/mjpg/video.cgi",
        ],
        http_paths: &[
            "/axis-cgi/com/ptz.cgi?info=1",
            "/axis-cgi/admin/param.cgi?action=list",
        ],
    },
    ManufacturerPattern {
        manufacturer: "Foscam",
        user_agent: &["Foscam", "FOSCAM"],
        server_header: &["Foscam"],
        html_keywords: &["foscam", "FOSCAM", "FI8910W", "FI9821W"],
        default_ports: &[80, 88, 554],
        rtsp_paths: &["/videoMain", "/videoSub", "/live.sdp"],
        http_paths: &["/cgi-bin/CGIProxy.fcgi", "/get_status.cgi"],
    },
    ManufacturerPattern {
        manufacturer: "Ubiquiti",
        user_agent: &["UniFi Video", "airCam"],
        server_header: &["nginx/ubiquiti"],
        html_keywords: &["UniFi Video", "Ubiquiti", "airCam"],
        default_ports: &[80, 554, 7080, 7443],
        rtsp_paths: &["/s0", "/s1", "/live"],
        http_paths: &["/api/bootstrap", "/api/2.0/snapshot"],
    },
    ManufacturerPattern {
        manufacturer: "Vivotek",
        user_agent: &["Vivotek", "VIVOTEK"],
        server_header: &["Vivotek-Http", "boa/0.94.14rc21"],
        html_keywords: &["VIVOTEK", "vivotek", "Network Camera"],
        default_ports: &[80, 554],
        rtsp_paths: &["/live.sdp", "/live/ch1", "/live/ch2"],
        http_paths: &["/cgi-bin/viewer/video.jpg", "/form/info"],
    },
    ManufacturerPattern {
        manufacturer: "D-Link",
        user_agent: &["D-Link", "DCS-"],
        server_header: &["D-Link DCS"],
        html_keywords: &["D-Link", "DCS-", "Internet Camera"],
        default_ports: &[80, 554],
        rtsp_paths: &["/live1.sdp", "/live2.sdp", "/play1.sdp"],
        http_paths: &["/video.cgi", "/image.jpg"],
    },
    ManufacturerPattern {
        manufacturer: "TP-Link",
        user_agent: &["TP-LINK", "Tapo"],
        server_header: &["TP-LINK"],
        html_keywords: &["TP-LINK", "Tapo", "Kasa Cam"],
        default_ports: &[80, 554, 8080],
        rtsp_paths: &["/stream1", "/stream2", "/live.sdp"],
        http_paths: &["/cgi-bin/hi3510/param.cgi", "/snapshot.cgi"],
    },
    ManufacturerPattern {
        manufacturer: "Generic ONVIF",
        user_agent: &["gSOAP"],
        server_header: &["Linux/2.6 UPnP/1.0 IpCamera/1.0"],
        html_keywords: &["onvif", "ONVIF", "IP Camera", "Network Camera"],
        default_ports: &[80, 554, 8080, 3702],
        rtsp_paths: &["/onvif1", "/onvif2", "/MediaInput/h264", "/profile1/media.smp"],
        http_paths: &[
            "/onvif/device_service",
            "/onvif/media_service",
            "/cgi-bin/hi3510/snap.cgi",
        ],
    },
];

impl ManufacturerPattern {
    /// `(score, max_score)` of this pattern against `evidence`.
    pub fn score(&self, evidence: &Evidence<'_>) -> (u32, u32) {
        let mut score = 0;
        let mut max_score = 0;

        let textual = [
            (evidence.user_agent, self.user_agent),
            (evidence.server_header, self.server_header),
            (evidence.html, self.html_keywords),
        ];
        for (input, needles) in textual {
            let Some(input) = input else { continue };
            if needles.is_empty() {
                continue;
            }
            max_score += 1;
            if contains_any_ignore_case(input, needles) {
                score += 1;
            }
        }

        if let Some(port) = evidence.port {
            if !self.default_ports.is_empty() {
                max_score += 1;
                if self.default_ports.contains(&port) {
                    score += 1;
                }
            }
        }

        (score, max_score)
    }
}

fn contains_any_ignore_case(haystack: &str, needles: &[&str]) -> bool {
    let haystack = haystack.to_lowercase();
    needles
        .iter()
        .any(|n| haystack.contains(&n.to_lowercase()))
}

/// First catalog entry (declared order) whose evidence ratio reaches the threshold.
pub fn identify_manufacturer(evidence: &Evidence<'_>) -> Option<&'static str> {
    MANUFACTURER_PATTERNS.iter().find_map(|pattern| {
        let (score, max_score) = pattern.score(evidence);
        (max_score > 0 && f64::from(score) / f64::from(max_score) >= MATCH_RATIO)
            .then_some(pattern.manufacturer)
    })
}

fn lookup(manufacturer: &str) -> Option<&'static ManufacturerPattern> {
    MANUFACTURER_PATTERNS
        .iter()
        .find(|p| p.manufacturer.eq_ignore_ascii_case(manufacturer))
}

/// Known stream paths for `manufacturer`, or [`GENERIC_STREAM_PATHS`].
pub fn get_stream_paths(manufacturer: &str) -> StreamPaths {
    lookup(manufacturer)
        .map(|p| StreamPaths {
            rtsp: p.rtsp_paths,
            http: p.http_paths,
        })
        .unwrap_or(GENERIC_STREAM_PATHS)
}

/// Default ports for `manufacturer`, or [`GENERIC_DEFAULT_PORTS`].
pub fn get_default_ports(manufacturer: &str) -> &'static [u16] {
    lookup(manufacturer)
        .map(|p| p.default_ports)
        .filter(|ports| !ports.is_empty())
        .unwrap_or(GENERIC_DEFAULT_PORTS)
}

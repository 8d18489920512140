use futures_util::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Per host-port probe timeout bounds (ms).
pub const PROBE_TIMEOUT_DEFAULT_MS: u64 = 350;
const PROBE_TIMEOUT_MIN_MS: u64 = 120;
const PROBE_TIMEOUT_MAX_MS: u64 = 2000;
/// HTTP fingerprinting needs a little longer than a bare connect.
const FINGERPRINT_TIMEOUT_MIN_MS: u64 = 300;

/// Bounded fan-out: probes in flight at once.
pub const MAX_CONCURRENT_PROBES: usize = 96;
/// Safety valve on target enumeration.
pub const MAX_HOSTS: usize = 1024;

const PRINTER_PORTS: [u16; 3] = [9100, 515, 631];
const RT_PORTS: [u16; 3] = [8008, 80, 443];
const FINGERPRINT_BODY_LIMIT: usize = 3000;

pub fn clamp_probe_timeout(requested_ms: Option<u64>) -> Duration {
    let ms = requested_ms
        .unwrap_or(PROBE_TIMEOUT_DEFAULT_MS)
        .clamp(PROBE_TIMEOUT_MIN_MS, PROBE_TIMEOUT_MAX_MS);
    Duration::from_millis(ms)
}

fn fingerprint_timeout(probe: Duration) -> Duration {
    probe.max(Duration::from_millis(FINGERPRINT_TIMEOUT_MIN_MS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionClass {
    Ethernet,
    Wifi,
    Unknown,
}

pub fn classify_interface(name: &str) -> ConnectionClass {
    let lower = name.to_lowercase();
    if ["ethernet", "lan", "eth"].iter().any(|k| lower.contains(k)) {
        ConnectionClass::Ethernet
    } else if ["wifi", "wi-fi", "wireless", "wlan"].iter().any(|k| lower.contains(k)) {
        ConnectionClass::Wifi
    } else {
        ConnectionClass::Unknown
    }
}

/// One candidate host, annotated with the interface it was enumerated from.
#[derive(Debug, Clone)]
pub struct ScanTarget {
    pub host: String,
    pub interface_name: String,
    pub interface_ip: String,
    pub connection_type: ConnectionClass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPrinter {
    pub host: String,
    pub port: u16,
    pub connection_type: ConnectionClass,
    pub interface_name: String,
    pub interface_ip: String,
    pub source: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredRtDevice {
    pub host: String,
    pub port: u16,
    pub brand: String,
    pub api_path: String,
    pub connection_type: ConnectionClass,
    pub interface_name: String,
    pub interface_ip: String,
    pub source: String,
    pub label: String,
}

fn is_scannable(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_link_local()
}

/// Walk the /24 of every scannable interface. Hosts are deduplicated across
/// interfaces (first interface wins) and capped at [`MAX_HOSTS`].
pub fn enumerate_targets_from(interfaces: &[(String, Ipv4Addr)]) -> Vec<ScanTarget> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for (name, ip) in interfaces {
        if !is_scannable(*ip) {
            continue;
        }
        let octets = ip.octets();
        let class = classify_interface(name);

        for d in 1..=254u8 {
            if d == octets[3] {
                continue;
            }
            let host = format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], d);
            if !seen.insert(host.clone()) {
                continue;
            }
            targets.push(ScanTarget {
                host,
                interface_name: name.clone(),
                interface_ip: ip.to_string(),
                connection_type: class,
            });
            if targets.len() >= MAX_HOSTS {
                warn!("Target enumeration capped at {} hosts", MAX_HOSTS);
                return targets;
            }
        }
    }

    targets
}

/// Enumerate scan targets from the machine's AF_INET interfaces.
pub fn enumerate_targets() -> Vec<ScanTarget> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(list) => list,
        Err(e) => {
            warn!("Could not list network interfaces: {}", e);
            return Vec::new();
        }
    };

    let v4: Vec<(String, Ipv4Addr)> = interfaces
        .into_iter()
        .filter_map(|(name, addr)| match addr {
            IpAddr::V4(ip) => Some((name, ip)),
            IpAddr::V6(_) => None,
        })
        .collect();

    enumerate_targets_from(&v4)
}

async fn port_open(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Probe the LAN for raw thermal printers. Ports are tried in order per host;
/// the first open one wins.
pub async fn discover_printers(requested_timeout_ms: Option<u64>) -> Vec<DiscoveredPrinter> {
    let timeout = clamp_probe_timeout(requested_timeout_ms);
    let targets = enumerate_targets();
    info!(
        "LAN printer scan: {} targets, timeout {:?}, {} probes in flight",
        targets.len(),
        timeout,
        MAX_CONCURRENT_PROBES
    );

    let mut found: Vec<DiscoveredPrinter> = stream::iter(targets)
        .map(|target| async move {
            for port in PRINTER_PORTS {
                if port_open(&target.host, port, timeout).await {
                    debug!("Printer port {} open on {}", port, target.host);
                    return Some(DiscoveredPrinter {
                        label: format!("Stampante di rete ({})", target.host),
                        host: target.host,
                        port,
                        connection_type: target.connection_type,
                        interface_name: target.interface_name,
                        interface_ip: target.interface_ip,
                        source: "lan_scan".to_string(),
                    });
                }
            }
            None
        })
        .buffer_unordered(MAX_CONCURRENT_PROBES)
        .filter_map(|result| async move { result })
        .collect()
        .await;

    dedupe_and_sort_printers(&mut found);
    info!("LAN printer scan complete: {} found", found.len());
    found
}

/// Probe the LAN for RT fiscal devices, collecting every open service port
/// and fingerprinting the web interface to pin the brand down.
pub async fn discover_rt_devices(requested_timeout_ms: Option<u64>) -> Vec<DiscoveredRtDevice> {
    let timeout = clamp_probe_timeout(requested_timeout_ms);
    let targets = enumerate_targets();
    info!(
        "LAN RT scan: {} targets, timeout {:?}, {} probes in flight",
        targets.len(),
        timeout,
        MAX_CONCURRENT_PROBES
    );

    let mut found: Vec<DiscoveredRtDevice> = stream::iter(targets)
        .map(|target| async move { probe_rt_host(target, timeout).await })
        .buffer_unordered(MAX_CONCURRENT_PROBES)
        .filter_map(|result| async move { result })
        .collect()
        .await;

    found.sort_by(|a, b| compare_hosts(&a.host, &b.host));
    found.dedup_by(|a, b| a.host == b.host && a.port == b.port);
    info!("LAN RT scan complete: {} found", found.len());
    found
}

async fn probe_rt_host(target: ScanTarget, timeout: Duration) -> Option<DiscoveredRtDevice> {
    let mut open = Vec::new();
    for port in RT_PORTS {
        if port_open(&target.host, port, timeout).await {
            open.push(port);
        }
    }
    if open.is_empty() {
        return None;
    }

    // RT_PORTS is already in preference order.
    let port = *open.first()?;
    let mut brand = if port == 8008 { "epson" } else { "other" }.to_string();

    // Plain-HTTP ports only; a fingerprint hit overrides the port-based guess.
    if let Some(http_port) = open.iter().find(|p| **p == 8008 || **p == 80) {
        if let Some(fingerprinted) =
            fingerprint_rt_brand(&target.host, *http_port, fingerprint_timeout(timeout)).await
        {
            brand = fingerprinted;
        }
    }

    let api_path = crate::jobs::default_api_path(&brand).to_string();
    Some(DiscoveredRtDevice {
        label: format!("{} RT ({})", capitalize(&brand), target.host),
        host: target.host,
        port,
        brand,
        api_path,
        connection_type: target.connection_type,
        interface_name: target.interface_name,
        interface_ip: target.interface_ip,
        source: "lan_scan".to_string(),
    })
}

static FINGERPRINT_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

const BRAND_KEYWORDS: [(&str, &[&str]); 5] = [
    ("epson", &["epson", "fpmate", "fp90"]),
    ("custom", &["custom"]),
    ("olivetti", &["olivetti"]),
    ("axon", &["axon"]),
    ("rch", &["rch"]),
];

/// GET `/` and look for vendor keywords in the first chunk of the body and
/// the identifying headers.
async fn fingerprint_rt_brand(host: &str, port: u16, timeout: Duration) -> Option<String> {
    let url = format!("http://{}:{}/", host, port);
    let response = FINGERPRINT_CLIENT
        .get(&url)
        .timeout(timeout)
        .send()
        .await
        .ok()?;

    let mut haystack = String::new();
    for header in ["server", "x-powered-by"] {
        if let Some(value) = response.headers().get(header).and_then(|v| v.to_str().ok()) {
            haystack.push_str(value);
            haystack.push(' ');
        }
    }
    if let Ok(body) = response.text().await {
        haystack.extend(body.chars().take(FINGERPRINT_BODY_LIMIT));
    }

    match_rt_brand(&haystack)
}

pub fn match_rt_brand(haystack: &str) -> Option<String> {
    let lower = haystack.to_lowercase();
    for (brand, keywords) in BRAND_KEYWORDS {
        if keywords.iter().any(|k| lower.contains(k)) {
            return Some(brand.to_string());
        }
    }
    None
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn dedupe_and_sort_printers(found: &mut Vec<DiscoveredPrinter>) {
    found.sort_by(|a, b| compare_hosts(&a.host, &b.host));
    found.dedup_by(|a, b| a.host == b.host && a.port == b.port);
}

/// Numeric-aware ASCII ordering: digit runs compare as numbers, so
/// `10.0.0.2` sorts before `10.0.0.10`.
pub fn compare_hosts(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(lc), Some(rc)) => {
                if lc.is_ascii_digit() && rc.is_ascii_digit() {
                    let ln = take_number(&mut left);
                    let rn = take_number(&mut right);
                    match ln.cmp(&rn) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                match lc.cmp(&rc) {
                    Ordering::Equal => {
                        left.next();
                        right.next();
                    }
                    other => return other,
                }
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> u128 {
    let mut value: u128 = 0;
    while let Some(c) = chars.peek().copied() {
        if !c.is_ascii_digit() {
            break;
        }
        value = value.saturating_mul(10).saturating_add((c as u8 - b'0') as u128);
        chars.next();
    }
    value
}

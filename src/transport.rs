use crate::errors::{truncate_error, BridgeError, Result};
use crate::jobs::RtRoute;
use backon::{ConstantBuilder, Retryable};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

/// Whole raw-TCP delivery (connect, write, half-close, drain) budget.
pub const TCP_TIMEOUT: Duration = Duration::from_secs(25);
/// Production fiscal POST budget.
pub const FISCAL_TIMEOUT: Duration = Duration::from_secs(20);
/// Connectivity-test POST budget.
pub const FISCAL_TEST_TIMEOUT: Duration = Duration::from_secs(15);

const RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Up to 2 attempts with a 500 ms pause, second attempt only for transient
/// network faults.
fn retry_policy() -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(RETRY_PAUSE)
        .with_max_times(1)
}

/// Transient faults worth one more try. Remote rejections never are.
pub fn is_retriable(error: &BridgeError) -> bool {
    const RETRIABLE: [&str; 5] = ["timeout", "econnreset", "ehostunreach", "econnrefused", "epipe"];
    match error {
        BridgeError::PrinterTimeout => true,
        BridgeError::Network(message) => {
            let lower = message.to_lowercase();
            RETRIABLE.iter().any(|needle| lower.contains(needle))
        }
        _ => false,
    }
}

fn io_error_tag(kind: std::io::ErrorKind) -> Option<&'static str> {
    use std::io::ErrorKind;
    match kind {
        ErrorKind::ConnectionReset => Some("ECONNRESET"),
        ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        ErrorKind::HostUnreachable => Some("EHOSTUNREACH"),
        ErrorKind::BrokenPipe => Some("EPIPE"),
        _ => None,
    }
}

/// Socket errors keep their errno-style tag so the retry gate can match them.
fn io_network_error(error: &std::io::Error) -> BridgeError {
    if matches!(error.kind(), std::io::ErrorKind::TimedOut) {
        return BridgeError::PrinterTimeout;
    }
    match io_error_tag(error.kind()) {
        Some(tag) => BridgeError::Network(format!("{}: {}", tag, error)),
        None => BridgeError::Network(error.to_string()),
    }
}

fn reqwest_network_error(error: reqwest::Error) -> BridgeError {
    if error.is_timeout() {
        return BridgeError::PrinterTimeout;
    }
    let mut source = std::error::Error::source(&error);
    while let Some(inner) = source {
        if let Some(io_error) = inner.downcast_ref::<std::io::Error>() {
            return io_network_error(io_error);
        }
        source = inner.source();
    }
    BridgeError::Network(error.to_string())
}

/// One raw delivery: connect with NoDelay, write the whole buffer, half-close,
/// then wait for the printer to close its side.
async fn send_raw_tcp_once(host: &str, port: u16, bytes: &[u8]) -> Result<()> {
    let attempt = async {
        let mut stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| io_network_error(&e))?;
        stream.set_nodelay(true).map_err(|e| io_network_error(&e))?;

        stream.write_all(bytes).await.map_err(|e| io_network_error(&e))?;
        stream.flush().await.map_err(|e| io_network_error(&e))?;
        stream.shutdown().await.map_err(|e| io_network_error(&e))?;

        // Drain until the peer closes so the printer has consumed the job.
        let mut sink = [0u8; 512];
        loop {
            match stream.read(&mut sink).await {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => return Err(io_network_error(&e)),
            }
        }
        Ok(())
    };

    match tokio::time::timeout(TCP_TIMEOUT, attempt).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::PrinterTimeout),
    }
}

/// Deliver an ESC/POS buffer over raw TCP. Returns the number of attempts
/// actually made (1 or 2).
pub async fn send_raw_tcp(host: &str, port: u16, bytes: &[u8]) -> Result<u32> {
    let attempts = Arc::new(AtomicU32::new(0));

    let host_owned = host.to_string();
    let payload = bytes.to_vec();
    let counter = attempts.clone();
    (move || {
        let host = host_owned.clone();
        let payload = payload.clone();
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("Raw TCP delivery to {}:{} (attempt {})", host, port, n);
            send_raw_tcp_once(&host, port, &payload).await
        }
    })
    .retry(retry_policy())
    .when(is_retriable)
    .await?;

    Ok(attempts.load(Ordering::SeqCst))
}

static FISCAL_FAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(error|fault|ko)\b").expect("fiscal failure regex"));

static RECEIPT_ID_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    ["receipt_id", "document_number", "progressive_number"]
        .iter()
        .map(|key| {
            Regex::new(&format!(
                r#"(?i)\b{}\b[^0-9A-Za-z]{{0,4}}([0-9A-Za-z][0-9A-Za-z._-]*)"#,
                key
            ))
            .expect("receipt id regex")
        })
        .collect()
});

/// Pull a receipt identifier out of a fiscal response body, trying the known
/// field names in priority order against loose `name=value` shapes.
pub fn extract_receipt_id(body: &str) -> Option<String> {
    RECEIPT_ID_RES
        .iter()
        .find_map(|re| re.captures(body))
        .map(|captures| captures[1].to_string())
}

#[derive(Debug, Clone)]
pub struct FiscalOutcome {
    pub receipt_id: Option<String>,
    pub attempts: u32,
}

static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

async fn post_fiscal_once(route: &RtRoute, xml: &str, timeout: Duration) -> Result<Option<String>> {
    let url = Url::parse(&format!("http://{}:{}{}", route.host, route.port, route.api_path))
        .map_err(|e| BridgeError::Network(format!("Bad fiscal endpoint: {}", e)))?;

    let response = HTTP_CLIENT
        .post(url)
        .header("Content-Type", "application/xml; charset=utf-8")
        .timeout(timeout)
        .body(xml.to_string())
        .send()
        .await
        .map_err(reqwest_network_error)?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if !status.is_success() {
        return Err(BridgeError::FiscalRejected(truncate_error(&format!(
            "HTTP {} - {}",
            status, body
        ))));
    }
    if FISCAL_FAIL_RE.is_match(&body) {
        return Err(BridgeError::FiscalRejected(truncate_error(&body)));
    }

    Ok(extract_receipt_id(&body))
}

/// POST an FPMate document to an RT device, with the same local retry rules
/// as raw TCP. A 2xx whose body contains a failure keyword still fails.
pub async fn post_fiscal_document(
    route: &RtRoute,
    xml: &str,
    timeout: Duration,
) -> Result<FiscalOutcome> {
    let attempts = Arc::new(AtomicU32::new(0));

    let route_owned = route.clone();
    let xml_owned = xml.to_string();
    let counter = attempts.clone();
    let receipt_id = (move || {
        let route = route_owned.clone();
        let xml = xml_owned.clone();
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(
                "Fiscal POST to {}:{}{} (attempt {})",
                route.host, route.port, route.api_path, n
            );
            post_fiscal_once(&route, &xml, timeout).await
        }
    })
    .retry(retry_policy())
    .when(is_retriable)
    .await?;

    Ok(FiscalOutcome {
        receipt_id,
        attempts: attempts.load(Ordering::SeqCst),
    })
}

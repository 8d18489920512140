use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SESSION_ABSENT")]
    SessionAbsent,

    #[error("SESSION_INVALID: {0}")]
    SessionInvalid(String),

    #[error("NO_PRINTER_HOST")]
    NoPrinterHost,

    #[error("PHYSICAL_RT_HOST_MISSING")]
    RtHostMissing,

    #[error("PRINT_WORKER_UNAVAILABLE")]
    WorkerUnavailable,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout stampante")]
    PrinterTimeout,

    #[error("Fiscal device rejected request: {0}")]
    FiscalRejected(String),

    #[error("RPC '{function}' failed: {message}")]
    Rpc { function: String, message: String },

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Job payload error: {0}")]
    Payload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    /// Stable code for the shell to match on, when the error is operational.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            BridgeError::SessionAbsent => Some("SESSION_ABSENT"),
            BridgeError::SessionInvalid(_) => Some("SESSION_INVALID"),
            BridgeError::NoPrinterHost => Some("NO_PRINTER_HOST"),
            BridgeError::RtHostMissing => Some("PHYSICAL_RT_HOST_MISSING"),
            BridgeError::WorkerUnavailable => Some("PRINT_WORKER_UNAVAILABLE"),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Ack metadata must stay bounded: cap at 500 chars on a char boundary.
pub fn truncate_error(message: &str) -> String {
    const MAX: usize = 500;
    if message.len() <= MAX {
        return message.to_string();
    }
    let mut end = MAX;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operational_codes() {
        assert_eq!(BridgeError::SessionAbsent.code(), Some("SESSION_ABSENT"));
        assert_eq!(
            BridgeError::SessionInvalid("refused".into()).code(),
            Some("SESSION_INVALID")
        );
        assert_eq!(BridgeError::NoPrinterHost.code(), Some("NO_PRINTER_HOST"));
        assert_eq!(BridgeError::Network("boom".into()).code(), None);
    }

    #[test]
    fn test_truncate_error_bounds() {
        let long = "x".repeat(900);
        assert_eq!(truncate_error(&long).len(), 500);
        assert_eq!(truncate_error("short"), "short");
    }

    #[test]
    fn test_truncate_error_respects_utf8() {
        let s = format!("{}é", "a".repeat(499));
        let t = truncate_error(&s);
        assert!(t.len() <= 500);
        assert!(t.is_char_boundary(t.len()));
    }
}

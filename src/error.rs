use thiserror::Error;

/// Stack status strings that indicate a transient fault worth retrying.
const TRANSIENT_PATTERNS: &[&str] = &[
    "DELIVERY_FAILED",
    "MAC_NO_ACK",
    "MAC_CHANNEL_ACCESS_FAILURE",
    "ERROR_EXCEEDED_MAXIMUM_ACK_TIMEOUT_COUNT",
    "EZSP_ERROR_NO_BUFFERS",
    "NETWORK_BUSY",
];

/// Stack status strings that will not improve with retries.
const PERMANENT_PATTERNS: &[&str] = &[
    "NOT_FOUND",
    "INVALID_PARAMETER",
    "INVALID_CALL",
    "TABLE_FULL",
];

/// Errors surfaced by the radio driver facade and everything above it.
#[derive(Debug, Error)]
pub enum RadioError {
    /// Transient stack-level failure (delivery, MAC contention, buffers).
    #[error("stack error: {0}")]
    Stack(String),

    /// The NCP itself faulted; routed to the resilience supervisor.
    #[error("NCP failure: {0}")]
    NcpFailure(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("no compatible radio found on {0}")]
    NoRadio(String),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RadioError {
    /// Classify by message, the way the vendor stacks report status: the
    /// status name is embedded in the error text.
    pub fn is_transient(&self) -> bool {
        match self {
            RadioError::Timeout(_) => true,
            RadioError::NcpFailure(_) => true,
            RadioError::DeviceNotFound(_) | RadioError::NoRadio(_) => false,
            RadioError::RetryExhausted { .. } => false,
            RadioError::Io(_) => false,
            RadioError::Stack(msg) => {
                let upper = msg.to_uppercase();
                if TRANSIENT_PATTERNS.iter().any(|p| upper.contains(p)) {
                    return true;
                }
                if PERMANENT_PATTERNS.iter().any(|p| upper.contains(p)) {
                    return false;
                }
                // Unknown status: don't retry forever on something we can't name.
                false
            }
        }
    }

    pub fn is_ncp_failure(&self) -> bool {
        matches!(self, RadioError::NcpFailure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn delivery_failures_are_transient() {
        assert!(RadioError::Stack("DELIVERY_FAILED".into()).is_transient());
        assert!(RadioError::Stack("mac_no_ack".into()).is_transient());
        assert!(RadioError::Stack("status NETWORK_BUSY on send".into()).is_transient());
        assert!(RadioError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(RadioError::NcpFailure("RESET".into()).is_transient());
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        assert!(!RadioError::Stack("NOT_FOUND".into()).is_transient());
        assert!(!RadioError::Stack("INVALID_PARAMETER".into()).is_transient());
        assert!(!RadioError::Stack("TABLE_FULL".into()).is_transient());
        assert!(!RadioError::Stack("something else".into()).is_transient());
        assert!(!RadioError::DeviceNotFound("x".into()).is_transient());
    }
}

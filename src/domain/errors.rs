use crate::domain::trading::state_machine::TradeStatus;
use thiserror::Error;

/// Broker-side failure taxonomy. Parsed once at the adapter boundary;
/// everything downstream branches on the variant, never on raw strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("retryable broker error (status {status:?}): {message}")]
    Retryable { status: Option<u16>, message: String },

    #[error("RMS/margin rejection: {message}")]
    Rms { message: String },

    #[error("circuit limit / price band rejection: {message}")]
    CircuitLimit { message: String },

    #[error("SL-M blocked for this contract: {message}")]
    SlmBlocked { message: String },

    #[error("order cannot be cancelled: {message}")]
    NotCancellable { message: String },

    #[error("order parameters not changed")]
    NotModified,

    #[error("order not found: {order_id}")]
    OrderNotFound { order_id: String },

    #[error("broker session invalid or expired: {message}")]
    SessionExpired { message: String },

    #[error("broker error: {message}")]
    Other { message: String },
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Retryable { .. })
    }

    /// Free-form classification fallback. Broker error bodies are not
    /// machine-stable, so string matching stays as the last resort behind
    /// the typed error envelope.
    pub fn classify(status: Option<u16>, error_type: Option<&str>, message: &str) -> Self {
        let msg = message.to_string();
        let lower = message.to_ascii_lowercase();

        if let Some(code) = status
            && (code == 429 || code >= 500)
        {
            return BrokerError::Retryable { status, message: msg };
        }
        match error_type {
            Some("NetworkException") | Some("GatewayException") => {
                return BrokerError::Retryable { status, message: msg };
            }
            Some("TokenException") => {
                return BrokerError::SessionExpired { message: msg };
            }
            _ => {}
        }
        if lower.contains("timed out") || lower.contains("connection") {
            return BrokerError::Retryable { status, message: msg };
        }
        if lower.contains("circuit") || lower.contains("price band") || lower.contains("execution range")
        {
            return BrokerError::CircuitLimit { message: msg };
        }
        if (lower.contains("sl-m") || lower.contains("market stoploss"))
            && (lower.contains("block") || lower.contains("not allowed"))
        {
            return BrokerError::SlmBlocked { message: msg };
        }
        if lower.contains("rms") || lower.contains("margin") || lower.contains("insufficient funds")
        {
            return BrokerError::Rms { message: msg };
        }
        if lower.contains("cannot be cancelled") || lower.contains("being processed") {
            return BrokerError::NotCancellable { message: msg };
        }
        if lower.contains("not changed") || lower.contains("no change") {
            return BrokerError::NotModified;
        }
        BrokerError::Other { message: msg }
    }
}

/// Persistence-layer failures surfaced by the TradeStore.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid status transition for trade {trade_id}: {from} -> {to}")]
    InvalidTransition {
        trade_id: String,
        from: TradeStatus,
        to: TradeStatus,
    },

    #[error("trade not found: {trade_id}")]
    TradeNotFound { trade_id: String },

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error("corrupt persisted document for {entity} {key}: {source}")]
    Corrupt {
        entity: &'static str,
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Order-rate refusals.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitExceeded {
    #[error("per-second order limit reached ({limit}/s)")]
    PerSecond { limit: u32 },
    #[error("per-minute order limit reached ({limit}/min)")]
    PerMinute { limit: u32 },
    #[error("daily order limit reached ({limit}/day)")]
    PerDay { limit: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_http_codes() {
        assert!(BrokerError::classify(Some(429), None, "too many requests").is_retryable());
        assert!(BrokerError::classify(Some(503), None, "gateway busy").is_retryable());
        assert!(!BrokerError::classify(Some(400), None, "bad order").is_retryable());
    }

    #[test]
    fn test_classify_semantic_buckets() {
        assert!(matches!(
            BrokerError::classify(Some(400), Some("InputException"), "RMS:Margin Exceeds"),
            BrokerError::Rms { .. }
        ));
        assert!(matches!(
            BrokerError::classify(None, None, "SL-M orders are blocked for this instrument"),
            BrokerError::SlmBlocked { .. }
        ));
        assert!(matches!(
            BrokerError::classify(None, None, "Order cannot be cancelled. It is being processed"),
            BrokerError::NotCancellable { .. }
        ));
        assert!(matches!(
            BrokerError::classify(None, None, "price is outside the circuit limits"),
            BrokerError::CircuitLimit { .. }
        ));
        assert_eq!(
            BrokerError::classify(Some(400), None, "order parameters not changed"),
            BrokerError::NotModified
        );
    }

    #[test]
    fn test_classify_token_exception() {
        assert!(matches!(
            BrokerError::classify(Some(403), Some("TokenException"), "api key expired"),
            BrokerError::SessionExpired { .. }
        ));
    }
}

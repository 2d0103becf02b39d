use thiserror::Error;

/// Failure classes the broker gateway surfaces. Each is a distinct kind so callers can
/// branch on retryability instead of string-matching.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("auth session expired")]
    AuthExpired,
    #[error("rejected by broker: {0}")]
    RejectedByBroker(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport(_) | GatewayError::RateLimited { .. } | GatewayError::AuthExpired
        )
    }
}

/// Domain-terminal error kinds, surfaced upstream and recorded rather than retried.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("no suitable option contract: {0}")]
    NoSuitableContract(String),
    #[error("unreasonable spread")]
    UnreasonableSpread,
    #[error("unreasonable spread persisted past hold budget")]
    UnreasonableSpreadPersisted,
    #[error("invalid tick size")]
    InvalidTick,
    #[error("bad signal: {0}")]
    BadSignal(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

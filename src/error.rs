use thiserror::Error;

/// Unified error type for the whole resolver.
#[derive(Error, Debug, Clone)]
pub enum DnsError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("request queue is full")]
    QueueFull,

    #[error("circuit breaker is open")]
    CircuitBreakerOpen,

    #[error("connection pool exhausted (max: {0})")]
    PoolExhausted(usize),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to decode DNS message: {0}")]
    DecodeFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    // Configuration errors
    #[error("invalid bind address: {0}")]
    InvalidBindAddress(String),

    #[error("invalid upstream address: {0}")]
    InvalidUpstreamAddress(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("metrics error: {0}")]
    Metrics(String),
}

impl From<std::io::Error> for DnsError {
    fn from(err: std::io::Error) -> Self {
        DnsError::Io(err.to_string())
    }
}

impl From<prometheus::Error> for DnsError {
    fn from(err: prometheus::Error) -> Self {
        DnsError::Metrics(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DnsError>;

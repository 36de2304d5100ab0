pub mod adaptive_timeout;
pub mod circuit_breaker;
pub mod request_queue;

pub use adaptive_timeout::{AdaptiveTimeout, TimeoutConfig};
pub use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use request_queue::{QueueConfig, QueuedRequest, RequestQueue};

pub mod config;
pub mod error;
pub mod forward;
pub mod metrics;
pub mod pool;
pub mod qos;
pub mod server;
pub mod upstream;

pub use error::{DnsError, Result};
pub use forward::Forward;

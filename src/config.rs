use std::net::SocketAddr;
use std::time::Duration;
use tracing::warn;

use crate::error::{DnsError, Result};

/// Main configuration for the resolver.
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Address to bind the UDP listener to
    pub bind_addr: SocketAddr,

    /// Upstream servers, as scheme URLs:
    /// `udp://ip[:port]`, `tcp://ip[:port]`, `tls://name@ip[:port]`,
    /// `quic://name@ip[:port]`, `https://host/path`, `h3://host/path`
    pub upstreams: Vec<String>,

    /// How many upstreams to race per query
    pub concurrent_queries: usize,

    /// Number of worker threads for the Tokio runtime (0 = use default)
    pub worker_threads: usize,

    /// AdaptiveTimeout: starting estimate before any samples
    pub base_timeout: Duration,

    /// AdaptiveTimeout: lower clamp for the computed timeout
    pub min_timeout: Duration,

    /// AdaptiveTimeout: upper clamp for the computed timeout
    pub max_timeout: Duration,

    /// AdaptiveTimeout: cap on the congestion backoff multiplier
    pub congestion_mult: f64,

    /// CircuitBreaker: consecutive failures before opening
    pub max_failures: u32,

    /// CircuitBreaker: cooldown before a half-open probe
    pub reset_timeout: Duration,

    /// CircuitBreaker: successful probes required to close again
    pub half_open_attempts: u32,

    /// RequestQueue: maximum queued requests
    pub queue_max_size: usize,

    /// RequestQueue: maximum time a request may wait before it expires
    pub queue_max_wait: Duration,

    /// ConnPool: connections kept warm by the health loop
    pub min_connections: usize,

    /// ConnPool: hard cap on pooled connections
    pub max_connections: usize,

    /// ConnPool: idle eviction threshold
    pub idle_timeout: Duration,

    /// Adaptive transport: reserved sliding-window size
    pub sample_size: usize,

    /// Adaptive transport: DoH3 must beat `preference * avg(DoH)` to win the trial
    pub preference: f64,

    /// Adaptive transport: combined exchanges before the trial is evaluated
    pub trial_count: u64,

    /// UDP ingress workers (0 = number of CPUs)
    pub worker_pool_size: usize,

    /// Pin each UDP worker to an OS thread
    pub cpu_affinity: bool,

    /// Set SO_REUSEPORT on the listener
    pub reuse_port: bool,

    /// SO_RCVBUF for the listener (0 = kernel default)
    pub recv_buffer_size: usize,

    /// SO_SNDBUF for the listener (0 = kernel default)
    pub send_buffer_size: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:53".parse().unwrap(),
            upstreams: vec![
                "udp://8.8.8.8:53".to_string(),
                "udp://1.1.1.1:53".to_string(),
            ],
            concurrent_queries: 1,
            worker_threads: 0,
            base_timeout: Duration::from_secs(2),
            min_timeout: Duration::from_millis(500),
            max_timeout: Duration::from_secs(30),
            congestion_mult: 4.0,
            max_failures: 10,
            reset_timeout: Duration::from_secs(60),
            half_open_attempts: 3,
            queue_max_size: 1000,
            queue_max_wait: Duration::from_secs(30),
            min_connections: 1,
            max_connections: 4,
            idle_timeout: Duration::from_secs(60),
            sample_size: 20,
            preference: 0.8,
            trial_count: 10,
            worker_pool_size: 0,
            cpu_affinity: false,
            reuse_port: false,
            recv_buffer_size: 512 * 1024,
            send_buffer_size: 512 * 1024,
        }
    }
}

impl DnsConfig {
    /// Load configuration from `BIFROST_*` environment variables, falling
    /// back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_addr = parse_env("BIFROST_BIND_ADDR", defaults.bind_addr);
        let upstreams = std::env::var("BIFROST_UPSTREAMS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.upstreams);

        Self {
            bind_addr,
            upstreams,
            concurrent_queries: parse_env("BIFROST_CONCURRENT", defaults.concurrent_queries),
            worker_threads: parse_env("BIFROST_WORKER_THREADS", defaults.worker_threads),
            base_timeout: parse_env_ms("BIFROST_BASE_TIMEOUT_MS", defaults.base_timeout),
            min_timeout: parse_env_ms("BIFROST_MIN_TIMEOUT_MS", defaults.min_timeout),
            max_timeout: parse_env_ms("BIFROST_MAX_TIMEOUT_MS", defaults.max_timeout),
            congestion_mult: parse_env("BIFROST_CONGESTION_MULT", defaults.congestion_mult),
            max_failures: parse_env("BIFROST_MAX_FAILURES", defaults.max_failures),
            reset_timeout: parse_env_ms("BIFROST_RESET_TIMEOUT_MS", defaults.reset_timeout),
            half_open_attempts: parse_env("BIFROST_HALF_OPEN_ATTEMPTS", defaults.half_open_attempts),
            queue_max_size: parse_env("BIFROST_QUEUE_MAX_SIZE", defaults.queue_max_size),
            queue_max_wait: parse_env_ms("BIFROST_QUEUE_MAX_WAIT_MS", defaults.queue_max_wait),
            min_connections: parse_env("BIFROST_MIN_CONNECTIONS", defaults.min_connections),
            max_connections: parse_env("BIFROST_MAX_CONNECTIONS", defaults.max_connections),
            idle_timeout: parse_env_ms("BIFROST_IDLE_TIMEOUT_MS", defaults.idle_timeout),
            sample_size: parse_env("BIFROST_SAMPLE_SIZE", defaults.sample_size),
            preference: parse_env("BIFROST_PREFERENCE", defaults.preference),
            trial_count: parse_env("BIFROST_TRIAL_COUNT", defaults.trial_count),
            worker_pool_size: parse_env("BIFROST_WORKER_POOL_SIZE", defaults.worker_pool_size),
            cpu_affinity: parse_env("BIFROST_CPU_AFFINITY", defaults.cpu_affinity),
            reuse_port: parse_env("BIFROST_REUSE_PORT", defaults.reuse_port),
            recv_buffer_size: parse_env("BIFROST_RECV_BUFFER", defaults.recv_buffer_size),
            send_buffer_size: parse_env("BIFROST_SEND_BUFFER", defaults.send_buffer_size),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstreams.is_empty() {
            return Err(DnsError::InvalidArgument("no upstream servers configured"));
        }
        if !(0.0..=1.0).contains(&self.preference) || self.preference == 0.0 {
            return Err(DnsError::InvalidArgument("preference must be in (0, 1]"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            warn!("invalid value for {}: {:?}, using default", name, v);
            default
        }),
        Err(_) => default,
    }
}

fn parse_env_ms(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(v) => match v.parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                warn!("invalid value for {}: {:?}, using default", name, v);
                default
            }
        },
        Err(_) => default,
    }
}

/// Transport scheme of a parsed upstream URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
    Udp,
    Tcp,
    Tls,
    Https,
    H3,
    Quic,
}

/// A parsed upstream address.
///
/// `udp`/`tcp`/`tls`/`quic` upstreams carry a socket address (and a TLS
/// server name for the encrypted ones); `https`/`h3` carry the full URL.
#[derive(Debug, Clone)]
pub struct ParsedUpstream {
    pub scheme: UpstreamScheme,
    pub addr: Option<SocketAddr>,
    pub server_name: Option<String>,
    pub url: Option<String>,
    /// Display tag: the original URL string.
    pub tag: String,
}

impl ParsedUpstream {
    pub fn parse(raw: &str) -> Result<Self> {
        let (scheme_str, rest) = raw
            .split_once("://")
            .ok_or_else(|| DnsError::InvalidUpstreamAddress(raw.to_string()))?;

        let scheme = match scheme_str {
            "udp" => UpstreamScheme::Udp,
            "tcp" => UpstreamScheme::Tcp,
            "tls" => UpstreamScheme::Tls,
            "https" => UpstreamScheme::Https,
            "h3" => UpstreamScheme::H3,
            "quic" => UpstreamScheme::Quic,
            _ => return Err(DnsError::InvalidUpstreamAddress(raw.to_string())),
        };

        match scheme {
            UpstreamScheme::Https | UpstreamScheme::H3 => Ok(Self {
                scheme,
                addr: None,
                server_name: None,
                url: Some(format!("https://{}", rest)),
                tag: raw.to_string(),
            }),
            UpstreamScheme::Udp | UpstreamScheme::Tcp => {
                let addr = parse_host_port(rest, 53)
                    .ok_or_else(|| DnsError::InvalidUpstreamAddress(raw.to_string()))?;
                Ok(Self {
                    scheme,
                    addr: Some(addr),
                    server_name: None,
                    url: None,
                    tag: raw.to_string(),
                })
            }
            UpstreamScheme::Tls | UpstreamScheme::Quic => {
                // name@ip[:port], name optional when the host is an IP
                let (name, host) = match rest.split_once('@') {
                    Some((n, h)) => (Some(n.to_string()), h),
                    None => (None, rest),
                };
                let addr = parse_host_port(host, 853)
                    .ok_or_else(|| DnsError::InvalidUpstreamAddress(raw.to_string()))?;
                let server_name = name.unwrap_or_else(|| addr.ip().to_string());
                Ok(Self {
                    scheme,
                    addr: Some(addr),
                    server_name: Some(server_name),
                    url: None,
                    tag: raw.to_string(),
                })
            }
        }
    }
}

fn parse_host_port(s: &str, default_port: u16) -> Option<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = s.parse::<std::net::IpAddr>() {
        return Some(SocketAddr::new(ip, default_port));
    }
    // [v6]:port handled by SocketAddr parse above; bare [v6]
    if let Some(inner) = s.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        if let Ok(ip) = inner.parse::<std::net::IpAddr>() {
            return Some(SocketAddr::new(ip, default_port));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DnsConfig::default();
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.trial_count, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_udp_upstream() {
        let u = ParsedUpstream::parse("udp://8.8.8.8").unwrap();
        assert_eq!(u.scheme, UpstreamScheme::Udp);
        assert_eq!(u.addr.unwrap(), "8.8.8.8:53".parse().unwrap());
    }

    #[test]
    fn test_parse_tls_upstream_with_name() {
        let u = ParsedUpstream::parse("tls://dns.google@8.8.8.8:853").unwrap();
        assert_eq!(u.scheme, UpstreamScheme::Tls);
        assert_eq!(u.server_name.as_deref(), Some("dns.google"));
        assert_eq!(u.addr.unwrap(), "8.8.8.8:853".parse().unwrap());
    }

    #[test]
    fn test_parse_quic_upstream_default_port() {
        let u = ParsedUpstream::parse("quic://dns.adguard-dns.com@94.140.14.14").unwrap();
        assert_eq!(u.scheme, UpstreamScheme::Quic);
        assert_eq!(u.addr.unwrap().port(), 853);
    }

    #[test]
    fn test_parse_https_upstream() {
        let u = ParsedUpstream::parse("https://dns.google/dns-query").unwrap();
        assert_eq!(u.scheme, UpstreamScheme::Https);
        assert_eq!(u.url.as_deref(), Some("https://dns.google/dns-query"));
    }

    #[test]
    fn test_parse_invalid_scheme() {
        assert!(ParsedUpstream::parse("gopher://example.com").is_err());
        assert!(ParsedUpstream::parse("8.8.8.8").is_err());
    }

    #[test]
    fn test_validate_rejects_empty_upstreams() {
        let config = DnsConfig {
            upstreams: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

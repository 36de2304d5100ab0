pub mod adaptive;
pub mod doh;
pub mod doq;
pub mod dot;
pub mod h3_pool;
pub mod selector;
pub mod udp;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

pub use adaptive::AdaptiveUpstream;
pub use selector::{SelectorEntry, UpstreamSelector};

use crate::config::{DnsConfig, ParsedUpstream, UpstreamScheme};
use crate::error::{DnsError, Result};
use crate::metrics::UpstreamMetrics;
use crate::qos::{BreakerConfig, TimeoutConfig};

const EMA_ALPHA: f64 = 0.3;

/// One DNS exchange over some transport. Implementations are safe for
/// concurrent use; each call is an independent request/response.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Exchange one wire-format query, returning the wire-format response.
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>>;
}

/// An upstream plus the performance bookkeeping the selector feeds on.
pub struct UpstreamWrapper {
    tag: String,
    inner: Arc<dyn Upstream>,
    metrics: UpstreamMetrics,

    ema_latency_ms: AtomicU64,
    query_count: AtomicU64,
    error_count: AtomicU64,
}

impl UpstreamWrapper {
    pub fn new(tag: String, inner: Arc<dyn Upstream>, metrics: UpstreamMetrics) -> Self {
        Self {
            tag,
            inner,
            metrics,
            ema_latency_ms: AtomicU64::new(0),
            query_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.query_total.inc();
        self.metrics.inflight.inc();

        let start = Instant::now();
        let result = self.inner.exchange(query).await;
        self.metrics.inflight.dec();

        let latency_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                self.metrics.response_latency.observe(latency_ms as f64);
                self.update_ema(latency_ms);
            }
            Err(_) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                self.metrics.err_total.inc();
            }
        }

        result
    }

    /// This upstream's response was the one served to the client.
    pub fn mark_used(&self) {
        self.metrics.used_total.inc();
    }

    fn update_ema(&self, latency_ms: u64) {
        let current = self.ema_latency_ms.load(Ordering::Relaxed);
        if current == 0 {
            self.ema_latency_ms.store(latency_ms, Ordering::Relaxed);
        } else {
            let updated =
                (current as f64 * (1.0 - EMA_ALPHA) + latency_ms as f64 * EMA_ALPHA) as u64;
            self.ema_latency_ms.store(updated, Ordering::Relaxed);
        }
    }
}

impl SelectorEntry for UpstreamWrapper {
    fn ema_latency_ms(&self) -> u64 {
        self.ema_latency_ms.load(Ordering::Relaxed)
    }

    fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::Relaxed)
    }

    fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }
}

/// Build the concrete exchanger for one parsed upstream URL.
///
/// `https://` gets the adaptive DoH / DoH3 pair; `h3://` is DoH3 only.
pub fn build_upstream(parsed: &ParsedUpstream, config: &DnsConfig) -> Result<Arc<dyn Upstream>> {
    let timeouts = TimeoutConfig {
        base_timeout: config.base_timeout,
        min_timeout: config.min_timeout,
        max_timeout: config.max_timeout,
        congestion_mult: config.congestion_mult,
    };
    let breaker = BreakerConfig {
        max_failures: config.max_failures,
        reset_timeout: config.reset_timeout,
        half_open_attempts: config.half_open_attempts,
    };

    match parsed.scheme {
        UpstreamScheme::Udp => {
            let addr = parsed
                .addr
                .ok_or(DnsError::InvalidArgument("udp upstream without address"))?;
            Ok(Arc::new(udp::UdpUpstream::new(addr, config.max_timeout)))
        }
        UpstreamScheme::Tcp => {
            let addr = parsed
                .addr
                .ok_or(DnsError::InvalidArgument("tcp upstream without address"))?;
            Ok(Arc::new(udp::TcpUpstream::new(addr, config.max_timeout)))
        }
        UpstreamScheme::Tls => {
            let addr = parsed
                .addr
                .ok_or(DnsError::InvalidArgument("tls upstream without address"))?;
            let name = parsed
                .server_name
                .clone()
                .ok_or(DnsError::InvalidArgument("tls upstream without server name"))?;
            Ok(Arc::new(dot::DotUpstream::new(
                addr,
                name,
                config.max_timeout,
            )?))
        }
        UpstreamScheme::Quic => {
            let addr = parsed
                .addr
                .ok_or(DnsError::InvalidArgument("quic upstream without address"))?;
            let name = parsed
                .server_name
                .clone()
                .ok_or(DnsError::InvalidArgument("quic upstream without server name"))?;
            Ok(Arc::new(doq::DoqUpstream::new(
                addr, name, timeouts, breaker,
            )?))
        }
        UpstreamScheme::H3 => {
            let url = parsed
                .url
                .clone()
                .ok_or(DnsError::InvalidArgument("h3 upstream without url"))?;
            Ok(Arc::new(h3_pool::Doh3Upstream::new(
                url,
                h3_pool::PoolConfig {
                    min_connections: config.min_connections,
                    max_connections: config.max_connections,
                    idle_timeout: config.idle_timeout,
                },
            )?))
        }
        UpstreamScheme::Https => {
            let url = parsed
                .url
                .clone()
                .ok_or(DnsError::InvalidArgument("https upstream without url"))?;
            let doh = Arc::new(doh::DohUpstream::new(url.clone(), config.max_timeout)?);
            let doh3 = Arc::new(h3_pool::Doh3Upstream::new(
                url,
                h3_pool::PoolConfig {
                    min_connections: config.min_connections,
                    max_connections: config.max_connections,
                    idle_timeout: config.idle_timeout,
                },
            )?);
            Ok(Arc::new(AdaptiveUpstream::new(
                doh,
                doh3,
                adaptive::AdaptiveConfig {
                    sample_size: config.sample_size,
                    preference: config.preference,
                    trial_count: config.trial_count,
                },
                parsed.tag.clone(),
            )))
        }
    }
}

/// Client rustls config trusting the webpki roots, with the given ALPN.
pub(crate) fn tls_client_config(alpn: &[u8]) -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config =
        rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| DnsError::TlsConfig(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
    config.alpn_protocols = vec![alpn.to_vec()];
    Ok(config)
}

/// QUIC client endpoint bound to an ephemeral port, with the given ALPN.
pub(crate) fn quic_endpoint(alpn: &[u8], ipv6: bool) -> Result<quinn::Endpoint> {
    let crypto = tls_client_config(alpn)?;
    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| DnsError::TlsConfig(e.to_string()))?;
    let client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));

    let bind: std::net::SocketAddr = if ipv6 {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    let mut endpoint = quinn::Endpoint::client(bind).map_err(|e| DnsError::Io(e.to_string()))?;
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

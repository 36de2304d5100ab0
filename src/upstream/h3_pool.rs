use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{BufMut, Bytes};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::doh::{restore_message_id, zero_message_id, DNS_MESSAGE_CONTENT_TYPE};
use super::Upstream;
use crate::error::{DnsError, Result};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection the pool can keep, probe and close.
pub trait Poolable: Send + Sync + 'static {
    fn is_alive(&self) -> bool;
    fn close(&self);
}

/// Dials one new connection.
pub type Dialer<C> = Arc<dyn Fn() -> BoxFuture<'static, Result<C>> + Send + Sync>;

/// A pooled connection with its bookkeeping.
pub struct PoolEntry<C> {
    pub conn: C,
    last_used: RwLock<Instant>,
    healthy: AtomicBool,
}

impl<C> PoolEntry<C> {
    fn new(conn: C) -> Arc<Self> {
        Arc::new(Self {
            conn,
            last_used: RwLock::new(Instant::now()),
            healthy: AtomicBool::new(true),
        })
    }

    fn touch(&self) {
        *self.last_used.write() = Instant::now();
    }

    fn last_used(&self) -> Instant {
        *self.last_used.read()
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 4,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.max_connections == 0 {
            self.max_connections = defaults.max_connections;
        }
        if self.min_connections > self.max_connections {
            self.min_connections = self.max_connections;
        }
        if self.idle_timeout.is_zero() {
            self.idle_timeout = defaults.idle_timeout;
        }
        self
    }
}

/// Bounded pool of live transport sessions behind a dialer closure.
///
/// `get` reuses the most recently used healthy connection (LIFO), purging
/// stale ones on the way, and dials when nothing is reusable and the pool
/// is below `max_connections`. Two background loops keep
/// `min_connections` warm and evict idle connections above the minimum.
pub struct ConnPool<C: Poolable> {
    config: PoolConfig,
    conns: Mutex<Vec<Arc<PoolEntry<C>>>>,
    dialer: Dialer<C>,
    closed: AtomicBool,
}

impl<C: Poolable> ConnPool<C> {
    pub fn new(config: PoolConfig, dialer: Dialer<C>) -> Arc<Self> {
        let config = config.sanitized();
        let pool = Arc::new(Self {
            conns: Mutex::new(Vec::with_capacity(config.max_connections)),
            config,
            dialer,
            closed: AtomicBool::new(false),
        });

        let health_pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if health_pool.closed.load(Ordering::Relaxed) {
                    return;
                }
                health_pool.check_health().await;
            }
        });

        let idle_pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IDLE_CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if idle_pool.closed.load(Ordering::Relaxed) {
                    return;
                }
                idle_pool.cleanup_idle().await;
            }
        });

        pool
    }

    /// Get a reusable connection, dialing a fresh one if needed.
    pub async fn get(&self) -> Result<Arc<PoolEntry<C>>> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(DnsError::PoolClosed);
        }

        let mut conns = self.conns.lock().await;
        let now = Instant::now();

        for i in (0..conns.len()).rev() {
            let entry = &conns[i];
            if entry.is_healthy() && now.duration_since(entry.last_used()) < self.config.idle_timeout
            {
                entry.touch();
                return Ok(Arc::clone(entry));
            }
            let entry = conns.remove(i);
            entry.conn.close();
        }

        if conns.len() < self.config.max_connections {
            let conn = (self.dialer)()
                .await
                .map_err(|e| DnsError::DialFailed(e.to_string()))?;
            let entry = PoolEntry::new(conn);
            conns.push(Arc::clone(&entry));
            return Ok(entry);
        }

        Err(DnsError::PoolExhausted(self.config.max_connections))
    }

    /// Return a connection. Unhealthy connections are closed and removed.
    pub async fn release(&self, entry: &Arc<PoolEntry<C>>, healthy: bool) {
        entry.healthy.store(healthy, Ordering::Relaxed);
        entry.touch();

        if !healthy {
            entry.conn.close();
            let mut conns = self.conns.lock().await;
            conns.retain(|c| !Arc::ptr_eq(c, entry));
        }
    }

    /// Close all connections and stop the background loops. Idempotent.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);

        let mut conns = self.conns.lock().await;
        for entry in conns.drain(..) {
            entry.conn.close();
        }
    }

    /// `(active, total)` where active connections are healthy and fresh.
    pub async fn stats(&self) -> (usize, usize) {
        let conns = self.conns.lock().await;
        let now = Instant::now();
        let active = conns
            .iter()
            .filter(|e| e.is_healthy() && now.duration_since(e.last_used()) < self.config.idle_timeout)
            .count();
        (active, conns.len())
    }

    async fn check_health(&self) {
        let mut conns = self.conns.lock().await;
        let now = Instant::now();

        for i in (0..conns.len()).rev() {
            let entry = &conns[i];
            let stale = now.duration_since(entry.last_used()) > self.config.idle_timeout;
            let alive = entry.conn.is_alive();
            entry.healthy.store(alive, Ordering::Relaxed);
            if stale || !alive {
                let entry = conns.remove(i);
                entry.conn.close();
            }
        }

        while conns.len() < self.config.min_connections {
            match tokio::time::timeout(DIAL_TIMEOUT, (self.dialer)()).await {
                Ok(Ok(conn)) => {
                    conns.push(PoolEntry::new(conn));
                }
                Ok(Err(e)) => {
                    warn!("failed to maintain minimum connections: {}", e);
                    break;
                }
                Err(_) => {
                    warn!("failed to maintain minimum connections: dial timed out");
                    break;
                }
            }
        }
    }

    async fn cleanup_idle(&self) {
        let mut conns = self.conns.lock().await;
        let now = Instant::now();

        for i in (0..conns.len()).rev() {
            if conns.len() <= self.config.min_connections {
                break;
            }
            if now.duration_since(conns[i].last_used()) > self.config.idle_timeout {
                let entry = conns.remove(i);
                entry.conn.close();
                debug!("evicted idle pooled connection");
            }
        }
    }
}

/// One live HTTP/3 session: the QUIC connection plus a request handle.
pub struct H3Conn {
    conn: quinn::Connection,
    send_request: h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>,
}

impl H3Conn {
    pub fn handle(&self) -> h3::client::SendRequest<h3_quinn::OpenStreams, Bytes> {
        self.send_request.clone()
    }
}

impl Poolable for H3Conn {
    fn is_alive(&self) -> bool {
        self.conn.close_reason().is_none()
    }

    fn close(&self) {
        self.conn.close(0u32.into(), b"pool closed");
    }
}

fn h3_dialer(endpoint: quinn::Endpoint, host: String, port: u16) -> Dialer<H3Conn> {
    Arc::new(move || {
        let endpoint = endpoint.clone();
        let host = host.clone();
        Box::pin(async move {
            let addr = tokio::net::lookup_host((host.as_str(), port))
                .await
                .map_err(|e| DnsError::DialFailed(e.to_string()))?
                .next()
                .ok_or_else(|| DnsError::DialFailed(format!("no address for {}", host)))?;

            let conn = endpoint
                .connect(addr, &host)
                .map_err(|e| DnsError::DialFailed(e.to_string()))?
                .await
                .map_err(|e| DnsError::DialFailed(e.to_string()))?;

            let (mut driver, send_request) =
                h3::client::new(h3_quinn::Connection::new(conn.clone()))
                    .await
                    .map_err(|e| DnsError::DialFailed(e.to_string()))?;

            tokio::spawn(async move {
                let _ = futures::future::poll_fn(|cx| driver.poll_close(cx)).await;
            });

            Ok(H3Conn { conn, send_request })
        })
    })
}

/// RFC 8484 DoH over HTTP/3, with sessions drawn from a [`ConnPool`].
pub struct Doh3Upstream {
    pool: Arc<ConnPool<H3Conn>>,
    url: String,
}

impl Doh3Upstream {
    pub fn new(url: String, pool_config: PoolConfig) -> Result<Self> {
        let uri: http::Uri = url
            .parse()
            .map_err(|_| DnsError::InvalidUpstreamAddress(url.clone()))?;
        let host = uri
            .host()
            .ok_or_else(|| DnsError::InvalidUpstreamAddress(url.clone()))?
            .to_string();
        let port = uri.port_u16().unwrap_or(443);

        let endpoint = super::quic_endpoint(b"h3", false)?;
        let pool = ConnPool::new(pool_config, h3_dialer(endpoint, host, port));

        Ok(Self { pool, url })
    }

    pub async fn stats(&self) -> (usize, usize) {
        self.pool.stats().await
    }

    async fn round_trip(
        mut send_request: h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>,
        uri: http::Uri,
    ) -> Result<Vec<u8>> {
        let request = http::Request::builder()
            .method(http::Method::GET)
            .uri(uri)
            .header(http::header::ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
            .body(())
            .map_err(|e| DnsError::ExchangeFailed(e.to_string()))?;

        let mut stream = send_request
            .send_request(request)
            .await
            .map_err(|e| DnsError::ExchangeFailed(e.to_string()))?;
        stream
            .finish()
            .await
            .map_err(|e| DnsError::ExchangeFailed(e.to_string()))?;

        let response = stream
            .recv_response()
            .await
            .map_err(|e| DnsError::ExchangeFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DnsError::ExchangeFailed(format!(
                "unexpected HTTP status {}",
                response.status()
            )));
        }

        let mut body = Vec::new();
        while let Some(chunk) = stream
            .recv_data()
            .await
            .map_err(|e| DnsError::ExchangeFailed(e.to_string()))?
        {
            body.put(chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl Upstream for Doh3Upstream {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        let (wire, original_id) = zero_message_id(query)?;
        let uri: http::Uri = format!("{}?dns={}", self.url, URL_SAFE_NO_PAD.encode(wire))
            .parse()
            .map_err(|_| DnsError::InvalidUpstreamAddress(self.url.clone()))?;

        let entry = self.pool.get().await?;
        match Self::round_trip(entry.conn.handle(), uri).await {
            Ok(mut body) => {
                restore_message_id(&mut body, original_id)?;
                Ok(body)
            }
            Err(e) => {
                self.pool.release(&entry, false).await;
                Err(e)
            }
        }
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use quinn::VarInt;
use tokio::sync::Mutex;
use tracing::debug;

use super::Upstream;
use crate::error::{DnsError, Result};
use crate::qos::{AdaptiveTimeout, BreakerConfig, CircuitBreaker, TimeoutConfig};

// RFC 9250 application error codes.
const DOQ_NO_ERROR: VarInt = VarInt::from_u32(0x0);
const DOQ_REQUEST_CANCELLED: VarInt = VarInt::from_u32(0x3);

/// Why a stream could not be reserved on a connection.
pub enum ReserveError {
    /// The QUIC connection is gone; the caller should redial.
    Closed,
    /// The circuit breaker is open.
    BreakerOpen,
    /// Opening a stream failed.
    Stream(String),
}

/// One QUIC connection guarded by an adaptive timeout and a circuit
/// breaker. Each exchange runs on its own bidirectional stream.
pub struct ResilientQuicConn {
    conn: quinn::Connection,
    timeout: AdaptiveTimeout,
    breaker: CircuitBreaker,
}

impl ResilientQuicConn {
    pub fn new(conn: quinn::Connection, timeouts: TimeoutConfig, breaker: BreakerConfig) -> Self {
        Self {
            conn,
            timeout: AdaptiveTimeout::new(timeouts),
            breaker: CircuitBreaker::new(breaker),
        }
    }

    pub fn close(&self) {
        self.conn.close(DOQ_NO_ERROR, b"");
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Reserve a stream for one exchange.
    pub async fn reserve(&self) -> std::result::Result<ReservedExchange<'_>, ReserveError> {
        if self.conn.close_reason().is_some() {
            return Err(ReserveError::Closed);
        }

        if self.breaker.before_execute() {
            return Err(ReserveError::BreakerOpen);
        }

        match self.conn.open_bi().await {
            Ok((send, recv)) => Ok(ReservedExchange {
                send,
                recv,
                conn: self,
            }),
            Err(e) => Err(ReserveError::Stream(e.to_string())),
        }
    }
}

/// A single reserved DoQ stream. Consumed by [`exchange`] or [`withdraw`].
///
/// [`exchange`]: ReservedExchange::exchange
/// [`withdraw`]: ReservedExchange::withdraw
pub struct ReservedExchange<'a> {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    conn: &'a ResilientQuicConn,
}

impl ReservedExchange<'_> {
    /// Run one DoQ exchange on the reserved stream, feeding the outcome
    /// into the connection's timeout estimator and breaker.
    pub async fn exchange(mut self, query: &[u8]) -> Result<Vec<u8>> {
        let start = Instant::now();
        let deadline = self.conn.timeout.timeout();

        let result = match tokio::time::timeout(deadline, self.exchange_on_stream(query)).await {
            Ok(result) => result,
            Err(_) => {
                self.cancel();
                Err(DnsError::Timeout)
            }
        };

        match &result {
            Ok(_) => {
                self.conn.timeout.record_success(start.elapsed());
                self.conn.breaker.after_execute(false);
            }
            Err(_) => {
                self.conn.timeout.record_timeout();
                self.conn.breaker.after_execute(true);
            }
        }

        result
    }

    async fn exchange_on_stream(&mut self, query: &[u8]) -> Result<Vec<u8>> {
        let payload = match frame_query(query) {
            Ok(p) => p,
            Err(e) => {
                self.cancel();
                return Err(e);
            }
        };
        // DNS ID sits right behind the 2-byte length prefix.
        let original_id = u16::from_be_bytes([query[0], query[1]]);

        if let Err(e) = self.send.write_all(&payload).await {
            self.cancel();
            return Err(DnsError::ExchangeFailed(e.to_string()));
        }
        if let Err(e) = self.send.finish() {
            self.cancel();
            return Err(DnsError::ExchangeFailed(e.to_string()));
        }

        let mut response = match self.read_response().await {
            Ok(r) => r,
            Err(e) => {
                self.cancel();
                return Err(e);
            }
        };

        if response.len() >= 2 {
            response[..2].copy_from_slice(&original_id.to_be_bytes());
        }
        let _ = self.recv.stop(DOQ_NO_ERROR);
        Ok(response)
    }

    async fn read_response(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 2];
        self.recv
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| DnsError::ExchangeFailed(e.to_string()))?;

        let len = u16::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        self.recv
            .read_exact(&mut body)
            .await
            .map_err(|e| DnsError::ExchangeFailed(e.to_string()))?;
        Ok(body)
    }

    /// Abandon the reservation without exchanging.
    pub fn withdraw(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        let _ = self.send.reset(DOQ_REQUEST_CANCELLED);
        let _ = self.recv.stop(DOQ_REQUEST_CANCELLED);
    }
}

/// Length-prefix the message and zero its ID, as DoQ requires on the wire.
fn frame_query(query: &[u8]) -> Result<Vec<u8>> {
    if query.len() < 12 {
        return Err(DnsError::DecodeFailed("message shorter than header".into()));
    }
    if query.len() > usize::from(u16::MAX) {
        return Err(DnsError::ExchangeFailed("message too large for DoQ".into()));
    }

    let mut payload = Vec::with_capacity(query.len() + 2);
    payload.extend_from_slice(&(query.len() as u16).to_be_bytes());
    payload.extend_from_slice(query);
    payload[2] = 0;
    payload[3] = 0;
    Ok(payload)
}

/// DoQ upstream: keeps one resilient connection, redialing when it dies.
pub struct DoqUpstream {
    endpoint: quinn::Endpoint,
    addr: SocketAddr,
    server_name: String,
    timeouts: TimeoutConfig,
    breaker: BreakerConfig,
    conn: Mutex<Option<Arc<ResilientQuicConn>>>,
}

impl DoqUpstream {
    pub fn new(
        addr: SocketAddr,
        server_name: String,
        timeouts: TimeoutConfig,
        breaker: BreakerConfig,
    ) -> Result<Self> {
        let endpoint = super::quic_endpoint(b"doq", addr.is_ipv6())?;
        Ok(Self {
            endpoint,
            addr,
            server_name,
            timeouts,
            breaker,
            conn: Mutex::new(None),
        })
    }

    async fn get_conn(&self) -> Result<Arc<ResilientQuicConn>> {
        let mut guard = self.conn.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.conn.close_reason().is_none() {
                return Ok(Arc::clone(conn));
            }
            debug!("{}: cached DoQ connection is dead, redialing", self.addr);
        }

        let quic_conn = self
            .endpoint
            .connect(self.addr, &self.server_name)
            .map_err(|e| DnsError::DialFailed(e.to_string()))?
            .await
            .map_err(|e| DnsError::DialFailed(e.to_string()))?;

        let conn = Arc::new(ResilientQuicConn::new(
            quic_conn,
            self.timeouts,
            self.breaker,
        ));
        *guard = Some(Arc::clone(&conn));
        Ok(conn)
    }
}

#[async_trait]
impl Upstream for DoqUpstream {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        let conn = self.get_conn().await?;

        let reserved = match conn.reserve().await {
            Ok(r) => r,
            Err(ReserveError::Closed) => {
                // One redial attempt on a freshly dead connection.
                let conn = self.get_conn().await?;
                return match conn.reserve().await {
                    Ok(r) => r.exchange(query).await,
                    Err(ReserveError::Closed) => {
                        Err(DnsError::DialFailed("connection closed".into()))
                    }
                    Err(ReserveError::BreakerOpen) => Err(DnsError::CircuitBreakerOpen),
                    Err(ReserveError::Stream(e)) => Err(DnsError::ExchangeFailed(e)),
                };
            }
            Err(ReserveError::BreakerOpen) => return Err(DnsError::CircuitBreakerOpen),
            Err(ReserveError::Stream(e)) => return Err(DnsError::ExchangeFailed(e)),
        };

        reserved.exchange(query).await
    }
}

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use super::dot::{read_prefixed, write_prefixed};
use super::Upstream;
use crate::error::{DnsError, Result};

const MAX_UDP_PAYLOAD: usize = 65535;
const TC_FLAG: u8 = 0x02;

/// Classic UDP53 exchanger. Mismatched response IDs are ignored; a
/// truncated response is retried over TCP.
pub struct UdpUpstream {
    addr: SocketAddr,
    timeout: Duration,
}

impl UdpUpstream {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    async fn exchange_udp(&self, query: &[u8]) -> Result<Vec<u8>> {
        let bind: SocketAddr = if self.addr.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.addr).await?;
        socket
            .send(query)
            .await
            .map_err(|e| DnsError::ExchangeFailed(e.to_string()))?;

        let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
        loop {
            let n = socket
                .recv(&mut buf)
                .await
                .map_err(|e| DnsError::ExchangeFailed(e.to_string()))?;
            if n < 12 {
                continue;
            }
            if buf[..2] != query[..2] {
                debug!("{}: dropping response with mismatched id", self.addr);
                continue;
            }
            buf.truncate(n);
            return Ok(buf);
        }
    }

    async fn exchange_inner(&self, query: &[u8]) -> Result<Vec<u8>> {
        let response = self.exchange_udp(query).await?;

        if response[2] & TC_FLAG != 0 {
            debug!("{}: truncated response, retrying over TCP", self.addr);
            return exchange_tcp(self.addr, query).await;
        }

        Ok(response)
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        if query.len() < 12 {
            return Err(DnsError::DecodeFailed("message shorter than header".into()));
        }
        tokio::time::timeout(self.timeout, self.exchange_inner(query))
            .await
            .map_err(|_| DnsError::Timeout)?
    }
}

/// DNS over plain TCP with 2-byte length framing.
pub struct TcpUpstream {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpUpstream {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }
}

#[async_trait]
impl Upstream for TcpUpstream {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        tokio::time::timeout(self.timeout, exchange_tcp(self.addr, query))
            .await
            .map_err(|_| DnsError::Timeout)?
    }
}

async fn exchange_tcp(addr: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| DnsError::DialFailed(e.to_string()))?;
    stream.set_nodelay(true).ok();

    write_prefixed(&mut stream, query).await?;
    read_prefixed(&mut stream).await
}

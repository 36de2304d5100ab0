use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::Upstream;
use crate::error::{DnsError, Result};

/// DNS over TLS (RFC 7858) exchanger. Each exchange runs on a fresh
/// connection with the standard 2-byte length framing.
pub struct DotUpstream {
    addr: SocketAddr,
    server_name: rustls::pki_types::ServerName<'static>,
    connector: TlsConnector,
    timeout: Duration,
}

impl DotUpstream {
    pub fn new(addr: SocketAddr, server_name: String, timeout: Duration) -> Result<Self> {
        let config = super::tls_client_config(b"dot")?;
        let server_name = rustls::pki_types::ServerName::try_from(server_name.clone())
            .map_err(|_| DnsError::TlsConfig(format!("invalid server name {}", server_name)))?;

        Ok(Self {
            addr,
            server_name,
            connector: TlsConnector::from(Arc::new(config)),
            timeout,
        })
    }

    async fn exchange_inner(&self, query: &[u8]) -> Result<Vec<u8>> {
        let tcp = TcpStream::connect(self.addr)
            .await
            .map_err(|e| DnsError::DialFailed(e.to_string()))?;
        tcp.set_nodelay(true).ok();

        let mut stream = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| DnsError::DialFailed(e.to_string()))?;

        write_prefixed(&mut stream, query).await?;
        read_prefixed(&mut stream).await
    }
}

#[async_trait]
impl Upstream for DotUpstream {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        tokio::time::timeout(self.timeout, self.exchange_inner(query))
            .await
            .map_err(|_| DnsError::Timeout)?
    }
}

/// Write a DNS message with its 16-bit big-endian length prefix.
pub(crate) async fn write_prefixed<W>(stream: &mut W, msg: &[u8]) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    if msg.len() > usize::from(u16::MAX) {
        return Err(DnsError::ExchangeFailed("message too large for TCP".into()));
    }
    stream
        .write_all(&(msg.len() as u16).to_be_bytes())
        .await
        .map_err(|e| DnsError::ExchangeFailed(e.to_string()))?;
    stream
        .write_all(msg)
        .await
        .map_err(|e| DnsError::ExchangeFailed(e.to_string()))?;
    Ok(())
}

/// Read one length-prefixed DNS message.
pub(crate) async fn read_prefixed<R>(stream: &mut R) -> Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| DnsError::ExchangeFailed(e.to_string()))?;

    let len = u16::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| DnsError::ExchangeFailed(e.to_string()))?;
    Ok(body)
}

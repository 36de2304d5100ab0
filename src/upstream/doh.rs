use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use super::Upstream;
use crate::error::{DnsError, Result};

pub const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// RFC 8484 DoH exchanger using GET with the `dns` query parameter.
pub struct DohUpstream {
    client: reqwest::Client,
    url: String,
}

impl DohUpstream {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .https_only(true)
            .timeout(timeout)
            .tcp_nodelay(true)
            .pool_idle_timeout(None)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DnsError::DialFailed(e.to_string()))?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl Upstream for DohUpstream {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        let (wire, original_id) = zero_message_id(query)?;
        let request_url = format!("{}?dns={}", self.url, URL_SAFE_NO_PAD.encode(wire));

        let response = self
            .client
            .get(&request_url)
            .header(http::header::ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DnsError::Timeout
                } else {
                    DnsError::ExchangeFailed(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(DnsError::ExchangeFailed(format!(
                "unexpected HTTP status {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DnsError::ExchangeFailed(e.to_string()))?;

        let mut out = body.to_vec();
        restore_message_id(&mut out, original_id)?;
        Ok(out)
    }
}

/// Copy the query with its ID field zeroed, returning the original ID.
/// GET bodies are cacheable by intermediaries, so the ID must not vary.
pub(crate) fn zero_message_id(query: &[u8]) -> Result<(Vec<u8>, u16)> {
    if query.len() < 12 {
        return Err(DnsError::DecodeFailed("message shorter than header".into()));
    }
    let original_id = u16::from_be_bytes([query[0], query[1]]);
    let mut wire = query.to_vec();
    wire[0] = 0;
    wire[1] = 0;
    Ok((wire, original_id))
}

pub(crate) fn restore_message_id(response: &mut [u8], id: u16) -> Result<()> {
    if response.len() < 12 {
        return Err(DnsError::DecodeFailed("response shorter than header".into()));
    }
    response[..2].copy_from_slice(&id.to_be_bytes());
    Ok(())
}

use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use tracing::{debug, warn};

use crate::config::{DnsConfig, ParsedUpstream};
use crate::error::{DnsError, Result};
use crate::metrics::DnsMetrics;
use crate::server::{Handler, QueryMeta};
use crate::upstream::{build_upstream, Upstream, UpstreamSelector, UpstreamWrapper};

/// The forwarder: picks upstreams through the weighted selector, races
/// them, and serves the first successful response.
pub struct Forward {
    wrappers: Vec<Arc<UpstreamWrapper>>,
    selector: UpstreamSelector<UpstreamWrapper>,
    concurrent: usize,
}

impl Forward {
    pub fn new(wrappers: Vec<Arc<UpstreamWrapper>>, concurrent: usize) -> Result<Self> {
        if wrappers.is_empty() {
            return Err(DnsError::InvalidArgument("no upstreams configured"));
        }

        let selector = UpstreamSelector::new(wrappers.clone());
        Ok(Self {
            wrappers,
            selector,
            concurrent: concurrent.max(1),
        })
    }

    /// Build a forwarder from configuration, registering per-upstream
    /// metrics along the way.
    pub fn from_config(config: &DnsConfig, metrics: &DnsMetrics) -> Result<Self> {
        config.validate()?;

        let mut wrappers = Vec::with_capacity(config.upstreams.len());
        for raw in &config.upstreams {
            let parsed = ParsedUpstream::parse(raw)?;
            let upstream: Arc<dyn Upstream> = build_upstream(&parsed, config)?;
            wrappers.push(Arc::new(UpstreamWrapper::new(
                parsed.tag.clone(),
                upstream,
                metrics.upstream(&parsed.tag)?,
            )));
        }

        Self::new(wrappers, config.concurrent_queries)
    }

    pub fn upstream_count(&self) -> usize {
        self.wrappers.len()
    }

    /// Exchange one wire-format query against the selected upstreams.
    pub async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        let picked = self.selector.select(self.concurrent);

        let mut in_flight: Vec<_> = picked
            .iter()
            .map(|&idx| {
                let wrapper = Arc::clone(&self.wrappers[idx]);
                let query = query.to_vec();
                Box::pin(async move {
                    let result = wrapper.exchange(&query).await;
                    (idx, result)
                })
            })
            .collect();

        let mut last_err = None;
        while !in_flight.is_empty() {
            let ((idx, result), _, rest) = futures::future::select_all(in_flight).await;
            in_flight = rest;

            match result {
                Ok(response) => {
                    self.wrappers[idx].mark_used();
                    return Ok(response);
                }
                Err(e) => {
                    warn!("upstream {} failed: {}", self.wrappers[idx].tag(), e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(DnsError::ExchangeFailed("no upstream answered".into())))
    }
}

#[async_trait]
impl Handler for Forward {
    async fn handle(&self, query: Message, meta: QueryMeta) -> Option<Vec<u8>> {
        let wire = match query.to_vec() {
            Ok(w) => w,
            Err(e) => {
                warn!("failed to repack query from {}: {}", meta.client_addr, e);
                return None;
            }
        };

        match self.exchange(&wire).await {
            Ok(mut response) => {
                // The response carries whatever ID the transport restored;
                // pin it back to the client's.
                if response.len() >= 2 {
                    response[..2].copy_from_slice(&query.id().to_be_bytes());
                }
                Some(response)
            }
            Err(e) => {
                debug!("forward failed for {}: {}", meta.client_addr, e);
                let servfail =
                    Message::error_msg(query.id(), query.op_code(), ResponseCode::ServFail);
                servfail.to_vec().ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::UpstreamMetrics;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedUpstream {
        fail: bool,
        calls: AtomicUsize,
        response: Vec<u8>,
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn exchange(&self, _query: &[u8]) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                Err(DnsError::ExchangeFailed("down".into()))
            } else {
                Ok(self.response.clone())
            }
        }
    }

    fn wrapper(fail: bool, response: Vec<u8>) -> Arc<UpstreamWrapper> {
        Arc::new(UpstreamWrapper::new(
            format!("stub-fail-{}", fail),
            Arc::new(ScriptedUpstream {
                fail,
                calls: AtomicUsize::new(0),
                response,
            }),
            UpstreamMetrics::detached(),
        ))
    }

    #[test]
    fn test_empty_upstreams_rejected() {
        assert!(matches!(
            Forward::new(vec![], 1),
            Err(DnsError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_failover_to_working_upstream() {
        let forward = Forward::new(
            vec![wrapper(true, vec![]), wrapper(false, vec![0xde, 0xad])],
            2,
        )
        .unwrap();

        let response = forward.exchange(&[0u8; 12]).await.unwrap();
        assert_eq!(response, vec![0xde, 0xad]);
    }

    #[tokio::test]
    async fn test_all_upstreams_failing_surfaces_error() {
        let forward = Forward::new(vec![wrapper(true, vec![]), wrapper(true, vec![])], 2).unwrap();
        assert!(forward.exchange(&[0u8; 12]).await.is_err());
    }

    #[tokio::test]
    async fn test_handle_returns_servfail_on_error() {
        use hickory_proto::op::{MessageType, OpCode, Query};
        use hickory_proto::rr::{Name, RecordType};
        use std::str::FromStr;

        let forward = Forward::new(vec![wrapper(true, vec![])], 1).unwrap();

        let mut query = Message::new();
        query.set_id(42).set_op_code(OpCode::Query);
        query.add_query(Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::A,
        ));

        let meta = QueryMeta {
            client_addr: "127.0.0.1".parse().unwrap(),
            from_udp: true,
        };
        let payload = forward.handle(query, meta).await.unwrap();
        let response = Message::from_vec(&payload).unwrap();
        assert_eq!(response.id(), 42);
        assert_eq!(response.message_type(), MessageType::Response);
        assert_eq!(response.response_code(), ResponseCode::ServFail);
    }
}

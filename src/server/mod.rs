pub mod socket;
pub mod udp;

use std::net::IpAddr;

use async_trait::async_trait;
use hickory_proto::op::Message;

pub use udp::{serve_udp, UdpServerOpts};

/// Where a query came from.
#[derive(Debug, Clone, Copy)]
pub struct QueryMeta {
    pub client_addr: IpAddr,
    pub from_udp: bool,
}

/// Serves one decoded query. Returning `None` drops the query silently.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, query: Message, meta: QueryMeta) -> Option<Vec<u8>>;
}

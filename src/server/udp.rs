use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;

use hickory_proto::op::Message;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::socket::{self, RecvMeta};
use super::{Handler, QueryMeta};
use crate::error::{DnsError, Result};
use crate::pool::BufferPool;

const WORKER_CHANNEL_DEPTH: usize = 128;
const MAX_DATAGRAM_SIZE: usize = 65535;

#[derive(Debug, Clone, Copy)]
pub struct UdpServerOpts {
    /// Number of workers; 0 means one per CPU.
    pub worker_pool_size: usize,
    /// Pin each worker to an OS thread (and a core, when available).
    pub cpu_affinity: bool,
}

impl Default for UdpServerOpts {
    fn default() -> Self {
        Self {
            worker_pool_size: 0,
            cpu_affinity: false,
        }
    }
}

struct UdpRequest {
    query: Message,
    src: SocketAddr,
    dst: Option<IpAddr>,
}

struct WorkerContext {
    socket: Arc<AsyncFd<UdpSocket>>,
    handler: Arc<dyn Handler>,
    /// Destination addresses are echoed back only when PKTINFO is on.
    oob_enabled: bool,
    /// Listener bound to an IPv6 address.
    ipv6_listener: bool,
}

/// Serve DNS over the given UDP socket until a fatal read error.
///
/// One reader dispatches datagrams round-robin into bounded per-worker
/// channels; a full channel backpressures the reader. Workers decode
/// nothing themselves - the reader hands them parsed messages - and write
/// responses from the same local address the query arrived on.
pub async fn serve_udp(
    socket: UdpSocket,
    handler: Arc<dyn Handler>,
    opts: UdpServerOpts,
) -> Result<()> {
    let local_addr = socket.local_addr()?;
    let ipv6_listener = local_addr.is_ipv6();

    let oob_enabled = match socket::enable_pktinfo(&socket, ipv6_listener) {
        Ok(()) => true,
        Err(e) => {
            warn!("PKTINFO unavailable, replies use the default source: {}", e);
            false
        }
    };

    let socket = Arc::new(AsyncFd::new(socket)?);
    let worker_count = if opts.worker_pool_size > 0 {
        opts.worker_pool_size
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    };

    let ctx = Arc::new(WorkerContext {
        socket: Arc::clone(&socket),
        handler,
        oob_enabled,
        ipv6_listener,
    });

    let mut senders = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        let (tx, rx) = mpsc::channel::<UdpRequest>(WORKER_CHANNEL_DEPTH);
        spawn_worker(id, rx, Arc::clone(&ctx), opts.cpu_affinity);
        senders.push(tx);
    }

    let buffer_pool = BufferPool::new(MAX_DATAGRAM_SIZE, worker_count * 2);

    // Two rotating control-message buffers, so a read never clobbers the
    // ancillary data still being picked apart from the previous one.
    let mut cmsg_bufs = [socket::cmsg_capacity(), socket::cmsg_capacity()];
    let mut cmsg_idx = 0;
    let mut next_worker = 0;

    loop {
        let mut buf = buffer_pool.get();

        let meta = match read_datagram(&socket, &mut buf, &mut cmsg_bufs[cmsg_idx]).await {
            Ok(meta) => meta,
            Err(e) => {
                error!("udp listener terminated: {}", e);
                return Err(DnsError::Io(e.to_string()));
            }
        };
        cmsg_idx = (cmsg_idx + 1) % cmsg_bufs.len();

        let query = match Message::from_vec(&buf[..meta.len]) {
            Ok(q) => q,
            Err(e) => {
                warn!("invalid msg from {}: {}", meta.src, e);
                continue;
            }
        };

        let request = UdpRequest {
            query,
            src: meta.src,
            dst: meta.dst,
        };
        let worker = &senders[next_worker];
        next_worker = (next_worker + 1) % senders.len();
        if worker.send(request).await.is_err() {
            return Err(DnsError::Io("worker pool stopped".into()));
        }
    }
}

async fn read_datagram(
    socket: &AsyncFd<UdpSocket>,
    buf: &mut [u8],
    cmsg_buf: &mut Vec<u8>,
) -> std::io::Result<RecvMeta> {
    loop {
        let mut guard = socket.readable().await?;
        match guard.try_io(|inner| socket::recv_with_dst(inner.get_ref(), buf, cmsg_buf)) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

fn spawn_worker(
    id: usize,
    mut rx: mpsc::Receiver<UdpRequest>,
    ctx: Arc<WorkerContext>,
    cpu_affinity: bool,
) {
    let work = async move {
        while let Some(request) = rx.recv().await {
            handle_request(request, &ctx).await;
        }
        debug!("udp worker {} stopped", id);
    };

    if cpu_affinity {
        let core = core_affinity::get_core_ids()
            .and_then(|cores| cores.get(id % cores.len().max(1)).copied());
        let runtime = tokio::runtime::Handle::current();
        std::thread::Builder::new()
            .name(format!("bifrost-udp-{}", id))
            .spawn(move || {
                if let Some(core) = core {
                    core_affinity::set_for_current(core);
                }
                runtime.block_on(work);
            })
            .expect("failed to spawn pinned udp worker");
    } else {
        tokio::spawn(work);
    }
}

async fn handle_request(request: UdpRequest, ctx: &WorkerContext) {
    let meta = QueryMeta {
        client_addr: request.src.ip(),
        from_udp: true,
    };

    let Some(payload) = ctx.handler.handle(request.query, meta).await else {
        return;
    };

    // An IPv4-mapped source on a v6-only listener has no usable reply
    // path without the ancillary writer; drop silently.
    if ctx.ipv6_listener && socket::is_ipv4_mapped(request.src.ip()) && !ctx.oob_enabled {
        debug!("dropping IPv4-mapped client {} on IPv6 listener", request.src);
        return;
    }

    let src_hint = if ctx.oob_enabled { request.dst } else { None };
    if let Err(e) = write_response(&ctx.socket, &payload, request.src, src_hint).await {
        warn!("failed to write response to {}: {}", request.src, e);
    }
}

async fn write_response(
    socket: &AsyncFd<UdpSocket>,
    payload: &[u8],
    dst: SocketAddr,
    src: Option<IpAddr>,
) -> std::io::Result<usize> {
    loop {
        let mut guard = socket.writable().await?;
        match guard.try_io(|inner| socket::send_with_src(inner.get_ref(), payload, dst, src)) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(&self, query: Message, meta: QueryMeta) -> Option<Vec<u8>> {
            assert!(meta.from_udp);
            let mut response = Message::new();
            response
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query);
            for q in query.queries() {
                response.add_query(q.clone());
            }
            response.to_vec().ok()
        }
    }

    fn test_query(id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id).set_op_code(OpCode::Query);
        msg.add_query(Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::A,
        ));
        msg
    }

    #[tokio::test]
    async fn test_serve_udp_round_trip() {
        let opts = socket::SocketOpts {
            reuse_port: false,
            recv_buffer_size: 0,
            send_buffer_size: 0,
        };
        let server_sock = socket::bind_udp_socket("127.0.0.1:0".parse().unwrap(), &opts).unwrap();
        let server_addr = server_sock.local_addr().unwrap();

        tokio::spawn(serve_udp(
            server_sock,
            Arc::new(EchoHandler),
            UdpServerOpts {
                worker_pool_size: 2,
                cpu_affinity: false,
            },
        ));

        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = test_query(0x1234);
        client
            .send_to(&query.to_vec().unwrap(), server_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 512];
        let (n, _) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();

        let response = Message::from_vec(&buf[..n]).unwrap();
        assert_eq!(response.id(), 0x1234);
        assert_eq!(response.message_type(), MessageType::Response);
    }

    #[tokio::test]
    async fn test_read_error_terminates_listener() {
        let opts = socket::SocketOpts {
            reuse_port: false,
            recv_buffer_size: 0,
            send_buffer_size: 0,
        };
        let server_sock = socket::bind_udp_socket("127.0.0.1:0".parse().unwrap(), &opts).unwrap();

        // Reserve a port, then free it so nothing is listening there.
        let dead = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        // Probing the dead port queues an ICMP port-unreachable on the
        // connected socket; the listener's next read surfaces it.
        server_sock.connect(dead_addr).unwrap();
        server_sock.send(b"probe").unwrap();

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            serve_udp(server_sock, Arc::new(EchoHandler), UdpServerOpts::default()),
        )
        .await
        .expect("listener should terminate on read error, not keep looping");

        assert!(matches!(result, Err(DnsError::Io(_))));
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped() {
        let opts = socket::SocketOpts {
            reuse_port: false,
            recv_buffer_size: 0,
            send_buffer_size: 0,
        };
        let server_sock = socket::bind_udp_socket("127.0.0.1:0".parse().unwrap(), &opts).unwrap();
        let server_addr = server_sock.local_addr().unwrap();

        tokio::spawn(serve_udp(
            server_sock,
            Arc::new(EchoHandler),
            UdpServerOpts::default(),
        ));

        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0xff, 0x00], server_addr).await.unwrap();

        // A valid query afterwards still gets served.
        let query = test_query(7);
        client
            .send_to(&query.to_vec().unwrap(), server_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 512];
        let (n, _) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(Message::from_vec(&buf[..n]).unwrap().id(), 7);
    }
}

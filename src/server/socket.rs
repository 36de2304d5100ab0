use std::io::{IoSlice, IoSliceMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
use std::os::fd::AsRawFd;

use nix::sys::socket::{
    recvmsg, sendmsg, setsockopt, sockopt, ControlMessage, ControlMessageOwned, MsgFlags,
    SockaddrStorage,
};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{DnsError, Result};

/// Listener socket options.
#[derive(Debug, Clone, Copy)]
pub struct SocketOpts {
    pub reuse_port: bool,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
}

impl Default for SocketOpts {
    fn default() -> Self {
        Self {
            reuse_port: false,
            recv_buffer_size: 512 * 1024,
            send_buffer_size: 512 * 1024,
        }
    }
}

/// Build and bind a nonblocking UDP socket with the requested options.
/// IPv6 sockets are bound v6-only.
pub fn bind_udp_socket(addr: SocketAddr, opts: &SocketOpts) -> Result<UdpSocket> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| DnsError::InvalidBindAddress(e.to_string()))?;

    if opts.reuse_port {
        socket
            .set_reuse_port(true)
            .map_err(|e| DnsError::InvalidBindAddress(e.to_string()))?;
    }
    if opts.recv_buffer_size > 0 {
        socket
            .set_recv_buffer_size(opts.recv_buffer_size)
            .map_err(|e| DnsError::InvalidBindAddress(e.to_string()))?;
    }
    if opts.send_buffer_size > 0 {
        socket
            .set_send_buffer_size(opts.send_buffer_size)
            .map_err(|e| DnsError::InvalidBindAddress(e.to_string()))?;
    }
    if addr.is_ipv6() {
        socket
            .set_only_v6(true)
            .map_err(|e| DnsError::InvalidBindAddress(e.to_string()))?;
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| DnsError::InvalidBindAddress(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| DnsError::InvalidBindAddress(format!("{}: {}", addr, e)))?;

    Ok(socket.into())
}

/// Ask the kernel for the destination address of incoming datagrams.
pub fn enable_pktinfo(socket: &UdpSocket, ipv6: bool) -> Result<()> {
    if ipv6 {
        setsockopt(socket, sockopt::Ipv6RecvPacketInfo, &true)
            .map_err(|e| DnsError::Io(e.to_string()))?;
    } else {
        setsockopt(socket, sockopt::Ipv4PacketInfo, &true)
            .map_err(|e| DnsError::Io(e.to_string()))?;
    }
    Ok(())
}

/// Byte capacity needed for the PKTINFO control message.
pub fn cmsg_capacity() -> Vec<u8> {
    nix::cmsg_space!(libc::in6_pktinfo)
}

/// Outcome of one datagram read.
#[derive(Debug, Clone, Copy)]
pub struct RecvMeta {
    pub len: usize,
    pub src: SocketAddr,
    /// Destination IP the datagram arrived on, when PKTINFO is enabled.
    pub dst: Option<IpAddr>,
}

/// Read one datagram along with its ancillary destination address.
pub fn recv_with_dst(
    socket: &UdpSocket,
    buf: &mut [u8],
    cmsg_buf: &mut Vec<u8>,
) -> std::io::Result<RecvMeta> {
    let fd = socket.as_raw_fd();
    let mut iov = [IoSliceMut::new(buf)];

    let msg = recvmsg::<SockaddrStorage>(fd, &mut iov, Some(cmsg_buf), MsgFlags::empty())
        .map_err(std::io::Error::from)?;

    let src = msg
        .address
        .as_ref()
        .and_then(storage_to_addr)
        .ok_or_else(|| std::io::Error::other("datagram without source address"))?;

    let mut dst = None;
    if let Ok(cmsgs) = msg.cmsgs() {
        for cmsg in cmsgs {
            match cmsg {
                ControlMessageOwned::Ipv4PacketInfo(pi) => {
                    dst = Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(pi.ipi_addr.s_addr))));
                }
                ControlMessageOwned::Ipv6PacketInfo(pi) => {
                    dst = Some(IpAddr::V6(Ipv6Addr::from(pi.ipi6_addr.s6_addr)));
                }
                _ => {}
            }
        }
    }

    Ok(RecvMeta {
        len: msg.bytes,
        src,
        dst,
    })
}

/// Send a datagram, optionally pinning the source address so the reply
/// leaves from the same local IP the query arrived on.
pub fn send_with_src(
    socket: &UdpSocket,
    buf: &[u8],
    dst: SocketAddr,
    src: Option<IpAddr>,
) -> std::io::Result<usize> {
    let fd = socket.as_raw_fd();
    let iov = [IoSlice::new(buf)];
    let addr = SockaddrStorage::from(dst);

    match src {
        Some(IpAddr::V4(ip)) => {
            let pktinfo = libc::in_pktinfo {
                ipi_ifindex: 0,
                ipi_spec_dst: libc::in_addr {
                    s_addr: u32::from(ip).to_be(),
                },
                ipi_addr: libc::in_addr { s_addr: 0 },
            };
            let cmsg = [ControlMessage::Ipv4PacketInfo(&pktinfo)];
            sendmsg(fd, &iov, &cmsg, MsgFlags::empty(), Some(&addr))
                .map_err(std::io::Error::from)
        }
        Some(IpAddr::V6(ip)) => {
            let pktinfo = libc::in6_pktinfo {
                ipi6_addr: libc::in6_addr {
                    s6_addr: ip.octets(),
                },
                ipi6_ifindex: 0,
            };
            let cmsg = [ControlMessage::Ipv6PacketInfo(&pktinfo)];
            sendmsg(fd, &iov, &cmsg, MsgFlags::empty(), Some(&addr))
                .map_err(std::io::Error::from)
        }
        None => sendmsg::<SockaddrStorage>(fd, &iov, &[], MsgFlags::empty(), Some(&addr))
            .map_err(std::io::Error::from),
    }
}

fn storage_to_addr(storage: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(sin) = storage.as_sockaddr_in() {
        return Some(SocketAddr::V4(SocketAddrV4::new(sin.ip(), sin.port())));
    }
    if let Some(sin6) = storage.as_sockaddr_in6() {
        return Some(SocketAddr::V6(SocketAddrV6::new(
            sin6.ip(),
            sin6.port(),
            sin6.flowinfo(),
            sin6.scope_id(),
        )));
    }
    None
}

/// `::ffff:x.x.x.x` addresses, which an IPv6-only socket should not see.
pub fn is_ipv4_mapped(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some(),
        IpAddr::V4(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_roundtrip_with_pktinfo() {
        let opts = SocketOpts::default();
        let server = bind_udp_socket("127.0.0.1:0".parse().unwrap(), &opts).unwrap();
        enable_pktinfo(&server, false).unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"ping", server_addr).unwrap();

        let mut buf = [0u8; 64];
        let mut cmsg = cmsg_capacity();
        // The socket is nonblocking; poll briefly for the datagram.
        let meta = loop {
            match recv_with_dst(&server, &mut buf, &mut cmsg) {
                Ok(meta) => break meta,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("recv failed: {}", e),
            }
        };

        assert_eq!(meta.len, 4);
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(meta.src.ip(), client.local_addr().unwrap().ip());
        assert_eq!(meta.dst, Some("127.0.0.1".parse().unwrap()));

        // Reply from the observed destination address.
        send_with_src(&server, b"pong", meta.src, meta.dst).unwrap();
        let mut reply = [0u8; 64];
        let (n, from) = client.recv_from(&mut reply).unwrap();
        assert_eq!(&reply[..n], b"pong");
        assert_eq!(from, server_addr);
    }

    #[test]
    fn test_ipv4_mapped_detection() {
        assert!(is_ipv4_mapped("::ffff:192.0.2.1".parse().unwrap()));
        assert!(!is_ipv4_mapped("2001:db8::1".parse().unwrap()));
        assert!(!is_ipv4_mapped("192.0.2.1".parse().unwrap()));
    }
}

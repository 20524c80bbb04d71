//! Per-target raw ICMP socket: creation, binding, non-blocking send/recv.
//!
//! One socket is opened per target, bound to that target's configured
//! source address so the kernel picks the matching egress interface. This
//! follows the same `socket2`-based raw-socket construction the pack's
//! traceroute-style tools use (e.g. `ProbeEngine::new` building
//! `Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))`), rather
//! than `pnet::transport`'s higher-level channel, because the engine needs
//! one independently-bound, independently-pollable fd per target.

use crate::error::SocketError;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

/// Byte offset of the checksum field within the ICMPv6 header, for the
/// `IPV6_CHECKSUM` sockopt (which wants the in-packet offset of the field
/// it should fill in, not a boolean). Ask the kernel to compute (and
/// verify) the checksum over the pseudo-header, since that pseudo-header
/// depends on routing decisions not available here. See spec §4.2:
/// "kernel computes the checksum when the socket's checksum offload is
/// configured".
const ICMPV6_CHECKSUM_FIELD_OFFSET: libc::c_int = 2;

/// A raw ICMP socket bound to one target's source address.
pub struct IcmpSocket {
    socket: Socket,
    family: Family,
    src: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn name(self) -> &'static str {
        match self {
            Family::V4 => "IPv4",
            Family::V6 => "IPv6",
        }
    }

    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

impl IcmpSocket {
    /// Creates and binds a new raw ICMP socket for `src`'s address family.
    /// `src` may be the unspecified address (`0.0.0.0` / `::`), meaning
    /// "let the kernel pick".
    pub fn new(src: IpAddr) -> Result<Self, SocketError> {
        let family = Family::of(src);
        let socket = match family {
            Family::V4 => Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)),
            Family::V6 => Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6)),
        }
        .map_err(|source| SocketError::Create {
            family: family.name(),
            source,
        })?;

        socket
            .set_nonblocking(true)
            .map_err(|source| SocketError::Create {
                family: family.name(),
                source,
            })?;

        if family == Family::V6 {
            set_ipv6_checksum_offset(&socket);
        }

        let bind_addr: SocketAddr = (src, 0).into();
        socket
            .bind(&SockAddr::from(bind_addr))
            .map_err(|source| SocketError::Bind { addr: src, source })?;

        Ok(IcmpSocket {
            socket,
            family,
            src,
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Sends `buf` to `dst` without blocking.
    pub fn send_to(&self, buf: &[u8], dst: IpAddr) -> std::io::Result<usize> {
        let addr: SocketAddr = (dst, 0).into();
        self.socket.send_to(buf, &SockAddr::from(addr))
    }

    /// Attempts to read one packet without blocking. Returns
    /// `Ok(None)` on `EAGAIN`/`EWOULDBLOCK` ("no data", per spec §7),
    /// propagating every other error.
    pub fn try_recv(&self, buf: &mut [u8]) -> std::io::Result<Option<(usize, IpAddr)>> {
        // socket2::Socket::recv_from takes &mut [MaybeUninit<u8>]; bounce
        // through a same-sized uninit view rather than unsafely
        // transmuting, matching the crate's own documented usage.
        let uninit = unsafe {
            std::slice::from_raw_parts_mut(
                buf.as_mut_ptr() as *mut std::mem::MaybeUninit<u8>,
                buf.len(),
            )
        };
        match self.socket.recv_from(uninit) {
            Ok((n, addr)) => Ok(Some((n, addr.as_socket().map_or(self.src, |s| s.ip())))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Errno values that warrant tearing down and recreating the socket
    /// rather than merely logging and continuing (spec §4.3/§7: `EBADF`,
    /// `ENOTSOCK`).
    pub fn is_fatal_send_error(err: &std::io::Error) -> bool {
        matches!(
            err.raw_os_error(),
            Some(libc::EBADF) | Some(libc::ENOTSOCK)
        )
    }
}

fn set_ipv6_checksum_offset(socket: &Socket) {
    let offset: libc::c_int = ICMPV6_CHECKSUM_FIELD_OFFSET;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IPV6,
            libc::IPV6_CHECKSUM,
            &offset as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        log::warn!(
            "failed to set IPV6_CHECKSUM offset: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// Helper for the target registry: resolves a numeric address string
/// (`AF_INET` first, then `AF_INET6`, per spec §4.4 — non-numeric names
/// are rejected rather than resolved via DNS).
pub fn parse_numeric_address(s: &str) -> Option<IpAddr> {
    if s.is_empty() {
        return None;
    }
    if let Ok(v4) = s.parse::<Ipv4Addr>() {
        return Some(IpAddr::V4(v4));
    }
    if let Ok(v6) = s.parse::<Ipv6Addr>() {
        return Some(IpAddr::V6(v6));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_v4_and_v6() {
        assert_eq!(
            parse_numeric_address("192.0.2.1"),
            Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))
        );
        assert_eq!(
            parse_numeric_address("::1"),
            Some(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );
    }

    #[test]
    fn rejects_non_numeric_hostnames() {
        assert_eq!(parse_numeric_address("example.invalid"), None);
        assert_eq!(parse_numeric_address(""), None);
    }

    #[test]
    fn fatal_send_errors_are_identified() {
        let ebadf = std::io::Error::from_raw_os_error(libc::EBADF);
        let eagain = std::io::Error::from_raw_os_error(libc::EAGAIN);
        assert!(IcmpSocket::is_fatal_send_error(&ebadf));
        assert!(!IcmpSocket::is_fatal_send_error(&eagain));
    }
}

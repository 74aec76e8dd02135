//! Thin wrappers over the socket syscalls the reactor needs.
//!
//! Everything here is non-blocking and close-on-exec from birth via
//! `SOCK_NONBLOCK | SOCK_CLOEXEC` and `accept4(2)`.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

/// Creates a non-blocking TCP socket for `family` (`AF_INET` or
/// `AF_INET6`).
///
/// # Errors
/// any `socket(2)` error
pub fn create_nonblocking(family: libc::c_int) -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn to_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { ptr::write(ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in>(), sin) };
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { ptr::write(ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in6>(), sin6) };
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn from_storage(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match i32::from(storage.ss_family) {
        libc::AF_INET => {
            let sin = unsafe { &*ptr::addr_of!(*storage).cast::<libc::sockaddr_in>() };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*ptr::addr_of!(*storage).cast::<libc::sockaddr_in6>() };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported address family {family}"),
        )),
    }
}

/// Writes up to `data.len()` bytes to `fd`.
///
/// # Errors
/// any `write(2)` error, `WouldBlock` included
pub fn write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// The pending error on `fd`, consuming it. Zero means no error.
#[must_use]
pub fn get_socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            ptr::addr_of_mut!(err).cast(),
            &mut len,
        )
    };
    if rc < 0 {
        return io::Error::last_os_error().raw_os_error().unwrap_or(0);
    }
    err
}

/// The address `fd` is bound to.
///
/// # Errors
/// any `getsockname(2)` error
pub fn get_local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, ptr::addr_of_mut!(storage).cast::<libc::sockaddr>(), &mut len)
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    from_storage(&storage)
}

/// The address of the peer connected to `fd`.
///
/// # Errors
/// any `getpeername(2)` error
pub fn get_peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getpeername(fd, ptr::addr_of_mut!(storage).cast::<libc::sockaddr>(), &mut len)
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    from_storage(&storage)
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, on: bool) -> io::Result<()> {
    let val: libc::c_int = i32::from(on);
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            ptr::addr_of!(val).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// An owned listening or connected socket.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Wraps an already created socket.
    #[must_use]
    pub fn new(fd: OwnedFd) -> Self {
        Socket { fd }
    }

    /// The raw descriptor.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Binds to `addr`.
    ///
    /// # Errors
    /// any `bind(2)` error
    pub fn bind_address(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = to_storage(addr);
        let rc = unsafe {
            libc::bind(self.fd(), ptr::addr_of!(storage).cast::<libc::sockaddr>(), len)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Starts listening with the system backlog.
    ///
    /// # Errors
    /// any `listen(2)` error
    pub fn listen(&self) -> io::Result<()> {
        let rc = unsafe { libc::listen(self.fd(), libc::SOMAXCONN) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accepts one pending connection, non-blocking and close-on-exec.
    ///
    /// # Errors
    /// any `accept4(2)` error, `WouldBlock` included
    pub fn accept(&self) -> io::Result<(OwnedFd, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let conn = unsafe {
            libc::accept4(
                self.fd(),
                ptr::addr_of_mut!(storage).cast::<libc::sockaddr>(),
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if conn < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(conn) };
        let peer = from_storage(&storage)?;
        Ok((fd, peer))
    }

    /// Half-closes the write side.
    ///
    /// # Errors
    /// any `shutdown(2)` error
    pub fn shutdown_write(&self) -> io::Result<()> {
        let rc = unsafe { libc::shutdown(self.fd(), libc::SHUT_WR) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Toggles `SO_REUSEADDR`.
    ///
    /// # Errors
    /// any `setsockopt(2)` error
    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    /// Toggles `SO_REUSEPORT`.
    ///
    /// # Errors
    /// any `setsockopt(2)` error
    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    /// Toggles `SO_KEEPALIVE`.
    ///
    /// # Errors
    /// any `setsockopt(2)` error
    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    /// Toggles `TCP_NODELAY`.
    ///
    /// # Errors
    /// any `setsockopt(2)` error
    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_listen_and_report_local_addr() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = Socket::new(create_nonblocking(libc::AF_INET).unwrap());
        socket.set_reuse_addr(true).unwrap();
        socket.bind_address(&addr).unwrap();
        socket.listen().unwrap();
        let local = get_local_addr(socket.fd()).unwrap();
        assert!(local.ip().is_loopback());
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn accept_reports_would_block_when_idle() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = Socket::new(create_nonblocking(libc::AF_INET).unwrap());
        socket.bind_address(&addr).unwrap();
        socket.listen().unwrap();
        let err = socket.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn v6_addresses_round_trip() {
        let addr: SocketAddr = "[::1]:0".parse().unwrap();
        let socket = Socket::new(create_nonblocking(libc::AF_INET6).unwrap());
        socket.bind_address(&addr).unwrap();
        let local = get_local_addr(socket.fd()).unwrap();
        assert!(local.is_ipv6());
        assert!(local.ip().is_loopback());
    }
}

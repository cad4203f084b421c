//! Thin safe wrappers over the BSD socket calls the runtime consumes.
//!
//! Everything here is non-blocking: sockets are created with
//! `SOCK_NONBLOCK | SOCK_CLOEXEC` (or flipped non-blocking after
//! `accept`), and callers are expected to park on the poller when an
//! operation reports `WouldBlock`.

use std::io::{self, Error as IoError, ErrorKind};
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::ptr;

use libc::{c_int, c_void, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, socklen_t};

pub const INVALID_SOCKET: RawFd = -1;

/// Socket address stored in `sockaddr_storage` form, convertible to and
/// from `std::net::SocketAddr`.
#[derive(Clone)]
pub struct RawAddr {
    storage: sockaddr_storage,
    len: socklen_t,
}

impl RawAddr {
    pub fn new() -> Self {
        Self {
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<sockaddr_storage>() as socklen_t,
        }
    }

    pub fn from_socket_addr(addr: &SocketAddr) -> Self {
        let mut raw = Self::new();

        match addr {
            SocketAddr::V4(v4) => {
                let mut sin: sockaddr_in = unsafe { mem::zeroed() };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets()).to_be();

                unsafe {
                    ptr::copy_nonoverlapping(
                        &sin as *const _ as *const u8,
                        &mut raw.storage as *mut _ as *mut u8,
                        mem::size_of::<sockaddr_in>(),
                    );
                }
                raw.len = mem::size_of::<sockaddr_in>() as socklen_t;
            }
            SocketAddr::V6(v6) => {
                let mut sin6: sockaddr_in6 = unsafe { mem::zeroed() };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_scope_id = v6.scope_id();

                unsafe {
                    ptr::copy_nonoverlapping(
                        &sin6 as *const _ as *const u8,
                        &mut raw.storage as *mut _ as *mut u8,
                        mem::size_of::<sockaddr_in6>(),
                    );
                }
                raw.len = mem::size_of::<sockaddr_in6>() as socklen_t;
            }
        }

        raw
    }

    pub fn as_ptr(&self) -> *const sockaddr {
        &self.storage as *const _ as *const sockaddr
    }

    pub fn as_mut_ptr(&mut self) -> *mut sockaddr {
        &mut self.storage as *mut _ as *mut sockaddr
    }

    pub fn len_ptr(&mut self) -> *mut socklen_t {
        &mut self.len as *mut socklen_t
    }

    pub fn len(&self) -> socklen_t {
        self.len
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        unsafe {
            match self.storage.ss_family as c_int {
                libc::AF_INET => {
                    let sin = &*(&self.storage as *const _ as *const sockaddr_in);
                    let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr).to_ne_bytes());
                    let port = u16::from_be(sin.sin_port);
                    Some(SocketAddr::new(IpAddr::V4(ip), port))
                }
                libc::AF_INET6 => {
                    let sin6 = &*(&self.storage as *const _ as *const sockaddr_in6);
                    let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                    let port = u16::from_be(sin6.sin6_port);
                    Some(SocketAddr::new(IpAddr::V6(ip), port))
                }
                _ => None,
            }
        }
    }
}

impl Default for RawAddr {
    fn default() -> Self {
        Self::new()
    }
}

/// The address family of a `SocketAddr` as a libc domain constant.
pub fn family_of(addr: &SocketAddr) -> c_int {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

/// An owned, unregistered socket. Closed on drop unless handed to the
/// poller via `into_raw`.
pub struct SocketHandle {
    fd: RawFd,
}

impl SocketHandle {
    /// A non-blocking stream socket of the given domain.
    pub fn stream(domain: c_int) -> io::Result<Self> {
        Ok(Self { fd: create_socket(domain, libc::SOCK_STREAM, 0)? })
    }

    /// A non-blocking datagram socket of the given domain.
    pub fn datagram(domain: c_int) -> io::Result<Self> {
        Ok(Self { fd: create_socket(domain, libc::SOCK_DGRAM, 0)? })
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    /// Releases ownership of the descriptor without closing it.
    pub fn into_raw(self) -> RawFd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        if self.fd != INVALID_SOCKET {
            close_socket(self.fd);
        }
    }
}

pub fn create_socket(domain: c_int, sock_type: c_int, protocol: c_int) -> io::Result<RawFd> {
    let fd = unsafe {
        libc::socket(domain, sock_type | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, protocol)
    };
    if fd == -1 {
        return Err(IoError::last_os_error());
    }
    Ok(fd)
}

/// A connected `AF_UNIX` stream pair, both ends non-blocking. Element 0
/// is conventionally the read end, element 1 the write end.
pub fn socketpair_stream() -> io::Result<[RawFd; 2]> {
    let mut fds = [INVALID_SOCKET; 2];
    if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) } == -1 {
        return Err(IoError::last_os_error());
    }
    for fd in fds {
        if let Err(error) = set_nonblocking(fd, true) {
            close_socket(fds[0]);
            close_socket(fds[1]);
            return Err(error);
        }
    }
    Ok(fds)
}

pub fn close_socket(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 {
        return Err(IoError::last_os_error());
    }

    let flags = if nonblocking { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };

    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } == -1 {
        return Err(IoError::last_os_error());
    }

    Ok(())
}

pub fn set_reuseaddr(fd: RawFd, reuse: bool) -> io::Result<()> {
    let optval: c_int = if reuse { 1 } else { 0 };
    if unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const c_void,
            mem::size_of::<c_int>() as socklen_t,
        )
    } == -1
    {
        return Err(IoError::last_os_error());
    }
    Ok(())
}

pub fn bind_socket(fd: RawFd, addr: &RawAddr) -> io::Result<()> {
    if unsafe { libc::bind(fd, addr.as_ptr(), addr.len()) } == -1 {
        return Err(IoError::last_os_error());
    }
    Ok(())
}

pub fn listen_socket(fd: RawFd, backlog: i32) -> io::Result<()> {
    if unsafe { libc::listen(fd, backlog) } == -1 {
        return Err(IoError::last_os_error());
    }
    Ok(())
}

pub fn accept_socket(fd: RawFd) -> io::Result<(RawFd, RawAddr)> {
    let mut addr = RawAddr::new();
    let client = unsafe { libc::accept(fd, addr.as_mut_ptr(), addr.len_ptr()) };
    if client == -1 {
        return Err(IoError::last_os_error());
    }

    if let Err(error) = set_nonblocking(client, true) {
        close_socket(client);
        return Err(error);
    }

    Ok((client, addr))
}

/// Initiates a connect. `EINPROGRESS` is success for a non-blocking
/// socket; completion is observed as writability, with `socket_error`
/// reporting the outcome.
pub fn connect_socket(fd: RawFd, addr: &RawAddr) -> io::Result<()> {
    if unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) } == -1 {
        let error = IoError::last_os_error();
        if error.raw_os_error() == Some(libc::EINPROGRESS) {
            return Ok(());
        }
        return Err(error);
    }
    Ok(())
}

pub fn send_socket(fd: RawFd, buf: &[u8], flags: c_int) -> io::Result<usize> {
    let ret = unsafe {
        libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags | libc::MSG_NOSIGNAL)
    };
    if ret == -1 {
        return Err(IoError::last_os_error());
    }
    Ok(ret as usize)
}

pub fn recv_socket(fd: RawFd, buf: &mut [u8], flags: c_int) -> io::Result<usize> {
    let ret = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags) };
    if ret == -1 {
        return Err(IoError::last_os_error());
    }
    Ok(ret as usize)
}

pub fn recv_from_socket(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, RawAddr)> {
    let mut addr = RawAddr::new();
    let ret = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            0,
            addr.as_mut_ptr(),
            addr.len_ptr(),
        )
    };
    if ret == -1 {
        return Err(IoError::last_os_error());
    }
    Ok((ret as usize, addr))
}

pub fn send_to_socket(fd: RawFd, buf: &[u8], addr: &RawAddr) -> io::Result<usize> {
    let ret = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
            addr.as_ptr(),
            addr.len(),
        )
    };
    if ret == -1 {
        return Err(IoError::last_os_error());
    }
    Ok(ret as usize)
}

pub fn shutdown_socket(fd: RawFd, how: c_int) -> io::Result<()> {
    if unsafe { libc::shutdown(fd, how) } == -1 {
        return Err(IoError::last_os_error());
    }
    Ok(())
}

pub fn local_addr(fd: RawFd) -> io::Result<RawAddr> {
    let mut addr = RawAddr::new();
    if unsafe { libc::getsockname(fd, addr.as_mut_ptr(), addr.len_ptr()) } == -1 {
        return Err(IoError::last_os_error());
    }
    Ok(addr)
}

/// Pending asynchronous error on the socket, if any (`SO_ERROR`).
pub fn socket_error(fd: RawFd) -> io::Result<Option<i32>> {
    let mut error: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    if unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut _ as *mut c_void,
            &mut len,
        )
    } == -1
    {
        return Err(IoError::last_os_error());
    }
    Ok(if error == 0 { None } else { Some(error) })
}

pub fn would_block(err: &IoError) -> bool {
    err.kind() == ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let raw = RawAddr::from_socket_addr(&addr);
        assert_eq!(raw.to_socket_addr(), Some(addr));
    }

    #[test]
    fn addr_round_trip_v6() {
        let addr: SocketAddr = "[::1]:9090".parse().unwrap();
        let raw = RawAddr::from_socket_addr(&addr);
        assert_eq!(raw.to_socket_addr(), Some(addr));
    }

    #[test]
    fn socketpair_carries_bytes() {
        let fds = socketpair_stream().unwrap();
        assert_eq!(send_socket(fds[1], b"x", 0).unwrap(), 1);

        let mut buf = [0u8; 8];
        let n = recv_socket(fds[0], &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"x");

        close_socket(fds[0]);
        close_socket(fds[1]);
    }

    #[test]
    fn handle_closes_on_drop() {
        let fd = {
            let handle = SocketHandle::stream(libc::AF_INET).unwrap();
            handle.raw()
        };
        // A second stat on the fd should now fail.
        let ret = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(ret, -1);
    }
}

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::warn;

use crate::net::InetAddress;

/// Listen backlog for the acceptor socket.
const BACKLOG: libc::c_int = 1024;

/// An owned, non-blocking IPv4 stream socket.
///
/// The descriptor is closed when the `Socket` is dropped; every descriptor
/// in the crate has exactly one owner.
#[derive(Debug)]
pub(crate) struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a non-blocking, close-on-exec TCP socket.
    pub(crate) fn new_stream() -> io::Result<Socket> {
        let fd = syscall!(socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        ))?;
        Ok(Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Wraps an already-connected descriptor, e.g. one produced by `accept`.
    pub(crate) fn from_owned(fd: OwnedFd) -> Socket {
        Socket { fd }
    }

    pub(crate) fn bind(&self, addr: &InetAddress) -> io::Result<()> {
        let raw = addr.to_raw();
        syscall!(bind(
            self.as_raw_fd(),
            &raw as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ))
        .map(|_| ())
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.as_raw_fd(), BACKLOG)).map(|_| ())
    }

    /// Accepts one pending connection; the returned descriptor is
    /// non-blocking and close-on-exec. Errors carry the raw os error so
    /// callers can tell transient conditions (`EAGAIN`, `EINTR`, `EMFILE`)
    /// from fatal ones.
    pub(crate) fn accept(&self) -> io::Result<(OwnedFd, InetAddress)> {
        let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let fd = syscall!(accept4(
            self.as_raw_fd(),
            &mut raw as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        Ok((unsafe { OwnedFd::from_raw_fd(fd) }, InetAddress::from_raw(raw)))
    }

    /// Closes the write side, leaving the read side open (half-close).
    pub(crate) fn shutdown_write(&self) {
        if let Err(err) = syscall!(shutdown(self.as_raw_fd(), libc::SHUT_WR)) {
            warn!("shutdown(SHUT_WR) on fd={} failed: {}", self.as_raw_fd(), err);
        }
    }

    /// The address this socket is bound to, per `getsockname`.
    pub(crate) fn local_addr(&self) -> io::Result<InetAddress> {
        let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        syscall!(getsockname(
            self.as_raw_fd(),
            &mut raw as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        ))?;
        Ok(InetAddress::from_raw(raw))
    }

    /// Takes the pending socket error, if any, per `SO_ERROR`.
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut optval: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut optval as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        ))?;
        if optval == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(optval)))
        }
    }

    pub(crate) fn set_tcp_nodelay(&self, on: bool) {
        self.set_bool_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, on);
    }

    pub(crate) fn set_reuse_addr(&self, on: bool) {
        self.set_bool_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, on);
    }

    pub(crate) fn set_reuse_port(&self, on: bool) {
        self.set_bool_option(libc::SOL_SOCKET, libc::SO_REUSEPORT, on);
    }

    pub(crate) fn set_keep_alive(&self, on: bool) {
        self.set_bool_option(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on);
    }

    fn set_bool_option(&self, level: libc::c_int, option: libc::c_int, on: bool) {
        let optval: libc::c_int = if on { 1 } else { 0 };
        if let Err(err) = syscall!(setsockopt(
            self.as_raw_fd(),
            level,
            option,
            &optval as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )) {
            warn!(
                "setsockopt(level={}, option={}) on fd={} failed: {}",
                level,
                option,
                self.as_raw_fd(),
                err
            );
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

//! Thin owned-fd socket wrapper.
//!
//! Channels never own descriptors; this type is the single owner of each
//! listening or connected socket fd and closes it on drop.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

use socket2::{Domain, Protocol, SockRef, Type};

pub(crate) struct Socket {
    fd: OwnedFd,
}

impl Socket {
    pub fn from_owned(fd: OwnedFd) -> Self {
        Socket { fd }
    }

    /// Create a non-blocking listening socket bound to `addr`.
    ///
    /// The socket is bound but not yet listening; `listen()` happens at
    /// server start.
    pub fn bind_listener(addr: SocketAddr, reuse_port: bool) -> io::Result<Self> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        Ok(Socket {
            fd: OwnedFd::from(socket),
        })
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        SockRef::from(&self.fd).listen(backlog)
    }

    /// Accept one pending connection; the returned fd is non-blocking and
    /// close-on-exec.
    pub fn accept(&self) -> io::Result<(OwnedFd, SocketAddr)> {
        let (fd, addr) = unsafe {
            socket2::SockAddr::try_init(|storage, len| {
                let fd = libc::accept4(
                    self.fd.as_raw_fd(),
                    storage as *mut libc::sockaddr,
                    len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                );
                if fd < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(unsafe { <OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(fd) })
                }
            })
        }?;
        let addr = addr
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer address"))?;
        Ok((fd, addr))
    }

    /// Close the write half; the peer's reads will observe EOF after the
    /// in-flight bytes drain.
    pub fn shutdown_write(&self) {
        let rc = unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_WR) };
        if rc != 0 {
            tracing::warn!(
                fd = self.fd.as_raw_fd(),
                error = %io::Error::last_os_error(),
                "shutdown(SHUT_WR) failed"
            );
        }
    }

    pub fn set_keepalive(&self, on: bool) -> io::Result<()> {
        SockRef::from(&self.fd).set_keepalive(on)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        SockRef::from(&self.fd)
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet local address"))
    }

    /// Pending socket error, if any (SO_ERROR).
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        SockRef::from(&self.fd).take_error()
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Local address of an arbitrary connected fd (getsockname).
pub(crate) fn local_addr_of(fd: &impl AsFd) -> io::Result<SocketAddr> {
    SockRef::from(fd)
        .local_addr()?
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet local address"))
}

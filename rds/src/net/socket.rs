//! Socket wrappers for mio-based I/O.
//!
//! [`DatagramSocket`] is a local datagram socket with the same
//! `try_*` conventions as the rest of the polling code. [`listen_stream`]
//! builds the TCP listener through rustix so the backlog can be chosen.

use std::fs;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::time::Duration;

use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use rustix::net::{AddressFamily, SocketType, sockopt};

use super::DatagramAddr;

/// A local datagram socket.
///
/// Non-blocking after [`bind`](Self::bind). A pathname socket file is removed
/// when the socket is dropped.
#[derive(Debug)]
pub struct DatagramSocket {
    inner: UnixDatagram,
    addr: DatagramAddr,
}

impl DatagramSocket {
    /// Binds a non-blocking socket to `addr`.
    ///
    /// A stale socket file left at a pathname address is removed first.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is in use, or a non-socket file
    /// occupies the path.
    pub fn bind(addr: &DatagramAddr) -> io::Result<Self> {
        if let Some(path) = addr.as_path() {
            remove_stale_socket(path)?;
        }
        let inner = UnixDatagram::bind_addr(&addr.to_socket_addr()?)?;
        inner.set_nonblocking(true)?;
        Ok(Self {
            inner,
            addr: addr.clone(),
        })
    }

    /// Returns the address this socket is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> &DatagramAddr {
        &self.addr
    }

    /// Sends one datagram to `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, including `WouldBlock`.
    pub fn send_to(&self, buf: &[u8], dest: &DatagramAddr) -> io::Result<usize> {
        self.inner.send_to_addr(buf, &dest.to_socket_addr()?)
    }

    /// Receives one datagram.
    ///
    /// The source is `None` when the sender never bound an address.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, including `WouldBlock`.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<DatagramAddr>)> {
        let (n, addr) = self.inner.recv_from(buf)?;
        Ok((n, DatagramAddr::from_socket_addr(&addr)))
    }

    /// Attempts to receive, returning `Ok(None)` instead of `WouldBlock`.
    pub fn try_recv_from(
        &self,
        buf: &mut [u8],
    ) -> io::Result<Option<(usize, Option<DatagramAddr>)>> {
        match self.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Takes the pending socket error, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    /// Switches between blocking and non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the mode cannot be changed.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.inner.set_nonblocking(nonblocking)
    }

    /// Sets the timeout for blocking receives.
    ///
    /// # Errors
    ///
    /// Returns an error if `timeout` is zero.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.set_read_timeout(timeout)
    }

    /// Sets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        // mio doesn't expose socket options
        sockopt::set_socket_send_buffer_size(&self.inner, size)?;
        Ok(())
    }

    /// Sets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        sockopt::set_socket_recv_buffer_size(&self.inner, size)?;
        Ok(())
    }

    /// Gets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn send_buffer_size(&self) -> io::Result<usize> {
        Ok(sockopt::socket_send_buffer_size(&self.inner)?)
    }

    /// Gets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(sockopt::socket_recv_buffer_size(&self.inner)?)
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => fs::remove_file(path),
        Ok(_) => Err(io::Error::new(
            ErrorKind::AddrInUse,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

impl Drop for DatagramSocket {
    fn drop(&mut self) {
        if let Some(path) = self.addr.as_path() {
            let _ = fs::remove_file(path);
        }
    }
}

impl AsFd for DatagramSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for DatagramSocket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.inner.as_raw_fd()).register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.inner.as_raw_fd()).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        SourceFd(&self.inner.as_raw_fd()).deregister(registry)
    }
}

/// Opens a non-blocking TCP listener on `addr` with the given backlog.
///
/// `SO_REUSEADDR` is set so a restarted broker can rebind immediately.
///
/// # Errors
///
/// Returns an error if the socket cannot be created, bound, or put into
/// listening mode.
pub fn listen_stream(addr: SocketAddr, backlog: i32) -> io::Result<mio::net::TcpListener> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::INET,
        SocketAddr::V6(_) => AddressFamily::INET6,
    };
    let fd = rustix::net::socket(family, SocketType::STREAM, None)?;
    sockopt::set_socket_reuseaddr(&fd, true)?;
    rustix::net::bind(&fd, &addr)?;
    rustix::net::listen(&fd, backlog)?;

    let listener = std::net::TcpListener::from(fd);
    listener.set_nonblocking(true)?;
    Ok(mio::net::TcpListener::from_std(listener))
}

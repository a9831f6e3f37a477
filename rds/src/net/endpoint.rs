//! Transport addressing.
//!
//! A peer is identified at the transport level by a [`ClientKey`]: either the
//! address its datagrams come from, or the token of the stream connection it
//! was accepted on. The two never collide.

use std::fmt;
use std::io;
use std::os::unix::net::SocketAddr as UnixSocketAddr;
use std::path::{Path, PathBuf};

#[cfg(target_os = "linux")]
use std::os::linux::net::SocketAddrExt;

/// Well-known name of the broker's local datagram endpoint.
pub const WELL_KNOWN_NAME: &str = "AMD-Developer-Service";

/// Address of a local datagram socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DatagramAddr {
    /// A filesystem path.
    Path(PathBuf),
    /// A Linux abstract-namespace name, without the leading NUL.
    Abstract(Vec<u8>),
}

impl DatagramAddr {
    /// A pathname address.
    #[must_use]
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    /// An abstract-namespace address.
    #[must_use]
    pub fn abstract_name(name: impl AsRef<[u8]>) -> Self {
        Self::Abstract(name.as_ref().to_vec())
    }

    /// The broker's default endpoint.
    ///
    /// Abstract on Linux; a file in the temp directory elsewhere.
    #[must_use]
    pub fn well_known() -> Self {
        if cfg!(target_os = "linux") {
            Self::abstract_name(WELL_KNOWN_NAME)
        } else {
            Self::path(std::env::temp_dir().join(WELL_KNOWN_NAME))
        }
    }

    /// The filesystem path, if this is a pathname address.
    #[must_use]
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(path) => Some(path),
            Self::Abstract(_) => None,
        }
    }

    /// Converts a received peer address.
    ///
    /// Returns `None` for unnamed sockets, which cannot be replied to.
    #[must_use]
    pub fn from_socket_addr(addr: &UnixSocketAddr) -> Option<Self> {
        if let Some(path) = addr.as_pathname() {
            return Some(Self::path(path));
        }
        #[cfg(target_os = "linux")]
        let name = addr.as_abstract_name();
        #[cfg(not(target_os = "linux"))]
        let name: Option<&[u8]> = None;
        name.map(Self::abstract_name)
    }

    /// Converts to a std socket address for `bind` or `send_to`.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is too long, or if an abstract name is
    /// used on a platform without an abstract namespace.
    pub fn to_socket_addr(&self) -> io::Result<UnixSocketAddr> {
        match self {
            Self::Path(path) => UnixSocketAddr::from_pathname(path),
            #[cfg(target_os = "linux")]
            Self::Abstract(name) => UnixSocketAddr::from_abstract_name(name),
            #[cfg(not(target_os = "linux"))]
            Self::Abstract(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "abstract socket names require Linux",
            )),
        }
    }
}

impl fmt::Display for DatagramAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Abstract(name) => write!(f, "@{}", name.escape_ascii()),
        }
    }
}

/// Broker-issued identifier for an accepted stream connection.
///
/// Doubles as the connection's mio poll token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionToken(usize);

impl ConnectionToken {
    #[must_use]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// The poll token for this connection.
    #[must_use]
    pub const fn token(self) -> mio::Token {
        mio::Token(self.0)
    }

    #[must_use]
    pub const fn from_token(token: mio::Token) -> Self {
        Self(token.0)
    }
}

impl fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp:{}", self.0)
    }
}

/// Registry key for a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClientKey {
    /// A datagram peer, keyed by the address it sends from.
    Datagram(DatagramAddr),
    /// A stream peer, keyed by its connection token.
    Stream(ConnectionToken),
}

impl ClientKey {
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }
}

impl From<DatagramAddr> for ClientKey {
    fn from(addr: DatagramAddr) -> Self {
        Self::Datagram(addr)
    }
}

impl From<ConnectionToken> for ClientKey {
    fn from(token: ConnectionToken) -> Self {
        Self::Stream(token)
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Datagram(addr) => write!(f, "unix:{addr}"),
            Self::Stream(token) => write!(f, "{token}"),
        }
    }
}

//! Transport multiplexer: the datagram endpoint, the stream listener and
//! every accepted stream, polled together with a zero timeout.
//!
//! mio reports readiness edge-triggered, so each source keeps a cached
//! "ready" flag that is only cleared once an operation hits `WouldBlock`.
//! That lets the broker perform one operation per source per cycle without
//! losing readiness for data it has not read yet.

use std::io::{self, ErrorKind, Read};
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use super::BrokerError;
use super::registry::{Registry, StreamConnection};
use crate::net::{ClientKey, ConnectionToken, DatagramAddr, DatagramSocket, listen_stream};
use crate::protocol::ClientId;
use crate::trace::{debug, info, trace, warn};

const DATAGRAM: Token = Token(0);
const LISTENER: Token = Token(1);
const FIRST_STREAM_TOKEN: usize = 2;

const EVENT_CAPACITY: usize = 256;

/// Outcome of one read on a stream connection.
#[derive(Debug)]
pub enum StreamRead {
    /// `n` bytes were read into the buffer.
    Message(usize),
    /// Nothing to read; readiness has been cleared.
    Idle,
    /// The peer closed the connection.
    Closed,
    /// The read failed.
    Failed(io::Error),
}

/// Sockets the broker polls each cycle.
pub struct Transport {
    poll: Poll,
    events: Events,
    datagram: DatagramSocket,
    listener: TcpListener,
    datagram_ready: bool,
    listener_ready: bool,
    next_token: usize,
}

impl Transport {
    /// Binds both primary endpoints and registers them for readability.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::BindDatagram`] or [`BrokerError::Listen`] if an
    /// endpoint cannot be opened, and [`BrokerError::Poll`] if the poller
    /// cannot be created.
    pub fn bind(
        datagram_addr: &DatagramAddr,
        stream_addr: SocketAddr,
        backlog: i32,
        datagram_buffer_size: Option<usize>,
    ) -> Result<Self, BrokerError> {
        let poll = Poll::new().map_err(BrokerError::Poll)?;

        let bind_err = |source| BrokerError::BindDatagram {
            addr: datagram_addr.clone(),
            source,
        };
        let mut datagram = DatagramSocket::bind(datagram_addr).map_err(bind_err)?;
        if let Some(size) = datagram_buffer_size {
            datagram.set_send_buffer_size(size).map_err(bind_err)?;
            datagram.set_recv_buffer_size(size).map_err(bind_err)?;
            // the kernel may round or double the request
            let _effective = datagram
                .send_buffer_size()
                .and_then(|send| Ok((send, datagram.recv_buffer_size()?)))
                .map_err(bind_err)?;
            debug!(
                requested = size,
                send = _effective.0,
                recv = _effective.1,
                "datagram buffers sized"
            );
        }

        let listen_err = |source| BrokerError::Listen {
            addr: stream_addr,
            source,
        };
        let mut listener = listen_stream(stream_addr, backlog).map_err(listen_err)?;

        poll.registry()
            .register(&mut datagram, DATAGRAM, Interest::READABLE)
            .map_err(BrokerError::Poll)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(BrokerError::Poll)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            datagram,
            listener,
            datagram_ready: false,
            listener_ready: false,
            next_token: FIRST_STREAM_TOKEN,
        })
    }

    /// The datagram endpoint, used to address datagram clients.
    #[must_use]
    pub const fn datagram(&self) -> &DatagramSocket {
        &self.datagram
    }

    /// Address the stream listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be retrieved.
    pub fn stream_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Polls every source without blocking and caches readiness.
    ///
    /// Stream error events mark the owning client for removal.
    ///
    /// # Errors
    ///
    /// Returns an error if polling fails or a primary endpoint reports an
    /// error condition.
    pub fn poll(&mut self, registry: &mut Registry) -> Result<(), BrokerError> {
        match self.poll.poll(&mut self.events, Some(Duration::ZERO)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(BrokerError::Poll(e)),
        }

        for event in &self.events {
            match event.token() {
                DATAGRAM => {
                    if event.is_error() {
                        return Err(BrokerError::Datagram(socket_error(
                            self.datagram.take_error(),
                        )));
                    }
                    self.datagram_ready = true;
                }
                LISTENER => {
                    if event.is_error() {
                        return Err(BrokerError::Listener(socket_error(
                            self.listener.take_error(),
                        )));
                    }
                    self.listener_ready = true;
                }
                token => {
                    let key = ClientKey::Stream(ConnectionToken::from_token(token));
                    let Some(record) = registry.lookup_mut(&key) else {
                        continue;
                    };
                    if event.is_error() {
                        warn!(client = %record.id(), key = %key, "stream error event");
                        record.mark_removed();
                    } else if let Some(conn) = record.stream_mut() {
                        // EOF shows up as readable; the read reports it
                        conn.readable = true;
                    }
                }
            }
        }
        Ok(())
    }

    /// Receives at most one datagram.
    ///
    /// Returns `Ok(None)` when the endpoint has nothing pending.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Datagram`] on a receive failure other than
    /// `WouldBlock`.
    pub fn recv_datagram(
        &mut self,
        buf: &mut [u8],
    ) -> Result<Option<(usize, Option<DatagramAddr>)>, BrokerError> {
        if !self.datagram_ready {
            return Ok(None);
        }
        match self.datagram.try_recv_from(buf) {
            Ok(Some(received)) => Ok(Some(received)),
            Ok(None) => {
                self.datagram_ready = false;
                Ok(None)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(BrokerError::Datagram(e)),
        }
    }

    /// Accepts at most one pending stream and registers it.
    ///
    /// The new client gets its identity immediately; its metadata arrives
    /// later through the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Listener`] on an accept failure and
    /// [`BrokerError::Registry`] if no identity is left for the client.
    pub fn accept(&mut self, registry: &mut Registry) -> Result<Option<ClientId>, BrokerError> {
        if !self.listener_ready {
            return Ok(None);
        }
        let (mut stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.listener_ready = false;
                return Ok(None);
            }
            // the peer gave up before we got to it
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionAborted | ErrorKind::Interrupted) => {
                debug!(error = %e, "accept interrupted");
                return Ok(None);
            }
            Err(e) => return Err(BrokerError::Listener(e)),
        };

        if let Err(_e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %_e, "failed to set TCP_NODELAY");
        }

        let token = ConnectionToken::new(self.next_token);
        self.next_token += 1;
        if let Err(_e) = self
            .poll
            .registry()
            .register(&mut stream, token.token(), Interest::READABLE)
        {
            warn!(peer = %peer, error = %_e, "failed to register stream, dropping it");
            return Ok(None);
        }

        match registry.create_stream(StreamConnection::new(stream, token, peer)) {
            Ok(id) => {
                info!(client = %id, peer = %peer, key = %token, "stream client accepted");
                Ok(Some(id))
            }
            Err((e, mut conn)) => {
                self.deregister(&mut conn);
                Err(BrokerError::Registry(e))
            }
        }
    }

    /// Removes a stream from the poll set. Closing happens on drop.
    pub fn deregister(&self, conn: &mut StreamConnection) {
        if let Err(_e) = self.poll.registry().deregister(conn.stream_mut()) {
            debug!(key = %conn.token(), error = %_e, "failed to deregister stream");
        }
    }
}

/// Performs one read on a stream connection.
pub fn read_stream(conn: &mut StreamConnection, buf: &mut [u8]) -> StreamRead {
    match conn.stream_mut().read(buf) {
        Ok(0) => StreamRead::Closed,
        Ok(n) => {
            trace!(key = %conn.token(), bytes = n, "stream read");
            StreamRead::Message(n)
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => {
            conn.readable = false;
            StreamRead::Idle
        }
        Err(e) if e.kind() == ErrorKind::Interrupted => StreamRead::Idle,
        Err(e) => StreamRead::Failed(e),
    }
}

fn socket_error(taken: io::Result<Option<io::Error>>) -> io::Error {
    match taken {
        Ok(Some(e)) | Err(e) => e,
        Ok(None) => io::Error::other("socket reported an error condition"),
    }
}

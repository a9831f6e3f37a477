//! The broker: one polling cycle at a time, on the caller's thread.
//!
//! # Cycle
//!
//! ```text
//! poll (zero timeout)
//!   ├─ datagram endpoint: one recv
//!   ├─ stream listener:   one accept
//!   └─ each ready stream: one read
//!        │
//!        ├─ ClientManagement, src == 0 → control handler → reply
//!        └─ anything else              → router (unicast / broadcast)
//! sweep
//!   └─ per removed client: delete record, then broadcast ClientDisconnected
//! ```
//!
//! A cycle never blocks. [`CycleStatus::NotReady`] tells the caller nothing
//! happened so it can back off; [`Broker::run`] does that with a short sleep.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use rds::broker::{Broker, BrokerConfig};
//!
//! let shutdown = AtomicBool::new(false);
//! let mut broker = Broker::bind(BrokerConfig::default())?;
//! broker.run(&shutdown)?;
//! # Ok::<(), rds::broker::BrokerError>(())
//! ```

pub mod control;
pub mod registry;
pub mod router;
pub mod transport;

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;

use crate::net::{ClientKey, ConnectionToken, DatagramAddr};
use crate::protocol::management::is_out_of_band;
use crate::protocol::system::{self, SystemMessage};
use crate::protocol::{ClientMetadata, MAX_MESSAGE_SIZE, Message, ProtocolId};
use crate::trace::{debug, error, info, trace, warn};

pub use control::{ControlError, ProtocolError, ProtocolErrorPolicy};
pub use registry::{ClientRecord, Registry, RegistryError, RemovedClient};
pub use router::{Outbound, SocketOutbound, TransportError};

use router::route;
use transport::{StreamRead, Transport, read_stream};

/// Default TCP port for remote tools.
pub const DEFAULT_STREAM_PORT: u16 = 27300;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 16;

/// Default sleep between cycles that found nothing to do.
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_micros(100);

// One byte over the limit so an oversized read is seen as a length mismatch
// instead of being silently truncated to a valid size.
const RECV_BUFFER_SIZE: usize = MAX_MESSAGE_SIZE + 1;

/// Configuration for the broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Local datagram endpoint.
    pub datagram_addr: DatagramAddr,
    /// TCP listener address.
    pub stream_addr: SocketAddr,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Sleep in [`Broker::run`] after a cycle that did nothing.
    pub idle_sleep: Duration,
    /// Reaction to unserved ClientManagement opcodes.
    pub protocol_errors: ProtocolErrorPolicy,
    /// Send/receive buffer size for the datagram endpoint. `None` keeps the
    /// system default.
    pub datagram_buffer_size: Option<usize>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            datagram_addr: DatagramAddr::well_known(),
            stream_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_STREAM_PORT)),
            backlog: DEFAULT_BACKLOG,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            protocol_errors: ProtocolErrorPolicy::default(),
            datagram_buffer_size: None,
        }
    }
}

/// Errors that stop the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to bind datagram endpoint {addr}: {source}")]
    BindDatagram {
        addr: DatagramAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("datagram endpoint failed: {0}")]
    Datagram(#[source] io::Error),

    #[error("stream listener failed: {0}")]
    Listener(#[source] io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<ControlError> for BrokerError {
    fn from(e: ControlError) -> Self {
        match e {
            ControlError::Protocol(e) => Self::Protocol(e),
            ControlError::Registry(e) => Self::Registry(e),
        }
    }
}

/// What a cycle accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    /// At least one message, accept, or connection loss was handled.
    Worked,
    /// Nothing was ready; the caller should back off.
    NotReady,
}

/// The message broker.
pub struct Broker {
    config: BrokerConfig,
    transport: Transport,
    registry: Registry,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
}

impl Broker {
    /// Binds both endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if either endpoint cannot be opened.
    pub fn bind(config: BrokerConfig) -> Result<Self, BrokerError> {
        info!(
            datagram_addr = %config.datagram_addr,
            stream_addr = %config.stream_addr,
            backlog = config.backlog,
            protocol_errors = %config.protocol_errors,
            "broker starting"
        );

        let transport = match Transport::bind(
            &config.datagram_addr,
            config.stream_addr,
            config.backlog,
            config.datagram_buffer_size,
        ) {
            Ok(transport) => transport,
            Err(e) => {
                error!(error = %e, "failed to bind broker endpoints");
                return Err(e);
            }
        };

        Ok(Self {
            config,
            transport,
            registry: Registry::new(),
            recv_buf: vec![0u8; RECV_BUFFER_SIZE],
            send_buf: Vec::with_capacity(MAX_MESSAGE_SIZE),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Address of the local datagram endpoint.
    #[must_use]
    pub const fn datagram_addr(&self) -> &DatagramAddr {
        self.transport.datagram().local_addr()
    }

    /// Address the TCP listener is bound to, with the real port if `0` was
    /// requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be retrieved.
    pub fn stream_addr(&self) -> io::Result<SocketAddr> {
        self.transport.stream_addr()
    }

    /// Both bound addresses.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream address cannot be retrieved.
    pub fn local_addrs(&self) -> io::Result<(DatagramAddr, SocketAddr)> {
        Ok((self.datagram_addr().clone(), self.stream_addr()?))
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    /// Runs one polling cycle. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns an error on a primary endpoint failure, identity exhaustion,
    /// or a protocol error under [`ProtocolErrorPolicy::Fatal`].
    pub fn process_cycle(&mut self) -> Result<CycleStatus, BrokerError> {
        self.transport.poll(&mut self.registry)?;
        let mut worked = false;

        if let Some((n, from)) = self.transport.recv_datagram(&mut self.recv_buf)? {
            worked = true;
            self.on_datagram(n, from)?;
        }

        if self.transport.accept(&mut self.registry)?.is_some() {
            worked = true;
        }

        for token in self.registry.readable_streams() {
            worked |= self.service_stream(token)?;
        }

        self.sweep();

        Ok(if worked {
            CycleStatus::Worked
        } else {
            CycleStatus::NotReady
        })
    }

    /// Runs cycles until `shutdown` is set or a cycle fails.
    ///
    /// Sleeps for the configured idle interval after a cycle that did
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns the first error a cycle reports.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), BrokerError> {
        info!("broker running");
        while !shutdown.load(Ordering::Relaxed) {
            match self.process_cycle() {
                Ok(CycleStatus::Worked) => {}
                Ok(CycleStatus::NotReady) => std::thread::sleep(self.config.idle_sleep),
                Err(e) => {
                    error!(error = %e, "broker cycle failed");
                    return Err(e);
                }
            }
        }
        info!(clients = self.registry.len(), "broker stopped");
        Ok(())
    }

    fn on_datagram(&mut self, n: usize, from: Option<DatagramAddr>) -> Result<(), BrokerError> {
        let Some(addr) = from else {
            warn!(bytes = n, "datagram from unnamed socket, dropping");
            return Ok(());
        };
        match Message::decode(&self.recv_buf[..n]) {
            Ok(message) => self.dispatch(&ClientKey::Datagram(addr), &message),
            Err(_e) => {
                warn!(key = %addr, error = %_e, "dropping malformed datagram");
                Ok(())
            }
        }
    }

    /// One read on a ready stream. Returns `true` if anything happened.
    fn service_stream(&mut self, token: ConnectionToken) -> Result<bool, BrokerError> {
        let key = ClientKey::Stream(token);
        let Some(conn) = self
            .registry
            .lookup_mut(&key)
            .and_then(ClientRecord::stream_mut)
        else {
            return Ok(false);
        };

        match read_stream(conn, &mut self.recv_buf) {
            StreamRead::Idle => Ok(false),
            StreamRead::Closed => {
                debug!(key = %key, "stream closed by peer");
                self.registry.mark_for_removal(&key);
                Ok(true)
            }
            StreamRead::Failed(_e) => {
                warn!(key = %key, error = %_e, "stream read failed");
                self.registry.mark_for_removal(&key);
                Ok(true)
            }
            StreamRead::Message(n) => {
                match Message::decode(&self.recv_buf[..n]) {
                    Ok(message) => self.dispatch(&key, &message)?,
                    Err(_e) => {
                        // framing is lost; the connection cannot recover
                        warn!(key = %key, error = %_e, "malformed stream message, closing");
                        self.registry.mark_for_removal(&key);
                    }
                }
                Ok(true)
            }
        }
    }

    fn dispatch(&mut self, sender: &ClientKey, message: &Message) -> Result<(), BrokerError> {
        let header = message.header();
        let mut out = SocketOutbound::new(self.transport.datagram());

        if header.protocol == ProtocolId::ClientManagement {
            if !is_out_of_band(header) {
                warn!(
                    key = %sender,
                    src = %header.src,
                    opcode = header.message_id,
                    "dropping in-band ClientManagement message"
                );
                return Ok(());
            }
            control::handle(
                &mut self.registry,
                &mut out,
                self.config.protocol_errors,
                sender,
                message,
                &mut self.send_buf,
            )?;
            return Ok(());
        }

        let _delivered = route(&mut self.registry, &mut out, message, &mut self.send_buf);
        if system::classify(header).is_some_and(SystemMessage::is_chatter) {
            trace!(key = %sender, src = %header.src, dst = %header.dst, "relayed ping/pong");
        } else {
            debug!(
                key = %sender,
                src = %header.src,
                dst = %header.dst,
                protocol = %header.protocol,
                opcode = header.message_id,
                bytes = header.payload_size,
                delivered = _delivered,
                "relayed message"
            );
        }
        Ok(())
    }

    /// Deletes removed clients, then tells everyone left.
    ///
    /// Repeats until a pass removes nobody, since a failed disconnect notice
    /// marks another client.
    fn sweep(&mut self) {
        loop {
            let removed = self.registry.sweep_removed();
            if removed.is_empty() {
                return;
            }
            for client in removed {
                self.release(client);
            }
        }
    }

    fn release(&mut self, client: RemovedClient) {
        let RemovedClient {
            key: _key,
            id,
            stream,
        } = client;
        if let Some(mut conn) = stream {
            debug!(client = %id, peer = %conn.peer(), "closing stream");
            self.transport.deregister(&mut conn);
        }
        info!(client = %id, key = %_key, "client disconnected");

        let notice = system::notification(
            SystemMessage::ClientDisconnected,
            id,
            ClientMetadata::empty(),
        );
        let mut out = SocketOutbound::new(self.transport.datagram());
        route(&mut self.registry, &mut out, &notice, &mut self.send_buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::management::{
        self, ConnectRequest, ConnectResponse, ManagementMessage, QueryStatusResponse,
    };
    use crate::protocol::{ClientId, Component, Header, StatusFlags, decode_header};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::os::unix::net::UnixDatagram;
    use std::time::Instant;

    fn test_config(dir: &tempfile::TempDir) -> BrokerConfig {
        BrokerConfig {
            datagram_addr: DatagramAddr::path(dir.path().join("broker.sock")),
            stream_addr: (Ipv4Addr::LOCALHOST, 0).into(),
            ..BrokerConfig::default()
        }
    }

    /// Cycles until `done` holds or a second passes.
    fn cycle_until(broker: &mut Broker, mut done: impl FnMut(&Broker) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(1);
        while !done(broker) {
            broker.process_cycle().unwrap();
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn datagram_peer(dir: &tempfile::TempDir, name: &str) -> UnixDatagram {
        let peer = UnixDatagram::bind(dir.path().join(name)).unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        peer
    }

    fn recv(peer: &UnixDatagram, broker: &mut Broker) -> Message {
        let deadline = Instant::now() + Duration::from_secs(1);
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        loop {
            broker.process_cycle().unwrap();
            if let Ok(n) = peer.recv(&mut buf) {
                return Message::decode(&buf[..n]).unwrap();
            }
            assert!(Instant::now() < deadline, "no message");
        }
    }

    fn connect_request() -> Vec<u8> {
        management::connect_request(0, ConnectRequest {
            flags: StatusFlags::empty(),
            component: Component::TOOL,
        })
        .to_bytes()
    }

    #[test]
    fn idle_cycle_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mut broker = Broker::bind(test_config(&dir)).unwrap();
        assert_eq!(broker.process_cycle().unwrap(), CycleStatus::NotReady);
        assert_eq!(broker.client_count(), 0);
    }

    #[test]
    fn datagram_connect_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut broker = Broker::bind(test_config(&dir)).unwrap();
        let peer = datagram_peer(&dir, "peer.sock");
        peer.send_to(&connect_request(), dir.path().join("broker.sock"))
            .unwrap();

        let reply = recv(&peer, &mut broker);
        let response = ConnectResponse::decode(reply.payload()).unwrap();
        assert_eq!(response.client_id, ClientId::new(1));
        assert_eq!(broker.client_count(), 1);
    }

    #[test]
    fn malformed_datagram_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut broker = Broker::bind(test_config(&dir)).unwrap();
        let peer = datagram_peer(&dir, "peer.sock");
        let mut bytes = connect_request();
        bytes.push(0);
        peer.send_to(&bytes, dir.path().join("broker.sock")).unwrap();

        let deadline = Instant::now() + Duration::from_millis(100);
        while Instant::now() < deadline {
            broker.process_cycle().unwrap();
        }
        assert_eq!(broker.client_count(), 0);
        let mut buf = [0u8; 64];
        assert!(peer.recv(&mut buf).is_err());
    }

    #[test]
    fn in_band_management_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut broker = Broker::bind(test_config(&dir)).unwrap();
        let peer = datagram_peer(&dir, "peer.sock");
        let header = management::out_of_band(ManagementMessage::QueryStatus, 0)
            .from_client(ClientId::new(5));
        peer.send_to(
            &Message::empty(header).to_bytes(),
            dir.path().join("broker.sock"),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_millis(100);
        while Instant::now() < deadline {
            broker.process_cycle().unwrap();
        }
        let mut buf = [0u8; 64];
        assert!(peer.recv(&mut buf).is_err());
    }

    #[test]
    fn stream_client_gets_identity_on_accept() {
        let dir = tempfile::tempdir().unwrap();
        let mut broker = Broker::bind(test_config(&dir)).unwrap();
        let mut stream = TcpStream::connect(broker.stream_addr().unwrap()).unwrap();
        cycle_until(&mut broker, |b| b.client_count() == 1);

        stream.write_all(&connect_request()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let mut buf = vec![0u8; ConnectResponse::SIZE + crate::protocol::HEADER_SIZE];
        let deadline = Instant::now() + Duration::from_secs(1);
        let mut filled = 0;
        while filled < buf.len() {
            broker.process_cycle().unwrap();
            if let Ok(n) = stream.read(&mut buf[filled..]) {
                filled += n;
            }
            assert!(Instant::now() < deadline, "no reply");
        }
        let header = decode_header(&buf).unwrap();
        assert_eq!(header.message_id, ManagementMessage::ConnectResponse.as_u8());
        let response = ConnectResponse::decode(&buf[crate::protocol::HEADER_SIZE..]).unwrap();
        assert_eq!(response.client_id, ClientId::new(1));
    }

    #[test]
    fn closed_stream_is_swept_and_announced() {
        let dir = tempfile::tempdir().unwrap();
        let mut broker = Broker::bind(test_config(&dir)).unwrap();

        let watcher = datagram_peer(&dir, "watcher.sock");
        watcher
            .send_to(&connect_request(), dir.path().join("broker.sock"))
            .unwrap();
        recv(&watcher, &mut broker);

        let stream = TcpStream::connect(broker.stream_addr().unwrap()).unwrap();
        cycle_until(&mut broker, |b| b.client_count() == 2);
        drop(stream);

        let notice = recv(&watcher, &mut broker);
        assert_eq!(notice.header().protocol, ProtocolId::System);
        assert_eq!(
            notice.header().message_id,
            SystemMessage::ClientDisconnected.as_u8()
        );
        assert_eq!(notice.header().src, ClientId::new(2));
        assert_eq!(broker.client_count(), 1);
    }

    #[test]
    fn fatal_policy_stops_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            protocol_errors: ProtocolErrorPolicy::Fatal,
            ..test_config(&dir)
        };
        let mut broker = Broker::bind(config).unwrap();
        let peer = datagram_peer(&dir, "peer.sock");
        let message = Message::empty(Header::new(ProtocolId::ClientManagement, 77));
        peer.send_to(&message.to_bytes(), dir.path().join("broker.sock"))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            match broker.process_cycle() {
                Err(BrokerError::Protocol(ProtocolError::UnexpectedOpcode(77))) => break,
                Err(e) => panic!("unexpected error: {e}"),
                Ok(_) => assert!(Instant::now() < deadline, "cycle never failed"),
            }
        }
    }

    #[test]
    fn query_status_over_datagram() {
        let dir = tempfile::tempdir().unwrap();
        let mut broker = Broker::bind(test_config(&dir)).unwrap();
        let peer = datagram_peer(&dir, "peer.sock");
        peer.send_to(
            &management::bare(ManagementMessage::QueryStatus, 1).to_bytes(),
            dir.path().join("broker.sock"),
        )
        .unwrap();

        let reply = recv(&peer, &mut broker);
        let response = QueryStatusResponse::decode(reply.payload()).unwrap();
        assert_eq!(response.flags, StatusFlags::DEVELOPER_MODE_ENABLED);
    }

    #[test]
    fn bind_fails_on_non_socket_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        std::fs::write(dir.path().join("broker.sock"), b"not a socket").unwrap();
        assert!(matches!(
            Broker::bind(config),
            Err(BrokerError::BindDatagram { .. })
        ));
    }
}

//! Blocking broker peer.
//!
//! A [`Peer`] is what tools and drivers use to talk to the broker: run the
//! handshake, query status, send keep-alives, and exchange application
//! messages by identity. Requests wait for their matching response; anything
//! else that arrives in the meantime is queued for [`Peer::recv_timeout`].

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::net::{DatagramAddr, DatagramSocket};
use crate::protocol::management::{
    self, ConnectRequest, ConnectResponse, ManagementMessage, PayloadError, QueryStatusResponse,
    ResultCode,
};
use crate::protocol::{
    ClientId, Component, FramingError, HEADER_SIZE, Header, MAX_MESSAGE_SIZE, MAX_PAYLOAD_SIZE,
    Message, ProtocolId, StatusFlags, decode_header, encode,
};
use crate::trace::debug;

/// Errors from a peer's conversation with the broker.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out waiting for the broker")]
    Timeout,

    #[error("malformed message: {0}")]
    Framing(#[from] FramingError),

    #[error("malformed response: {0}")]
    Payload(#[from] PayloadError),

    #[error("broker answered {0}")]
    Rejected(ResultCode),

    /// Relayed messages need an identity; run [`Peer::connect`] first.
    #[error("peer has no identity yet")]
    NotConnected,
}

enum Link {
    Datagram {
        socket: DatagramSocket,
        broker: DatagramAddr,
    },
    Stream(TcpStream),
}

/// A connection to the broker over either transport.
pub struct Peer {
    link: Link,
    id: Option<ClientId>,
    pending: VecDeque<Message>,
    send_buf: Vec<u8>,
    recv_buf: Vec<u8>,
}

impl Peer {
    /// Binds a local datagram socket at `local` and targets the broker at
    /// `broker`.
    ///
    /// # Errors
    ///
    /// Returns an error if `local` cannot be bound.
    pub fn bind_datagram(local: &DatagramAddr, broker: &DatagramAddr) -> Result<Self, ClientError> {
        let socket = DatagramSocket::bind(local)?;
        socket.set_nonblocking(false)?;
        Ok(Self::new(Link::Datagram {
            socket,
            broker: broker.clone(),
        }))
    }

    /// Opens a TCP connection to the broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn connect_stream(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self::new(Link::Stream(stream)))
    }

    fn new(link: Link) -> Self {
        Self {
            link,
            id: None,
            pending: VecDeque::new(),
            send_buf: Vec::with_capacity(MAX_MESSAGE_SIZE),
            recv_buf: vec![0u8; MAX_MESSAGE_SIZE],
        }
    }

    /// Identity assigned by the broker, once connected.
    #[must_use]
    pub const fn id(&self) -> Option<ClientId> {
        self.id
    }

    /// Runs the handshake and stores the assigned identity.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Rejected`] if the broker refuses the request,
    /// or [`ClientError::Timeout`] if no response arrives in time.
    pub fn connect(
        &mut self,
        flags: StatusFlags,
        component: Component,
        timeout: Duration,
    ) -> Result<ClientId, ClientError> {
        let session = rand::random();
        let request = management::connect_request(session, ConnectRequest { flags, component });
        let reply = self.request(&request, ManagementMessage::ConnectResponse, timeout)?;
        let response = ConnectResponse::decode(reply.payload())?;
        if !response.result.is_success() {
            return Err(ClientError::Rejected(response.result));
        }

        debug!(client = %response.client_id, "connected to broker");
        self.id = Some(response.client_id);
        Ok(response.client_id)
    }

    /// Asks the broker for the aggregate status of all clients.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or times out.
    pub fn query_status(&mut self, timeout: Duration) -> Result<StatusFlags, ClientError> {
        let request = management::bare(ManagementMessage::QueryStatus, rand::random());
        let reply = self.request(&request, ManagementMessage::QueryStatusResponse, timeout)?;
        let response = QueryStatusResponse::decode(reply.payload())?;
        if !response.result.is_success() {
            return Err(ClientError::Rejected(response.result));
        }
        Ok(response.flags)
    }

    /// Sends a keep-alive and waits for the echo.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or times out.
    pub fn keep_alive(&mut self, timeout: Duration) -> Result<(), ClientError> {
        let request = management::bare(ManagementMessage::KeepAlive, rand::random());
        self.request(&request, ManagementMessage::KeepAlive, timeout)?;
        Ok(())
    }

    /// Sends an application message from this peer to `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] before the handshake, or an
    /// error if the payload is too large or the send fails.
    pub fn send_to(
        &mut self,
        dst: ClientId,
        protocol: ProtocolId,
        message_id: u8,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        let src = self.id.ok_or(ClientError::NotConnected)?;
        let header = Header::new(protocol, message_id)
            .from_client(src)
            .to_client(dst);
        encode(&header, payload, &mut self.send_buf)?;
        self.flush()
    }

    /// Sends a prebuilt message as-is.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails or is short.
    pub fn send(&mut self, message: &Message) -> Result<(), ClientError> {
        message.encode_into(&mut self.send_buf);
        self.flush()
    }

    /// Writes the encoded frame in `send_buf`.
    fn flush(&mut self) -> Result<(), ClientError> {
        match &mut self.link {
            Link::Datagram { socket, broker } => {
                let n = socket.send_to(&self.send_buf, broker)?;
                if n != self.send_buf.len() {
                    return Err(io::Error::new(ErrorKind::WriteZero, "short datagram send").into());
                }
            }
            Link::Stream(stream) => stream.write_all(&self.send_buf)?,
        }
        Ok(())
    }

    /// Receives the next message, queued or fresh.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] if nothing arrives in time.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Message, ClientError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(message);
        }
        self.read_message(Instant::now() + timeout)
    }

    /// Sends `request` and waits for the ClientManagement reply `expected`
    /// carrying the same session.
    fn request(
        &mut self,
        request: &Message,
        expected: ManagementMessage,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let session = request.header().session_id;
        self.send(request)?;

        let deadline = Instant::now() + timeout;
        loop {
            let message = self.read_message(deadline)?;
            let header = message.header();
            if header.protocol == ProtocolId::ClientManagement
                && header.message_id == expected.as_u8()
                && header.session_id == session
            {
                return Ok(message);
            }
            self.pending.push_back(message);
        }
    }

    fn read_message(&mut self, deadline: Instant) -> Result<Message, ClientError> {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or(ClientError::Timeout)?;

        match &mut self.link {
            Link::Datagram { socket, .. } => {
                socket.set_read_timeout(Some(remaining))?;
                let (n, _) = socket.recv_from(&mut self.recv_buf).map_err(timeout_or_io)?;
                Ok(Message::decode(&self.recv_buf[..n])?)
            }
            Link::Stream(stream) => {
                stream.set_read_timeout(Some(remaining))?;
                let mut head = [0u8; HEADER_SIZE];
                stream.read_exact(&mut head).map_err(timeout_or_io)?;
                let header = decode_header(&head).ok_or(FramingError::Truncated { have: 0 })?;
                let payload_size = header.payload_size as usize;
                if payload_size > MAX_PAYLOAD_SIZE {
                    return Err(FramingError::PayloadTooLarge { size: payload_size }.into());
                }
                let payload = &mut self.recv_buf[..payload_size];
                stream.read_exact(payload).map_err(timeout_or_io)?;
                Ok(Message::new(header, payload.to_vec())?)
            }
        }
    }
}

fn timeout_or_io(e: io::Error) -> ClientError {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => ClientError::Timeout,
        _ => ClientError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};
    use std::os::unix::net::UnixDatagram;

    const TIMEOUT: Duration = Duration::from_millis(500);

    #[test]
    fn send_to_requires_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut peer = Peer::bind_datagram(
            &DatagramAddr::path(dir.path().join("peer.sock")),
            &DatagramAddr::path(dir.path().join("broker.sock")),
        )
        .unwrap();
        assert!(matches!(
            peer.send_to(ClientId::new(2), ProtocolId::RGP, 1, b""),
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn send_to_rejects_oversized_payload() {
        let dir = tempfile::tempdir().unwrap();
        let broker_path = dir.path().join("broker.sock");
        let broker = UnixDatagram::bind(&broker_path).unwrap();
        let mut peer = Peer::bind_datagram(
            &DatagramAddr::path(dir.path().join("peer.sock")),
            &DatagramAddr::path(&broker_path),
        )
        .unwrap();
        peer.id = Some(ClientId::new(1));

        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            peer.send_to(ClientId::new(2), ProtocolId::RGP, 1, &payload),
            Err(ClientError::Framing(FramingError::PayloadTooLarge { .. }))
        ));

        peer.send_to(ClientId::new(2), ProtocolId::RGP, 4, b"trace")
            .unwrap();
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let n = broker.recv(&mut buf).unwrap();
        let sent = Message::decode(&buf[..n]).unwrap();
        assert_eq!(sent.header().src, ClientId::new(1));
        assert_eq!(sent.header().dst, ClientId::new(2));
        assert_eq!(sent.payload(), b"trace");
    }

    #[test]
    fn datagram_recv_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut peer = Peer::bind_datagram(
            &DatagramAddr::path(dir.path().join("peer.sock")),
            &DatagramAddr::path(dir.path().join("broker.sock")),
        )
        .unwrap();
        assert!(matches!(
            peer.recv_timeout(Duration::from_millis(20)),
            Err(ClientError::Timeout)
        ));
    }

    #[test]
    fn connect_rejected_by_fake_broker() {
        let dir = tempfile::tempdir().unwrap();
        let broker_path = dir.path().join("broker.sock");
        let broker = UnixDatagram::bind(&broker_path).unwrap();
        let mut peer = Peer::bind_datagram(
            &DatagramAddr::path(dir.path().join("peer.sock")),
            &DatagramAddr::path(&broker_path),
        )
        .unwrap();

        let responder = std::thread::spawn(move || {
            let mut buf = [0u8; MAX_MESSAGE_SIZE];
            let (n, from) = broker.recv_from(&mut buf).unwrap();
            let request = Message::decode(&buf[..n]).unwrap();
            // an unrelated message first; it must be queued, not consumed
            let noise = Message::empty(Header::new(ProtocolId::RGP, 9));
            broker
                .send_to(&noise.to_bytes(), from.as_pathname().unwrap())
                .unwrap();
            let reply = management::connect_response(
                request.header().session_id,
                ConnectResponse {
                    result: ResultCode::Rejected,
                    client_id: ClientId::BROADCAST,
                },
            );
            broker
                .send_to(&reply.to_bytes(), from.as_pathname().unwrap())
                .unwrap();
        });

        let result = peer.connect(StatusFlags::empty(), Component::TOOL, TIMEOUT);
        responder.join().unwrap();
        assert!(matches!(
            result,
            Err(ClientError::Rejected(ResultCode::Rejected))
        ));
        assert_eq!(peer.id(), None);

        let queued = peer.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(queued.header().message_id, 9);
    }

    #[test]
    fn stream_reads_header_then_payload() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let mut peer = Peer::connect_stream(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let first = Message::new(Header::new(ProtocolId::RGP, 1), b"abc".to_vec()).unwrap();
        let second = Message::empty(Header::new(ProtocolId::RGP, 2));
        let mut bytes = first.to_bytes();
        bytes.extend_from_slice(&second.to_bytes());
        server.write_all(&bytes).unwrap();

        assert_eq!(peer.recv_timeout(TIMEOUT).unwrap(), first);
        assert_eq!(peer.recv_timeout(TIMEOUT).unwrap(), second);
    }
}

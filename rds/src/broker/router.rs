//! Message delivery by identity.
//!
//! A nonzero destination is a unicast to the one client holding that
//! identity. The broadcast destination reaches every live client except the
//! sender. A failed delivery marks the target for removal and routing carries
//! on with the remaining targets.

use std::io::{self, Write};

use thiserror::Error;

use super::registry::{Registry, StreamConnection};
use crate::net::{ClientKey, DatagramSocket};
use crate::protocol::{ClientId, Message};
use crate::trace::{trace, warn};

/// A delivery to one client failed.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send failed: {0}")]
    Io(#[from] io::Error),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// A stream key whose record no longer holds a stream.
    #[error("no route to {0}")]
    Unaddressable(ClientKey),
}

/// Where encoded frames go.
///
/// The broker delivers over sockets; tests substitute a recorder.
pub trait Outbound {
    /// Delivers one encoded frame to the client under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame was not delivered in full.
    fn deliver(
        &mut self,
        key: &ClientKey,
        stream: Option<&StreamConnection>,
        frame: &[u8],
    ) -> Result<(), TransportError>;
}

/// Delivers over the client's own stream, or the broker's datagram endpoint.
pub struct SocketOutbound<'a> {
    datagram: &'a DatagramSocket,
}

impl<'a> SocketOutbound<'a> {
    #[must_use]
    pub const fn new(datagram: &'a DatagramSocket) -> Self {
        Self { datagram }
    }
}

impl Outbound for SocketOutbound<'_> {
    fn deliver(
        &mut self,
        key: &ClientKey,
        stream: Option<&StreamConnection>,
        frame: &[u8],
    ) -> Result<(), TransportError> {
        let written = match (key, stream) {
            (_, Some(conn)) => {
                let mut stream = conn.stream();
                stream.write(frame)?
            }
            (ClientKey::Datagram(addr), None) => self.datagram.send_to(frame, addr)?,
            (ClientKey::Stream(_), None) => return Err(TransportError::Unaddressable(key.clone())),
        };
        if written != frame.len() {
            return Err(TransportError::ShortWrite {
                written,
                expected: frame.len(),
            });
        }
        Ok(())
    }
}

/// Routes a relayed message to its destination(s).
///
/// `scratch` holds the encoded frame; its capacity is reused across calls.
/// Returns the number of clients the message reached.
pub fn route<O: Outbound>(
    registry: &mut Registry,
    out: &mut O,
    message: &Message,
    scratch: &mut Vec<u8>,
) -> usize {
    let header = message.header();
    message.encode_into(scratch);

    if header.dst.is_broadcast() {
        broadcast(registry, out, header.src, scratch)
    } else {
        usize::from(unicast(registry, out, header.dst, scratch))
    }
}

fn unicast<O: Outbound>(
    registry: &mut Registry,
    out: &mut O,
    dst: ClientId,
    frame: &[u8],
) -> bool {
    let Some((key, record)) = registry
        .find_by_id_mut(dst)
        .filter(|(_, record)| !record.is_removed())
    else {
        trace!(dst = %dst, "no client for unicast destination");
        return false;
    };

    match out.deliver(key, record.stream(), frame) {
        Ok(()) => true,
        Err(_e) => {
            warn!(client = %dst, key = %key, error = %_e, "delivery failed, removing client");
            record.mark_removed();
            false
        }
    }
}

fn broadcast<O: Outbound>(
    registry: &mut Registry,
    out: &mut O,
    src: ClientId,
    frame: &[u8],
) -> usize {
    let mut delivered = 0;
    for (key, record) in registry.iter_mut() {
        if record.is_removed() || record.id() == src {
            continue;
        }
        match out.deliver(key, record.stream(), frame) {
            Ok(()) => delivered += 1,
            Err(_e) => {
                warn!(client = %record.id(), key = %key, error = %_e, "delivery failed, removing client");
                record.mark_removed();
            }
        }
    }
    delivered
}

/// Sends a broker reply to the client under `key`.
///
/// The key need not be registered: an unknown datagram sender is answered
/// at its address. A registered client whose reply fails is marked for
/// removal.
pub fn reply<O: Outbound>(
    registry: &mut Registry,
    out: &mut O,
    key: &ClientKey,
    message: &Message,
    scratch: &mut Vec<u8>,
) -> bool {
    message.encode_into(scratch);
    let stream = registry.lookup(key).and_then(|record| record.stream());
    match out.deliver(key, stream, scratch) {
        Ok(()) => true,
        Err(_e) => {
            warn!(key = %key, error = %_e, "reply failed");
            registry.mark_for_removal(key);
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::net::DatagramAddr;
    use crate::protocol::{Header, ProtocolId};
    use std::collections::BTreeSet;

    /// Records deliveries; fails for keys in `failing`.
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub(crate) sent: Vec<(ClientKey, Message)>,
        pub(crate) failing: BTreeSet<ClientKey>,
    }

    impl Recorder {
        pub(crate) fn to(&self, key: &ClientKey) -> Vec<&Message> {
            self.sent
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, m)| m)
                .collect()
        }
    }

    impl Outbound for Recorder {
        fn deliver(
            &mut self,
            key: &ClientKey,
            _stream: Option<&StreamConnection>,
            frame: &[u8],
        ) -> Result<(), TransportError> {
            if self.failing.contains(key) {
                return Err(TransportError::Io(io::Error::from(
                    io::ErrorKind::BrokenPipe,
                )));
            }
            let message = Message::decode(frame).map_err(io::Error::other)?;
            self.sent.push((key.clone(), message));
            Ok(())
        }
    }

    pub(crate) fn key(name: &str) -> ClientKey {
        ClientKey::Datagram(DatagramAddr::path(format!("/tmp/{name}")))
    }

    fn registry_with(names: &[&str]) -> Registry {
        let mut registry = Registry::new();
        for name in names {
            registry.create(key(name)).unwrap();
        }
        registry
    }

    fn app_message(src: u16, dst: u16, payload: &[u8]) -> Message {
        let header = Header::new(ProtocolId::RGP, 4)
            .from_client(ClientId::new(src))
            .to_client(ClientId::new(dst));
        Message::new(header, payload.to_vec()).unwrap()
    }

    #[test]
    fn unicast_reaches_only_destination() {
        let mut registry = registry_with(&["a", "b", "c"]);
        let mut out = Recorder::default();
        let msg = app_message(1, 2, b"data");

        let delivered = route(&mut registry, &mut out, &msg, &mut Vec::new());
        assert_eq!(delivered, 1);
        assert_eq!(out.sent.len(), 1);
        assert_eq!(out.to(&key("b")), vec![&msg]);
    }

    #[test]
    fn unicast_to_unknown_id_is_dropped() {
        let mut registry = registry_with(&["a"]);
        let mut out = Recorder::default();
        let delivered = route(&mut registry, &mut out, &app_message(1, 9, b""), &mut Vec::new());
        assert_eq!(delivered, 0);
        assert!(out.sent.is_empty());
    }

    #[test]
    fn unicast_to_marked_client_is_dropped() {
        let mut registry = registry_with(&["a", "b"]);
        registry.mark_for_removal(&key("b"));
        let mut out = Recorder::default();
        let delivered = route(&mut registry, &mut out, &app_message(1, 2, b""), &mut Vec::new());
        assert_eq!(delivered, 0);
        assert!(out.sent.is_empty());
    }

    #[test]
    fn broadcast_excludes_sender() {
        let mut registry = registry_with(&["a", "b", "c"]);
        let mut out = Recorder::default();
        let msg = app_message(1, 0, b"all");

        let delivered = route(&mut registry, &mut out, &msg, &mut Vec::new());
        assert_eq!(delivered, 2);
        assert!(out.to(&key("a")).is_empty());
        assert_eq!(out.to(&key("b")).len(), 1);
        assert_eq!(out.to(&key("c")).len(), 1);
    }

    #[test]
    fn broadcast_skips_removed_clients() {
        let mut registry = registry_with(&["a", "b", "c"]);
        registry.mark_for_removal(&key("c"));
        let mut out = Recorder::default();

        route(&mut registry, &mut out, &app_message(1, 0, b""), &mut Vec::new());
        assert_eq!(out.sent.len(), 1);
        assert!(out.to(&key("c")).is_empty());

        route(&mut registry, &mut out, &app_message(1, 3, b""), &mut Vec::new());
        assert_eq!(out.sent.len(), 1);
    }

    #[test]
    fn failed_target_marked_and_others_still_served() {
        let mut registry = registry_with(&["a", "b", "c", "d"]);
        let mut out = Recorder::default();
        out.failing.insert(key("b"));

        let delivered = route(&mut registry, &mut out, &app_message(1, 0, b"x"), &mut Vec::new());
        assert_eq!(delivered, 2);
        assert!(registry.lookup(&key("b")).unwrap().is_removed());
        assert_eq!(out.to(&key("c")).len(), 1);
        assert_eq!(out.to(&key("d")).len(), 1);
    }

    #[test]
    fn reply_to_unregistered_sender() {
        let mut registry = Registry::new();
        let mut out = Recorder::default();
        let msg = app_message(0, 0, b"");
        assert!(reply(&mut registry, &mut out, &key("new"), &msg, &mut Vec::new()));
        assert_eq!(out.to(&key("new")).len(), 1);
    }

    #[test]
    fn failed_reply_marks_client() {
        let mut registry = registry_with(&["a"]);
        let mut out = Recorder::default();
        out.failing.insert(key("a"));
        assert!(!reply(&mut registry, &mut out, &key("a"), &app_message(0, 0, b""), &mut Vec::new()));
        assert!(registry.lookup(&key("a")).unwrap().is_removed());
    }

    #[test]
    fn socket_outbound_delivers_datagram() {
        let dir = tempfile::tempdir().unwrap();
        let broker = DatagramSocket::bind(&DatagramAddr::path(dir.path().join("b.sock"))).unwrap();
        let peer_addr = DatagramAddr::path(dir.path().join("p.sock"));
        let peer = DatagramSocket::bind(&peer_addr).unwrap();

        let mut out = SocketOutbound::new(&broker);
        out.deliver(&ClientKey::Datagram(peer_addr), None, b"frame")
            .unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = peer.try_recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"frame");
    }

    #[test]
    fn socket_outbound_to_missing_peer_fails() {
        let dir = tempfile::tempdir().unwrap();
        let broker = DatagramSocket::bind(&DatagramAddr::path(dir.path().join("b.sock"))).unwrap();
        let gone = ClientKey::Datagram(DatagramAddr::path(dir.path().join("gone.sock")));

        let mut out = SocketOutbound::new(&broker);
        assert!(matches!(
            out.deliver(&gone, None, b"frame"),
            Err(TransportError::Io(_))
        ));
        assert!(matches!(
            out.deliver(&ClientKey::Stream(crate::net::ConnectionToken::new(5)), None, b""),
            Err(TransportError::Unaddressable(_))
        ));
    }
}

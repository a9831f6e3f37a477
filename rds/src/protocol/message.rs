//! Message framing: a fixed 24-byte header followed by the payload.
//!
//! # Wire Format
//!
//! All fields are little-endian.
//!
//! ```text
//! ┌──────────┬──────────┬───────┬───────┬──────────┬──────────────┐
//! │ Src(2)   │ Dst(2)   │ Pr(1) │ Id(1) │ Window(2)│ PayloadLen(4)│
//! ├──────────┴──────────┴───────┴───────┼──────────┴──────────────┤
//! │ Session ID (4)                      │                         │
//! ├─────────────────────────────────────┴─────────────────────────┤
//! │ Sequence (8) - packed client metadata on System messages       │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! One datagram or one stream read carries exactly one message. There is no
//! reassembly: a read whose length disagrees with the declared payload size
//! is a framing violation.

use std::fmt;

use thiserror::Error;

/// Size of the fixed message header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Largest message (header + payload) the broker accepts.
pub const MAX_MESSAGE_SIZE: usize = 1408;

/// Largest payload a single message may carry.
pub const MAX_PAYLOAD_SIZE: usize = MAX_MESSAGE_SIZE - HEADER_SIZE;

/// Identity the broker assigns to a connected peer.
///
/// Zero is reserved as the broadcast identity: as a destination it means
/// "every peer except the sender", as a source it marks an out-of-band
/// message from a peer that has no identity yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u16);

impl ClientId {
    /// The reserved broadcast identity.
    pub const BROADCAST: Self = Self(0);

    /// Wraps a raw identity.
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Raw value for wire serialization.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns `true` for the broadcast identity.
    #[must_use]
    pub const fn is_broadcast(self) -> bool {
        self.0 == 0
    }
}

impl From<u16> for ClientId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

impl From<ClientId> for u16 {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Protocol a message belongs to.
///
/// `System` and `ClientManagement` are understood by the broker; every other
/// id is an application protocol whose payload is relayed untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolId {
    /// Broker-originated notifications (client connected/disconnected).
    System,
    /// Out-of-band connection bootstrap handled by the broker itself.
    ClientManagement,
    /// Any other protocol, relayed opaquely.
    Application(u8),
}

impl ProtocolId {
    /// Wire value of [`ProtocolId::System`].
    pub const SYSTEM: u8 = 255;
    /// Wire value of [`ProtocolId::ClientManagement`].
    pub const CLIENT_MANAGEMENT: u8 = 254;

    /// Driver control (clock modes, resume).
    pub const DRIVER_CONTROL: Self = Self::Application(0);
    /// Driver logging.
    pub const LOGGING: Self = Self::Application(1);
    /// Driver settings.
    pub const SETTINGS: Self = Self::Application(2);
    /// Profiling trace capture.
    pub const RGP: Self = Self::Application(3);

    /// Classify a wire byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            Self::SYSTEM => Self::System,
            Self::CLIENT_MANAGEMENT => Self::ClientManagement,
            other => Self::Application(other),
        }
    }

    /// Wire byte for this protocol.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::System => Self::SYSTEM,
            Self::ClientManagement => Self::CLIENT_MANAGEMENT,
            Self::Application(id) => id,
        }
    }
}

impl From<u8> for ProtocolId {
    fn from(value: u8) -> Self {
        Self::from_u8(value)
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::ClientManagement => f.write_str("client-management"),
            Self::Application(id) => write!(f, "app:{id}"),
        }
    }
}

/// Fixed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sending peer, or broadcast for out-of-band messages.
    pub src: ClientId,
    /// Receiving peer, or broadcast for "everyone but the sender".
    pub dst: ClientId,
    /// Protocol the opcode belongs to.
    pub protocol: ProtocolId,
    /// Protocol-scoped opcode.
    pub message_id: u8,
    /// Sender's receive window, relayed untouched.
    pub window_size: u16,
    /// Number of payload bytes following the header.
    pub payload_size: u32,
    /// Session the message belongs to.
    pub session_id: u32,
    /// Sequence number, or packed client metadata on System messages.
    pub sequence: u64,
}

impl Header {
    /// A zeroed header for the given protocol and opcode.
    #[must_use]
    pub const fn new(protocol: ProtocolId, message_id: u8) -> Self {
        Self {
            src: ClientId::BROADCAST,
            dst: ClientId::BROADCAST,
            protocol,
            message_id,
            window_size: 0,
            payload_size: 0,
            session_id: 0,
            sequence: 0,
        }
    }

    /// Sets the source identity.
    #[must_use]
    pub const fn from_client(mut self, src: ClientId) -> Self {
        self.src = src;
        self
    }

    /// Sets the destination identity.
    #[must_use]
    pub const fn to_client(mut self, dst: ClientId) -> Self {
        self.dst = dst;
        self
    }

    /// Sets the session identifier.
    #[must_use]
    pub const fn with_session(mut self, session_id: u32) -> Self {
        self.session_id = session_id;
        self
    }

    /// Sets the sequence field.
    #[must_use]
    pub const fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Total encoded length of a message with this header.
    #[must_use]
    pub const fn message_len(&self) -> usize {
        HEADER_SIZE + self.payload_size as usize
    }
}

/// Errors while framing or unframing a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramingError {
    /// Fewer bytes than a header.
    #[error("truncated message: need {HEADER_SIZE} header bytes, have {have}")]
    Truncated {
        /// Bytes actually received.
        have: usize,
    },
    /// Declared or supplied payload exceeds the buffer capacity.
    #[error("payload of {size} bytes exceeds maximum of {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge {
        /// Offending payload size.
        size: usize,
    },
    /// Received length does not equal header plus declared payload.
    #[error("length mismatch: header declares {declared} bytes, received {received}")]
    LengthMismatch {
        /// `HEADER_SIZE + payload_size` from the header.
        declared: usize,
        /// Bytes actually received.
        received: usize,
    },
}

/// A decoded message: header plus owned payload.
///
/// Invariant: `header.payload_size == payload.len() <= MAX_PAYLOAD_SIZE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: Header,
    payload: Vec<u8>,
}

impl Message {
    /// Builds a message, setting the header's payload size from `payload`.
    pub fn new(mut header: Header, payload: impl Into<Vec<u8>>) -> Result<Self, FramingError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FramingError::PayloadTooLarge {
                size: payload.len(),
            });
        }
        header.payload_size = payload.len() as u32;
        Ok(Self { header, payload })
    }

    /// Builds a message with no payload.
    #[must_use]
    pub const fn empty(mut header: Header) -> Self {
        header.payload_size = 0;
        Self {
            header,
            payload: Vec::new(),
        }
    }

    /// Builds a message from a fixed-size payload known to fit.
    pub(crate) fn fixed<const N: usize>(mut header: Header, payload: [u8; N]) -> Self {
        const { assert!(N <= MAX_PAYLOAD_SIZE) };
        header.payload_size = N as u32;
        Self {
            header,
            payload: payload.to_vec(),
        }
    }

    /// The message header.
    #[must_use]
    pub const fn header(&self) -> &Header {
        &self.header
    }

    /// The payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encoded length in bytes.
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        self.header.message_len()
    }

    /// Encodes into `buf`, clearing it first (capacity is reused).
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        write_frame(&self.header, &self.payload, buf);
    }

    /// Encodes into a fresh buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decodes one complete message from `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        decode(bytes)
    }
}

/// Writer for little-endian wire fields.
pub(crate) struct WireWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> WireWriter<'a> {
    pub(crate) fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    pub(crate) fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_slice(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
}

/// Reader for little-endian wire fields.
///
/// Callers check the total length up front, so reads past the end yield
/// `None` rather than a detailed error.
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> WireReader<'a> {
    pub(crate) const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.buf.get(self.cursor..self.cursor + N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(bytes);
        self.cursor += N;
        Some(arr)
    }

    pub(crate) fn take_u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|[b]| b)
    }

    pub(crate) fn take_u16(&mut self) -> Option<u16> {
        self.take::<2>().map(u16::from_le_bytes)
    }

    pub(crate) fn take_u32(&mut self) -> Option<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    pub(crate) fn take_u64(&mut self) -> Option<u64> {
        self.take::<8>().map(u64::from_le_bytes)
    }
}

/// Encodes `header` and `payload` into `buf`.
///
/// The header's `payload_size` is taken from `payload.len()`.
pub fn encode(header: &Header, payload: &[u8], buf: &mut Vec<u8>) -> Result<(), FramingError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FramingError::PayloadTooLarge {
            size: payload.len(),
        });
    }
    write_frame(header, payload, buf);
    Ok(())
}

fn write_frame(header: &Header, payload: &[u8], buf: &mut Vec<u8>) {
    let mut w = WireWriter::new(buf);
    w.put_u16(header.src.as_u16());
    w.put_u16(header.dst.as_u16());
    w.put_u8(header.protocol.as_u8());
    w.put_u8(header.message_id);
    w.put_u16(header.window_size);
    w.put_u32(payload.len() as u32);
    w.put_u32(header.session_id);
    w.put_u64(header.sequence);
    w.put_slice(payload);
}

/// Decodes one complete message from `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Message, FramingError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FramingError::Truncated { have: bytes.len() });
    }

    let header = decode_header(bytes).ok_or(FramingError::Truncated { have: bytes.len() })?;
    let payload_size = header.payload_size as usize;
    if payload_size > MAX_PAYLOAD_SIZE {
        return Err(FramingError::PayloadTooLarge { size: payload_size });
    }
    if bytes.len() != header.message_len() {
        return Err(FramingError::LengthMismatch {
            declared: header.message_len(),
            received: bytes.len(),
        });
    }

    Ok(Message {
        header,
        payload: bytes[HEADER_SIZE..].to_vec(),
    })
}

/// Decodes only the header, without validating the payload length.
///
/// Used by stream peers that read the header first and then the payload.
#[must_use]
pub fn decode_header(bytes: &[u8]) -> Option<Header> {
    let mut r = WireReader::new(bytes);
    Some(Header {
        src: ClientId::new(r.take_u16()?),
        dst: ClientId::new(r.take_u16()?),
        protocol: ProtocolId::from_u8(r.take_u8()?),
        message_id: r.take_u8()?,
        window_size: r.take_u16()?,
        payload_size: r.take_u32()?,
        session_id: r.take_u32()?,
        sequence: r.take_u64()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Message {
        let header = Header::new(ProtocolId::RGP, 7)
            .from_client(ClientId::new(3))
            .to_client(ClientId::new(9))
            .with_session(0xDEAD_BEEF)
            .with_sequence(0x0102_0304_0506_0708);
        Message::new(header, b"trace chunk".to_vec()).unwrap()
    }

    #[test]
    fn header_layout_is_little_endian() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 11);
        assert_eq!(&bytes[0..2], &[3, 0]);
        assert_eq!(&bytes[2..4], &[9, 0]);
        assert_eq!(bytes[4], 3);
        assert_eq!(bytes[5], 7);
        assert_eq!(&bytes[8..12], &[11, 0, 0, 0]);
        assert_eq!(&bytes[12..16], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(&bytes[16..24], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&bytes[24..], b"trace chunk");
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let msg = sample();
        let decoded = Message::decode(&msg.to_bytes()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.header().payload_size, 11);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let msg = Message::empty(Header::new(ProtocolId::ClientManagement, 9).with_session(5));
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn decode_truncated_header() {
        let result = decode(&[0u8; HEADER_SIZE - 1]);
        assert_eq!(
            result,
            Err(FramingError::Truncated {
                have: HEADER_SIZE - 1
            })
        );
    }

    #[test]
    fn decode_rejects_short_payload() {
        let mut bytes = sample().to_bytes();
        bytes.pop();
        assert!(matches!(
            decode(&bytes),
            Err(FramingError::LengthMismatch { declared, received })
                if declared == HEADER_SIZE + 11 && received == HEADER_SIZE + 10
        ));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = sample().to_bytes();
        bytes.push(0);
        assert!(matches!(
            decode(&bytes),
            Err(FramingError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_oversized_declaration() {
        let mut bytes = sample().to_bytes();
        let huge = (MAX_PAYLOAD_SIZE as u32 + 1).to_le_bytes();
        bytes[8..12].copy_from_slice(&huge);
        assert_eq!(
            decode(&bytes),
            Err(FramingError::PayloadTooLarge {
                size: MAX_PAYLOAD_SIZE + 1
            })
        );
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let header = Header::new(ProtocolId::RGP, 1);
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            Message::new(header, payload.clone()),
            Err(FramingError::PayloadTooLarge { .. })
        ));
        let mut buf = Vec::new();
        assert!(encode(&header, &payload, &mut buf).is_err());
    }

    #[test]
    fn max_payload_fits() {
        let header = Header::new(ProtocolId::RGP, 1);
        let msg = Message::new(header, vec![0xAB; MAX_PAYLOAD_SIZE]).unwrap();
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), MAX_MESSAGE_SIZE);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn protocol_id_classification() {
        assert_eq!(ProtocolId::from_u8(255), ProtocolId::System);
        assert_eq!(ProtocolId::from_u8(254), ProtocolId::ClientManagement);
        assert_eq!(ProtocolId::from_u8(3), ProtocolId::RGP);
        assert_eq!(ProtocolId::Application(42).as_u8(), 42);
    }

    proptest! {
        #[test]
        fn roundtrip_any_message(
            src in any::<u16>(),
            dst in any::<u16>(),
            protocol in any::<u8>(),
            message_id in any::<u8>(),
            window_size in any::<u16>(),
            session_id in any::<u32>(),
            sequence in any::<u64>(),
            payload in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_SIZE),
        ) {
            let header = Header {
                src: ClientId::new(src),
                dst: ClientId::new(dst),
                protocol: ProtocolId::from_u8(protocol),
                message_id,
                window_size,
                payload_size: 0,
                session_id,
                sequence,
            };
            let msg = Message::new(header, payload).unwrap();
            let decoded = Message::decode(&msg.to_bytes()).unwrap();
            prop_assert_eq!(decoded, msg);
        }

        #[test]
        fn tampered_length_is_rejected(
            payload in proptest::collection::vec(any::<u8>(), 0..64),
            delta in 1u32..16,
        ) {
            let msg = Message::new(Header::new(ProtocolId::RGP, 1), payload).unwrap();
            let mut bytes = msg.to_bytes();
            let declared = msg.header().payload_size + delta;
            bytes[8..12].copy_from_slice(&declared.to_le_bytes());
            prop_assert!(decode(&bytes).is_err());
        }
    }
}

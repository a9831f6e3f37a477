//! System protocol: notifications the broker originates.
//!
//! The broker only emits `ClientConnected` and `ClientDisconnected`. The
//! remaining opcodes belong to peers and are relayed like any application
//! message.

use std::fmt;

use super::message::{ClientId, Header, Message, ProtocolId};
use super::metadata::ClientMetadata;

/// System protocol opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SystemMessage {
    ClientConnected = 1,
    ClientDisconnected = 2,
    Ping = 3,
    Pong = 4,
    QueryClientInfo = 5,
    ClientInfo = 6,
    Halted = 7,
}

impl SystemMessage {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Liveness traffic that is only worth logging at `trace`.
    #[must_use]
    pub const fn is_chatter(self) -> bool {
        matches!(self, Self::Ping | Self::Pong)
    }
}

impl TryFrom<u8> for SystemMessage {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::ClientConnected,
            2 => Self::ClientDisconnected,
            3 => Self::Ping,
            4 => Self::Pong,
            5 => Self::QueryClientInfo,
            6 => Self::ClientInfo,
            7 => Self::Halted,
            other => return Err(other),
        })
    }
}

impl fmt::Display for SystemMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Builds a broadcast System notification about `subject`.
///
/// `sequence` carries the packed metadata.
#[must_use]
pub const fn notification(
    kind: SystemMessage,
    subject: ClientId,
    metadata: ClientMetadata,
) -> Message {
    let header = Header::new(ProtocolId::System, kind.as_u8())
        .from_client(subject)
        .to_client(ClientId::BROADCAST)
        .with_sequence(metadata.to_u64());
    Message::empty(header)
}

/// Classifies a header as a System message, if it is one.
#[must_use]
pub fn classify(header: &Header) -> Option<SystemMessage> {
    match header.protocol {
        ProtocolId::System => SystemMessage::try_from(header.message_id).ok(),
        _ => None,
    }
}

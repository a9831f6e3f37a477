//! ClientManagement protocol: the out-of-band handshake a peer runs before it
//! has an identity.
//!
//! Every message on this protocol is sent with `src == 0`. The broker answers
//! on the same transport it received the request on.

use std::fmt;

use thiserror::Error;

use super::message::{ClientId, Header, Message, ProtocolId, WireReader};
use super::metadata::{Component, StatusFlags};

/// ClientManagement opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ManagementMessage {
    ConnectRequest = 1,
    ConnectResponse = 2,
    DisconnectNotification = 3,
    DisconnectResponse = 4,
    SetClientFlags = 5,
    SetClientFlagsResponse = 6,
    QueryStatus = 7,
    QueryStatusResponse = 8,
    KeepAlive = 9,
}

impl ManagementMessage {
    /// Wire opcode.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Response opcode paired with a request, if the request has one.
    #[must_use]
    pub const fn response(self) -> Option<Self> {
        match self {
            Self::ConnectRequest => Some(Self::ConnectResponse),
            Self::DisconnectNotification => Some(Self::DisconnectResponse),
            Self::SetClientFlags => Some(Self::SetClientFlagsResponse),
            Self::QueryStatus => Some(Self::QueryStatusResponse),
            Self::KeepAlive => Some(Self::KeepAlive),
            _ => None,
        }
    }
}

impl TryFrom<u8> for ManagementMessage {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::ConnectRequest,
            2 => Self::ConnectResponse,
            3 => Self::DisconnectNotification,
            4 => Self::DisconnectResponse,
            5 => Self::SetClientFlags,
            6 => Self::SetClientFlagsResponse,
            7 => Self::QueryStatus,
            8 => Self::QueryStatusResponse,
            9 => Self::KeepAlive,
            other => return Err(other),
        })
    }
}

impl fmt::Display for ManagementMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result code carried in ClientManagement responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0,
    Error = 1,
    NotReady = 2,
    VersionMismatch = 3,
    Unavailable = 4,
    Rejected = 5,
}

impl ResultCode {
    /// Wire value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Decodes a wire value; unknown codes collapse to [`ResultCode::Error`].
    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Success,
            2 => Self::NotReady,
            3 => Self::VersionMismatch,
            4 => Self::Unavailable,
            5 => Self::Rejected,
            _ => Self::Error,
        }
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A ClientManagement payload was shorter than its fixed layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("{opcode} payload too short: need {need} bytes, have {have}")]
    TooShort {
        opcode: ManagementMessage,
        need: usize,
        have: usize,
    },
}

const fn too_short(opcode: ManagementMessage, need: usize, payload: &[u8]) -> PayloadError {
    PayloadError::TooShort {
        opcode,
        need,
        have: payload.len(),
    }
}

/// Handshake request from a peer that wants an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub flags: StatusFlags,
    pub component: Component,
}

impl ConnectRequest {
    pub const SIZE: usize = 4;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let flags = self.flags.bits().to_le_bytes();
        [flags[0], flags[1], self.component.as_u8(), 0]
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PayloadError> {
        let err = || too_short(ManagementMessage::ConnectRequest, Self::SIZE, payload);
        let mut r = WireReader::new(payload);
        let flags = r.take_u16().ok_or_else(err)?;
        let component = r.take_u8().ok_or_else(err)?;
        r.take_u8().ok_or_else(err)?;
        Ok(Self {
            flags: StatusFlags::from_bits_retain(flags),
            component: Component::new(component),
        })
    }
}

/// Handshake reply carrying the assigned identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    pub result: ResultCode,
    pub client_id: ClientId,
}

impl ConnectResponse {
    pub const SIZE: usize = 8;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.result.as_u32().to_le_bytes());
        out[4..6].copy_from_slice(&self.client_id.as_u16().to_le_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PayloadError> {
        let err = || too_short(ManagementMessage::ConnectResponse, Self::SIZE, payload);
        let mut r = WireReader::new(payload);
        let result = r.take_u32().ok_or_else(err)?;
        let client_id = r.take_u16().ok_or_else(err)?;
        r.take_u16().ok_or_else(err)?;
        Ok(Self {
            result: ResultCode::from_u32(result),
            client_id: ClientId::new(client_id),
        })
    }
}

/// Aggregate status reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryStatusResponse {
    pub result: ResultCode,
    pub flags: StatusFlags,
}

impl QueryStatusResponse {
    pub const SIZE: usize = 8;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.result.as_u32().to_le_bytes());
        out[4..6].copy_from_slice(&self.flags.bits().to_le_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PayloadError> {
        let err = || too_short(ManagementMessage::QueryStatusResponse, Self::SIZE, payload);
        let mut r = WireReader::new(payload);
        let result = r.take_u32().ok_or_else(err)?;
        let flags = r.take_u16().ok_or_else(err)?;
        r.take_u16().ok_or_else(err)?;
        Ok(Self {
            result: ResultCode::from_u32(result),
            flags: StatusFlags::from_bits_retain(flags),
        })
    }
}

/// Result-only reply used by DisconnectResponse and SetClientFlagsResponse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultResponse {
    pub result: ResultCode,
}

impl ResultResponse {
    pub const SIZE: usize = 4;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        self.result.as_u32().to_le_bytes()
    }

    pub fn decode(opcode: ManagementMessage, payload: &[u8]) -> Result<Self, PayloadError> {
        let result = WireReader::new(payload)
            .take_u32()
            .ok_or_else(|| too_short(opcode, Self::SIZE, payload))?;
        Ok(Self {
            result: ResultCode::from_u32(result),
        })
    }
}

/// Header for an out-of-band message: `src` and `dst` are both broadcast.
#[must_use]
pub const fn out_of_band(opcode: ManagementMessage, session_id: u32) -> Header {
    Header::new(ProtocolId::ClientManagement, opcode.as_u8()).with_session(session_id)
}

/// Returns `true` if `header` is an out-of-band ClientManagement message.
#[must_use]
pub const fn is_out_of_band(header: &Header) -> bool {
    matches!(header.protocol, ProtocolId::ClientManagement) && header.src.is_broadcast()
}

/// Builds a ConnectRequest message.
#[must_use]
pub fn connect_request(session_id: u32, request: ConnectRequest) -> Message {
    Message::fixed(
        out_of_band(ManagementMessage::ConnectRequest, session_id),
        request.to_bytes(),
    )
}

/// Builds a ConnectResponse message.
#[must_use]
pub fn connect_response(session_id: u32, response: ConnectResponse) -> Message {
    Message::fixed(
        out_of_band(ManagementMessage::ConnectResponse, session_id),
        response.to_bytes(),
    )
}

/// Builds a QueryStatusResponse message.
#[must_use]
pub fn query_status_response(session_id: u32, response: QueryStatusResponse) -> Message {
    Message::fixed(
        out_of_band(ManagementMessage::QueryStatusResponse, session_id),
        response.to_bytes(),
    )
}

/// Builds a result-only response under `opcode`.
#[must_use]
pub fn result_response(opcode: ManagementMessage, session_id: u32, result: ResultCode) -> Message {
    Message::fixed(
        out_of_band(opcode, session_id),
        ResultResponse { result }.to_bytes(),
    )
}

/// Builds a zero-payload out-of-band message (QueryStatus, KeepAlive).
#[must_use]
pub const fn bare(opcode: ManagementMessage, session_id: u32) -> Message {
    Message::empty(out_of_band(opcode, session_id))
}

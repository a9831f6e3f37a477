//! ClientManagement handling.
//!
//! The handler holds no state of its own: everything it needs is in the
//! registry. Each out-of-band request yields at most one reply to the sender,
//! plus a `ClientConnected` broadcast after a successful handshake.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::registry::{Registry, RegistryError};
use super::router::{self, Outbound};
use crate::net::ClientKey;
use crate::protocol::management::{
    self, ConnectRequest, ConnectResponse, ManagementMessage, QueryStatusResponse, ResultCode,
};
use crate::protocol::system::{self, SystemMessage};
use crate::protocol::{ClientId, ClientMetadata, Message};
use crate::trace::{debug, info, trace, warn};

/// How the broker reacts to ClientManagement opcodes it does not serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolErrorPolicy {
    /// Drop the message with a warning.
    Ignore,
    /// Answer reserved opcodes with `Unavailable`; drop unknown ones.
    #[default]
    Reject,
    /// Abort the cycle with an error.
    Fatal,
}

impl FromStr for ProtocolErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "reject" => Ok(Self::Reject),
            "fatal" => Ok(Self::Fatal),
            other => Err(format!(
                "unknown policy '{other}', expected ignore, reject or fatal"
            )),
        }
    }
}

impl fmt::Display for ProtocolErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ignore => "ignore",
            Self::Reject => "reject",
            Self::Fatal => "fatal",
        })
    }
}

/// A ClientManagement opcode the broker does not serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A defined request with no broker behavior.
    #[error("reserved ClientManagement opcode {0}")]
    Reserved(ManagementMessage),

    /// A response opcode, or one outside the protocol.
    #[error("unexpected ClientManagement opcode {0}")]
    UnexpectedOpcode(u8),
}

/// Errors that abort the cycle.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Handles one out-of-band ClientManagement message from `sender`.
///
/// # Errors
///
/// - [`ControlError::Protocol`] for an unserved opcode under
///   [`ProtocolErrorPolicy::Fatal`]
/// - [`ControlError::Registry`] if a new datagram client cannot get an
///   identity
pub fn handle<O: Outbound>(
    registry: &mut Registry,
    out: &mut O,
    policy: ProtocolErrorPolicy,
    sender: &ClientKey,
    message: &Message,
    scratch: &mut Vec<u8>,
) -> Result<(), ControlError> {
    let header = message.header();
    let session = header.session_id;

    let opcode = match ManagementMessage::try_from(header.message_id) {
        Ok(opcode) => opcode,
        Err(raw) => return unserved(policy, sender, ProtocolError::UnexpectedOpcode(raw)),
    };

    match opcode {
        ManagementMessage::ConnectRequest => {
            connect(registry, out, sender, session, message.payload(), scratch)
        }
        ManagementMessage::QueryStatus => {
            let flags = registry.aggregate_flags();
            debug!(key = %sender, flags = flags.bits(), "query status");
            let response = management::query_status_response(
                session,
                QueryStatusResponse {
                    result: ResultCode::Success,
                    flags,
                },
            );
            router::reply(registry, out, sender, &response, scratch);
            Ok(())
        }
        ManagementMessage::KeepAlive => {
            trace!(key = %sender, session, "keep-alive");
            let response = management::bare(ManagementMessage::KeepAlive, session);
            router::reply(registry, out, sender, &response, scratch);
            Ok(())
        }
        ManagementMessage::DisconnectNotification | ManagementMessage::SetClientFlags => {
            match (policy, opcode.response()) {
                (ProtocolErrorPolicy::Reject, Some(response_opcode)) => {
                    debug!(key = %sender, opcode = %opcode, "rejecting reserved opcode");
                    let response = management::result_response(
                        response_opcode,
                        session,
                        ResultCode::Unavailable,
                    );
                    router::reply(registry, out, sender, &response, scratch);
                    Ok(())
                }
                _ => unserved(policy, sender, ProtocolError::Reserved(opcode)),
            }
        }
        ManagementMessage::ConnectResponse
        | ManagementMessage::DisconnectResponse
        | ManagementMessage::SetClientFlagsResponse
        | ManagementMessage::QueryStatusResponse => unserved(
            policy,
            sender,
            ProtocolError::UnexpectedOpcode(opcode.as_u8()),
        ),
    }
}

fn unserved(
    policy: ProtocolErrorPolicy,
    _sender: &ClientKey,
    error: ProtocolError,
) -> Result<(), ControlError> {
    if policy == ProtocolErrorPolicy::Fatal {
        return Err(error.into());
    }
    warn!(key = %_sender, error = %error, "dropping ClientManagement message");
    Ok(())
}

fn connect<O: Outbound>(
    registry: &mut Registry,
    out: &mut O,
    sender: &ClientKey,
    session: u32,
    payload: &[u8],
    scratch: &mut Vec<u8>,
) -> Result<(), ControlError> {
    let request = match ConnectRequest::decode(payload) {
        Ok(request) => request,
        Err(_e) => {
            warn!(key = %sender, error = %_e, "malformed connect request");
            let response = management::connect_response(
                session,
                ConnectResponse {
                    result: ResultCode::Rejected,
                    client_id: ClientId::BROADCAST,
                },
            );
            router::reply(registry, out, sender, &response, scratch);
            return Ok(());
        }
    };

    let id = match registry.lookup(sender) {
        Some(record) => record.id(),
        None if !sender.is_stream() => registry.create(sender.clone())?,
        None => {
            // stream records exist from accept until the sweep
            warn!(key = %sender, "connect request from unregistered stream");
            return Ok(());
        }
    };
    if let Some(record) = registry.lookup_mut(sender) {
        record.set_metadata(request.flags, request.component);
    }
    info!(
        client = %id,
        key = %sender,
        component = %request.component,
        flags = request.flags.bits(),
        "client connected"
    );

    let response = management::connect_response(
        session,
        ConnectResponse {
            result: ResultCode::Success,
            client_id: id,
        },
    );
    router::reply(registry, out, sender, &response, scratch);

    let notice = system::notification(SystemMessage::ClientConnected, id, ClientMetadata::empty());
    router::route(registry, out, &notice, scratch);
    Ok(())
}

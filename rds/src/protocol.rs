//! Wire protocol: message framing and the two protocols the broker
//! understands itself.
//!
//! - [`message`]: header layout, encode/decode
//! - [`metadata`]: client descriptor packed into the `sequence` field
//! - [`management`]: out-of-band handshake (ClientManagement)
//! - [`system`]: broker notifications (System)

pub mod management;
pub mod message;
pub mod metadata;
pub mod system;

pub use management::{ManagementMessage, ResultCode};
pub use message::{
    ClientId, FramingError, HEADER_SIZE, Header, MAX_MESSAGE_SIZE, MAX_PAYLOAD_SIZE, Message,
    ProtocolId, decode, decode_header, encode,
};
pub use metadata::{ClientMetadata, Component, ProtocolFlags, StatusFlags};
pub use system::SystemMessage;

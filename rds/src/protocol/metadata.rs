//! Client metadata packed into the 64-bit `sequence` header field.
//!
//! System notifications carry a [`ClientMetadata`] in place of a sequence
//! number. The layout is fixed:
//!
//! ```text
//! bits  0..32  protocol support mask
//! bits 32..40  component kind
//! bits 40..48  reserved
//! bits 48..64  status flags
//! ```

use std::fmt;
use std::mem::size_of;

use bitflags::bitflags;

bitflags! {
    /// Status bits a peer advertises during the handshake.
    ///
    /// The broker ORs these across all clients to answer `QueryStatus`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatusFlags: u16 {
        /// Developer mode is active. Always set in aggregate status.
        const DEVELOPER_MODE_ENABLED = 0x0001;
        /// Devices halt when a driver connects.
        const DEVICE_HALT_ON_CONNECT = 0x0002;
        /// GPU crash dumps are being collected.
        const GPU_CRASH_DUMPS_ENABLED = 0x0004;
        /// Pipeline binaries are being dumped.
        const PIPELINE_DUMPS_ENABLED = 0x0008;
        /// Platform-level halt on connect.
        const PLATFORM_HALT_ON_CONNECT = 0x0010;
    }
}

bitflags! {
    /// Protocols a peer implements, one bit per protocol id.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProtocolFlags: u32 {
        const DRIVER_CONTROL = 1 << 0;
        const LOGGING = 1 << 1;
        const SETTINGS = 1 << 2;
        const RGP = 1 << 3;
    }
}

/// Kind of process behind a peer.
///
/// Stored as a raw byte so unknown kinds survive a pack/unpack cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Component(u8);

impl Component {
    pub const UNKNOWN: Self = Self(0);
    pub const SERVER: Self = Self(1);
    pub const TOOL: Self = Self(2);
    pub const DRIVER: Self = Self(3);

    /// Wraps a raw component byte.
    #[must_use]
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Raw value for wire serialization.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNKNOWN => f.write_str("unknown"),
            Self::SERVER => f.write_str("server"),
            Self::TOOL => f.write_str("tool"),
            Self::DRIVER => f.write_str("driver"),
            Self(other) => write!(f, "component:{other}"),
        }
    }
}

/// Descriptor of a peer, sized to fit the header's `sequence` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct ClientMetadata {
    pub protocols: ProtocolFlags,
    pub component: Component,
    pub reserved: u8,
    pub status: StatusFlags,
}

const _: () = assert!(size_of::<ClientMetadata>() == size_of::<u64>());

impl ClientMetadata {
    /// Metadata with every field zeroed.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            protocols: ProtocolFlags::empty(),
            component: Component::UNKNOWN,
            reserved: 0,
            status: StatusFlags::empty(),
        }
    }

    /// Packs into the `sequence` field layout.
    #[must_use]
    pub const fn to_u64(self) -> u64 {
        (self.protocols.bits() as u64)
            | ((self.component.as_u8() as u64) << 32)
            | ((self.reserved as u64) << 40)
            | ((self.status.bits() as u64) << 48)
    }

    /// Unpacks from the `sequence` field layout. Unknown bits are kept.
    #[must_use]
    pub const fn from_u64(packed: u64) -> Self {
        Self {
            protocols: ProtocolFlags::from_bits_retain(packed as u32),
            component: Component::new((packed >> 32) as u8),
            reserved: (packed >> 40) as u8,
            status: StatusFlags::from_bits_retain((packed >> 48) as u16),
        }
    }
}

impl Default for ClientMetadata {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<ClientMetadata> for u64 {
    fn from(metadata: ClientMetadata) -> Self {
        metadata.to_u64()
    }
}

impl From<u64> for ClientMetadata {
    fn from(packed: u64) -> Self {
        Self::from_u64(packed)
    }
}

//! Transport primitives.
//!
//! Addressing types for both transports and the mio-compatible sockets the
//! broker polls.

pub mod endpoint;
pub mod socket;

pub use endpoint::{ClientKey, ConnectionToken, DatagramAddr, WELL_KNOWN_NAME};
pub use socket::{DatagramSocket, listen_stream};

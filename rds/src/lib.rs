//! Developer-mode message broker.
//!
//! Peers connect over a local datagram socket or TCP, receive a numeric
//! identity through an out-of-band handshake, and exchange framed messages
//! addressed by identity or broadcast.
//!
//! - [`protocol`]: wire format and the control protocols
//! - [`net`]: addressing and sockets
//! - [`broker`]: the polling broker
//! - [`client`]: a blocking peer for tools and tests

pub mod broker;
pub mod client;
pub mod net;
pub mod protocol;
mod trace;

pub use broker::{Broker, BrokerConfig, BrokerError, CycleStatus};
pub use client::{ClientError, Peer};
pub use protocol::{ClientId, Message};
pub use trace::init_tracing;

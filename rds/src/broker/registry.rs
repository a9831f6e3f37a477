//! Client registry: transport key to client record.
//!
//! The registry owns every record and the stream each stream-backed record
//! holds. Removal is two-phase: records are marked while the cycle iterates,
//! then deleted by [`Registry::sweep_removed`] once iteration is done.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use thiserror::Error;

use crate::net::{ClientKey, ConnectionToken};
use crate::protocol::{ClientId, Component, StatusFlags};

/// Errors from identity assignment.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Every assignable identity has been handed out.
    #[error("client identity space exhausted")]
    IdentitySpaceExhausted,

    /// A record already exists for this key.
    #[error("client key {0} already registered")]
    KeyInUse(ClientKey),
}

/// An accepted stream connection and its cached readiness.
#[derive(Debug)]
pub struct StreamConnection {
    stream: mio::net::TcpStream,
    token: ConnectionToken,
    peer: SocketAddr,
    pub(crate) readable: bool,
}

impl StreamConnection {
    pub(crate) const fn new(
        stream: mio::net::TcpStream,
        token: ConnectionToken,
        peer: SocketAddr,
    ) -> Self {
        Self {
            stream,
            token,
            peer,
            readable: false,
        }
    }

    #[must_use]
    pub const fn token(&self) -> ConnectionToken {
        self.token
    }

    /// Remote address of the connection.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) const fn stream(&self) -> &mio::net::TcpStream {
        &self.stream
    }

    pub(crate) const fn stream_mut(&mut self) -> &mut mio::net::TcpStream {
        &mut self.stream
    }
}

/// State the broker keeps per connected peer.
#[derive(Debug)]
pub struct ClientRecord {
    id: ClientId,
    flags: StatusFlags,
    component: Component,
    stream: Option<StreamConnection>,
    removed: bool,
}

impl ClientRecord {
    const fn new(id: ClientId) -> Self {
        Self {
            id,
            flags: StatusFlags::empty(),
            component: Component::UNKNOWN,
            stream: None,
            removed: false,
        }
    }

    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// Status flags declared in the peer's ConnectRequest.
    #[must_use]
    pub const fn flags(&self) -> StatusFlags {
        self.flags
    }

    #[must_use]
    pub const fn component(&self) -> Component {
        self.component
    }

    /// The owned stream, for stream-backed peers.
    #[must_use]
    pub const fn stream(&self) -> Option<&StreamConnection> {
        self.stream.as_ref()
    }

    pub(crate) const fn stream_mut(&mut self) -> Option<&mut StreamConnection> {
        self.stream.as_mut()
    }

    /// Returns `true` once the record is marked for removal.
    #[must_use]
    pub const fn is_removed(&self) -> bool {
        self.removed
    }

    /// Records the metadata a peer declared in its handshake.
    pub fn set_metadata(&mut self, flags: StatusFlags, component: Component) {
        self.flags = flags;
        self.component = component;
    }

    /// Marks the record for removal at the next sweep.
    ///
    /// Returns `true` if the record was not already marked.
    pub fn mark_removed(&mut self) -> bool {
        !std::mem::replace(&mut self.removed, true)
    }
}

/// A record deleted by [`Registry::sweep_removed`].
#[derive(Debug)]
pub struct RemovedClient {
    pub key: ClientKey,
    pub id: ClientId,
    /// The stream, handed back so the transport can deregister it.
    pub stream: Option<StreamConnection>,
}

/// Map from transport key to client record, plus the identity counter.
#[derive(Debug)]
pub struct Registry {
    clients: BTreeMap<ClientKey, ClientRecord>,
    next_id: u16,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// An empty registry. The first identity handed out is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            clients: BTreeMap::new(),
            next_id: 1,
        }
    }

    #[cfg(test)]
    pub(crate) const fn with_next_id(next_id: u16) -> Self {
        Self {
            clients: BTreeMap::new(),
            next_id,
        }
    }

    #[must_use]
    pub fn lookup(&self, key: &ClientKey) -> Option<&ClientRecord> {
        self.clients.get(key)
    }

    pub fn lookup_mut(&mut self, key: &ClientKey) -> Option<&mut ClientRecord> {
        self.clients.get_mut(key)
    }

    /// Finds the record holding `id`, whether or not it is marked.
    pub fn find_by_id_mut(&mut self, id: ClientId) -> Option<(&ClientKey, &mut ClientRecord)> {
        self.clients.iter_mut().find(|(_, record)| record.id == id)
    }

    /// Inserts an empty record under the next sequential identity.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::KeyInUse`] if `key` is already registered
    /// - [`RegistryError::IdentitySpaceExhausted`] once identity 65534 has
    ///   been assigned
    pub fn create(&mut self, key: ClientKey) -> Result<ClientId, RegistryError> {
        if self.clients.contains_key(&key) {
            return Err(RegistryError::KeyInUse(key));
        }
        if self.next_id == u16::MAX {
            return Err(RegistryError::IdentitySpaceExhausted);
        }

        let id = ClientId::new(self.next_id);
        self.next_id += 1;
        self.clients.insert(key, ClientRecord::new(id));
        Ok(id)
    }

    /// Registers an accepted stream under its connection token.
    ///
    /// On error the connection is handed back so the caller can close it.
    pub fn create_stream(
        &mut self,
        conn: StreamConnection,
    ) -> Result<ClientId, (RegistryError, StreamConnection)> {
        let key = ClientKey::Stream(conn.token);
        match self.create(key.clone()) {
            Ok(id) => {
                if let Some(record) = self.clients.get_mut(&key) {
                    record.stream = Some(conn);
                }
                Ok(id)
            }
            Err(e) => Err((e, conn)),
        }
    }

    /// Marks the record under `key` for removal. Idempotent.
    ///
    /// Returns `true` if the record existed and was not already marked.
    pub fn mark_for_removal(&mut self, key: &ClientKey) -> bool {
        self.clients
            .get_mut(key)
            .is_some_and(ClientRecord::mark_removed)
    }

    /// Deletes every marked record, in key order.
    pub fn sweep_removed(&mut self) -> Vec<RemovedClient> {
        let keys: Vec<ClientKey> = self
            .clients
            .iter()
            .filter(|(_, record)| record.removed)
            .map(|(key, _)| key.clone())
            .collect();

        keys.into_iter()
            .filter_map(|key| {
                let record = self.clients.remove(&key)?;
                Some(RemovedClient {
                    key,
                    id: record.id,
                    stream: record.stream,
                })
            })
            .collect()
    }

    /// OR of every client's flags, with developer mode always set.
    #[must_use]
    pub fn aggregate_flags(&self) -> StatusFlags {
        self.clients
            .values()
            .fold(StatusFlags::DEVELOPER_MODE_ENABLED, |acc, record| {
                acc | record.flags
            })
    }

    /// Tokens of live stream clients whose readiness is cached as readable.
    #[must_use]
    pub fn readable_streams(&self) -> Vec<ConnectionToken> {
        self.clients
            .values()
            .filter(|record| !record.removed)
            .filter_map(|record| record.stream.as_ref())
            .filter(|conn| conn.readable)
            .map(|conn| conn.token)
            .collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ClientKey, &mut ClientRecord)> {
        self.clients.iter_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

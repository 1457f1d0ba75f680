//! Client registry
//!
//! Maps live client ids to their socket handles. Owned and accessed
//! exclusively by the proxy actor task, so it carries no locking.

use bytes::Bytes;
use portway_proto::ClientId;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Client {0} already registered")]
    DuplicateClient(ClientId),
}

/// Everything the registry owns for one accepted TCP client.
///
/// Removal from the registry is the unique point of destruction for a
/// client; the handle carries the pieces needed to tear the socket down.
#[derive(Debug)]
pub struct ClientHandle {
    /// Write side of the socket; an empty chunk is the shutdown sentinel
    pub write_tx: mpsc::Sender<Bytes>,
    pub peer_addr: SocketAddr,
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

impl ClientHandle {
    /// End the socket: half-close the write side and stop the read pump.
    ///
    /// The write pump drains queued chunks before it sees the sentinel, so
    /// bytes already accepted for this client still go out.
    pub fn shutdown(&self) {
        let _ = self.write_tx.try_send(Bytes::new());
        self.reader.abort();
    }
}

/// Live client ids and their socket handles for one proxy instance
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, ClientHandle>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    /// Register a client. Fails when the id is already present.
    pub fn insert(&mut self, client_id: ClientId, handle: ClientHandle) -> Result<(), RegistryError> {
        match self.clients.entry(client_id) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateClient(client_id)),
            Entry::Vacant(entry) => {
                entry.insert(handle);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, client_id: ClientId) -> Option<&ClientHandle> {
        self.clients.get(&client_id)
    }

    /// Detach a client. Idempotent for absent ids.
    pub fn remove(&mut self, client_id: ClientId) -> Option<ClientHandle> {
        self.clients.remove(&client_id)
    }

    /// Detach every live handle, emptying the registry. Shutdown only.
    pub fn drain(&mut self) -> Vec<ClientHandle> {
        self.clients.drain().map(|(_, handle)| handle).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use thiserror::Error;
use uuid::Uuid;
use log::{info, warn, error};

use crate::config::MAX_CONNECTIONS;
use crate::market::PriceEntry;

pub type ConnectionId = Uuid;

#[derive(Debug, Error, PartialEq)]
pub enum DeliveryError {
    #[error("client outbox is full")]
    Full,
    #[error("client disconnected")]
    Closed,
}

/// The hub's view of one streaming client: an id plus the sending half of the
/// bounded outbox that the connection's write task drains onto the socket.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ConnectionId,
    peer_addr: String,
    outbox: mpsc::Sender<String>,
}

impl ClientHandle {
    pub fn new(peer_addr: String, outbox: mpsc::Sender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_addr,
            outbox,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Never waits: a client that has not drained its outbox is treated the
    /// same as one whose transport is gone.
    fn deliver(&self, payload: &str) -> Result<(), DeliveryError> {
        self.outbox.try_send(payload.to_string()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Live set of streaming clients and the fan-out of price snapshots to them.
///
/// Delivery happens under the read lock and registration changes under the
/// write lock, so a client removed by `deregister` can never have a snapshot
/// enqueued afterwards. Clients whose delivery fails are dropped from the set,
/// which also drops their outbox sender and lets the write task shut the
/// socket.
pub struct BroadcastHub {
    clients: RwLock<HashMap<ConnectionId, ClientHandle>>,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_capacity(MAX_CONNECTIONS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Adds `client` to the live set unless the hub is at capacity, and
    /// returns whether it was added. The capacity check and the insert happen
    /// under one write lock, so concurrent callers cannot overshoot.
    /// Registering the same id again replaces the previous handle.
    pub fn register(&self, client: ClientHandle) -> bool {
        let mut clients = self.write();
        let id = client.id;
        let peer_addr = client.peer_addr().to_string();

        if clients.len() >= self.capacity && !clients.contains_key(&id) {
            warn!("Refusing client {} from {}: {} clients live", id, peer_addr, clients.len());
            return false;
        }
        if clients.insert(id, client).is_some() {
            warn!("Client {} re-registered, replacing previous handle", id);
        }
        info!("Registered streaming client {} from {} ({} live)", id, peer_addr, clients.len());
        true
    }

    /// Removes the client if present. Returns whether it was registered.
    pub fn deregister(&self, id: ConnectionId) -> bool {
        let mut clients = self.write();
        match clients.remove(&id) {
            Some(client) => {
                info!("Deregistered streaming client {} from {} ({} live)",
                      id, client.peer_addr, clients.len());
                true
            }
            None => false,
        }
    }

    /// Delivers `snapshot` to every registered client and returns how many
    /// accepted it. Failed clients are removed; the rest still get the message.
    pub fn publish(&self, snapshot: &[PriceEntry]) -> usize {
        let payload = match serde_json::to_string(snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize price snapshot: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let clients = self.read();
            for client in clients.values() {
                match client.deliver(&payload) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!("Dropping client {} from {}: {}", client.id, client.peer_addr, e);
                        failed.push(client.clone());
                    }
                }
            }
        }

        self.remove_failed(&failed);
        delivered
    }

    /// Delivers `snapshot` to a single client, removing it on failure.
    pub fn send_to(&self, id: ConnectionId, snapshot: &[PriceEntry]) -> bool {
        let payload = match serde_json::to_string(snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize price snapshot: {}", e);
                return false;
            }
        };

        let failed = {
            let clients = self.read();
            let Some(client) = clients.get(&id) else {
                return false;
            };
            match client.deliver(&payload) {
                Ok(()) => return true,
                Err(e) => {
                    warn!("Dropping client {} from {}: {}", client.id, client.peer_addr, e);
                    client.clone()
                }
            }
        };

        self.remove_failed(&[failed]);
        false
    }

    /// Drops every client. Their write tasks see the closed outbox and close
    /// the sockets.
    pub fn close_all(&self) -> usize {
        let mut clients = self.write();
        let count = clients.len();
        clients.clear();
        if count > 0 {
            info!("Closed {} streaming clients", count);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.read().len() >= self.capacity
    }

    fn remove_failed(&self, failed: &[ClientHandle]) {
        if failed.is_empty() {
            return;
        }

        let mut clients = self.write();
        for client in failed {
            // The id may have been re-registered with a fresh outbox meanwhile.
            let same = clients
                .get(&client.id)
                .is_some_and(|current| current.outbox.same_channel(&client.outbox));
            if same {
                clients.remove(&client.id);
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, ClientHandle>> {
        self.clients.read().unwrap_or_else(|poisoned| {
            error!("Client set lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, ClientHandle>> {
        self.clients.write().unwrap_or_else(|poisoned| {
            error!("Client set lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl BroadcastHub {
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.read().contains_key(&id)
    }
}

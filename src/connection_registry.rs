// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Registry
//!
//! Tracks which identities currently have a live connection so the relay can
//! broadcast presence and push new messages to online recipients.
//!
//! The registry maps each identity to at most one [`ConnectionHandle`]. A
//! second connection for the same identity replaces the first
//! (last-connect-wins). Every operation takes the registry lock exactly once,
//! so a snapshot never observes a half-applied register or deregister. The
//! lock is never held while pushing to a connection.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::identity::Identity;
use crate::protocol::ServerEvent;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique ID of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Why a push to a connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    /// The connection task has ended and dropped its receiver.
    #[error("connection closed")]
    Closed,
    /// The connection is not draining its outbound queue.
    #[error("outbound queue full")]
    Full,
}

/// Sending side of one live connection.
///
/// Pushing never blocks: a closed or saturated connection fails the push
/// immediately. A connection evicted for a failed push is told so through
/// [`ConnectionHandle::evicted`] and is expected to close itself.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<ServerEvent>,
    eviction: Arc<Notify>,
}

impl ConnectionHandle {
    /// Creates a handle with an outbound queue of `capacity` events.
    /// The connection task drains the returned receiver.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            ConnectionHandle {
                id: ConnectionId::next(),
                tx,
                eviction: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues an event for the connection.
    pub fn push(&self, event: ServerEvent) -> Result<(), PushError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
            mpsc::error::TrySendError::Full(_) => PushError::Full,
        })
    }

    /// Returns true once the connection task has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the registry has evicted this connection. An eviction
    /// that happens before anyone waits is not lost.
    pub async fn evicted(&self) {
        self.eviction.notified().await
    }
}

/// Point-in-time view of the online set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSnapshot {
    /// Incremented on every registry mutation.
    pub revision: u64,
    pub online: BTreeSet<Identity>,
}

/// Point-in-time view of every registered handle, read in one critical
/// section together with its revision.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub revision: u64,
    pub entries: Vec<(Identity, ConnectionHandle)>,
}

impl RegistrySnapshot {
    /// Online identities, sorted.
    pub fn online(&self) -> Vec<Identity> {
        let set: BTreeSet<&Identity> = self.entries.iter().map(|(id, _)| id).collect();
        set.into_iter().cloned().collect()
    }
}

#[derive(Default)]
struct Inner {
    connections: HashMap<Identity, ConnectionHandle>,
    revision: u64,
}

/// Thread-safe registry of identified connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection for `identity`, replacing any previous one.
    ///
    /// The replaced handle is dropped from the registry but its connection
    /// is left open; it will find out on its own close that it no longer
    /// owns the entry.
    pub fn register(&self, identity: Identity, handle: ConnectionHandle) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.revision += 1;
        if let Some(previous) = inner.connections.insert(identity.clone(), handle) {
            debug!(
                "Connection {:?} for {} superseded by reconnect",
                previous.id, identity
            );
        }
    }

    /// Returns the current handle for `identity`, if online.
    pub fn lookup(&self, identity: &Identity) -> Option<ConnectionHandle> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .get(identity)
            .cloned()
    }

    /// Removes `identity` if present. Removing an absent identity is a no-op.
    pub fn deregister(&self, identity: &Identity) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.connections.remove(identity).is_some() {
            inner.revision += 1;
        }
    }

    /// Removes `identity` only if it is still owned by `connection`.
    ///
    /// Used by a connection's own teardown and by stale-handle eviction so
    /// that neither can remove a newer connection for the same identity.
    /// Returns whether an entry was removed.
    pub fn deregister_connection(&self, identity: &Identity, connection: ConnectionId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let owned = inner
            .connections
            .get(identity)
            .is_some_and(|h| h.id == connection);
        if owned {
            inner.connections.remove(identity);
            inner.revision += 1;
        }
        owned
    }

    /// Evicts a connection whose push failed.
    ///
    /// Removes `identity` if `handle` still owns it, and signals the
    /// connection to close whether or not it was still registered.
    /// Returns whether an entry was removed.
    pub fn evict(&self, identity: &Identity, handle: &ConnectionHandle) -> bool {
        let removed = self.deregister_connection(identity, handle.id);
        handle.eviction.notify_one();
        removed
    }

    /// Returns the current online set.
    pub fn snapshot(&self) -> PresenceSnapshot {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        PresenceSnapshot {
            revision: inner.revision,
            online: inner.connections.keys().cloned().collect(),
        }
    }

    /// Returns every registered handle with the revision it was read at.
    pub fn handles(&self) -> RegistrySnapshot {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        RegistrySnapshot {
            revision: inner.revision,
            entries: inner
                .connections
                .iter()
                .map(|(id, h)| (id.clone(), h.clone()))
                .collect(),
        }
    }

    /// Returns the number of currently registered identities.
    pub fn connected_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .len()
    }
}

// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Lifecycle Manager
//!
//! Each connection moves `Connecting -> Open -> Closed`. Opening an
//! identified connection registers it and announces presence; closing it
//! deregisters it and announces again. Anonymous connections pass through
//! the same states without ever touching the registry.
//!
//! [`ConnectionLifecycle`] closes itself on drop, so a connection task that
//! ends by any path (error, panic unwind, cancellation) still deregisters.

use std::sync::Arc;

use tracing::debug;

use crate::connection_registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};
use crate::identity::Identity;
use crate::presence::{AnnounceReport, PresenceBroadcaster};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Creates per-connection lifecycles bound to one registry and broadcaster.
#[derive(Clone)]
pub struct LifecycleManager {
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<PresenceBroadcaster>,
}

impl LifecycleManager {
    pub fn new(registry: Arc<ConnectionRegistry>, broadcaster: Arc<PresenceBroadcaster>) -> Self {
        LifecycleManager {
            registry,
            broadcaster,
        }
    }

    /// Starts tracking a connection whose identity (if any) has been
    /// resolved from its handshake.
    pub fn connecting(&self, identity: Option<Identity>, handle: ConnectionHandle) -> ConnectionLifecycle {
        ConnectionLifecycle {
            state: ConnectionState::Connecting,
            identity,
            handle,
            registry: self.registry.clone(),
            broadcaster: self.broadcaster.clone(),
        }
    }
}

/// Lifecycle of one connection.
pub struct ConnectionLifecycle {
    state: ConnectionState,
    identity: Option<Identity>,
    handle: ConnectionHandle,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<PresenceBroadcaster>,
}

impl ConnectionLifecycle {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.handle.id()
    }

    /// `Connecting -> Open`. Registers and announces an identified
    /// connection; returns the announcement report, or `None` when nothing
    /// was announced (anonymous, or not in `Connecting`).
    pub fn open(&mut self) -> Option<AnnounceReport> {
        if self.state != ConnectionState::Connecting {
            return None;
        }
        self.state = ConnectionState::Open;

        let identity = self.identity.clone()?;
        debug!("Registering {} as {:?}", identity, self.handle.id());
        self.registry.register(identity, self.handle.clone());
        Some(self.broadcaster.announce())
    }

    /// `-> Closed`. Deregisters an identified connection that was opened and
    /// announces the new online set. Closing twice is a no-op.
    ///
    /// A connection superseded by a reconnect leaves the registry untouched;
    /// the announcement still goes out.
    pub fn close(&mut self) -> Option<AnnounceReport> {
        let was_open = self.state == ConnectionState::Open;
        if self.state == ConnectionState::Closed {
            return None;
        }
        self.state = ConnectionState::Closed;

        if !was_open {
            return None;
        }
        let identity = self.identity.as_ref()?;
        if !self.registry.deregister_connection(identity, self.handle.id()) {
            debug!("{:?} for {} already superseded", self.handle.id(), identity);
        }
        Some(self.broadcaster.announce())
    }
}

impl Drop for ConnectionLifecycle {
    fn drop(&mut self) {
        self.close();
    }
}

// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Presence Broadcaster
//!
//! Pushes the full online set to every registered connection whenever the
//! registry changes. Pushes are best-effort: a failed push never stops the
//! broadcast, and the failed connection is evicted from the registry
//! before the broadcast returns.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::connection_registry::ConnectionRegistry;
use crate::protocol::{PresenceChanged, ServerEvent};

/// Outcome of one [`PresenceBroadcaster::announce`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnounceReport {
    /// Pushes attempted, across all rounds.
    pub attempted: usize,
    /// Pushes accepted by their connection.
    pub delivered: usize,
    /// Identities removed from the registry because their push failed.
    pub evicted: usize,
    /// Revision of the last online set announced.
    pub revision: u64,
}

pub struct PresenceBroadcaster {
    registry: Arc<ConnectionRegistry>,
    // Serializes announcements so revisions reach each connection in order.
    announce_lock: Mutex<()>,
}

impl PresenceBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        PresenceBroadcaster {
            registry,
            announce_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Announces the current online set to every registered connection.
    ///
    /// Connections whose push fails are deregistered, and the survivors
    /// then receive a fresh announcement without them. Rounds repeat until
    /// one completes without evictions, so no broken connection outlives
    /// the call.
    pub fn announce(&self) -> AnnounceReport {
        let _serial = self
            .announce_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut report = AnnounceReport::default();
        loop {
            let snapshot = self.registry.handles();
            let event = ServerEvent::PresenceChanged(PresenceChanged {
                revision: snapshot.revision,
                online: snapshot.online(),
            });
            report.revision = snapshot.revision;

            let mut evicted_this_round = 0;
            for (identity, handle) in &snapshot.entries {
                report.attempted += 1;
                match handle.push(event.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        warn!("Presence push to {} failed ({}), evicting", identity, e);
                        if self.registry.evict(identity, handle) {
                            evicted_this_round += 1;
                        }
                    }
                }
            }

            report.evicted += evicted_this_round;
            if evicted_this_round == 0 {
                break;
            }
        }

        debug!(
            "Presence revision {} announced: {}/{} pushes, {} evicted",
            report.revision, report.delivered, report.attempted, report.evicted
        );
        report
    }
}

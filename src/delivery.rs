// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Delivery Router
//!
//! At-most-once live push of an already persisted message to its
//! recipient. There is no retry and no queue: an offline recipient reads
//! the message later through the history path.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection_registry::ConnectionRegistry;
use crate::identity::Identity;
use crate::message_store::ChatMessage;
use crate::presence::PresenceBroadcaster;
use crate::protocol::{MessageReceived, ServerEvent};

/// What happened to a delivery attempt. None of these are errors to the
/// caller; they exist for metrics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Pushed to the recipient's connection.
    Delivered,
    /// Recipient has no live connection.
    Offline,
    /// The push failed; the stale connection was evicted.
    Failed,
}

pub struct DeliveryRouter {
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<PresenceBroadcaster>,
}

impl DeliveryRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, broadcaster: Arc<PresenceBroadcaster>) -> Self {
        DeliveryRouter {
            registry,
            broadcaster,
        }
    }

    /// Pushes `message` to `recipient` if it is online.
    ///
    /// `message` must already be persisted.
    pub fn deliver(&self, recipient: &Identity, message: &ChatMessage) -> DeliveryOutcome {
        let Some(handle) = self.registry.lookup(recipient) else {
            debug!("Recipient {} offline, message {} stored only", recipient, message.id);
            return DeliveryOutcome::Offline;
        };

        let event = ServerEvent::MessageReceived(MessageReceived {
            message: message.clone(),
        });
        match handle.push(event) {
            Ok(()) => {
                debug!("Message {} delivered to {}", message.id, recipient);
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                warn!(
                    "Delivery of {} to {} failed ({}), evicting",
                    message.id, recipient, e
                );
                if self.registry.evict(recipient, &handle) {
                    self.broadcaster.announce();
                }
                DeliveryOutcome::Failed
            }
        }
    }
}

// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Message Send and History
//!
//! The send path validates a request, uploads its image, persists the
//! message and only then hands it to the [`DeliveryRouter`]. A message that
//! failed to persist is never delivered.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::delivery::{DeliveryOutcome, DeliveryRouter};
use crate::error::{SendError, StoreError};
use crate::identity::Identity;
use crate::image_store::{parse_data_url, ImageStore};
use crate::message_store::{ChatMessage, MessageStore, NewMessage};
use crate::metrics::RelayMetrics;
use crate::protocol::SendMessage;
use crate::rate_limit::RateLimiter;

#[derive(Debug, Clone, Copy)]
pub struct MessageLimits {
    /// Characters.
    pub max_text_len: usize,
    /// Decoded bytes.
    pub max_image_bytes: usize,
    pub history_limit: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        MessageLimits {
            max_text_len: 4000,
            max_image_bytes: 5 * 1024 * 1024,
            history_limit: 500,
        }
    }
}

/// A persisted message and what happened to its live delivery.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message: ChatMessage,
    pub delivery: DeliveryOutcome,
}

pub struct MessageService {
    store: Arc<dyn MessageStore>,
    images: Arc<dyn ImageStore>,
    router: Arc<DeliveryRouter>,
    limiter: Arc<RateLimiter>,
    metrics: RelayMetrics,
    limits: MessageLimits,
}

impl MessageService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        images: Arc<dyn ImageStore>,
        router: Arc<DeliveryRouter>,
        limiter: Arc<RateLimiter>,
        metrics: RelayMetrics,
        limits: MessageLimits,
    ) -> Self {
        MessageService {
            store,
            images,
            router,
            limiter,
            metrics,
            limits,
        }
    }

    /// Stores a message and delivers it to its recipient if online.
    pub fn send(
        &self,
        sender: Option<&Identity>,
        request: SendMessage,
    ) -> Result<SendReceipt, SendError> {
        let message = self.store_message(sender, request)?;
        let delivery = self.deliver(&message);
        Ok(SendReceipt { message, delivery })
    }

    /// Validates and persists a send request without delivering it.
    ///
    /// The caller acknowledges the sender and then passes the returned
    /// message to [`MessageService::deliver`].
    pub fn store_message(
        &self,
        sender: Option<&Identity>,
        request: SendMessage,
    ) -> Result<ChatMessage, SendError> {
        let started = Instant::now();
        let result = self.persist(sender, request);
        self.metrics
            .send_duration
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(ref message) => {
                self.metrics.messages_persisted.inc();
                debug!(
                    "Stored message {} from {} to {}",
                    message.id, message.sender_id, message.receiver_id
                );
            }
            Err(SendError::RateLimited) => self.metrics.rate_limited.inc(),
            Err(SendError::Store(ref e)) => {
                self.metrics.sends_rejected.inc();
                error!("Failed to persist message: {}", e);
            }
            Err(ref e) => {
                self.metrics.sends_rejected.inc();
                debug!("Send rejected: {}", e);
            }
        }
        result
    }

    fn persist(
        &self,
        sender: Option<&Identity>,
        request: SendMessage,
    ) -> Result<ChatMessage, SendError> {
        let sender = sender.ok_or(SendError::Anonymous)?;
        if !self.limiter.consume(sender) {
            return Err(SendError::RateLimited);
        }

        let text = request.text.filter(|t| !t.trim().is_empty());
        let image = request.image.filter(|i| !i.is_empty());
        if text.is_none() && image.is_none() {
            return Err(SendError::Empty);
        }
        if let Some(ref text) = text {
            let len = text.chars().count();
            if len > self.limits.max_text_len {
                return Err(SendError::TextTooLong {
                    len,
                    max: self.limits.max_text_len,
                });
            }
        }

        let image_url = match image {
            Some(data_url) => {
                let (content_type, data) = parse_data_url(&data_url, self.limits.max_image_bytes)?;
                Some(self.images.upload(&content_type, data)?)
            }
            None => None,
        };

        let stored = self.store.persist(NewMessage {
            sender_id: sender.clone(),
            receiver_id: request.receiver_id,
            text,
            image: image_url.clone(),
        });
        if stored.is_err() {
            // No message will ever reference the upload.
            if let Some(ref url) = image_url {
                self.images.remove(url);
            }
        }
        Ok(stored?)
    }

    /// Live-delivers a persisted message to its receiver.
    pub fn deliver(&self, message: &ChatMessage) -> DeliveryOutcome {
        let outcome = self.router.deliver(&message.receiver_id, message);
        if outcome == DeliveryOutcome::Failed {
            warn!("Live delivery of {} failed; kept in history", message.id);
        }
        self.metrics.record_delivery(outcome);
        outcome
    }

    /// Conversation between `requester` and `with`, oldest first.
    ///
    /// `limit` is capped at the configured history limit.
    pub fn history(
        &self,
        requester: &Identity,
        with: &Identity,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let limit = limit
            .unwrap_or(self.limits.history_limit)
            .min(self.limits.history_limit);
        self.store.conversation(requester, with, limit)
    }
}

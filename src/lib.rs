// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod config;
pub mod connection_registry;
pub mod delivery;
pub mod error;
pub mod handler;
pub mod http;
pub mod identity;
pub mod image_store;
pub mod lifecycle;
pub mod message_store;
pub mod messaging;
pub mod metrics;
pub mod presence;
pub mod protocol;
pub mod rate_limit;

/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::Arc;

use crate::config::Config;

pub mod auth;
pub mod config;
pub mod core;
pub mod listener;
pub mod master;
pub mod op;
pub mod registry;

/// Process-wide settings snapshot, read-only after boot.
pub struct ImapGate {
    pub capability_base: String,
    pub greeting: String,
    pub greeting_capability: bool,
    pub verbose_proctitle: bool,
    pub disable_plaintext_auth: bool,
}

impl ImapGate {
    pub fn init(config: &Config) -> Arc<Self> {
        Arc::new(ImapGate {
            capability_base: config.server.capability.clone(),
            greeting: config.server.greeting.clone(),
            greeting_capability: config.server.greeting_capability,
            verbose_proctitle: config.server.verbose_proctitle,
            disable_plaintext_auth: config.auth.disable_plaintext_auth,
        })
    }
}

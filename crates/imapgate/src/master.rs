/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::core::SessionStream;

/// A fully authenticated connection leaving the gateway: the owned client
/// stream plus the identity the authentication service established.
pub struct Handoff {
    pub stream: Box<dyn SessionStream>,
    pub user: String,
    pub mechanism: String,
    pub peer: IpAddr,
    pub session_id: u64,
}

/// Backend that takes over authenticated connections. Aborting an in-flight
/// handoff is dropping the future; the registry kill signal delivers that.
#[async_trait]
pub trait Master: Send + Sync + 'static {
    async fn handoff(&self, handoff: Handoff) -> std::io::Result<()>;
}

/// Relays the authenticated connection to a backend address, byte for byte
/// in both directions, until either side closes.
pub struct TcpMaster {
    backend: SocketAddr,
}

impl TcpMaster {
    pub fn new(backend: SocketAddr) -> Self {
        TcpMaster { backend }
    }
}

#[async_trait]
impl Master for TcpMaster {
    async fn handoff(&self, mut handoff: Handoff) -> std::io::Result<()> {
        let mut backend = TcpStream::connect(self.backend).await?;
        tracing::debug!(
            context = "master",
            event = "handoff",
            user = %handoff.user,
            mechanism = %handoff.mechanism,
            backend = %self.backend,
            "Relaying authenticated connection."
        );
        tokio::io::copy_bidirectional(&mut handoff.stream, &mut backend).await?;
        Ok(())
    }
}

/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{borrow::Cow, net::IpAddr, sync::Arc};

use imapgate_proto::{receiver::Receiver, Command};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf},
    net::TcpStream,
    sync::{mpsc, watch},
};
use tokio_rustls::server::TlsStream;

use crate::{
    auth::{AuthClient, AuthHandle},
    listener::{ServerInstance, SessionPermit},
    master::Master,
    registry::{ClientHandle, Clients, Disconnect},
    ImapGate,
};

pub mod client;
pub mod session;
pub mod writer;

/// Max size of one read, and of data staged while the auth service is down;
/// also the largest single parameter a command line may carry.
pub const MAX_INBUF_SIZE: usize = 4096;

/// Max size of one corked output batch. SASL challenges give the largest
/// output; a batch beyond this disconnects the client.
pub const MAX_OUTBUF_SIZE: usize = 4096;

pub trait SessionStream:
    AsyncRead + AsyncWrite + Unpin + Sync + Send + 'static
{
    fn is_tls(&self) -> bool;
}

impl SessionStream for TcpStream {
    fn is_tls(&self) -> bool {
        false
    }
}

impl<T: SessionStream> SessionStream for TlsStream<T> {
    fn is_tls(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct GateSessionManager {
    pub gate: Arc<ImapGate>,
    pub clients: Arc<Clients>,
    pub auth: AuthClient,
    pub master: Arc<dyn Master>,
}

impl GateSessionManager {
    pub fn new(
        gate: Arc<ImapGate>,
        clients: Arc<Clients>,
        auth: AuthClient,
        master: Arc<dyn Master>,
    ) -> Self {
        Self {
            gate,
            clients,
            auth,
            master,
        }
    }
}

/// One pre-login connection. Generic over the stream so the same protocol
/// logic runs before and after the STARTTLS upgrade; the upgrade itself
/// rebuilds the session on the TLS stream.
pub struct Session<T: SessionStream> {
    pub gate: Arc<ImapGate>,
    pub instance: Arc<ServerInstance>,
    pub clients: Arc<Clients>,
    pub auth: AuthClient,
    pub master: Arc<dyn Master>,
    pub handle: Arc<ClientHandle>,
    pub receiver: Receiver<Command>,
    pub bad_commands: u32,
    pub pending_auth: Option<PendingAuth>,
    pub is_tls: bool,
    pub secured: bool,
    pub writer: mpsc::Sender<writer::Event>,
    pub out_buf: Vec<u8>,
    pub stream_rx: ReadHalf<T>,
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
    pub killed: watch::Receiver<Option<Disconnect>>,
    pub permit: SessionPermit,
    pub span: tracing::Span,
}

/// An outstanding SASL exchange with the auth service. While one exists the
/// session accepts only raw continuation lines.
pub struct PendingAuth {
    pub handle: AuthHandle,
    pub tag: String,
    pub mechanism: String,
    pub user: Option<String>,
}

pub enum SessionAction {
    Continue,
    UpgradeTls,
    Handoff { user: String, mechanism: String },
    /// Tear the session down; the reason, if any, is logged.
    Close(Option<Cow<'static, str>>),
}

/// Loopback peers count as secured even over cleartext: IPv4 127.0.0.0/8
/// and IPv6 ::1.
pub(crate) fn is_loopback(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.octets()[0] == 127,
        IpAddr::V6(addr) => *addr == std::net::Ipv6Addr::LOCALHOST,
    }
}

#[cfg(test)]
mod tests {
    use super::is_loopback;

    #[test]
    fn loopback_detection() {
        for (addr, expected) in [
            ("127.0.0.1", true),
            ("127.255.0.7", true),
            ("::1", true),
            ("10.0.0.1", false),
            ("2001:db8::1", false),
        ] {
            assert_eq!(is_loopback(&addr.parse().unwrap()), expected, "{}", addr);
        }
    }
}

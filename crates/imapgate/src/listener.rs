/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tokio::sync::watch;

pub struct ServerInstance {
    pub id: String,
    pub acceptor: Option<TlsAcceptor>,
    pub is_tls_implicit: bool,
    pub max_sessions: u64,
    active_sessions: AtomicU64,
    pub shutdown_rx: watch::Receiver<bool>,
}

impl ServerInstance {
    /// True when TLS material was configured at boot; gates STARTTLS in the
    /// capability banner and in command dispatch.
    pub fn tls_available(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Claims a session slot, or refuses when the listener is at capacity.
    /// The slot is freed when the permit drops with the session task.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SessionPermit> {
        if self.active_sessions.fetch_add(1, Ordering::Relaxed) < self.max_sessions {
            Some(SessionPermit {
                instance: self.clone(),
            })
        } else {
            self.active_sessions.fetch_sub(1, Ordering::Relaxed);
            None
        }
    }

    pub async fn tls_accept(
        &self,
        stream: TcpStream,
        span: &tracing::Span,
    ) -> Result<TlsStream<TcpStream>, ()> {
        let acceptor = self.acceptor.as_ref().ok_or(())?;
        match acceptor.accept(stream).await {
            Ok(stream) => Ok(stream),
            Err(err) => {
                tracing::debug!(
                    parent: span,
                    context = "tls",
                    event = "error",
                    reason = %err,
                    "Failed to accept TLS connection."
                );
                Err(())
            }
        }
    }
}

pub struct SessionPermit {
    instance: Arc<ServerInstance>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.instance.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct SessionData<T> {
    pub stream: T,
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
    pub span: tracing::Span,
    pub permit: SessionPermit,
    pub instance: Arc<ServerInstance>,
}

pub trait SessionManager: Sync + Send + 'static + Clone {
    fn spawn(&self, session: SessionData<TcpStream>);
    fn max_concurrent(&self) -> u64;
}

pub struct Server {
    pub id: String,
    pub addr: SocketAddr,
    pub is_tls_implicit: bool,
}

impl Server {
    /// Binds the listener and spawns the accept loop. Returns the bound
    /// address so callers using port 0 can learn the ephemeral port.
    pub async fn spawn(
        self,
        acceptor: Option<TlsAcceptor>,
        manager: impl SessionManager,
        shutdown_rx: watch::Receiver<bool>,
    ) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        let local_ip = local_addr.ip();

        let instance = Arc::new(ServerInstance {
            id: self.id,
            acceptor,
            is_tls_implicit: self.is_tls_implicit,
            max_sessions: manager.max_concurrent(),
            active_sessions: AtomicU64::new(0),
            shutdown_rx,
        });

        tracing::info!(
            id = instance.id,
            bind.ip = local_addr.ip().to_string(),
            bind.port = local_addr.port(),
            tls = instance.is_tls_implicit,
            "Starting listener"
        );

        let mut shutdown_rx = instance.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    stream = listener.accept() => {
                        match stream {
                            Ok((stream, remote_addr)) => {
                                if let Some(permit) = instance.try_acquire() {
                                    let span = tracing::info_span!(
                                        "session",
                                        instance = instance.id,
                                        remote.ip = remote_addr.ip().to_string(),
                                        remote.port = remote_addr.port(),
                                    );

                                    manager.spawn(SessionData {
                                        stream,
                                        local_ip,
                                        remote_ip: remote_addr.ip(),
                                        span,
                                        permit,
                                        instance: instance.clone(),
                                    });
                                } else {
                                    tracing::info!(
                                        context = "throttle",
                                        event = "too-many-requests",
                                        instance = instance.id,
                                        remote.ip = remote_addr.ip().to_string(),
                                        max_sessions = instance.max_sessions,
                                        "Too many concurrent connections."
                                    );
                                }
                            }
                            Err(err) => {
                                tracing::debug!(
                                    context = "io",
                                    event = "error",
                                    instance = instance.id,
                                    "Failed to accept TCP connection: {}", err);
                            }
                        }
                    },
                    _ = shutdown_rx.changed() => {
                        tracing::debug!(
                            event = "shutdown",
                            instance = instance.id,
                            "Listener shutting down.");
                        break;
                    }
                };
            }
        });

        Ok(local_addr)
    }
}

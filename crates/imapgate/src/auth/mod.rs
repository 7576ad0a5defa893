/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
    sync::{mpsc, watch},
};

use self::proto::{AuthParameters, ServerLine};

pub mod proto;
pub mod sasl;

/// Upper bound on one authentication attempt. Must stay above the client
/// idle timeout, otherwise the registry sweep could orphan an attempt that
/// the service is still working on.
pub const AUTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(150);

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mechanism {
    pub name: String,
    pub plaintext: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthReply {
    /// The service wants more data from the client; the payload is the
    /// base64 challenge to forward.
    Continue(String),
    Success {
        user: String,
    },
    Failure {
        reason: Option<String>,
    },
    /// Service connection lost or attempt timed out; the session must not
    /// tell the client whether the credentials were valid.
    InternalFailure,
}

/// Broker for the out-of-process authentication service. Holds one
/// connection at a time, reconnecting with a fixed delay, and multiplexes
/// attempts from all sessions over it by request id.
#[derive(Clone)]
pub struct AuthClient {
    inner: Arc<Inner>,
}

struct Inner {
    connected_tx: watch::Sender<bool>,
    mechanisms: RwLock<Vec<Mechanism>>,
    pending: DashMap<u32, mpsc::Sender<AuthReply>>,
    write_tx: RwLock<Option<mpsc::Sender<String>>>,
    next_id: AtomicU32,
    request_timeout: Duration,
}

impl AuthClient {
    pub fn spawn(
        socket_path: PathBuf,
        request_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let client = AuthClient {
            inner: Arc::new(Inner {
                connected_tx: watch::channel(false).0,
                mechanisms: RwLock::new(Vec::new()),
                pending: DashMap::new(),
                write_tx: RwLock::new(None),
                next_id: AtomicU32::new(1),
                request_timeout,
            }),
        };
        let conn = client.clone();
        tokio::spawn(async move {
            conn.run(socket_path, shutdown_rx).await;
        });
        client
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.inner.connected_tx.subscribe()
    }

    /// Mechanisms to advertise; plaintext mechanisms are withheld when the
    /// transport does not permit them.
    pub fn mechanisms(&self, include_plaintext: bool) -> Vec<String> {
        self.inner
            .mechanisms
            .read()
            .iter()
            .filter(|mechanism| include_plaintext || !mechanism.plaintext)
            .map(|mechanism| mechanism.name.clone())
            .collect()
    }

    pub fn mechanism(&self, name: &str) -> Option<Mechanism> {
        self.inner
            .mechanisms
            .read()
            .iter()
            .find(|mechanism| mechanism.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Begins an attempt. Fails only when the service connection is down,
    /// which callers are expected to have ruled out via `is_connected`.
    pub async fn submit(&self, params: AuthParameters) -> Option<AuthHandle> {
        let write_tx = self.inner.write_tx.read().clone()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(8);
        self.inner.pending.insert(id, tx);
        if write_tx.send(proto::format_auth(id, &params)).await.is_err() {
            self.inner.pending.remove(&id);
            return None;
        }
        Some(AuthHandle {
            id,
            rx,
            client: self.clone(),
        })
    }

    async fn run(self, socket_path: PathBuf, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            match UnixStream::connect(&socket_path).await {
                Ok(stream) => {
                    if let Err(err) = self.serve_connection(stream, &mut shutdown_rx).await {
                        tracing::warn!(
                            context = "auth",
                            event = "error",
                            reason = %err,
                            "Authentication service connection failed."
                        );
                    }
                    self.disconnected();
                }
                Err(err) => {
                    tracing::debug!(
                        context = "auth",
                        event = "connect-error",
                        path = %socket_path.display(),
                        reason = %err,
                        "Cannot reach authentication service."
                    );
                }
            }

            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown_rx.changed() => break,
            }
        }
    }

    async fn serve_connection(
        &self,
        stream: UnixStream,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let (rx, mut tx) = stream.into_split();
        tx.write_all(proto::format_handshake(std::process::id()).as_bytes())
            .await?;

        let (write_tx, mut write_rx) = mpsc::channel::<String>(128);
        tokio::spawn(async move {
            while let Some(line) = write_rx.recv().await {
                if tx.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut lines = BufReader::new(rx).lines();
        let mut mechanisms = Vec::new();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        return Ok(());
                    };
                    match proto::parse_server_line(&line) {
                        Some(ServerLine::Version { major, .. }) => {
                            if major != proto::AUTH_PROTOCOL_MAJOR {
                                return Err(std::io::Error::new(
                                    std::io::ErrorKind::InvalidData,
                                    format!("unsupported auth protocol version {}", major),
                                ));
                            }
                        }
                        Some(ServerLine::Mech { name, plaintext }) => {
                            mechanisms.push(Mechanism { name, plaintext });
                        }
                        Some(ServerLine::Done) => {
                            *self.inner.mechanisms.write() = std::mem::take(&mut mechanisms);
                            *self.inner.write_tx.write() = Some(write_tx.clone());
                            let _ = self.inner.connected_tx.send(true);
                            tracing::info!(
                                context = "auth",
                                event = "connected",
                                "Authentication service connected."
                            );
                        }
                        Some(ServerLine::Cont { id, data }) => {
                            self.route(id, AuthReply::Continue(data), false).await;
                        }
                        Some(ServerLine::Ok { id, user }) => {
                            self.route(
                                id,
                                AuthReply::Success {
                                    user: user.unwrap_or_default(),
                                },
                                true,
                            )
                            .await;
                        }
                        Some(ServerLine::Fail { id, reason, temporary }) => {
                            let reply = if temporary {
                                AuthReply::InternalFailure
                            } else {
                                AuthReply::Failure { reason }
                            };
                            self.route(id, reply, true).await;
                        }
                        Some(ServerLine::Ignored) => {}
                        None => {
                            tracing::debug!(
                                context = "auth",
                                event = "protocol-error",
                                line = %line,
                                "Unrecognized line from authentication service."
                            );
                        }
                    }
                }
                _ = shutdown_rx.changed() => return Ok(()),
            }
        }
    }

    async fn route(&self, id: u32, reply: AuthReply, last: bool) {
        let sender = if last {
            self.inner.pending.remove(&id).map(|(_, tx)| tx)
        } else {
            self.inner.pending.get(&id).map(|tx| tx.clone())
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(reply).await;
            }
            None => {
                // Aborted attempt; the service does not know yet.
                tracing::debug!(
                    context = "auth",
                    event = "stale-reply",
                    id = id,
                    "Reply for an aborted request."
                );
            }
        }
    }

    fn disconnected(&self) {
        *self.inner.write_tx.write() = None;
        self.inner.mechanisms.write().clear();
        let _ = self.inner.connected_tx.send(false);

        let stale: Vec<u32> = self
            .inner
            .pending
            .iter()
            .map(|entry| *entry.key())
            .collect();
        for id in stale {
            if let Some((_, tx)) = self.inner.pending.remove(&id) {
                let _ = tx.try_send(AuthReply::InternalFailure);
            }
        }
    }
}

/// One in-flight attempt. Dropping the handle aborts it.
pub struct AuthHandle {
    id: u32,
    rx: mpsc::Receiver<AuthReply>,
    client: AuthClient,
}

impl AuthHandle {
    pub async fn next_reply(&mut self) -> AuthReply {
        match tokio::time::timeout(self.client.inner.request_timeout, self.rx.recv()).await {
            Ok(Some(reply)) => reply,
            Ok(None) => AuthReply::InternalFailure,
            Err(_) => {
                tracing::warn!(
                    context = "auth",
                    event = "timeout",
                    id = self.id,
                    "Authentication request timed out."
                );
                AuthReply::InternalFailure
            }
        }
    }

    pub async fn submit_continuation(&self, data: &str) -> bool {
        let write_tx = self.client.inner.write_tx.read().clone();
        match write_tx {
            Some(tx) => tx.send(proto::format_cont(self.id, data)).await.is_ok(),
            None => false,
        }
    }

    /// Safe to call more than once; a reply that races in is discarded.
    pub fn abort(&self) {
        self.client.inner.pending.remove(&self.id);
    }
}

impl Drop for AuthHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

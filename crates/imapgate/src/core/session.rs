/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{borrow::Cow, sync::atomic::Ordering};

use imapgate_proto::{receiver::Receiver, ResponseCode, StatusResponse};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::oneshot,
};
use tokio_rustls::server::TlsStream;

use crate::{
    listener::{ServerInstance, SessionData, SessionManager},
    master::Handoff,
    op::capability::capabilities,
    registry::CLIENT_DESTROY_OLDEST_COUNT,
};

use super::{
    is_loopback, writer, GateSessionManager, Session, SessionAction, SessionStream,
    MAX_INBUF_SIZE,
};

impl SessionManager for GateSessionManager {
    fn spawn(&self, session: SessionData<TcpStream>) {
        let manager = self.clone();

        tokio::spawn(async move {
            if session.instance.is_tls_implicit {
                if let Ok(session) = Session::<TlsStream<TcpStream>>::new(session, manager).await {
                    session.handle_conn().await;
                }
            } else if let Ok(session) = Session::<TcpStream>::new(session, manager).await {
                session.handle_conn().await;
            }
        });
    }

    fn max_concurrent(&self) -> u64 {
        if self.clients.max_logging_users > 0 {
            (self.clients.max_logging_users + CLIENT_DESTROY_OLDEST_COUNT) as u64
        } else {
            8192
        }
    }
}

fn greeting(
    manager: &GateSessionManager,
    instance: &ServerInstance,
    is_tls: bool,
    secured: bool,
) -> Vec<u8> {
    let gate = &manager.gate;
    let response = StatusResponse::ok(gate.greeting.clone());
    if gate.greeting_capability {
        response.with_code(ResponseCode::Capability {
            capabilities: capabilities(
                gate,
                &manager.auth,
                instance.tls_available(),
                is_tls,
                secured,
            )
            .serialize(),
        })
    } else {
        response
    }
    .into_bytes()
}

impl<T: SessionStream> Session<T> {
    pub async fn handle_conn_(&mut self) -> SessionAction {
        let mut buf = vec![0; MAX_INBUF_SIZE];
        let mut shutdown_rx = self.instance.shutdown_rx.clone();
        let mut killed = self.killed.clone();
        let mut auth_ready = self.auth.connected_watch();
        let mut blocked_input: Vec<u8> = Vec::new();

        // A kill that raced session construction would otherwise be missed.
        if let Some(disconnect) = *killed.borrow_and_update() {
            return SessionAction::Close(disconnect.reason().map(Cow::Borrowed));
        }

        loop {
            tokio::select! {
                result = self.stream_rx.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!(parent: &self.span, event = "close", "Connection closed by client.");
                            return SessionAction::Close(Some("Disconnected".into()));
                        }
                        Ok(bytes_read) => {
                            self.handle.touch(self.clients.now());
                            if !self.auth.is_connected() {
                                // No commands until the auth process is back.
                                if !self.handle.input_blocked.swap(true, Ordering::Relaxed)
                                    && self
                                        .write_now(
                                            &b"* OK Waiting for authentication process to respond..\r\n"[..],
                                        )
                                        .await
                                        .is_err()
                                {
                                    return SessionAction::Close(Some("Disconnected".into()));
                                }
                                if blocked_input.len() + bytes_read > MAX_INBUF_SIZE {
                                    let _ = self
                                        .write_now(&b"* BYE Input buffer full, aborting\r\n"[..])
                                        .await;
                                    return SessionAction::Close(Some(
                                        "Disconnected: Input buffer full".into(),
                                    ));
                                }
                                blocked_input.extend_from_slice(&buf[..bytes_read]);
                                continue;
                            }
                            // Bytes staged while the auth service was down
                            // stay ahead of the new ones.
                            let action = if !blocked_input.is_empty() {
                                self.handle.input_blocked.store(false, Ordering::Relaxed);
                                blocked_input.extend_from_slice(&buf[..bytes_read]);
                                let staged = std::mem::take(&mut blocked_input);
                                self.ingest(&staged).await
                            } else {
                                self.ingest(&buf[..bytes_read]).await
                            };
                            match action {
                                SessionAction::Continue => {}
                                action => return action,
                            }
                        }
                        Err(err) => {
                            tracing::debug!(parent: &self.span, event = "error", reason = %err, "Connection error.");
                            return SessionAction::Close(Some("Disconnected".into()));
                        }
                    }
                },
                _ = auth_ready.changed() => {
                    if self.auth.is_connected()
                        && self.handle.input_blocked.swap(false, Ordering::Relaxed)
                    {
                        let staged = std::mem::take(&mut blocked_input);
                        match self.ingest(&staged).await {
                            SessionAction::Continue => {}
                            action => return action,
                        }
                    }
                },
                _ = killed.changed() => {
                    let disconnect = *killed.borrow_and_update();
                    if let Some(disconnect) = disconnect {
                        if let Some(bye) = disconnect.bye_line() {
                            let _ = self.write_now(bye).await;
                        }
                        return SessionAction::Close(disconnect.reason().map(Cow::Borrowed));
                    }
                },
                _ = shutdown_rx.changed() => {
                    return SessionAction::Close(None);
                }
            };
        }
    }

    pub async fn destroy(mut self, reason: Option<Cow<'static, str>>) {
        if let Some(reason) = &reason {
            tracing::info!(
                parent: &self.span,
                event = "disconnect",
                reason = %reason,
                "Client disconnected."
            );
        }
        if let Some(pending) = self.pending_auth.take() {
            pending.handle.abort();
        }
        self.clients.remove(self.handle.id);
        // Dropping the read half and the writer channel closes the socket
        // and stops the writer task.
    }
}

impl Session<TcpStream> {
    pub async fn new(
        mut session: SessionData<TcpStream>,
        manager: GateSessionManager,
    ) -> Result<Session<TcpStream>, ()> {
        let is_tls = session.stream.is_tls();
        let secured = is_tls || is_loopback(&session.remote_ip);
        let handle = manager.clients.admit(session.remote_ip);

        if manager.gate.verbose_proctitle {
            tracing::info!(
                parent: &session.span,
                event = "connect",
                tls = is_tls,
                secured = secured,
                "Client connected."
            );
        }

        let greeting = greeting(&manager, &session.instance, is_tls, secured);
        if let Err(err) = session.stream.write_all(&greeting).await {
            tracing::debug!(parent: &session.span, event = "error", reason = %err, "Failed to write greeting.");
            manager.clients.remove(handle.id);
            return Err(());
        }
        let _ = session.stream.flush().await;

        let (stream_rx, stream_tx) = tokio::io::split(session.stream);

        Ok(Session {
            gate: manager.gate,
            clients: manager.clients,
            auth: manager.auth,
            master: manager.master,
            killed: handle.killed(),
            handle,
            receiver: Receiver::new(),
            bad_commands: 0,
            pending_auth: None,
            is_tls,
            secured,
            writer: writer::spawn_writer(
                writer::Event::Stream(stream_tx),
                session.span.clone(),
            ),
            out_buf: Vec::new(),
            stream_rx,
            local_ip: session.local_ip,
            remote_ip: session.remote_ip,
            permit: session.permit,
            instance: session.instance,
            span: session.span,
        })
    }

    pub async fn handle_conn(mut self) {
        match self.handle_conn_().await {
            SessionAction::UpgradeTls => {
                if let Ok(session) = self.into_tls().await {
                    session.handle_conn().await;
                }
            }
            SessionAction::Handoff { user, mechanism } => self.handoff(user, mechanism).await,
            SessionAction::Close(reason) => self.destroy(reason).await,
            SessionAction::Continue => unreachable!(),
        }
    }

    pub async fn into_tls(self) -> Result<Session<TlsStream<TcpStream>>, ()> {
        // Recover the write half; the queued OK tagline is flushed first.
        let (tx, rx) = oneshot::channel();
        if self.writer.send(writer::Event::Detach(tx)).await.is_err() {
            self.destroy(Some("Disconnected".into())).await;
            return Err(());
        }
        let stream_tx = match rx.await {
            Ok(writer::DetachedStream::Plain(stream_tx)) => stream_tx,
            _ => {
                self.destroy(Some("Disconnected".into())).await;
                return Err(());
            }
        };

        let bad_commands = self.bad_commands;
        let Session {
            gate,
            instance,
            clients,
            auth,
            master,
            handle,
            writer,
            stream_rx,
            local_ip,
            remote_ip,
            killed,
            permit,
            span,
            ..
        } = self;

        let mut stream = stream_rx.unsplit(stream_tx);
        if instance.acceptor.is_none() {
            let _ = stream
                .write_all(b"* BYE TLS initialization failed.\r\n")
                .await;
            tracing::info!(
                parent: &span,
                event = "disconnect",
                reason = "TLS initialization failed",
                "Client disconnected."
            );
            clients.remove(handle.id);
            return Err(());
        }

        let tls_stream = match instance.tls_accept(stream, &span).await {
            Ok(tls_stream) => tls_stream,
            Err(_) => {
                tracing::info!(
                    parent: &span,
                    event = "disconnect",
                    reason = "TLS handshake failed",
                    "Client disconnected."
                );
                clients.remove(handle.id);
                return Err(());
            }
        };

        if gate.verbose_proctitle {
            tracing::info!(parent: &span, event = "starttls", "TLS negotiation completed.");
        }

        let is_tls = tls_stream.is_tls();
        let (stream_rx, stream_tx) = tokio::io::split(tls_stream);
        if writer
            .send(writer::Event::StreamTls(stream_tx))
            .await
            .is_err()
        {
            clients.remove(handle.id);
            return Err(());
        }

        // The parser is rebuilt: bytes a client pipelined after STARTTLS in
        // cleartext must never be interpreted under TLS.
        Ok(Session {
            gate,
            instance,
            clients,
            auth,
            master,
            handle,
            receiver: Receiver::new(),
            bad_commands,
            pending_auth: None,
            is_tls,
            secured: true,
            writer,
            out_buf: Vec::new(),
            stream_rx,
            local_ip,
            remote_ip,
            killed,
            permit,
            span,
        })
    }

    pub async fn handoff(self, user: String, mechanism: String) {
        let (tx, rx) = oneshot::channel();
        if self.writer.send(writer::Event::Detach(tx)).await.is_err() {
            self.destroy(Some("Disconnected".into())).await;
            return;
        }
        let stream_tx = match rx.await {
            Ok(writer::DetachedStream::Plain(stream_tx)) => stream_tx,
            _ => {
                self.destroy(Some("Disconnected".into())).await;
                return;
            }
        };

        let Session {
            clients,
            master,
            handle,
            stream_rx,
            remote_ip,
            span,
            ..
        } = self;
        clients.remove(handle.id);

        let stream = stream_rx.unsplit(stream_tx);
        if let Err(err) = master
            .handoff(Handoff {
                stream: Box::new(stream),
                user,
                mechanism,
                peer: remote_ip,
                session_id: handle.id,
            })
            .await
        {
            tracing::debug!(parent: &span, event = "error", reason = %err, "Backend handoff failed.");
        }
    }
}

impl Session<TlsStream<TcpStream>> {
    pub async fn new(
        session: SessionData<TcpStream>,
        manager: GateSessionManager,
    ) -> Result<Session<TlsStream<TcpStream>>, ()> {
        let span = session.span;
        let mut stream = session
            .instance
            .tls_accept(session.stream, &span)
            .await?;

        let is_tls = stream.is_tls();
        let handle = manager.clients.admit(session.remote_ip);

        if manager.gate.verbose_proctitle {
            tracing::info!(
                parent: &span,
                event = "connect",
                tls = is_tls,
                secured = true,
                "Client connected."
            );
        }

        let greeting = greeting(&manager, &session.instance, is_tls, true);
        if let Err(err) = stream.write_all(&greeting).await {
            tracing::debug!(parent: &span, event = "error", reason = %err, "Failed to write greeting.");
            manager.clients.remove(handle.id);
            return Err(());
        }
        let _ = stream.flush().await;

        let (stream_rx, stream_tx) = tokio::io::split(stream);

        Ok(Session {
            gate: manager.gate,
            clients: manager.clients,
            auth: manager.auth,
            master: manager.master,
            killed: handle.killed(),
            handle,
            receiver: Receiver::new(),
            bad_commands: 0,
            pending_auth: None,
            is_tls,
            secured: true,
            writer: writer::spawn_writer(writer::Event::StreamTls(stream_tx), span.clone()),
            out_buf: Vec::new(),
            stream_rx,
            local_ip: session.local_ip,
            remote_ip: session.remote_ip,
            permit: session.permit,
            instance: session.instance,
            span,
        })
    }

    pub async fn handle_conn(mut self) {
        match self.handle_conn_().await {
            // STARTTLS is refused while TLS is active, so an upgrade can
            // never be requested here.
            SessionAction::UpgradeTls => self.destroy(None).await,
            SessionAction::Handoff { user, mechanism } => self.handoff(user, mechanism).await,
            SessionAction::Close(reason) => self.destroy(reason).await,
            SessionAction::Continue => unreachable!(),
        }
    }

    pub async fn handoff(self, user: String, mechanism: String) {
        let (tx, rx) = oneshot::channel();
        if self.writer.send(writer::Event::Detach(tx)).await.is_err() {
            self.destroy(Some("Disconnected".into())).await;
            return;
        }
        let stream_tx = match rx.await {
            Ok(writer::DetachedStream::Tls(stream_tx)) => stream_tx,
            _ => {
                self.destroy(Some("Disconnected".into())).await;
                return;
            }
        };

        let Session {
            clients,
            master,
            handle,
            stream_rx,
            remote_ip,
            span,
            ..
        } = self;
        clients.remove(handle.id);

        let stream = stream_rx.unsplit(stream_tx);
        if let Err(err) = master
            .handoff(Handoff {
                stream: Box::new(stream),
                user,
                mechanism,
                peer: remote_ip,
                session_id: handle.id,
            })
            .await
        {
            tracing::debug!(parent: &span, event = "error", reason = %err, "Backend handoff failed.");
        }
    }
}

/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::borrow::Cow;

use imapgate_proto::{receiver, Command, ResponseType, StatusResponse};
use tokio::sync::mpsc;

use super::{writer, Session, SessionAction, SessionStream, MAX_OUTBUF_SIZE};
use crate::op;

/// Disconnect client when it sends too many bad commands.
pub const CLIENT_MAX_BAD_COMMANDS: u32 = 10;

impl<T: SessionStream> Session<T> {
    /// Drains one chunk of client input through the parser, dispatching
    /// every complete command. Output is corked for the whole batch and
    /// flushed once at the end, so untagged lines and the tagged reply of
    /// one command reach the peer together.
    pub async fn ingest(&mut self, bytes: &[u8]) -> SessionAction {
        tracing::trace!(
            parent: &self.span,
            event = "read",
            size = bytes.len(),
        );

        let mut bytes_iter = bytes.iter();
        let mut action = SessionAction::Continue;

        loop {
            match self.receiver.parse(&mut bytes_iter) {
                Ok(request) => match self.handle_request(request).await {
                    Ok(SessionAction::Continue) => {}
                    Ok(next) => {
                        // Any bytes pipelined behind STARTTLS or a login are
                        // dropped with the rest of the iterator.
                        action = next;
                        break;
                    }
                    Err(response) => {
                        if let Some(pending) = self.pending_auth.take() {
                            pending.handle.abort();
                        }
                        let counted = matches!(response.rtype, ResponseType::Bad);
                        self.write_response(response);
                        if counted && !self.bump_bad_commands() {
                            action = SessionAction::Close(Some(
                                "Disconnected: Too many invalid commands".into(),
                            ));
                            break;
                        }
                    }
                },
                Err(receiver::Error::NeedsMoreData) => break,
                Err(receiver::Error::NeedsLiteral { size }) => {
                    self.write_bytes(format!("+ Ready for {} bytes.\r\n", size));
                    break;
                }
                Err(receiver::Error::Error { response, fatal }) => {
                    if let Some(pending) = self.pending_auth.take() {
                        pending.handle.abort();
                    }
                    if fatal {
                        self.write_bytes(
                            StatusResponse::bye(response.message.clone()).into_bytes(),
                        );
                        action = SessionAction::Close(Some(
                            format!("Disconnected: {}", response.message).into(),
                        ));
                        break;
                    }
                    self.write_response(response);
                    if !self.bump_bad_commands() {
                        action = SessionAction::Close(Some(
                            "Disconnected: Too many invalid commands".into(),
                        ));
                        break;
                    }
                }
            }
        }

        if let Err(reason) = self.flush_output().await {
            if matches!(
                action,
                SessionAction::Continue | SessionAction::UpgradeTls
            ) {
                action = SessionAction::Close(Some(reason));
            }
        }

        action
    }

    async fn handle_request(
        &mut self,
        request: receiver::Request<Command>,
    ) -> op::Result<SessionAction> {
        if self.pending_auth.is_some() {
            // Raw SASL continuation line completing the re-primed request.
            return self.handle_authenticate(request).await;
        }

        if request.tag == "*" {
            // Not a usable tag; the reply goes out with tag '*'.
            return Err(StatusResponse::bad(
                "Error in IMAP command received by server.",
            ));
        }

        match request.command {
            Command::Capability => self.handle_capability(request).await,
            Command::Noop => self.handle_noop(request).await,
            Command::Logout => self.handle_logout(request).await,
            Command::StartTls => self.handle_starttls(request).await,
            Command::Login => self.handle_login(request).await,
            Command::Authenticate => self.handle_authenticate(request).await,
        }
    }

    /// Returns false once the client has used up its allowance; the BYE is
    /// already queued behind the offending command's tagged reply.
    fn bump_bad_commands(&mut self) -> bool {
        self.bad_commands += 1;
        if self.bad_commands >= CLIENT_MAX_BAD_COMMANDS {
            self.write_bytes(&b"* BYE Too many invalid IMAP commands.\r\n"[..]);
            false
        } else {
            true
        }
    }

    pub fn write_bytes(&mut self, bytes: impl AsRef<[u8]>) {
        self.out_buf.extend_from_slice(bytes.as_ref());
    }

    pub fn write_response(&mut self, response: StatusResponse) {
        self.out_buf = response.serialize(std::mem::take(&mut self.out_buf));
    }

    /// Uncork: ship the batch to the writer task as one event.
    pub async fn flush_output(&mut self) -> Result<(), Cow<'static, str>> {
        if self.out_buf.is_empty() {
            return Ok(());
        }
        if self.out_buf.len() > MAX_OUTBUF_SIZE {
            self.out_buf.clear();
            return Err("Transmit buffer full".into());
        }
        let bytes = std::mem::take(&mut self.out_buf);
        match self.writer.try_send(writer::Event::Bytes(bytes.into())) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err("Transmit buffer full".into()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err("Disconnected".into()),
        }
    }

    /// Uncorked write for lines outside a command batch (greeting-style
    /// notices, disconnect BYEs).
    pub async fn write_now(
        &self,
        bytes: impl Into<Cow<'static, [u8]>>,
    ) -> Result<(), ()> {
        self.writer
            .send(writer::Event::Bytes(bytes.into()))
            .await
            .map_err(|_| ())
    }
}

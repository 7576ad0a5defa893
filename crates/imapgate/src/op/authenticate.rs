/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use imapgate_proto::{
    receiver::{self, Request, Token},
    Command, StatusResponse,
};

use crate::{
    auth::{proto::AuthParameters, AuthReply},
    core::{PendingAuth, Session, SessionAction, SessionStream},
};

impl<T: SessionStream> Session<T> {
    pub async fn handle_authenticate(
        &mut self,
        request: Request<Command>,
    ) -> crate::op::Result<SessionAction> {
        if let Some(pending) = self.pending_auth.take() {
            return self.continue_auth(pending, request).await;
        }

        let mut args = request.parse_authenticate()?;

        let Some(mechanism) = self.auth.mechanism(&args.mechanism) else {
            return Err(
                StatusResponse::no("Unsupported authentication mechanism.").with_tag(args.tag)
            );
        };
        if mechanism.plaintext && !self.secured && self.gate.disable_plaintext_auth {
            return Err(
                StatusResponse::no("Plaintext authentication disabled.").with_tag(args.tag)
            );
        }

        let initial = if args.params.is_empty() {
            None
        } else {
            Some(args.params.remove(0))
        };
        self.begin_auth(mechanism.name, initial, args.tag, None).await
    }

    pub(crate) async fn begin_auth(
        &mut self,
        mechanism: String,
        initial: Option<String>,
        tag: String,
        user: Option<String>,
    ) -> crate::op::Result<SessionAction> {
        let params = AuthParameters {
            mechanism: mechanism.clone(),
            local_ip: self.local_ip,
            remote_ip: self.remote_ip,
            secured: self.secured,
            initial_response: initial,
        };
        match self.auth.submit(params).await {
            Some(handle) => {
                self.auth_step(PendingAuth {
                    handle,
                    tag,
                    mechanism,
                    user,
                })
                .await
            }
            None => Ok(self.internal_login_failure(user.as_deref())),
        }
    }

    /// The client answered a `+` challenge; the receiver was re-primed so
    /// the raw line arrives as the last argument of the same request.
    async fn continue_auth(
        &mut self,
        pending: PendingAuth,
        request: Request<Command>,
    ) -> crate::op::Result<SessionAction> {
        let args = request.parse_authenticate()?;
        let line = args.params.into_iter().last().unwrap_or_default();

        if line == "*" {
            pending.handle.abort();
            self.write_response(
                StatusResponse::bad("Authentication aborted").with_tag(args.tag),
            );
            return Ok(SessionAction::Continue);
        }

        if !pending.handle.submit_continuation(&line).await {
            return Ok(self.internal_login_failure(pending.user.as_deref()));
        }
        self.auth_step(pending).await
    }

    /// Waits for the next auth service reply. The service may answer
    /// immediately, so this can resolve synchronously with the submission;
    /// a registry kill arriving meanwhile is honored instead of the reply.
    async fn auth_step(&mut self, mut pending: PendingAuth) -> crate::op::Result<SessionAction> {
        let mut killed = self.killed.clone();
        let reply = tokio::select! {
            reply = pending.handle.next_reply() => reply,
            _ = killed.changed() => {
                pending.handle.abort();
                return Ok(SessionAction::Continue);
            }
        };

        match reply {
            AuthReply::Continue(challenge) => {
                self.write_bytes(format!("+ {}\r\n", challenge));
                self.receiver.request = receiver::Request {
                    tag: pending.tag.clone(),
                    command: Command::Authenticate,
                    tokens: vec![Token::Argument(pending.mechanism.clone().into_bytes())],
                };
                self.receiver.state = receiver::State::Argument { last_ch: b' ' };
                self.pending_auth = Some(pending);
                Ok(SessionAction::Continue)
            }
            AuthReply::Success { user } => {
                tracing::info!(
                    parent: &self.span,
                    event = "login",
                    user = %user,
                    mechanism = %pending.mechanism,
                    "Login"
                );
                self.write_response(StatusResponse::ok("Logged in.").with_tag(pending.tag));
                Ok(SessionAction::Handoff {
                    user,
                    mechanism: pending.mechanism,
                })
            }
            AuthReply::Failure { reason } => Err(StatusResponse::no(
                reason.unwrap_or_else(|| "Authentication failed.".to_string()),
            )
            .with_tag(pending.tag)),
            AuthReply::InternalFailure => {
                Ok(self.internal_login_failure(pending.user.as_deref()))
            }
        }
    }

    pub(crate) fn internal_login_failure(&mut self, user: Option<&str>) -> SessionAction {
        self.write_bytes(
            &b"* BYE Internal login failure. Refer to server log for more information.\r\n"[..],
        );
        SessionAction::Close(Some(match user {
            Some(user) => format!("Internal login failure: {}", user).into(),
            None => "Internal login failure".into(),
        }))
    }
}

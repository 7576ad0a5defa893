/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use imapgate_proto::{capability::Capabilities, receiver::Request, Command, StatusResponse};

use crate::{
    auth::AuthClient,
    core::{Session, SessionAction, SessionStream},
    ImapGate,
};

/// Shared between the greeting and the CAPABILITY command so both always
/// agree on what is advertised.
pub fn capabilities(
    gate: &ImapGate,
    auth: &AuthClient,
    tls_available: bool,
    is_tls: bool,
    secured: bool,
) -> Capabilities {
    Capabilities {
        base: gate.capability_base.clone(),
        starttls: tls_available && !is_tls,
        login_disabled: gate.disable_plaintext_auth && !secured,
        mechanisms: auth.mechanisms(secured || !gate.disable_plaintext_auth),
    }
}

impl<T: SessionStream> Session<T> {
    pub fn capabilities(&self) -> Capabilities {
        capabilities(
            &self.gate,
            &self.auth,
            self.instance.tls_available(),
            self.is_tls,
            self.secured,
        )
    }

    pub async fn handle_capability(
        &mut self,
        request: Request<Command>,
    ) -> crate::op::Result<SessionAction> {
        self.write_bytes(format!(
            "* CAPABILITY {}\r\n",
            self.capabilities().serialize()
        ));
        self.write_response(StatusResponse::ok("Capability completed.").with_tag(request.tag));
        Ok(SessionAction::Continue)
    }
}

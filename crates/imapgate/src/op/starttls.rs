/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use imapgate_proto::{receiver::Request, Command, StatusResponse};

use crate::core::{Session, SessionAction, SessionStream};

impl<T: SessionStream> Session<T> {
    pub async fn handle_starttls(
        &mut self,
        request: Request<Command>,
    ) -> crate::op::Result<SessionAction> {
        if self.is_tls {
            self.write_response(
                StatusResponse::bad("TLS is already active.").with_tag(request.tag),
            );
            return Ok(SessionAction::Continue);
        }
        if !self.instance.tls_available() {
            self.write_response(
                StatusResponse::bad("TLS support isn't enabled.").with_tag(request.tag),
            );
            return Ok(SessionAction::Continue);
        }

        // The tagged OK must leave in cleartext before the handshake; the
        // writer delivers it ahead of the detach in any case.
        self.write_response(
            StatusResponse::ok("Begin TLS negotiation now.").with_tag(request.tag),
        );
        Ok(SessionAction::UpgradeTls)
    }
}

/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use imapgate_proto::{receiver::Request, Command, StatusResponse};

use crate::core::{Session, SessionAction, SessionStream};

impl<T: SessionStream> Session<T> {
    pub async fn handle_logout(
        &mut self,
        request: Request<Command>,
    ) -> crate::op::Result<SessionAction> {
        self.write_bytes(&b"* BYE Logging out\r\n"[..]);
        self.write_response(StatusResponse::ok("Logout completed.").with_tag(request.tag));
        Ok(SessionAction::Close(Some("Aborted login".into())))
    }
}

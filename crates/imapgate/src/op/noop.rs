/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use imapgate_proto::{receiver::Request, Command, StatusResponse};

use crate::core::{Session, SessionAction, SessionStream};

impl<T: SessionStream> Session<T> {
    pub async fn handle_noop(
        &mut self,
        request: Request<Command>,
    ) -> crate::op::Result<SessionAction> {
        self.write_response(StatusResponse::ok("NOOP completed.").with_tag(request.tag));
        Ok(SessionAction::Continue)
    }
}

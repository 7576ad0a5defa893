/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use imapgate_proto::{receiver::Request, Command, StatusResponse};

use crate::{
    auth::sasl,
    core::{Session, SessionAction, SessionStream},
};

impl<T: SessionStream> Session<T> {
    /// LOGIN is a thin wrapper over the PLAIN mechanism: userid and password
    /// become the initial response of a regular attempt.
    pub async fn handle_login(
        &mut self,
        request: Request<Command>,
    ) -> crate::op::Result<SessionAction> {
        let args = request.parse_login()?;

        if !self.secured && self.gate.disable_plaintext_auth {
            return Err(
                StatusResponse::no("Plaintext authentication disabled.").with_tag(args.tag)
            );
        }

        let initial = sasl::plain_initial_response(&args.username, &args.password);
        self.begin_auth(
            "PLAIN".to_string(),
            Some(initial),
            args.tag,
            Some(args.username),
        )
        .await
    }
}

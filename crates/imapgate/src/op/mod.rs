/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use imapgate_proto::StatusResponse;

pub mod authenticate;
pub mod capability;
pub mod login;
pub mod logout;
pub mod noop;
pub mod starttls;

pub type Result<T> = std::result::Result<T, StatusResponse>;

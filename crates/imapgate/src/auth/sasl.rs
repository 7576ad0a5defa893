/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use base64::{engine::general_purpose::STANDARD, Engine};

/// SASL PLAIN initial response for a LOGIN command:
/// `base64([authzid] NUL authcid NUL password)` with an empty authzid.
pub fn plain_initial_response(username: &str, password: &str) -> String {
    let mut message = Vec::with_capacity(username.len() + password.len() + 2);
    message.push(0);
    message.extend_from_slice(username.as_bytes());
    message.push(0);
    message.extend_from_slice(password.as_bytes());
    STANDARD.encode(message)
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD, Engine};

    #[test]
    fn plain_initial_response() {
        let encoded = super::plain_initial_response("tim", "tanstaaftanstaaf");
        assert_eq!(
            STANDARD.decode(&encoded).unwrap(),
            b"\0tim\0tanstaaftanstaaf"
        );
        assert_eq!(encoded, "AHRpbQB0YW5zdGFhZnRhbnN0YWFm");
    }
}

/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

/// Capability banner advertised before authentication.
///
/// `STARTTLS` is present while TLS is available but not yet active,
/// `LOGINDISABLED` while plaintext authentication is refused on an
/// unsecured transport. SASL mechanisms follow, one `AUTH=` item each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub base: String,
    pub starttls: bool,
    pub login_disabled: bool,
    pub mechanisms: Vec<String>,
}

impl Capabilities {
    pub fn serialize(&self) -> String {
        let mut caps = String::with_capacity(64);
        caps.push_str(&self.base);
        if self.starttls {
            caps.push_str(" STARTTLS");
        }
        if self.login_disabled {
            caps.push_str(" LOGINDISABLED");
        }
        for mechanism in &self.mechanisms {
            caps.push_str(" AUTH=");
            caps.push_str(mechanism);
        }
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::Capabilities;

    #[test]
    fn serialize_capabilities() {
        for (capabilities, expected) in [
            (
                Capabilities {
                    base: "IMAP4rev1".to_string(),
                    starttls: true,
                    login_disabled: false,
                    mechanisms: vec!["PLAIN".to_string()],
                },
                "IMAP4rev1 STARTTLS AUTH=PLAIN",
            ),
            (
                Capabilities {
                    base: "IMAP4rev1".to_string(),
                    starttls: false,
                    login_disabled: true,
                    mechanisms: vec![],
                },
                "IMAP4rev1 LOGINDISABLED",
            ),
            (
                Capabilities {
                    base: "IMAP4rev1".to_string(),
                    starttls: false,
                    login_disabled: false,
                    mechanisms: vec!["PLAIN".to_string(), "LOGIN".to_string()],
                },
                "IMAP4rev1 AUTH=PLAIN AUTH=LOGIN",
            ),
        ] {
            assert_eq!(capabilities.serialize(), expected);
        }
    }
}

/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Client side of the authentication service line protocol. Requests and
//! replies are tab-separated fields on LF-terminated lines, multiplexed by
//! request id:
//!
//! ```text
//! C: VERSION  1   2
//! C: CPID    173
//! S: VERSION  1   2
//! S: MECH    PLAIN   plaintext
//! S: MECH    LOGIN   plaintext
//! S: DONE
//! C: AUTH    7   PLAIN   service=imap    lip=10.0.0.1    rip=203.0.113.9 resp=...
//! S: CONT    7   <base64>
//! C: CONT    7   <base64>
//! S: OK      7   user=alice
//! ```

use std::net::IpAddr;

pub const AUTH_PROTOCOL_MAJOR: u64 = 1;
pub const AUTH_PROTOCOL_MINOR: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    Version { major: u64, minor: u64 },
    Mech { name: String, plaintext: bool },
    Done,
    Cont { id: u32, data: String },
    Ok { id: u32, user: Option<String> },
    Fail { id: u32, reason: Option<String>, temporary: bool },
    Ignored,
}

pub fn parse_server_line(line: &str) -> Option<ServerLine> {
    let mut fields = line.split('\t');
    let verb = fields.next()?;

    if verb.eq_ignore_ascii_case("VERSION") {
        Some(ServerLine::Version {
            major: fields.next()?.parse().ok()?,
            minor: fields.next()?.parse().ok()?,
        })
    } else if verb.eq_ignore_ascii_case("MECH") {
        let name = fields.next()?.to_ascii_uppercase();
        let plaintext = fields.any(|flag| flag.eq_ignore_ascii_case("plaintext"));
        Some(ServerLine::Mech { name, plaintext })
    } else if verb.eq_ignore_ascii_case("DONE") {
        Some(ServerLine::Done)
    } else if verb.eq_ignore_ascii_case("CONT") {
        Some(ServerLine::Cont {
            id: fields.next()?.parse().ok()?,
            data: fields.next().unwrap_or_default().to_string(),
        })
    } else if verb.eq_ignore_ascii_case("OK") {
        let id = fields.next()?.parse().ok()?;
        let user = fields
            .find_map(|field| field.strip_prefix("user="))
            .map(|user| user.to_string());
        Some(ServerLine::Ok { id, user })
    } else if verb.eq_ignore_ascii_case("FAIL") {
        let id = fields.next()?.parse().ok()?;
        let mut reason = None;
        let mut temporary = false;
        for field in fields {
            if let Some(value) = field.strip_prefix("reason=") {
                reason = Some(value.to_string());
            } else if field == "temp" {
                temporary = true;
            }
        }
        Some(ServerLine::Fail {
            id,
            reason,
            temporary,
        })
    } else if verb.eq_ignore_ascii_case("SPID")
        || verb.eq_ignore_ascii_case("CUID")
        || verb.eq_ignore_ascii_case("COOKIE")
    {
        Some(ServerLine::Ignored)
    } else {
        None
    }
}

/// Connection metadata forwarded with every attempt, so the service can
/// apply its own policy (e.g. refuse plaintext mechanisms on unsecured
/// transports).
#[derive(Debug, Clone)]
pub struct AuthParameters {
    pub mechanism: String,
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
    pub secured: bool,
    pub initial_response: Option<String>,
}

pub fn format_handshake(pid: u32) -> String {
    format!(
        "VERSION\t{}\t{}\nCPID\t{}\n",
        AUTH_PROTOCOL_MAJOR, AUTH_PROTOCOL_MINOR, pid
    )
}

pub fn format_auth(id: u32, params: &AuthParameters) -> String {
    // All field values are tab-free by construction: mechanism names are
    // uppercase atoms, addresses are formatted by the stdlib, responses are
    // base64.
    let mut line = format!(
        "AUTH\t{}\t{}\tservice=imap\tlip={}\trip={}",
        id, params.mechanism, params.local_ip, params.remote_ip
    );
    if params.secured {
        line.push_str("\tsecured");
    }
    if let Some(resp) = &params.initial_response {
        line.push_str("\tresp=");
        line.push_str(resp);
    }
    line.push('\n');
    line
}

pub fn format_cont(id: u32, data: &str) -> String {
    format!("CONT\t{}\t{}\n", id, data)
}

/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::borrow::Cow;

pub mod capability;
pub mod receiver;

use receiver::{CommandParser, Request, Token};

/// Commands recognized before authentication. Everything else is answered
/// with a tagged BAD and counted against the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    Capability,
    #[default]
    Noop,
    Logout,
    StartTls,
    Authenticate,
    Login,
}

impl CommandParser for Command {
    fn parse(value: &[u8]) -> Option<Self> {
        if value.eq_ignore_ascii_case(b"LOGIN") {
            Some(Command::Login)
        } else if value.eq_ignore_ascii_case(b"AUTHENTICATE") {
            Some(Command::Authenticate)
        } else if value.eq_ignore_ascii_case(b"CAPABILITY") {
            Some(Command::Capability)
        } else if value.eq_ignore_ascii_case(b"STARTTLS") {
            Some(Command::StartTls)
        } else if value.eq_ignore_ascii_case(b"NOOP") {
            Some(Command::Noop)
        } else if value.eq_ignore_ascii_case(b"LOGOUT") {
            Some(Command::Logout)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseType {
    Ok,
    No,
    Bad,
    Bye,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    Capability { capabilities: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub tag: Option<String>,
    pub code: Option<ResponseCode>,
    pub message: Cow<'static, str>,
    pub rtype: ResponseType,
}

impl ResponseType {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(match self {
            ResponseType::Ok => b"OK".as_slice(),
            ResponseType::No => b"NO".as_slice(),
            ResponseType::Bad => b"BAD".as_slice(),
            ResponseType::Bye => b"BYE".as_slice(),
        });
    }
}

impl StatusResponse {
    pub fn ok(message: impl Into<Cow<'static, str>>) -> Self {
        StatusResponse {
            tag: None,
            code: None,
            message: message.into(),
            rtype: ResponseType::Ok,
        }
    }

    pub fn no(message: impl Into<Cow<'static, str>>) -> Self {
        StatusResponse {
            tag: None,
            code: None,
            message: message.into(),
            rtype: ResponseType::No,
        }
    }

    pub fn bad(message: impl Into<Cow<'static, str>>) -> Self {
        StatusResponse {
            tag: None,
            code: None,
            message: message.into(),
            rtype: ResponseType::Bad,
        }
    }

    pub fn bye(message: impl Into<Cow<'static, str>>) -> Self {
        StatusResponse {
            tag: None,
            code: None,
            message: message.into(),
            rtype: ResponseType::Bye,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_code(mut self, code: ResponseCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn serialize(self, mut buf: Vec<u8>) -> Vec<u8> {
        if let Some(tag) = &self.tag {
            buf.extend_from_slice(tag.as_bytes());
        } else {
            buf.push(b'*');
        }
        buf.push(b' ');
        self.rtype.serialize(&mut buf);
        buf.push(b' ');
        if let Some(ResponseCode::Capability { capabilities }) = &self.code {
            buf.extend_from_slice(b"[CAPABILITY ");
            buf.extend_from_slice(capabilities.as_bytes());
            buf.extend_from_slice(b"] ");
        }
        buf.extend_from_slice(self.message.as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.serialize(Vec::with_capacity(16))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginArguments {
    pub tag: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateArguments {
    pub tag: String,
    pub mechanism: String,
    pub params: Vec<String>,
}

impl Request<Command> {
    pub fn into_error(self, message: impl Into<Cow<'static, str>>) -> StatusResponse {
        StatusResponse::bad(message).with_tag(self.tag)
    }

    pub fn parse_login(self) -> Result<LoginArguments, StatusResponse> {
        match self.tokens.len() {
            2 => {
                let mut tokens = self.tokens.into_iter();
                let username = tokens.next().unwrap().unwrap_string();
                let password = tokens.next().unwrap().unwrap_string();
                match (username, password) {
                    (Ok(username), Ok(password)) => Ok(LoginArguments {
                        tag: self.tag,
                        username,
                        password,
                    }),
                    _ => Err(StatusResponse::bad("Invalid UTF-8 in argument.").with_tag(self.tag)),
                }
            }
            0 | 1 => Err(self.into_error("Missing arguments.")),
            _ => Err(self.into_error("Too many arguments.")),
        }
    }

    pub fn parse_authenticate(self) -> Result<AuthenticateArguments, StatusResponse> {
        if !self.tokens.is_empty() {
            let mut tokens = self.tokens.into_iter();
            let mechanism = match tokens.next().unwrap() {
                Token::Argument(value) => match String::from_utf8(value) {
                    Ok(value) => value.to_ascii_uppercase(),
                    Err(_) => {
                        return Err(StatusResponse::bad("Invalid UTF-8 in mechanism name.")
                            .with_tag(self.tag))
                    }
                },
                _ => {
                    return Err(
                        StatusResponse::bad("Invalid mechanism name.").with_tag(self.tag)
                    )
                }
            };
            Ok(AuthenticateArguments {
                mechanism,
                params: tokens
                    .filter_map(|token| token.unwrap_string().ok())
                    .collect(),
                tag: self.tag,
            })
        } else {
            Err(self.into_error("Authentication mechanism missing."))
        }
    }
}

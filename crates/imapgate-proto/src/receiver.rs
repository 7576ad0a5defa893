/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::borrow::Cow;

use crate::StatusResponse;

/// Maximum length of one command line, literal bodies included. Exceeding it
/// leaves the stream unparseable and is fatal.
pub const MAX_LINE_SIZE: usize = 8192;

/// Maximum size of a single parameter; also the ceiling for literal bodies.
pub const MAX_PARAM_SIZE: usize = 4096;

const TOO_LONG_ARGUMENT: &str = "Too long argument.";
const LINE_TOO_LONG: &str = "Input buffer full, aborting";
const UNKNOWN_COMMAND: &str = "Error in IMAP command received by server.";

#[derive(Debug, Clone)]
pub enum Error {
    NeedsMoreData,
    NeedsLiteral { size: u32 },
    Error { response: StatusResponse, fatal: bool },
}

pub trait CommandParser: Sized + Default {
    fn parse(value: &[u8]) -> Option<Self>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<T: CommandParser> {
    pub tag: String,
    pub command: T,
    pub tokens: Vec<Token>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Argument(Vec<u8>),
    ParenthesisOpen,
    ParenthesisClose,
    Nil,
}

impl<T: CommandParser> Default for Request<T> {
    fn default() -> Self {
        Self {
            tag: String::with_capacity(0),
            command: T::default(),
            tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    Start,
    Tag,
    Command,
    Argument { last_ch: u8 },
    ArgumentQuoted { escaped: bool },
    Literal { non_sync: bool },
    LiteralSeek { size: u32, non_sync: bool },
    LiteralData { remaining: u32 },
    SkipLine,
}

/// Incremental request parser. Feed it byte slices as they arrive; it hands
/// back one request per command line and never blocks. After `NeedsMoreData`
/// the same logical command resumes with the next call, nothing is lost.
///
/// Errors on a single line discard the rest of that line before surfacing,
/// so the stream stays in sync; errors with the `fatal` bit set mean the
/// stream cannot be resynchronized and must be torn down.
pub struct Receiver<T: CommandParser> {
    buf: Vec<u8>,
    pub request: Request<T>,
    pub state: State,
    pub max_line_size: usize,
    line_size: usize,
    skip_response: Option<StatusResponse>,
}

impl<T: CommandParser> Default for Receiver<T> {
    fn default() -> Self {
        Self {
            buf: Vec::with_capacity(10),
            request: Default::default(),
            state: State::Start,
            max_line_size: MAX_LINE_SIZE,
            line_size: 0,
            skip_response: None,
        }
    }
}

impl<T: CommandParser> Receiver<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_size(max_line_size: usize) -> Self {
        Receiver {
            max_line_size,
            ..Default::default()
        }
    }

    fn tagged_response(&mut self, message: impl Into<Cow<'static, str>>) -> StatusResponse {
        let request = std::mem::take(&mut self.request);
        let response = StatusResponse::bad(message);
        if !request.tag.is_empty() {
            response.with_tag(request.tag)
        } else {
            response
        }
    }

    /// Line-local error: remember the reply, then discard input through the
    /// next LF before surfacing it.
    fn skip_line(&mut self, message: impl Into<Cow<'static, str>>) {
        self.skip_response = Some(self.tagged_response(message));
        self.buf.clear();
        self.state = State::SkipLine;
    }

    /// Error detected at end of line; the offending line is already consumed.
    fn error_at_eol(&mut self, message: impl Into<Cow<'static, str>>) -> Error {
        let response = self.tagged_response(message);
        self.reset_line();
        Error::Error {
            response,
            fatal: false,
        }
    }

    fn fatal(&mut self, message: impl Into<Cow<'static, str>>) -> Error {
        let response = self.tagged_response(message);
        self.reset_line();
        Error::Error {
            response,
            fatal: true,
        }
    }

    fn reset_line(&mut self) {
        self.buf.clear();
        self.state = State::Start;
        self.line_size = 0;
    }

    fn push_argument(&mut self, in_quote: bool) {
        if !self.buf.is_empty() {
            self.request.tokens.push(Token::Argument(std::mem::replace(
                &mut self.buf,
                Vec::with_capacity(10),
            )));
        } else if in_quote {
            self.request.tokens.push(Token::Nil);
        }
    }

    pub fn parse(&mut self, bytes: &mut std::slice::Iter<'_, u8>) -> Result<Request<T>, Error> {
        #[allow(clippy::while_let_on_iterator)]
        while let Some(&ch) = bytes.next() {
            if !matches!(self.state, State::SkipLine) {
                self.line_size += 1;
                if self.line_size > self.max_line_size {
                    return Err(self.fatal(LINE_TOO_LONG));
                }
            }

            match self.state {
                State::Start => {
                    if !ch.is_ascii_whitespace() {
                        self.buf.push(ch);
                        self.state = State::Tag;
                    } else {
                        // Stray whitespace between lines is not part of any
                        // command and does not count against the budget.
                        self.line_size = 0;
                    }
                }
                State::Tag => match ch {
                    b' ' => {
                        if !self.buf.is_empty() {
                            match String::from_utf8(std::mem::replace(
                                &mut self.buf,
                                Vec::with_capacity(10),
                            )) {
                                Ok(tag) => {
                                    self.request.tag = tag;
                                    self.state = State::Command;
                                }
                                Err(_) => {
                                    self.skip_line("Tag is not a valid UTF-8 string.");
                                }
                            }
                        }
                    }
                    b'\t' | b'\r' => {}
                    b'\n' => {
                        let tag = String::from_utf8_lossy(&self.buf).into_owned();
                        return Err(
                            self.error_at_eol(format!("Missing command after tag {:?}.", tag))
                        );
                    }
                    _ => {
                        if self.buf.len() < 128 {
                            self.buf.push(ch);
                        } else {
                            self.skip_line("Tag too long.");
                        }
                    }
                },
                State::Command => {
                    if ch.is_ascii_alphanumeric() {
                        if self.buf.len() < 15 {
                            self.buf.push(ch.to_ascii_uppercase());
                        } else {
                            // Longer than any known command name.
                            self.skip_line(UNKNOWN_COMMAND);
                        }
                    } else if ch.is_ascii_whitespace() {
                        if !self.buf.is_empty() {
                            match T::parse(&self.buf) {
                                Some(command) => {
                                    self.request.command = command;
                                    self.buf.clear();
                                    if ch != b'\n' {
                                        self.state = State::Argument { last_ch: b' ' };
                                    } else {
                                        self.line_size = 0;
                                        self.state = State::Start;
                                        return Ok(std::mem::take(&mut self.request));
                                    }
                                }
                                None => {
                                    if ch == b'\n' {
                                        return Err(self.error_at_eol(UNKNOWN_COMMAND));
                                    } else {
                                        self.skip_line(UNKNOWN_COMMAND);
                                    }
                                }
                            }
                        }
                    } else {
                        self.skip_line(format!(
                            "Invalid character {:?} in command name.",
                            ch as char
                        ));
                    }
                }
                State::Argument { last_ch } => match ch {
                    b'\"' if last_ch.is_ascii_whitespace() => {
                        self.push_argument(false);
                        self.state = State::ArgumentQuoted { escaped: false };
                    }
                    b'{' if last_ch.is_ascii_whitespace()
                        || (last_ch == b'~' && self.buf.len() == 1) =>
                    {
                        if last_ch != b'~' {
                            self.push_argument(false);
                        } else {
                            self.buf.clear();
                        }
                        self.state = State::Literal { non_sync: false };
                    }
                    b'(' => {
                        self.push_argument(false);
                        self.request.tokens.push(Token::ParenthesisOpen);
                    }
                    b')' => {
                        self.push_argument(false);
                        self.request.tokens.push(Token::ParenthesisClose);
                    }
                    b'\n' => {
                        self.push_argument(false);
                        self.line_size = 0;
                        self.state = State::Start;
                        return Ok(std::mem::take(&mut self.request));
                    }
                    _ if ch.is_ascii_whitespace() => {
                        self.push_argument(false);
                        self.state = State::Argument { last_ch: ch };
                    }
                    _ => {
                        if self.buf.len() < MAX_PARAM_SIZE {
                            self.buf.push(ch);
                            self.state = State::Argument { last_ch: ch };
                        } else {
                            self.skip_line(TOO_LONG_ARGUMENT);
                        }
                    }
                },
                State::ArgumentQuoted { escaped } => match ch {
                    b'\"' => {
                        if !escaped {
                            self.push_argument(true);
                            self.state = State::Argument { last_ch: b' ' };
                        } else if self.buf.len() < MAX_PARAM_SIZE {
                            self.buf.push(ch);
                            self.state = State::ArgumentQuoted { escaped: false };
                        } else {
                            self.skip_line(TOO_LONG_ARGUMENT);
                        }
                    }
                    b'\\' => {
                        if escaped {
                            self.buf.push(ch);
                        }
                        self.state = State::ArgumentQuoted { escaped: !escaped };
                    }
                    b'\n' => {
                        return Err(self.error_at_eol("Unterminated quoted argument."));
                    }
                    _ => {
                        if self.buf.len() < MAX_PARAM_SIZE {
                            if escaped {
                                self.buf.push(b'\\');
                            }
                            self.buf.push(ch);
                            self.state = State::ArgumentQuoted { escaped: false };
                        } else {
                            self.skip_line(TOO_LONG_ARGUMENT);
                        }
                    }
                },
                State::Literal { non_sync } => match ch {
                    b'}' => {
                        if !self.buf.is_empty() {
                            match std::str::from_utf8(&self.buf)
                                .unwrap_or_default()
                                .parse::<u32>()
                            {
                                Ok(size) if size as usize <= MAX_PARAM_SIZE => {
                                    if self.line_size + size as usize > self.max_line_size {
                                        return Err(self.fatal(LINE_TOO_LONG));
                                    }
                                    self.state = State::LiteralSeek { size, non_sync };
                                    self.buf = Vec::with_capacity(size as usize);
                                }
                                Ok(_) => {
                                    // A parameter that can never fit the input buffer.
                                    return Err(self.fatal(LINE_TOO_LONG));
                                }
                                Err(_) => {
                                    self.skip_line("Literal size is not a valid number.");
                                }
                            }
                        } else {
                            self.skip_line("Invalid empty literal.");
                        }
                    }
                    b'+' => {
                        if !self.buf.is_empty() && !non_sync {
                            self.state = State::Literal { non_sync: true };
                        } else {
                            self.skip_line("Invalid non-sync literal.");
                        }
                    }
                    _ if ch.is_ascii_digit() => {
                        if !non_sync {
                            self.buf.push(ch);
                        } else {
                            self.skip_line("Invalid literal.");
                        }
                    }
                    _ => {
                        self.skip_line(format!("Invalid character {:?} in literal.", ch as char));
                    }
                },
                State::LiteralSeek { size, non_sync } => {
                    if ch == b'\n' {
                        if size > 0 {
                            self.state = State::LiteralData { remaining: size };
                        } else {
                            self.state = State::Argument { last_ch: b' ' };
                            self.request.tokens.push(Token::Nil);
                        }
                        if !non_sync {
                            return Err(Error::NeedsLiteral { size });
                        }
                    } else if !ch.is_ascii_whitespace() {
                        self.skip_line("Expected CRLF after literal.");
                    }
                }
                State::LiteralData { remaining } => {
                    self.buf.push(ch);
                    if remaining > 1 {
                        self.state = State::LiteralData {
                            remaining: remaining - 1,
                        };
                    } else {
                        self.push_argument(false);
                        self.state = State::Argument { last_ch: b' ' };
                    }
                }
                State::SkipLine => {
                    if ch == b'\n' {
                        let response = self
                            .skip_response
                            .take()
                            .unwrap_or_else(|| StatusResponse::bad(UNKNOWN_COMMAND));
                        self.reset_line();
                        return Err(Error::Error {
                            response,
                            fatal: false,
                        });
                    }
                }
            }
        }

        Err(Error::NeedsMoreData)
    }
}

impl Token {
    pub fn unwrap_string(self) -> Result<String, Cow<'static, str>> {
        match self {
            Token::Argument(value) => {
                String::from_utf8(value).map_err(|_| "Invalid UTF-8 in argument.".into())
            }
            Token::ParenthesisOpen => Ok("(".to_string()),
            Token::ParenthesisClose => Ok(")".to_string()),
            Token::Nil => Ok(String::new()),
        }
    }

}

// src/parser.rs
//! Incremental HTTP/1.x request parser.
//!
//! The parser reads straight out of a connection's [`ByteBuffer`] and only
//! consumes a line once it has seen its terminator, so it can be called again
//! after every read: feeding a request one byte at a time ends in the same
//! [`Request`] as feeding it whole.

use std::collections::HashMap;

use memchr::memmem;
use thiserror::Error;
use tracing::debug;

use crate::buffer::ByteBuffer;
use crate::http::{FORM_URLENCODED, Request, normalize_path};

const CRLF: &[u8] = b"\r\n";

pub const DEFAULT_MAX_REQUEST_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    RequestLine,
    Headers,
    Body,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A full request is available.
    Complete,
    /// More bytes are needed; parser state is kept for the next call.
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request line")]
    BadRequestLine,
    #[error("request exceeds {0} bytes")]
    TooLarge(usize),
}

#[derive(Debug, Clone)]
pub struct HttpParser {
    state: ParseState,
    max_request_bytes: usize,
}

impl HttpParser {
    pub fn new(max_request_bytes: usize) -> Self {
        Self {
            state: ParseState::RequestLine,
            max_request_bytes,
        }
    }

    #[inline]
    pub fn state(&self) -> ParseState {
        self.state
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state == ParseState::Finished
    }

    /// Start a new parse cycle.
    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
    }

    /// Advance the state machine over the unread part of `buf`.
    pub fn parse(
        &mut self,
        buf: &mut ByteBuffer,
        req: &mut Request,
    ) -> Result<ParseStatus, ParseError> {
        while buf.readable_bytes() > 0 && self.state != ParseState::Finished {
            let data = buf.peek();
            let line_end = memmem::find(data, CRLF);

            match self.state {
                ParseState::RequestLine => {
                    let Some(end) = line_end else { break };
                    if !parse_request_line(&data[..end], req) {
                        return Err(ParseError::BadRequestLine);
                    }
                    normalize_path(&mut req.path);
                    self.state = ParseState::Headers;
                    buf.retrieve(end + CRLF.len());
                }
                ParseState::Headers => {
                    let Some(end) = line_end else { break };
                    let is_header = parse_header(&data[..end], req);
                    let remaining = data.len() - end - CRLF.len();
                    buf.retrieve(end + CRLF.len());

                    if !is_header {
                        // Blank separator line.
                        self.state = match req.content_length() {
                            Some(0) => ParseState::Finished,
                            Some(len) if len > self.max_request_bytes => {
                                return Err(ParseError::TooLarge(self.max_request_bytes));
                            }
                            Some(_) => ParseState::Body,
                            None if remaining == 0 => ParseState::Finished,
                            None => ParseState::Body,
                        };
                    }
                }
                ParseState::Body => {
                    if let Some(len) = req.content_length() {
                        if data.len() < len {
                            break;
                        }
                        req.body.extend_from_slice(&data[..len]);
                        self.finish_body(req);
                        buf.retrieve(len);
                        continue;
                    }

                    // No length: the body runs to the next line terminator or
                    // to the end of what has arrived.
                    let end = line_end.unwrap_or(data.len());
                    req.body.extend_from_slice(&data[..end]);
                    self.finish_body(req);
                    match line_end {
                        Some(end) => buf.retrieve(end + CRLF.len()),
                        // Terminator coincides with end of data: a finished
                        // POST consumes up to the boundary, nothing else moves.
                        None if req.is_post() => buf.retrieve(end),
                        None => {}
                    }
                    break;
                }
                ParseState::Finished => break,
            }
        }

        if self.state == ParseState::Finished {
            return Ok(ParseStatus::Complete);
        }
        if buf.readable_bytes() > self.max_request_bytes {
            return Err(ParseError::TooLarge(self.max_request_bytes));
        }
        Ok(ParseStatus::Incomplete)
    }

    fn finish_body(&mut self, req: &mut Request) {
        if req.is_post() && req.header("Content-Type") == Some(FORM_URLENCODED) {
            req.form = decode_form(&req.body);
            debug!(fields = req.form.len(), path = %req.path, "decoded form body");
        }
        self.state = ParseState::Finished;
    }
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUEST_BYTES)
    }
}

/// `METHOD SP PATH SP HTTP/VERSION`, exactly three space-separated tokens.
fn parse_request_line(line: &[u8], req: &mut Request) -> bool {
    let Ok(line) = std::str::from_utf8(line) else {
        return false;
    };
    let mut parts = line.split(' ');
    let (Some(method), Some(path), Some(proto), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let Some(version) = proto.strip_prefix("HTTP/") else {
        return false;
    };

    req.method = method.to_owned();
    req.path = path.to_owned();
    req.version = version.to_owned();
    true
}

/// `key: value`, split at the first colon with one optional leading space
/// dropped from the value. Returns `false` for a line without a colon.
fn parse_header(line: &[u8], req: &mut Request) -> bool {
    let Some(colon) = memchr::memchr(b':', line) else {
        return false;
    };
    let key = String::from_utf8_lossy(&line[..colon]).into_owned();
    let value = &line[colon + 1..];
    let value = value.strip_prefix(b" ").unwrap_or(value);
    req.headers
        .insert(key, String::from_utf8_lossy(value).into_owned());
    true
}

/// Decode an `application/x-www-form-urlencoded` body.
///
/// `+` is a space and `%XY` is the byte `0xXY`. Every `&`-terminated pair
/// overwrites an earlier value for its key; the trailing unterminated pair
/// only fills a key not seen before.
pub fn decode_form(body: &[u8]) -> HashMap<String, String> {
    let mut form = HashMap::new();
    if body.is_empty() {
        return form;
    }
    let pairs = match serde_urlencoded::from_bytes::<Vec<(String, String)>>(body) {
        Ok(pairs) => pairs,
        Err(e) => {
            debug!(error = %e, "undecodable form body");
            return form;
        }
    };

    let terminated = body.ends_with(b"&");
    let last = pairs.len().saturating_sub(1);
    for (i, (key, value)) in pairs.into_iter().enumerate() {
        if i == last && !terminated {
            form.entry(key).or_insert(value);
        } else {
            form.insert(key, value);
        }
    }
    form
}

// src/parser.rs
//! Incremental HTTP/1.1 request parser.
//!
//! Bytes accumulate in a fixed [`RecvBuffer`]; [`RequestParser::parse`] is
//! called after every read and picks up where the previous call stopped.
//! Lines are delimited in place by three cursors:
//!
//! ```text
//!  0          start_line      checked_idx         read_idx      capacity
//!  |-- done --|--- current ---|--- unscanned -----|--- spare ---|
//! ```
//!
//! `start_line <= checked_idx <= read_idx <= capacity` holds after every
//! operation.

use memchr::memchr2;

use crate::http::Method;

pub const READ_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    Complete,
    Malformed,
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Header,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// More bytes are needed.
    Incomplete,
    Complete,
    Malformed,
}

pub struct RecvBuffer {
    data: [u8; READ_BUFFER_SIZE],
    read_idx: usize,
    checked_idx: usize,
    start_line: usize,
    line_end: usize,
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self {
            data: [0; READ_BUFFER_SIZE],
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            line_end: 0,
        }
    }

    pub fn clear(&mut self) {
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.line_end = 0;
    }

    /// Unfilled tail of the buffer, for `recv`.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.read_idx..]
    }

    /// Mark `n` bytes of [`spare_mut`](Self::spare_mut) as filled.
    pub fn commit(&mut self, n: usize) {
        self.read_idx = (self.read_idx + n).min(READ_BUFFER_SIZE);
    }

    /// Copy as much of `bytes` as fits. Returns the number copied.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(READ_BUFFER_SIZE - self.read_idx);
        self.data[self.read_idx..self.read_idx + n].copy_from_slice(&bytes[..n]);
        self.read_idx += n;
        n
    }

    pub fn filled(&self) -> &[u8] {
        &self.data[..self.read_idx]
    }

    pub fn is_full(&self) -> bool {
        self.read_idx == READ_BUFFER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.read_idx == 0
    }

    pub fn read_idx(&self) -> usize {
        self.read_idx
    }

    pub fn checked_idx(&self) -> usize {
        self.checked_idx
    }

    pub fn start_line(&self) -> usize {
        self.start_line
    }

    /// The line most recently delimited by [`read_line`](Self::read_line),
    /// without its terminator.
    pub fn line(&self) -> &[u8] {
        &self.data[self.start_line..self.line_end]
    }

    /// Scan for the next line terminator starting at `checked_idx`.
    ///
    /// On `Complete` the line is `[start_line, line_end)` and `checked_idx`
    /// sits just past the terminator. On `Incomplete` the cursor rests on the
    /// last byte that could still start a terminator.
    pub fn read_line(&mut self) -> LineStatus {
        let filled = &self.data[..self.read_idx];
        let Some(offset) = memchr2(b'\r', b'\n', &filled[self.checked_idx..]) else {
            self.checked_idx = self.read_idx;
            return LineStatus::Incomplete;
        };
        let pos = self.checked_idx + offset;

        if filled[pos] == b'\r' {
            if pos + 1 == self.read_idx {
                self.checked_idx = pos;
                return LineStatus::Incomplete;
            }
            if filled[pos + 1] == b'\n' {
                self.line_end = pos;
                self.checked_idx = pos + 2;
                return LineStatus::Complete;
            }
            self.checked_idx = pos;
            return LineStatus::Malformed;
        }

        // Bare '\n': only valid when the '\r' before it was seen by an
        // earlier call.
        if pos > self.start_line && filled[pos - 1] == b'\r' {
            self.line_end = pos - 1;
            self.checked_idx = pos + 1;
            return LineStatus::Complete;
        }
        self.checked_idx = pos;
        LineStatus::Malformed
    }

    fn finish_line(&mut self) {
        self.start_line = self.checked_idx;
    }
}

#[derive(Debug)]
pub struct RequestParser {
    state: ParseState,
    method: Method,
    target: String,
    version: String,
    host: Option<String>,
    content_length: usize,
    keep_alive: bool,
    body: Vec<u8>,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: Method::Get,
            target: String::new(),
            version: String::new(),
            host: None,
            content_length: 0,
            keep_alive: false,
            body: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.method = Method::Get;
        self.target.clear();
        self.version.clear();
        self.host = None;
        self.content_length = 0;
        self.keep_alive = false;
        self.body.clear();
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Request path, with absolute-form targets reduced to their path and
    /// `/` replaced by the default document.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Advance over whatever `buf` holds. Safe to call again after more
    /// bytes arrive; nothing already consumed is re-parsed.
    pub fn parse(&mut self, buf: &mut RecvBuffer, default_document: &str) -> ParseOutcome {
        let mut line_status = LineStatus::Complete;

        loop {
            let proceed = (self.state == ParseState::Body && line_status == LineStatus::Complete) || {
                line_status = buf.read_line();
                line_status == LineStatus::Complete
            };
            if !proceed {
                break;
            }

            match self.state {
                ParseState::RequestLine => {
                    tracing::trace!(line = %String::from_utf8_lossy(buf.line()), "request line");
                    let ok = self.parse_request_line(buf.line(), default_document);
                    buf.finish_line();
                    if !ok {
                        return ParseOutcome::Malformed;
                    }
                }
                ParseState::Header => {
                    tracing::trace!(line = %String::from_utf8_lossy(buf.line()), "header");
                    let outcome = self.parse_header(buf.line());
                    buf.finish_line();
                    match outcome {
                        Some(ParseOutcome::Incomplete) | None => {}
                        Some(done) => return done,
                    }
                }
                ParseState::Body => {
                    let start = buf.checked_idx;
                    if buf.read_idx >= start + self.content_length {
                        let end = start + self.content_length;
                        self.body.clear();
                        self.body.extend_from_slice(&buf.data[start..end]);
                        buf.checked_idx = end;
                        buf.line_end = end;
                        buf.finish_line();
                        return ParseOutcome::Complete;
                    }
                    // Body bytes are never scanned for terminators.
                    return ParseOutcome::Incomplete;
                }
            }
        }

        if line_status == LineStatus::Malformed {
            return ParseOutcome::Malformed;
        }
        ParseOutcome::Incomplete
    }

    fn parse_request_line(&mut self, line: &[u8], default_document: &str) -> bool {
        let mut parts = line
            .split(|&b| b == b' ' || b == b'\t')
            .filter(|part| !part.is_empty());
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return false;
        };

        let Some(method) = Method::from_bytes(method) else {
            return false;
        };
        if !version.eq_ignore_ascii_case(b"HTTP/1.1") {
            return false;
        }
        let Ok(target) = std::str::from_utf8(target) else {
            return false;
        };

        let path = match strip_scheme(target) {
            Some(rest) => match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => return false,
            },
            None => target,
        };
        if !path.starts_with('/') {
            return false;
        }

        self.method = method;
        self.version = "HTTP/1.1".to_string();
        self.target.clear();
        if path == "/" {
            self.target.push('/');
            self.target.push_str(default_document);
        } else {
            self.target.push_str(path);
        }
        self.state = ParseState::Header;
        true
    }

    /// `None` to keep reading headers, otherwise the outcome to return.
    fn parse_header(&mut self, line: &[u8]) -> Option<ParseOutcome> {
        if line.is_empty() {
            if self.content_length > 0 {
                self.state = ParseState::Body;
                return Some(ParseOutcome::Incomplete);
            }
            return Some(ParseOutcome::Complete);
        }

        let Some(colon) = memchr::memchr(b':', line) else {
            tracing::debug!(header = %String::from_utf8_lossy(line), "ignoring header line without colon");
            return None;
        };
        let name = trim(&line[..colon]);
        let value = trim(&line[colon + 1..]);

        if name.eq_ignore_ascii_case(b"connection") {
            self.keep_alive = value.eq_ignore_ascii_case(b"keep-alive");
        } else if name.eq_ignore_ascii_case(b"content-length") {
            let parsed = std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.parse::<usize>().ok());
            match parsed {
                Some(len) if len <= READ_BUFFER_SIZE => self.content_length = len,
                _ => return Some(ParseOutcome::Malformed),
            }
        } else if name.eq_ignore_ascii_case(b"host") {
            self.host = Some(String::from_utf8_lossy(value).into_owned());
        } else {
            tracing::debug!(header = %String::from_utf8_lossy(name), "unknown header");
        }
        None
    }
}

fn strip_scheme(target: &str) -> Option<&str> {
    let bytes = target.as_bytes();
    for scheme in ["http://", "https://"] {
        if bytes.len() >= scheme.len() && bytes[..scheme.len()].eq_ignore_ascii_case(scheme.as_bytes()) {
            return Some(&target[scheme.len()..]);
        }
    }
    None
}

fn trim(bytes: &[u8]) -> &[u8] {
    let is_space = |b: &u8| *b == b' ' || *b == b'\t';
    let start = bytes.iter().position(|b| !is_space(b)).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !is_space(b)).map_or(start, |i| i + 1);
    &bytes[start..end]
}

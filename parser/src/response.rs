// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Incremental HTTP/1.1 response parser.
//!
//! Mirrors the shape of joyent's `http_parser` (as wrapped by the teacher's
//! request parser): bytes are fed in as they arrive off the wire, and the
//! parser drives a set of callbacks rather than returning a parsed tree. This
//! lets a caller start acting on a response (accumulating headers, streaming
//! a body) before the full message has arrived, and makes pipelined
//! back-to-back responses in one read a non-issue: `execute` simply keeps
//! consuming until the buffer given to it is exhausted.

use crate::tokens::{is_field_vchar, is_ows, is_reason_char, is_tchar};
use crate::version::Version;

/// Failure encountered while tokenizing response bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Status line did not start with a recognized `HTTP/x.x` version.
    Version,
    /// Status code was not exactly 3 ASCII digits.
    StatusCode,
    /// Reason phrase contained a disallowed byte.
    Reason,
    /// Header field name contained a byte outside `tchar`.
    HeaderName,
    /// Header field value contained a byte outside `field-vchar`.
    HeaderValue,
    /// Expected `\r\n` was missing or malformed.
    NewLine,
    /// `Transfer-Encoding: chunked` chunk-size line was not valid hex.
    ChunkSize,
    /// Both `Content-Length` and `Transfer-Encoding: chunked` were present,
    /// or `Content-Length` was not a valid non-negative integer.
    Framing,
}

impl core::fmt::Display for ParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::Version => "invalid or unsupported HTTP version",
            Self::StatusCode => "invalid status code",
            Self::Reason => "invalid byte in reason phrase",
            Self::HeaderName => "invalid byte in header name",
            Self::HeaderValue => "invalid byte in header value",
            Self::NewLine => "invalid or missing newline",
            Self::ChunkSize => "invalid chunk size",
            Self::Framing => "conflicting or invalid message framing",
        })
    }
}

impl std::error::Error for ParseError {}

/// `Result` alias for parser operations.
pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// Callbacks driven by [`ResponseParser::execute`].
///
/// Header field/value bytes may be delivered across more than one call for a
/// single logical header, exactly as joyent's `http_parser` does: a callback
/// fires once per contiguous run of bytes belonging to the same field or
/// value, and a new field/value begins only once the *other* callback fires.
/// The caller is expected to accumulate these into its own buffer and notice
/// the field→value / value→field transition to know when to delimit them —
/// the parser itself carries no opinion on storage.
pub trait ResponseCallbacks {
    /// First line of the response was parsed.
    fn on_status(&mut self, version: Version, status: u16);
    /// A run of bytes belonging to the current header's name.
    fn on_header_field(&mut self, data: &[u8]);
    /// A run of bytes belonging to the current header's value.
    fn on_header_value(&mut self, data: &[u8]);
    /// Headers are fully parsed; body framing has been determined.
    /// Returning `true` tells the parser to treat the body as absent even if
    /// framing headers said otherwise (used for responses to `HEAD`).
    fn on_headers_complete(&mut self) -> bool {
        false
    }
    /// A run of decoded body bytes (dechunked, if applicable).
    fn on_body(&mut self, data: &[u8]);
    /// The full message, including any body, has been received.
    fn on_message_complete(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StatusVersion,
    StatusCode,
    StatusCodeSpace,
    StatusReason,
    StatusReasonCr,
    HeaderLineStart,
    HeaderName,
    HeaderColon,
    HeaderValueStart,
    HeaderValue,
    HeaderValueCr,
    HeadersCr,
    BodyContentLength,
    BodyUntilClose,
    ChunkSizeLine,
    ChunkExtension,
    ChunkSizeCr,
    ChunkData,
    ChunkDataCr,
    ChunkDataLf,
    ChunkTrailerLineStart,
    ChunkTrailerName,
    ChunkTrailerColon,
    ChunkTrailerValue,
    ChunkTrailerValueCr,
    ChunkTrailersCr,
    Done,
}

/// Body framing, determined once headers are complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    UntilClose,
}

/// Which framing-relevant header the parser is currently accumulating the
/// value of, so it knows whether to mirror that value into `value_scratch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderKind {
    Other,
    ContentLength,
    TransferEncoding,
    Connection,
}

fn classify_header_name(name: &[u8]) -> HeaderKind {
    if name.eq_ignore_ascii_case(b"content-length") {
        HeaderKind::ContentLength
    } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
        HeaderKind::TransferEncoding
    } else if name.eq_ignore_ascii_case(b"connection") {
        HeaderKind::Connection
    } else {
        HeaderKind::Other
    }
}

/// Incremental HTTP/1.1 response parser.
///
/// One instance parses exactly one response; call [`ResponseParser::reset`]
/// to reuse it for the next response on a keep-alive connection (this is
/// cheaper than constructing a new one, since it has no heap allocations of
/// its own).
#[derive(Debug)]
pub struct ResponseParser {
    state: State,
    version: Option<Version>,
    status: u16,
    body_mode: BodyMode,
    remaining: u64,
    seen_content_length: bool,
    seen_transfer_encoding_chunked: bool,
    seen_connection_close: bool,
    seen_connection_keep_alive: bool,
    skip_body: bool,
    chunk_size_digits: u32,
    header_kind: HeaderKind,
    name_scratch: Vec<u8>,
    value_scratch: Vec<u8>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    /// Creates a parser ready to parse a status line from byte 0.
    pub fn new() -> Self {
        ResponseParser {
            state: State::StatusVersion,
            version: None,
            status: 0,
            body_mode: BodyMode::None,
            remaining: 0,
            seen_content_length: false,
            seen_transfer_encoding_chunked: false,
            seen_connection_close: false,
            seen_connection_keep_alive: false,
            skip_body: false,
            chunk_size_digits: 0,
            header_kind: HeaderKind::Other,
            name_scratch: Vec::new(),
            value_scratch: Vec::new(),
        }
    }

    /// Resets all per-message state so this parser can parse the next
    /// pipelined response on the same connection.
    pub fn reset(&mut self) {
        *self = ResponseParser::new();
    }

    /// Tell the parser that the next response corresponds to a request whose
    /// method forbids a body in the response (`HEAD`), regardless of framing
    /// headers. Cleared by [`ResponseParser::reset`].
    pub fn skip_next_body(&mut self) {
        self.skip_body = true;
    }

    /// True once [`ResponseParser::on_message_complete`] has fired for the
    /// current message.
    pub fn is_complete(&self) -> bool {
        self.state == State::Done
    }

    /// Whether the peer indicated (via `Connection: close`, or the absence
    /// of keep-alive semantics on HTTP/1.0) that the connection will not
    /// carry another response after this one. Valid only after
    /// [`ResponseParser::on_status`] has fired (i.e. once `version()` is
    /// `Some`).
    pub fn keep_alive(&self) -> bool {
        if self.seen_connection_close {
            return false;
        }
        match self.version {
            Some(v) => v.keeps_alive_by_default() || self.seen_connection_keep_alive,
            None => false,
        }
    }

    /// The parsed status code, valid once the status line has been parsed.
    pub fn status_code(&self) -> u16 {
        self.status
    }

    /// Feeds `buf` to the parser, driving `cb` for every event recognized.
    /// Always consumes the entirety of `buf` unless a malformed byte is
    /// encountered, in which case `Err` is returned and no further bytes
    /// should be fed without calling [`ResponseParser::reset`].
    ///
    /// Bytes received after the message is already [`ResponseParser::is_complete`]
    /// are left for the caller to interpret as the start of the next
    /// pipelined response (reset and re-execute).
    pub fn execute<C: ResponseCallbacks>(&mut self, buf: &[u8], cb: &mut C) -> ParseResult<usize> {
        let mut i = 0usize;
        let mut field_start = 0usize;

        macro_rules! flush_field {
            ($end:expr) => {
                if $end > field_start {
                    cb.on_header_field(&buf[field_start..$end]);
                }
            };
        }
        macro_rules! flush_value {
            ($end:expr) => {
                if $end > field_start {
                    cb.on_header_value(&buf[field_start..$end]);
                }
            };
        }

        while i < buf.len() {
            if self.state == State::Done {
                break;
            }

            let b = buf[i];

            match self.state {
                State::StatusVersion => {
                    const PREFIX: &[u8] = b"HTTP/1.";
                    let start = i;
                    // Require the full "HTTP/1." prefix to be present in one
                    // go; real responses never split it mid-read in practice,
                    // and doing so keeps this state trivially re-entrant.
                    if buf.len() - i < PREFIX.len() + 1 {
                        return Err(ParseError::Version);
                    }
                    if &buf[i..i + PREFIX.len()] != PREFIX {
                        return Err(ParseError::Version);
                    }
                    let minor = buf[i + PREFIX.len()];
                    self.version = Some(match minor {
                        b'0' => Version::Http10,
                        b'1' => Version::Http11,
                        _ => return Err(ParseError::Version),
                    });
                    i += PREFIX.len() + 1;
                    if buf.get(i) != Some(&b' ') {
                        return Err(ParseError::Version);
                    }
                    i += 1;
                    self.state = State::StatusCode;
                    let _ = start;
                    continue;
                }
                State::StatusCode => {
                    if buf.len() - i < 3 {
                        return Err(ParseError::StatusCode);
                    }
                    let mut code: u16 = 0;
                    for &d in &buf[i..i + 3] {
                        if !d.is_ascii_digit() {
                            return Err(ParseError::StatusCode);
                        }
                        code = code * 10 + u16::from(d - b'0');
                    }
                    self.status = code;
                    i += 3;
                    self.state = State::StatusCodeSpace;
                    continue;
                }
                State::StatusCodeSpace => {
                    if b != b' ' {
                        return Err(ParseError::StatusCode);
                    }
                    i += 1;
                    self.state = State::StatusReason;
                    continue;
                }
                State::StatusReason => {
                    if b == b'\r' {
                        self.state = State::StatusReasonCr;
                        i += 1;
                        continue;
                    }
                    if !is_reason_char(b) {
                        return Err(ParseError::Reason);
                    }
                    i += 1;
                }
                State::StatusReasonCr => {
                    if b != b'\n' {
                        return Err(ParseError::NewLine);
                    }
                    i += 1;
                    cb.on_status(self.version.expect("version set before reason"), self.status);
                    field_start = i;
                    self.state = State::HeaderLineStart;
                }
                State::HeaderLineStart => {
                    if b == b'\r' {
                        self.state = State::HeadersCr;
                        i += 1;
                        continue;
                    }
                    field_start = i;
                    self.state = State::HeaderName;
                    continue;
                }
                State::HeaderName => {
                    if b == b':' {
                        flush_field!(i);
                        self.header_kind = classify_header_name(&self.name_scratch);
                        self.name_scratch.clear();
                        i += 1;
                        self.state = State::HeaderColon;
                        continue;
                    }
                    if !is_tchar(b) {
                        return Err(ParseError::HeaderName);
                    }
                    self.name_scratch.push(b);
                    i += 1;
                }
                State::HeaderColon => {
                    if is_ows(b) {
                        i += 1;
                        continue;
                    }
                    field_start = i;
                    self.state = State::HeaderValueStart;
                    continue;
                }
                State::HeaderValueStart | State::HeaderValue => {
                    if b == b'\r' {
                        flush_value!(i);
                        if self.header_kind != HeaderKind::Other {
                            self.apply_framing_value()?;
                        }
                        self.value_scratch.clear();
                        self.header_kind = HeaderKind::Other;
                        self.state = State::HeaderValueCr;
                        i += 1;
                        continue;
                    }
                    if !is_field_vchar(b) {
                        return Err(ParseError::HeaderValue);
                    }
                    if self.header_kind != HeaderKind::Other {
                        self.value_scratch.push(b);
                    }
                    self.state = State::HeaderValue;
                    i += 1;
                }
                State::HeaderValueCr => {
                    if b != b'\n' {
                        return Err(ParseError::NewLine);
                    }
                    i += 1;
                    field_start = i;
                    self.state = State::HeaderLineStart;
                }
                State::HeadersCr => {
                    if b != b'\n' {
                        return Err(ParseError::NewLine);
                    }
                    i += 1;
                    self.begin_body(cb)?;
                }
                State::BodyContentLength => {
                    let take = (self.remaining as usize).min(buf.len() - i);
                    if take > 0 {
                        cb.on_body(&buf[i..i + take]);
                        self.remaining -= take as u64;
                        i += take;
                    }
                    if self.remaining == 0 {
                        self.finish(cb);
                    } else {
                        break;
                    }
                }
                State::BodyUntilClose => {
                    let rest = &buf[i..];
                    if !rest.is_empty() {
                        cb.on_body(rest);
                    }
                    i = buf.len();
                }
                State::ChunkSizeLine => {
                    if b == b';' {
                        self.state = State::ChunkExtension;
                        i += 1;
                        continue;
                    }
                    if b == b'\r' {
                        if self.chunk_size_digits == 0 {
                            return Err(ParseError::ChunkSize);
                        }
                        self.state = State::ChunkSizeCr;
                        i += 1;
                        continue;
                    }
                    let digit = (b as char).to_digit(16).ok_or(ParseError::ChunkSize)?;
                    self.remaining = self
                        .remaining
                        .checked_mul(16)
                        .and_then(|v| v.checked_add(u64::from(digit)))
                        .ok_or(ParseError::ChunkSize)?;
                    self.chunk_size_digits += 1;
                    i += 1;
                }
                State::ChunkExtension => {
                    if b == b'\r' {
                        self.state = State::ChunkSizeCr;
                    }
                    i += 1;
                }
                State::ChunkSizeCr => {
                    if b != b'\n' {
                        return Err(ParseError::NewLine);
                    }
                    i += 1;
                    if self.remaining == 0 {
                        self.state = State::ChunkTrailerLineStart;
                        field_start = i;
                    } else {
                        self.state = State::ChunkData;
                    }
                }
                State::ChunkData => {
                    let take = (self.remaining as usize).min(buf.len() - i);
                    if take > 0 {
                        cb.on_body(&buf[i..i + take]);
                        self.remaining -= take as u64;
                        i += take;
                    }
                    if self.remaining == 0 {
                        self.state = State::ChunkDataCr;
                    } else {
                        break;
                    }
                }
                State::ChunkDataCr => {
                    if b != b'\r' {
                        return Err(ParseError::NewLine);
                    }
                    i += 1;
                    self.state = State::ChunkDataLf;
                }
                State::ChunkDataLf => {
                    if b != b'\n' {
                        return Err(ParseError::NewLine);
                    }
                    i += 1;
                    self.chunk_size_digits = 0;
                    self.remaining = 0;
                    self.state = State::ChunkSizeLine;
                }
                State::ChunkTrailerLineStart => {
                    if b == b'\r' {
                        self.state = State::ChunkTrailersCr;
                        i += 1;
                        continue;
                    }
                    field_start = i;
                    self.state = State::ChunkTrailerName;
                    continue;
                }
                State::ChunkTrailerName => {
                    if b == b':' {
                        i += 1;
                        self.state = State::ChunkTrailerColon;
                        continue;
                    }
                    if !is_tchar(b) {
                        return Err(ParseError::HeaderName);
                    }
                    i += 1;
                }
                State::ChunkTrailerColon => {
                    if is_ows(b) {
                        i += 1;
                        continue;
                    }
                    self.state = State::ChunkTrailerValue;
                    continue;
                }
                State::ChunkTrailerValue => {
                    if b == b'\r' {
                        self.state = State::ChunkTrailerValueCr;
                        i += 1;
                        continue;
                    }
                    if !is_field_vchar(b) {
                        return Err(ParseError::HeaderValue);
                    }
                    i += 1;
                }
                State::ChunkTrailerValueCr => {
                    if b != b'\n' {
                        return Err(ParseError::NewLine);
                    }
                    i += 1;
                    field_start = i;
                    self.state = State::ChunkTrailerLineStart;
                }
                State::ChunkTrailersCr => {
                    if b != b'\n' {
                        return Err(ParseError::NewLine);
                    }
                    i += 1;
                    self.finish(cb);
                }
                State::Done => break,
            }
        }

        // A header name or value may end exactly at the boundary of this
        // buffer, mid-run. Flush what's been seen so far so the caller's own
        // accumulation doesn't silently lose it; the next `execute` call
        // picks back up with a fresh `field_start` and reports only the new
        // bytes, so nothing is double-counted.
        match self.state {
            State::HeaderName => flush_field!(i),
            State::HeaderValueStart | State::HeaderValue => flush_value!(i),
            _ => {}
        }

        Ok(i)
    }

    fn begin_body<C: ResponseCallbacks>(&mut self, cb: &mut C) -> ParseResult<()> {
        if self.seen_content_length && self.seen_transfer_encoding_chunked {
            return Err(ParseError::Framing);
        }

        let no_body_status = matches!(self.status, 100..=199 | 204 | 304);
        let skip = cb.on_headers_complete() || self.skip_body || no_body_status;

        self.body_mode = if skip {
            BodyMode::None
        } else if self.seen_transfer_encoding_chunked {
            BodyMode::Chunked
        } else if self.seen_content_length {
            BodyMode::ContentLength(self.remaining)
        } else {
            BodyMode::UntilClose
        };

        match self.body_mode {
            BodyMode::None => {
                self.finish(cb);
            }
            BodyMode::ContentLength(n) => {
                self.remaining = n;
                self.state = if n == 0 {
                    self.finish(cb);
                    State::Done
                } else {
                    State::BodyContentLength
                };
            }
            BodyMode::Chunked => {
                self.remaining = 0;
                self.chunk_size_digits = 0;
                self.state = State::ChunkSizeLine;
            }
            BodyMode::UntilClose => {
                self.state = State::BodyUntilClose;
            }
        }

        Ok(())
    }

    fn finish<C: ResponseCallbacks>(&mut self, cb: &mut C) {
        self.state = State::Done;
        cb.on_message_complete();
    }
}

/// Header-name-driven framing bookkeeping, applied internally as soon as a
/// framing-relevant header's value is fully accumulated (`value_scratch`).
/// Kept on `ResponseParser` itself rather than delegated to the caller: the
/// caller's own header buffer lives behind a separate, possibly-stale
/// instance by the time headers complete (the owning `Connection` swaps its
/// `ResponseParser` out for the duration of `execute` so it can also act as
/// the callback target), so framing decisions must not depend on a callback
/// reaching back into `self`.
impl ResponseParser {
    /// Applies `self.value_scratch` (the value of the header named by
    /// `self.header_kind`) to framing state, for `Content-Length`,
    /// `Transfer-Encoding`, and `Connection`. Values are compared
    /// case-insensitively only where the grammar requires it (`chunked`,
    /// `close`, `keep-alive`).
    fn apply_framing_value(&mut self) -> ParseResult<()> {
        match self.header_kind {
            HeaderKind::ContentLength => {
                let text = std::str::from_utf8(&self.value_scratch).map_err(|_| ParseError::Framing)?;
                let n: u64 = text.trim().parse().map_err(|_| ParseError::Framing)?;
                self.seen_content_length = true;
                self.remaining = n;
            }
            HeaderKind::TransferEncoding => {
                if contains_token_ci(&self.value_scratch, b"chunked") {
                    self.seen_transfer_encoding_chunked = true;
                }
            }
            HeaderKind::Connection => {
                if contains_token_ci(&self.value_scratch, b"close") {
                    self.seen_connection_close = true;
                }
                if contains_token_ci(&self.value_scratch, b"keep-alive") {
                    self.seen_connection_keep_alive = true;
                }
            }
            HeaderKind::Other => {}
        }
        Ok(())
    }
}

fn contains_token_ci(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .map(|part| {
            let trimmed = trim_ascii(part);
            trimmed
        })
        .any(|part| part.eq_ignore_ascii_case(token))
}

fn trim_ascii(mut s: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = s {
        if is_ows(*first) {
            s = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = s {
        if is_ows(*last) {
            s = rest;
        } else {
            break;
        }
    }
    s
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        status: Option<(Version, u16)>,
        fields: Vec<u8>,
        values: Vec<u8>,
        body: Vec<u8>,
        complete: u32,
    }

    impl ResponseCallbacks for Recorder {
        fn on_status(&mut self, version: Version, status: u16) {
            self.status = Some((version, status));
        }
        fn on_header_field(&mut self, data: &[u8]) {
            self.fields.extend_from_slice(data);
        }
        fn on_header_value(&mut self, data: &[u8]) {
            self.values.extend_from_slice(data);
        }
        fn on_body(&mut self, data: &[u8]) {
            self.body.extend_from_slice(data);
        }
        fn on_message_complete(&mut self) {
            self.complete += 1;
        }
    }

    #[test]
    fn parses_simple_no_body_response() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let input = b"HTTP/1.1 204 No Content\r\n\r\n";
        let n = p.execute(input, &mut r).unwrap();
        assert_eq!(n, input.len());
        assert!(p.is_complete());
        assert_eq!(r.status, Some((Version::Http11, 204)));
        assert_eq!(r.complete, 1);
        assert!(r.body.is_empty());
    }

    #[test]
    fn parses_content_length_body_and_header() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let input = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let n = p.execute(input, &mut r).unwrap();
        assert_eq!(n, input.len());
        assert!(p.is_complete());
        assert_eq!(r.body, b"hello");
        assert_eq!(r.fields, b"Content-Length");
        assert_eq!(r.values, b"5");
    }

    #[test]
    fn parses_across_two_reads() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let first = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhe";
        let n1 = p.execute(first, &mut r).unwrap();
        assert_eq!(n1, first.len());
        assert!(!p.is_complete());
        let second = b"llo";
        let n2 = p.execute(second, &mut r).unwrap();
        assert_eq!(n2, second.len());
        assert!(p.is_complete());
        assert_eq!(r.body, b"hello");
    }

    #[test]
    fn parses_chunked_body() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let input = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let n = p.execute(input, &mut r).unwrap();
        assert_eq!(n, input.len());
        assert!(p.is_complete());
        assert_eq!(r.body, b"Wikipedia");
    }

    #[test]
    fn detects_connection_close() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let input = b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";
        p.execute(input, &mut r).unwrap();
        assert!(!p.keep_alive());
    }

    #[test]
    fn http10_without_keep_alive_header_closes() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let input = b"HTTP/1.0 200 OK\r\n\r\n";
        p.execute(input, &mut r).unwrap();
        assert!(!p.keep_alive());
    }

    #[test]
    fn rejects_bad_version() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        assert_eq!(
            p.execute(b"GARBAGE 200 OK\r\n\r\n", &mut r),
            Err(ParseError::Version)
        );
    }

    #[test]
    fn until_close_body_consumes_everything_as_body() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let input = b"HTTP/1.1 200 OK\r\n\r\nsome body bytes without framing";
        p.execute(input, &mut r).unwrap();
        assert!(!p.is_complete());
        assert_eq!(&r.body[..], &input[input.len() - "some body bytes without framing".len()..]);
    }

    #[test]
    fn rejects_conflicting_framing_headers() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let input = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert_eq!(p.execute(input, &mut r), Err(ParseError::Framing));
    }

    #[test]
    fn content_length_header_split_across_reads_still_frames_the_body() {
        // The framing-critical header arrives in pieces across two reads;
        // the parser must still recognize Content-Length and stop at 5
        // bytes of body instead of falling through to until-close.
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let first = b"HTTP/1.1 200 OK\r\nConte";
        let second = b"nt-Length: 5\r\n\r\nhello";
        p.execute(first, &mut r).unwrap();
        assert!(!p.is_complete());
        p.execute(second, &mut r).unwrap();
        assert!(p.is_complete());
        assert_eq!(r.body, b"hello");
        assert_eq!(r.fields, b"Content-Length");
    }

    #[test]
    fn header_value_split_across_reads_is_reported_in_full() {
        let mut p = ResponseParser::new();
        let mut r = Recorder::default();
        let first = b"HTTP/1.1 200 OK\r\nX-Test: ab";
        let second = b"cdef\r\n\r\n";
        p.execute(first, &mut r).unwrap();
        p.execute(second, &mut r).unwrap();
        assert_eq!(r.fields, b"X-Test");
        assert_eq!(r.values, b"abcdef");
    }
}

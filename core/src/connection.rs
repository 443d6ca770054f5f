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

//! Per-connection state machine: connect → handshake → request/response
//! pipelining → reconnect.
//!
//! Socket I/O and reactor registration are driven by
//! [`crate::thread_engine::ThreadEngine`], which owns the reactor and every
//! connection's socket; this module holds each connection's own state and
//! the HTTP response bookkeeping (header field/value accumulation, pending
//! count, batch timing) so that logic can be exercised without a live
//! socket.

use std::time::Instant;

use gale_parser::{ParseResult, ResponseCallbacks, ResponseParser, Version};
use mio::Interest;

use crate::buffer::Buffer;
use crate::socket::Socket;

/// Fixed receive buffer size, matching the original's `RECVBUF`.
pub const RECVBUF: usize = 8192;

/// Coarse connection lifecycle state (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No transport; about to (re)connect.
    Closed,
    /// Non-blocking connect issued, awaiting completion.
    Connecting,
    /// TCP established (or not needed); TLS handshake in progress.
    Handshaking,
    /// Established and idle between batches.
    Idle,
    /// Writing the current batch of pipelined requests.
    Sending,
    /// Batch fully written; draining responses.
    Awaiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderPart {
    Field,
    Value,
}

/// One fully-parsed response within a (possibly pipelined) batch, staged for
/// [`Connection::take_responses`].
#[derive(Debug)]
pub struct CompletedResponse {
    /// Parsed status code.
    pub status: u16,
    /// Headers, populated only when the run wants script response hooks.
    pub headers: Vec<(String, String)>,
    /// Body bytes, populated only when the run wants script response hooks.
    pub body: Vec<u8>,
    /// Whether the peer's response indicates the connection should close.
    pub keep_alive: bool,
}

/// A single connection's socket, parser, and pipelining state.
pub struct Connection {
    socket: Option<Socket>,
    state: ConnState,
    parser: ResponseParser,
    header_part: HeaderPart,
    cur_field: Buffer,
    cur_value: Buffer,
    cur_headers: Vec<(String, String)>,
    cur_body: Buffer,
    want_response: bool,
    finished_responses: Vec<CompletedResponse>,
    is_connected: bool,
    /// Set while a script-injected delay is pending before the next batch.
    pub delayed: bool,
    request_start: Option<Instant>,
    r_started: u64,
    r_completed: u64,
    r_read: u64,
    outbound: Vec<u8>,
    written: usize,
    pending: u64,
    recv_buf: Box<[u8; RECVBUF]>,
    /// The readiness mask last requested during a handshake; reconciled
    /// exactly (spec §4.2, §9).
    pub connect_interest: Interest,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("is_connected", &self.is_connected)
            .field("pending", &self.pending)
            .field("r_started", &self.r_started)
            .field("r_completed", &self.r_completed)
            .field("r_read", &self.r_read)
            .finish()
    }
}

impl Connection {
    /// Creates a connection with no socket yet (state `Closed`), ready for
    /// its first connect.
    pub fn new(want_response: bool) -> Self {
        Connection {
            socket: None,
            state: ConnState::Closed,
            parser: ResponseParser::new(),
            header_part: HeaderPart::Field,
            cur_field: Buffer::new(64),
            cur_value: Buffer::new(64),
            cur_headers: Vec::new(),
            cur_body: Buffer::new(256),
            want_response,
            finished_responses: Vec::new(),
            is_connected: false,
            delayed: false,
            request_start: None,
            r_started: 0,
            r_completed: 0,
            r_read: 0,
            outbound: Vec::new(),
            written: 0,
            pending: 0,
            recv_buf: Box::new([0u8; RECVBUF]),
            connect_interest: Interest::READABLE,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Moves to `state`.
    pub fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    /// The live socket, if connected.
    pub fn socket(&self) -> Option<&Socket> {
        self.socket.as_ref()
    }

    /// The live socket, mutably.
    pub fn socket_mut(&mut self) -> Option<&mut Socket> {
        self.socket.as_mut()
    }

    /// Installs a freshly connected socket and transitions out of `Closed`.
    pub fn set_socket(&mut self, socket: Socket) {
        self.socket = Some(socket);
        self.state = ConnState::Connecting;
    }

    /// Tears down the socket (reconnect or shutdown), resetting all
    /// per-batch and per-message state, but preserving cumulative counters
    /// (`r_started`, `r_completed`, `r_read`) used by the fairness
    /// histogram.
    pub fn close_for_reconnect(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.close();
        }
        self.state = ConnState::Closed;
        self.is_connected = false;
        self.parser.reset();
        self.header_part = HeaderPart::Field;
        self.cur_field.clear();
        self.cur_value.clear();
        self.cur_headers.clear();
        self.cur_body.clear();
        self.finished_responses.clear();
        self.outbound.clear();
        self.written = 0;
        self.pending = 0;
        self.request_start = None;
        self.delayed = false;
    }

    /// Whether the handshake has completed at least once.
    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    /// Marks the handshake complete.
    pub fn mark_connected(&mut self) {
        self.is_connected = true;
    }

    /// Fixed-size receive buffer used by the thread engine's read loop.
    pub fn recv_buf_mut(&mut self) -> &mut [u8; RECVBUF] {
        &mut self.recv_buf
    }

    /// `r_started`, `r_completed`, `r_read` — cumulative per-connection
    /// counters backing the fairness histogram (spec §4.8).
    pub fn counters(&self) -> (u64, u64, u64) {
        (self.r_started, self.r_completed, self.r_read)
    }

    /// Records `n` bytes received over this connection's lifetime.
    pub fn note_bytes_read(&mut self, n: u64) {
        self.r_read += n;
    }

    /// Begins a new pipelined batch: stores the request bytes, arms the
    /// pending-response counter to `pipeline`, and clears `written`.
    /// `r_started` increments once per batch, not once per pipelined
    /// request, mirroring the per-batch completion semantics used to
    /// gate re-arming WRITABLE.
    pub fn start_batch(&mut self, request: Vec<u8>, pipeline: u64) {
        self.outbound = request;
        self.written = 0;
        self.pending = pipeline;
        self.r_started += 1;
    }

    /// Bytes of the current batch not yet written.
    pub fn outbound_remaining(&self) -> &[u8] {
        &self.outbound[self.written..]
    }

    /// Splits into the unwritten tail of the current batch and the live
    /// socket, so a caller can write one into the other without taking two
    /// conflicting mutable borrows of `self` through separate accessors.
    pub fn write_parts(&mut self) -> (&[u8], Option<&mut Socket>) {
        (&self.outbound[self.written..], self.socket.as_mut())
    }

    /// Splits into the fixed receive buffer and the live socket, for the
    /// same reason as [`Connection::write_parts`].
    pub fn read_parts(&mut self) -> (&mut [u8; RECVBUF], Option<&mut Socket>) {
        (&mut self.recv_buf, self.socket.as_mut())
    }

    /// Whether the current batch is fully acknowledged: nothing pending
    /// and nothing left unwritten, so the connection is eligible to start
    /// a new batch.
    pub fn batch_idle(&self) -> bool {
        self.pending == 0 && self.written >= self.outbound.len()
    }

    /// Records `n` additional bytes written. Returns `true` once the whole
    /// batch has been flushed. `start` is recorded the instant `written`
    /// transitions away from 0 — biasing latency low for send-buffered
    /// sockets, preserved as in the original rather than "fixed" (spec §9
    /// Open Question).
    pub fn note_bytes_written(&mut self, n: usize, now: Instant) -> bool {
        if self.written == 0 && n > 0 {
            self.request_start = Some(now);
        }
        self.written += n;
        self.written >= self.outbound.len()
    }

    /// Pending responses still owed for the current batch.
    pub fn pending(&self) -> u64 {
        self.pending
    }

    /// Whether the in-flight batch has been awaiting its remaining
    /// responses for at least `timeout`, for the thread engine's periodic
    /// timeout sweep.
    pub fn timed_out(&self, now: Instant, timeout: std::time::Duration) -> bool {
        self.pending > 0
            && self
                .request_start
                .map(|start| now.saturating_duration_since(start) >= timeout)
                .unwrap_or(false)
    }

    /// Feeds freshly-read bytes to the response parser. On
    /// `on_message_complete`, stages a [`CompletedResponse`] for
    /// [`Connection::take_responses`] and decrements `pending`.
    pub fn feed(&mut self, data: &[u8]) -> ParseResult<usize> {
        let mut parser = std::mem::take(&mut self.parser);
        let result = parser.execute(data, self);
        self.parser = parser;
        result
    }

    /// Whether the parser finished the current message (caller should reset
    /// the parser via [`Connection::prepare_for_next_response`] before
    /// feeding pipelined bytes for the next one).
    pub fn message_complete(&self) -> bool {
        self.parser.is_complete()
    }

    /// Whether the peer indicated the connection will not be reused.
    pub fn peer_keep_alive(&self) -> bool {
        self.parser.keep_alive()
    }

    /// Resets the parser for the next pipelined response on the same
    /// connection, without touching socket or batch state.
    pub fn prepare_for_next_response(&mut self) {
        self.parser.reset();
    }

    /// Drains completed responses staged since the last call.
    pub fn take_responses(&mut self) -> Vec<CompletedResponse> {
        std::mem::take(&mut self.finished_responses)
    }

    /// Decrements `pending` by one (called once per response-complete,
    /// per-batch re-arm gate). Returns `true` once it reaches zero and the
    /// batch's latency should be recorded.
    ///
    /// Leaves `written` untouched: it already equals `outbound.len()` from
    /// the batch's completed write, which is exactly what [`batch_idle`]
    /// needs to see to let the next call to `start_batch` replace `outbound`
    /// and reset `written` to 0 for the new batch. Zeroing it here instead
    /// would make `batch_idle` compare `written` (0) against the *previous*
    /// batch's length and never report idle, stalling the connection after
    /// one batch.
    ///
    /// [`batch_idle`]: Connection::batch_idle
    pub fn complete_one_response(&mut self, now: Instant) -> Option<std::time::Duration> {
        self.r_completed += 1;
        self.pending = self.pending.saturating_sub(1);
        if self.pending == 0 {
            let latency = self
                .request_start
                .map(|start| now.saturating_duration_since(start))
                .unwrap_or_default();
            Some(latency)
        } else {
            None
        }
    }

    /// Flushes the accumulated field/value pair into `cur_headers` for
    /// script `want_response` consumption. Framing (`Content-Length`,
    /// `Transfer-Encoding`, `Connection`) is decided by the parser itself as
    /// bytes arrive, not here — see `gale_parser::ResponseParser`'s internal
    /// `apply_framing_value`.
    fn flush_header_pair(&mut self) {
        if self.cur_field.remaining() == 0 && self.cur_value.remaining() == 0 {
            return;
        }
        if self.want_response {
            let name = String::from_utf8_lossy(&self.cur_field).into_owned();
            let value = String::from_utf8_lossy(&self.cur_value).into_owned();
            self.cur_headers.push((name, value));
        }
        self.cur_field.clear();
        self.cur_value.clear();
    }
}

impl ResponseCallbacks for Connection {
    fn on_status(&mut self, _version: Version, _status: u16) {
        self.header_part = HeaderPart::Field;
    }

    fn on_header_field(&mut self, data: &[u8]) {
        if self.header_part == HeaderPart::Value && self.cur_value.remaining() > 0 {
            self.flush_header_pair();
        }
        self.header_part = HeaderPart::Field;
        self.cur_field.extend(data);
    }

    fn on_header_value(&mut self, data: &[u8]) {
        self.header_part = HeaderPart::Value;
        self.cur_value.extend(data);
    }

    fn on_headers_complete(&mut self) -> bool {
        self.flush_header_pair();
        false
    }

    fn on_body(&mut self, data: &[u8]) {
        if self.want_response {
            self.cur_body.extend(data);
        }
    }

    fn on_message_complete(&mut self) {
        self.finished_responses.push(CompletedResponse {
            status: self.parser.status_code(),
            headers: std::mem::take(&mut self.cur_headers),
            body: {
                let body: Vec<u8> = self.cur_body.to_vec();
                self.cur_body.clear();
                body
            },
            keep_alive: self.parser.keep_alive(),
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn start_batch_resets_written_and_sets_pending() {
        let mut c = Connection::new(false);
        c.start_batch(b"GET / HTTP/1.1\r\n\r\n".to_vec(), 3);
        assert_eq!(c.pending(), 3);
        assert_eq!(c.outbound_remaining().len(), 18);
    }

    #[test]
    fn note_bytes_written_tracks_full_flush() {
        let mut c = Connection::new(false);
        c.start_batch(b"abc".to_vec(), 1);
        let now = Instant::now();
        assert!(!c.note_bytes_written(2, now));
        assert!(c.note_bytes_written(1, now));
    }

    #[test]
    fn complete_one_response_decrements_pending_and_records_latency_at_zero() {
        let mut c = Connection::new(false);
        c.start_batch(b"abc".to_vec(), 2);
        let t0 = Instant::now();
        c.note_bytes_written(3, t0);
        assert!(c.complete_one_response(t0).is_none());
        assert!(c.complete_one_response(t0).is_some());
        assert_eq!(c.counters().1, 2);
    }

    #[test]
    fn feeding_full_response_stages_completed_response() {
        let mut c = Connection::new(true);
        let input = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        c.feed(input).unwrap();
        let responses = c.take_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, 200);
        assert_eq!(responses[0].body, b"hi");
    }

    #[test]
    fn close_for_reconnect_preserves_cumulative_counters() {
        let mut c = Connection::new(false);
        c.start_batch(b"abc".to_vec(), 1);
        c.complete_one_response(Instant::now());
        let before = c.counters();
        c.close_for_reconnect();
        assert_eq!(c.counters(), before);
        assert_eq!(c.pending(), 0);
    }
}

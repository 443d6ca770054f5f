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

//! The per-thread engine: owns one [`Reactor`] and every connection it
//! drives through connect → handshake → request/response pipelining →
//! reconnect, and reports a [`ThreadReport`] once its reactor stops.
//!
//! Every connection's state lives behind one `Rc<RefCell<Shared>>` rather
//! than inside the reactor callbacks themselves, because [`Reactor`]'s
//! callback signature only ever hands back `&mut Reactor` — there is no
//! other channel back to per-connection or per-thread state. Callbacks
//! capture a clone of the `Rc` plus the connection's index and borrow
//! `Shared` for the duration of their own body; the reactor's take-then-put
//! back dispatch (see `reactor.rs`) makes it safe for a callback to
//! register, reregister, or deregister itself or any other connection's
//! callback while running.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::Interest;
use rustls::ClientConfig;
use tracing::{debug, warn};

use crate::aggregator::ThreadReport;
use crate::config::Config;
use crate::connection::{CompletedResponse, Connection, RECVBUF};
use crate::error::SpawnError;
use crate::reactor::{Reactor, Readiness, Token};
use crate::runtime::Runtime;
use crate::script::{ErrorCounts, ScriptEngine};
use crate::socket::{ConnectProgress, IoProgress, Socket};
use crate::stats::Statistics;
use crate::sync::InterProcessSync;

/// How often each thread samples its request-rate histogram and sweeps for
/// timed-out batches, matching the original's `RECORD_INTERVAL_MS`.
const RECORD_INTERVAL_MS: u64 = 100;

/// How often a thread that has finished warming up polls
/// [`Runtime::is_ready`] while waiting on its peers, matching the
/// original's `THREAD_SYNC_INTERVAL_MS`.
const THREAD_SYNC_INTERVAL_MS: u64 = 1000;

/// Delay before retrying a connect attempt that failed synchronously
/// (before the reactor ever saw it), so a persistently refusing target
/// does not spin a thread in a tight connect loop.
const CONNECT_RETRY_DELAY_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Warmup,
    Normal,
}

struct ConnSlot {
    conn: Connection,
    token: Option<Token>,
    /// Bumped every time this slot starts a fresh connect attempt, so a
    /// callback that reconnects mid-dispatch can tell its caller the
    /// connection it was driving no longer exists.
    generation: u64,
}

struct Shared {
    config: Arc<Config>,
    runtime: Arc<Runtime>,
    sync: Arc<Mutex<InterProcessSync>>,
    script: Box<dyn ScriptEngine>,
    thread_index: u64,
    remote_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    tls_config: Option<Arc<ClientConfig>>,
    connections: Vec<ConnSlot>,
    phase: Phase,
    phase_normal_start: Option<Instant>,
    start: Instant,
    complete: u64,
    requests: u64,
    bytes: u64,
    errors: ErrorCounts,
    reconnects: u64,
    established: u64,
    last_record_complete: u64,
    latency: Statistics,
    request_rate: Statistics,
    sync_interval_armed: bool,
}

/// Spawns one worker thread, returning its `JoinHandle` immediately. The
/// handle's result distinguishes a reactor construction failure (fatal to
/// that thread's own startup) from a clean run.
///
/// `script_factory` is called once, on the new thread, to build that
/// thread's own [`ScriptEngine`] instance — scripting backends such as an
/// embedded Lua interpreter are not `Send`, so every thread must build its
/// own rather than share one built centrally.
pub fn spawn(
    thread_index: u64,
    config: Arc<Config>,
    runtime: Arc<Runtime>,
    remote_addr: SocketAddr,
    tls_config: Option<Arc<ClientConfig>>,
    sync: Arc<Mutex<InterProcessSync>>,
    script_factory: Arc<dyn Fn() -> Box<dyn ScriptEngine> + Send + Sync>,
) -> io::Result<JoinHandle<Result<ThreadReport, SpawnError>>> {
    std::thread::Builder::new()
        .name(format!("gale-worker-{thread_index}"))
        .spawn(move || {
            run_thread(
                thread_index,
                config,
                runtime,
                remote_addr,
                tls_config,
                sync,
                script_factory,
            )
        })
}

fn run_thread(
    thread_index: u64,
    config: Arc<Config>,
    runtime: Arc<Runtime>,
    remote_addr: SocketAddr,
    tls_config: Option<Arc<ClientConfig>>,
    sync: Arc<Mutex<InterProcessSync>>,
    script_factory: Arc<dyn Fn() -> Box<dyn ScriptEngine> + Send + Sync>,
) -> Result<ThreadReport, SpawnError> {
    let mut reactor = Reactor::new().map_err(|source| SpawnError::Reactor {
        thread: thread_index,
        source,
    })?;

    let mut script = script_factory();
    script.init(
        crate::script::ThreadContext {
            thread_index,
            threads: config.threads,
        },
        &[],
    );

    let local_addr = config.local_ip_for_thread(thread_index).and_then(|ip| {
        match crate::runtime::resolve_local_bind_addr(ip) {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!(thread = thread_index, ip, error = %e, "could not resolve local bind address; using default route");
                None
            }
        }
    });

    let n = config.connections_for_thread(thread_index) as usize;
    let now = Instant::now();
    let initial_phase = if config.warmup { Phase::Warmup } else { Phase::Normal };

    let shared = Rc::new(RefCell::new(Shared {
        config: config.clone(),
        runtime,
        sync,
        script,
        thread_index,
        remote_addr,
        local_addr,
        tls_config,
        connections: Vec::with_capacity(n),
        phase: initial_phase,
        phase_normal_start: None,
        start: now,
        complete: 0,
        requests: 0,
        bytes: 0,
        errors: ErrorCounts::default(),
        reconnects: 0,
        established: 0,
        last_record_complete: 0,
        latency: Statistics::latency(config.timeout.as_millis() as u64),
        request_rate: Statistics::request_rate(),
        sync_interval_armed: false,
    }));

    for _ in 0..n {
        shared.borrow_mut().connections.push(ConnSlot {
            conn: Connection::new(config.want_response),
            token: None,
            generation: 0,
        });
    }
    for idx in 0..n {
        start_connect(&mut reactor, &shared, idx);
    }

    register_record_timer(&mut reactor, &shared);
    if config.warmup && config.sync_addr.is_none() {
        register_warmup_timeout(&mut reactor, &shared);
    }

    reactor.run().map_err(|source| SpawnError::Reactor {
        thread: thread_index,
        source,
    })?;

    // Every registered callback (and every timer) holds its own clone of
    // `shared`; dropping the reactor drops them all before we try to
    // reclaim sole ownership below.
    drop(reactor);

    let shared = Rc::try_unwrap(shared)
        .unwrap_or_else(|_| unreachable!("reactor callbacks outlive the stopped reactor"))
        .into_inner();

    Ok(ThreadReport {
        complete: shared.complete,
        requests: shared.requests,
        bytes: shared.bytes,
        errors: shared.errors,
        reconnects: shared.reconnects,
        established: shared.established,
        phase_normal_start: shared.phase_normal_start,
        start: shared.start,
        connections: shared.connections.iter().map(|c| c.conn.counters()).collect(),
        latency: shared.latency,
        request_rate: shared.request_rate,
    })
}

fn start_connect(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, idx: usize) {
    shared.borrow_mut().connections[idx].generation += 1;

    let (transport, remote, local, tls_config, host) = {
        let s = shared.borrow();
        (s.config.transport, s.remote_addr, s.local_addr, s.tls_config.clone(), s.config.host.clone())
    };

    let socket = match Socket::connect(transport, remote, local, &host, tls_config) {
        Ok(socket) => socket,
        Err(e) => {
            let mut s = shared.borrow_mut();
            s.errors.connect += 1;
            warn!(thread = s.thread_index, connection = idx, error = %e, "connect failed");
            drop(s);

            let shared2 = shared.clone();
            reactor.register_timer(
                Duration::from_millis(CONNECT_RETRY_DELAY_MS),
                Box::new(move |reactor| {
                    start_connect(reactor, &shared2, idx);
                    None
                }),
            );
            return;
        }
    };

    shared.borrow_mut().connections[idx].conn.set_socket(socket);

    let shared2 = shared.clone();
    let registered = {
        let mut s = shared.borrow_mut();
        let sock = s.connections[idx]
            .conn
            .socket_mut()
            .expect("socket was just installed by set_socket");
        reactor.register_io(
            sock,
            Interest::READABLE | Interest::WRITABLE,
            Box::new(move |reactor, readiness| {
                on_connect_readiness(reactor, &shared2, idx, readiness);
            }),
        )
    };

    match registered {
        Ok(token) => shared.borrow_mut().connections[idx].token = Some(token),
        Err(e) => {
            warn!(error = %e, "reactor registration failed during connect; stopping thread");
            shared.borrow().runtime.request_stop();
            reactor.stop();
        }
    }
}

fn on_connect_readiness(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, idx: usize, _readiness: Readiness) {
    let progress = {
        let mut s = shared.borrow_mut();
        let sock = match s.connections[idx].conn.socket_mut() {
            Some(sock) => sock,
            None => return,
        };
        sock.connect_progress()
    };

    match progress {
        Ok(ConnectProgress::Complete) => on_established(reactor, shared, idx),
        Ok(ConnectProgress::Retry(interest)) => {
            let mut s = shared.borrow_mut();
            s.connections[idx].conn.connect_interest = interest;
            let token = s.connections[idx].token;
            if let (Some(token), Some(sock)) = (token, s.connections[idx].conn.socket_mut()) {
                let _ = reactor.reregister_io(sock, token, interest);
            }
        }
        Err(e) => {
            let mut s = shared.borrow_mut();
            s.errors.connect += 1;
            debug!(thread = s.thread_index, connection = idx, error = %e, "handshake failed");
            drop(s);
            reconnect(reactor, shared, idx);
        }
    }
}

fn on_established(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, idx: usize) {
    let (phase, warmup, strict_sync, total_threads) = {
        let mut s = shared.borrow_mut();
        let token = s.connections[idx].token.take();
        if let (Some(token), Some(sock)) = (token, s.connections[idx].conn.socket_mut()) {
            let _ = reactor.deregister_io(sock, token);
        }
        s.connections[idx].conn.mark_connected();
        s.established += 1;
        (s.phase, s.config.warmup, s.config.strict_sync, s.config.threads)
    };

    if phase == Phase::Normal || !warmup {
        arm_normal(reactor, shared, idx);
        return;
    }

    let all_established = shared.borrow().connections.iter().all(|c| c.conn.is_connected());
    if !all_established {
        return;
    }

    if !shared.borrow().sync_interval_armed {
        shared.borrow_mut().sync_interval_armed = true;
        register_inter_thread_sync_timer(reactor, shared);
    }

    let ready_count = shared.borrow().runtime.mark_thread_ready();
    if ready_count == total_threads {
        let sync = shared.borrow().sync.clone();
        let mut guard = sync.lock().expect("inter-process sync mutex poisoned");
        if let Err(e) = guard.barrier(strict_sync) {
            warn!(error = %e, "inter-process barrier failed");
        }
        drop(guard);
        shared.borrow().runtime.set_ready();
    }

    if shared.borrow().runtime.is_ready() {
        transition_to_normal(reactor, shared);
    }
}

fn register_inter_thread_sync_timer(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>) {
    let shared2 = shared.clone();
    reactor.register_timer(
        Duration::from_millis(THREAD_SYNC_INTERVAL_MS),
        Box::new(move |reactor| {
            if shared2.borrow().runtime.is_ready() {
                transition_to_normal(reactor, &shared2);
                return None;
            }
            Some(Duration::from_millis(THREAD_SYNC_INTERVAL_MS))
        }),
    );
}

fn register_warmup_timeout(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>) {
    let timeout = shared.borrow().config.effective_warmup_timeout();
    let shared2 = shared.clone();
    reactor.register_timer(
        timeout,
        Box::new(move |reactor| {
            if shared2.borrow().phase == Phase::Warmup {
                warn!("warmup timeout elapsed before every thread reported ready; forcing normal phase");
                transition_to_normal(reactor, &shared2);
            }
            None
        }),
    );
}

fn transition_to_normal(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>) {
    let already_normal = {
        let mut s = shared.borrow_mut();
        if s.phase == Phase::Normal {
            true
        } else {
            s.phase = Phase::Normal;
            s.phase_normal_start = Some(Instant::now());
            false
        }
    };
    if already_normal {
        return;
    }

    let n = shared.borrow().connections.len();
    for idx in 0..n {
        if shared.borrow().connections[idx].conn.is_connected() {
            arm_normal(reactor, shared, idx);
        }
    }
}

fn arm_normal(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, idx: usize) {
    if shared.borrow().connections[idx].token.is_some() {
        return;
    }

    let shared2 = shared.clone();
    let registered = {
        let mut s = shared.borrow_mut();
        let sock = s.connections[idx]
            .conn
            .socket_mut()
            .expect("arm_normal is only called on an established connection");
        reactor.register_io(
            sock,
            Interest::READABLE | Interest::WRITABLE,
            Box::new(move |reactor, readiness| {
                on_steady_readiness(reactor, &shared2, idx, readiness);
            }),
        )
    };

    match registered {
        Ok(token) => shared.borrow_mut().connections[idx].token = Some(token),
        Err(e) => {
            warn!(error = %e, "reactor registration failed while arming normal phase; stopping thread");
            shared.borrow().runtime.request_stop();
            reactor.stop();
        }
    }
}

/// Drops WRITABLE from the connection's registered interest once a batch has
/// been fully flushed to the socket (spec §4.4: "disarm WRITABLE"), so the
/// reactor doesn't spin delivering writable edges with nothing owed.
fn disarm_writable(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, idx: usize) {
    let mut s = shared.borrow_mut();
    let token = s.connections[idx].token;
    if let (Some(token), Some(sock)) = (token, s.connections[idx].conn.socket_mut()) {
        if let Err(e) = reactor.reregister_io(sock, token, Interest::READABLE) {
            warn!(error = %e, "failed to disarm WRITABLE after batch flush");
        }
    }
}

/// Re-arms WRITABLE once the in-flight batch's pending responses have all
/// completed (spec §4.4: "re-arm WRITABLE to begin the next batch"), so the
/// reactor delivers another writable edge to start the next pipeline batch.
fn rearm_writable(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, idx: usize) {
    let mut s = shared.borrow_mut();
    let token = s.connections[idx].token;
    if let (Some(token), Some(sock)) = (token, s.connections[idx].conn.socket_mut()) {
        if let Err(e) = reactor.reregister_io(sock, token, Interest::READABLE | Interest::WRITABLE) {
            warn!(error = %e, "failed to re-arm WRITABLE for next batch");
        }
    }
}

fn reconnect(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, idx: usize) {
    if shared.borrow().runtime.should_stop() {
        return;
    }

    {
        let mut s = shared.borrow_mut();
        let token = s.connections[idx].token.take();
        if let (Some(token), Some(sock)) = (token, s.connections[idx].conn.socket_mut()) {
            let _ = reactor.deregister_io(sock, token);
        }
        s.connections[idx].conn.close_for_reconnect();
        s.reconnects += 1;
    }

    start_connect(reactor, shared, idx);
}

fn register_record_timer(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>) {
    let shared2 = shared.clone();
    reactor.register_timer(
        Duration::from_millis(RECORD_INTERVAL_MS),
        Box::new(move |reactor| on_record_tick(reactor, &shared2)),
    );
}

fn on_record_tick(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>) -> Option<Duration> {
    if shared.borrow().runtime.should_stop() {
        reactor.stop();
        return None;
    }

    let (timeout, n) = {
        let mut s = shared.borrow_mut();
        let delta = s.complete.saturating_sub(s.last_record_complete);
        s.last_record_complete = s.complete;
        let rate = delta.saturating_mul(1000 / RECORD_INTERVAL_MS);
        s.request_rate.record(rate);
        (s.config.timeout, s.connections.len())
    };

    let now = Instant::now();
    for idx in 0..n {
        let timed_out = shared.borrow().connections[idx].conn.timed_out(now, timeout);
        if timed_out {
            shared.borrow_mut().errors.timeout += 1;
            reconnect(reactor, shared, idx);
        }
    }

    Some(Duration::from_millis(RECORD_INTERVAL_MS))
}

fn build_batch(shared: &Rc<RefCell<Shared>>) -> Vec<u8> {
    let mut s = shared.borrow_mut();
    let pipeline = s.config.pipeline.max(1);
    let dynamic = s.config.dynamic;

    if dynamic {
        let mut batch = Vec::new();
        for _ in 0..pipeline {
            batch.extend_from_slice(&s.script.request());
        }
        batch
    } else {
        let one = s.script.request();
        let mut batch = Vec::with_capacity(one.len() * pipeline as usize);
        for _ in 0..pipeline {
            batch.extend_from_slice(&one);
        }
        batch
    }
}

fn on_steady_readiness(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, idx: usize, readiness: Readiness) {
    let generation = shared.borrow().connections[idx].generation;

    if readiness.writable {
        handle_writable(reactor, shared, idx);
    }

    if shared.borrow().connections[idx].generation != generation {
        return;
    }

    if readiness.readable {
        handle_readable(reactor, shared, idx);
    }
}

fn handle_writable(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, idx: usize) {
    if shared.borrow().connections[idx].conn.delayed {
        return;
    }

    if shared.borrow().connections[idx].conn.batch_idle() {
        if shared.borrow().config.delay {
            let ms = shared.borrow_mut().script.delay();
            if ms > 0 {
                shared.borrow_mut().connections[idx].conn.delayed = true;
                let shared2 = shared.clone();
                reactor.register_timer(
                    Duration::from_millis(ms),
                    Box::new(move |_reactor| {
                        shared2.borrow_mut().connections[idx].conn.delayed = false;
                        None
                    }),
                );
                return;
            }
        }

        let batch = build_batch(shared);
        let mut s = shared.borrow_mut();
        let pipeline = s.config.pipeline.max(1);
        s.connections[idx].conn.start_batch(batch, pipeline);
        s.requests += 1;
    }

    let mut batch_done = false;
    loop {
        let write_result = {
            let mut s = shared.borrow_mut();
            let conn = &mut s.connections[idx].conn;
            let (remaining, socket) = conn.write_parts();
            if remaining.is_empty() {
                None
            } else {
                let socket = socket.expect("sending connection must hold a socket");
                Some(socket.write(remaining))
            }
        };

        let Some(write_result) = write_result else {
            break;
        };

        match write_result {
            Ok(IoProgress::Complete(n)) => {
                let now = Instant::now();
                let mut s = shared.borrow_mut();
                let done = s.connections[idx].conn.note_bytes_written(n, now);
                if done {
                    batch_done = true;
                    break;
                }
            }
            Ok(IoProgress::Retry) => break,
            Ok(IoProgress::Closed) => {
                shared.borrow_mut().errors.write += 1;
                reconnect(reactor, shared, idx);
                return;
            }
            Err(_e) => {
                shared.borrow_mut().errors.write += 1;
                reconnect(reactor, shared, idx);
                return;
            }
        }
    }

    if batch_done {
        disarm_writable(reactor, shared, idx);
    }
}

fn handle_readable(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, idx: usize) {
    let generation = shared.borrow().connections[idx].generation;

    loop {
        let outcome = {
            let mut s = shared.borrow_mut();
            let conn = &mut s.connections[idx].conn;
            let (buf, socket) = conn.read_parts();
            match socket {
                Some(socket) => socket.read(buf),
                None => return,
            }
        };

        let mut filled_buffer = false;
        match outcome {
            Ok(IoProgress::Retry) => break,
            Ok(IoProgress::Closed) => {
                shared.borrow_mut().errors.read += 1;
                reconnect(reactor, shared, idx);
                return;
            }
            Err(_e) => {
                shared.borrow_mut().errors.read += 1;
                reconnect(reactor, shared, idx);
                return;
            }
            Ok(IoProgress::Complete(n)) => {
                filled_buffer = n == RECVBUF;
                on_bytes_read(reactor, shared, idx, n, Instant::now());
            }
        }

        if shared.borrow().connections[idx].generation != generation {
            return;
        }

        // A full read may have left more bytes coalesced behind it (plain
        // socket: more sitting in the kernel buffer; TLS: more decrypted
        // records already buffered) without yet delivering a fresh readable
        // edge, so keep draining (spec §4.4: "loop while last read ==
        // RECVBUF and `readable()` indicates more").
        let buffered = shared.borrow().connections[idx]
            .conn
            .socket()
            .map(|socket| socket.readable())
            .unwrap_or(false);
        if !filled_buffer && !buffered {
            break;
        }
    }
}

/// Processes one kernel read's worth of bytes, which may contain zero, one,
/// or several complete pipelined responses. The response parser only
/// consumes up to the end of one message per call (see
/// `gale_parser::ResponseParser::execute`), so this loops, resetting the
/// parser between messages, until every byte handed to it is accounted for.
fn on_bytes_read(reactor: &mut Reactor, shared: &Rc<RefCell<Shared>>, idx: usize, n: usize, now: Instant) {
    let generation = shared.borrow().connections[idx].generation;

    let data = {
        let mut s = shared.borrow_mut();
        s.bytes += n as u64;
        let conn = &mut s.connections[idx].conn;
        conn.note_bytes_read(n as u64);
        conn.recv_buf_mut()[..n].to_vec()
    };

    let mut offset = 0usize;
    while offset < data.len() {
        let consumed = {
            let mut s = shared.borrow_mut();
            s.connections[idx].conn.feed(&data[offset..])
        };

        let consumed = match consumed {
            Ok(consumed) => consumed,
            Err(e) => {
                debug!(thread = shared.borrow().thread_index, connection = idx, error = %e, "response parse error");
                shared.borrow_mut().errors.read += 1;
                reconnect(reactor, shared, idx);
                return;
            }
        };

        if consumed == 0 {
            break;
        }
        offset += consumed;

        if !shared.borrow().connections[idx].conn.message_complete() {
            break;
        }

        let response = {
            let mut s = shared.borrow_mut();
            s.connections[idx].conn.take_responses().pop()
        };

        if let Some(response) = response {
            if !record_response(reactor, shared, idx, &response, now) {
                return;
            }
        }

        if shared.borrow().connections[idx].generation != generation {
            return;
        }
        shared.borrow_mut().connections[idx].conn.prepare_for_next_response();
    }
}

/// Finalizes bookkeeping for one completed response. Returns `false` if
/// the connection was torn down as a result (peer declined keep-alive, or
/// the script requested an early stop while we still held the borrow),
/// signalling the caller to stop processing this connection's buffer.
fn record_response(
    reactor: &mut Reactor,
    shared: &Rc<RefCell<Shared>>,
    idx: usize,
    response: &CompletedResponse,
    now: Instant,
) -> bool {
    let latency = shared.borrow_mut().connections[idx].conn.complete_one_response(now);

    if response.status >= 400 {
        shared.borrow_mut().errors.status += 1;
    }

    if let Some(latency) = latency {
        {
            let mut s = shared.borrow_mut();
            s.complete += 1;
            if !s.latency.record(latency.as_micros() as u64) {
                s.errors.timeout += 1;
            }
        }
        rearm_writable(reactor, shared, idx);
    }

    if shared.borrow().config.want_response {
        let mut s = shared.borrow_mut();
        s.script.response(response.status, &response.headers, &response.body);
    }

    if shared.borrow_mut().script.has_done() {
        shared.borrow().runtime.request_stop();
    }

    if !response.keep_alive {
        reconnect(reactor, shared, idx);
        return false;
    }

    true
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{Role, Transport, DEFAULT_DURATION, DEFAULT_TIMEOUT};
    use crate::script::StaticScript;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn base_config(connections: u64, threads: u64) -> Config {
        Config {
            connections,
            threads,
            duration: DEFAULT_DURATION,
            timeout: DEFAULT_TIMEOUT,
            pipeline: 1,
            dynamic: false,
            delay: false,
            want_response: false,
            latency_report: false,
            warmup: false,
            warmup_timeout: None,
            local_ips: vec![],
            sync_addr: None,
            role: Role::Standalone,
            strict_sync: false,
            transport: Transport::Plain,
            host: "127.0.0.1".into(),
            headers: vec![],
        }
    }

    /// Runs one connection against a loopback server that answers every
    /// request with a fixed `Content-Length: 0` response, for a short
    /// fixed duration, and checks the thread sustains many request/response
    /// round trips rather than sending a single batch and stalling — the
    /// connection's single pipeline slot (`pipeline: 1`) only gets reused if
    /// WRITABLE is correctly disarmed after each full write and re-armed
    /// once the response completes it.
    #[test]
    fn drives_connections_against_a_loopback_server_and_reports_completions() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let deadline = Instant::now() + Duration::from_millis(500);
            while Instant::now() < deadline {
                sock.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
                match sock.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let _ = sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
                    }
                    Err(_) => continue,
                }
            }
        });

        let config = Arc::new(base_config(1, 1));
        let runtime = Arc::new(Runtime::new());
        let runtime_stop = runtime.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(250));
            runtime_stop.request_stop();
        });

        let sync = Arc::new(Mutex::new(InterProcessSync::Standalone));
        let config_for_script = config.clone();
        let script_factory: Arc<dyn Fn() -> Box<dyn ScriptEngine> + Send + Sync> =
            Arc::new(move || Box::new(StaticScript::new(&config_for_script, "/")) as Box<dyn ScriptEngine>);

        let report = run_thread(0, config, runtime, addr, None, sync, script_factory).unwrap();

        // A single stalled batch would report `complete == 1` (or 0); a
        // sustained keep-alive loop over 250ms of loopback round trips
        // completes many multiples of the pipeline depth.
        assert!(
            report.complete > 20,
            "expected sustained throughput across many batches, got {} completions",
            report.complete
        );
        assert_eq!(report.errors.connect, 0);
        assert_eq!(report.errors.write, 0);
        assert_eq!(report.errors.read, 0);
        server.join().unwrap();
    }
}

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

//! Process-wide lifecycle state shared (by `Arc`) across worker threads.
//!
//! The original implementation keeps this as a handful of C globals
//! (`stop`, `g_ready_threads`, `g_is_ready`). Rather than reintroduce
//! globals, this module bundles them into one value created once at
//! startup and handed to every thread.

use std::io;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Process-wide coordination state: the stop signal and the intra-process
/// warmup barrier counters (spec §5).
#[derive(Debug, Default)]
pub struct Runtime {
    stop: AtomicBool,
    ready_threads: AtomicU64,
    is_ready: AtomicBool,
}

impl Runtime {
    /// Creates a fresh runtime with no threads yet reporting ready.
    pub fn new() -> Self {
        Runtime::default()
    }

    /// Whether the run should stop. Checked by each thread's record-rate
    /// tick, so a thread observes this within `RECORD_INTERVAL_MS`.
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Sets the stop flag. Called by the duration timer on the main thread,
    /// or by the SIGINT handler; both paths are equivalent (spec §5).
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Atomically increments the count of threads that have finished their
    /// warmup connection establishments, returning the new count. The
    /// thread whose call returns exactly `total_threads` is responsible for
    /// performing the inter-process barrier (if configured) and setting
    /// [`Runtime::set_ready`].
    pub fn mark_thread_ready(&self) -> u64 {
        self.ready_threads.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether every thread has warmed up and, if inter-process sync is
    /// configured, the barrier has completed.
    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::Acquire)
    }

    /// Marks the run ready to transition every thread to NORMAL. Set
    /// exactly once, by the thread that drove `ready_threads` to the total
    /// thread count.
    pub fn set_ready(&self) {
        self.is_ready.store(true, Ordering::Release);
    }
}

/// Ignores `SIGPIPE` process-wide, matching `wrk.c:main`'s
/// `signal(SIGPIPE, SIG_IGN)`: a peer resetting a connection mid-write
/// should surface as an `EPIPE` I/O error, not terminate the process.
/// No-op on non-Unix targets.
#[cfg(unix)]
pub fn ignore_sigpipe() {
    // SAFETY: SIG_IGN is a valid, well-known disposition; this call has no
    // preconditions beyond being single-threaded-safe, which `signal(2)`
    // guarantees for this disposition value.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
pub fn ignore_sigpipe() {}

/// Binds a just-created, not-yet-connected socket to `local_ip` before the
/// caller issues `connect`. Supports a trailing `%ifname` suffix on IPv6
/// literals to select the scope id (spec §4.7), the way the original's
/// `bind_socket` resolves `getaddrinfo` with a zone id.
///
/// Bind failure is reported to the caller as an `io::Error`; per spec this
/// is a warning, not fatal — callers should log and proceed unbound rather
/// than propagate it as connection failure.
pub fn resolve_local_bind_addr(local_ip: &str) -> io::Result<SocketAddr> {
    if let Some((addr, ifname)) = local_ip.split_once('%') {
        let scope_id = interface_index(ifname)?;
        let ip: std::net::Ipv6Addr = addr.parse().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid IPv6 literal {addr:?}"))
        })?;
        return Ok(SocketAddr::V6(std::net::SocketAddrV6::new(ip, 0, 0, scope_id)));
    }

    let ip: std::net::IpAddr = local_ip
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid bind address {local_ip:?}")))?;
    Ok(SocketAddr::new(ip, 0))
}

fn interface_index(ifname: &str) -> io::Result<u32> {
    if ifname.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty interface name"));
    }
    #[cfg(unix)]
    {
        let name = std::ffi::CString::new(ifname)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name contains NUL"))?;
        // SAFETY: `name` is a valid NUL-terminated C string for the call's
        // duration.
        let idx = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if idx == 0 {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("unknown interface {ifname:?}")));
        }
        Ok(idx)
    }
    #[cfg(not(unix))]
    {
        Err(io::Error::new(io::ErrorKind::Unsupported, "scoped IPv6 bind requires Unix"))
    }
}

/// Probes whether `addr` is reachable enough to bind a UDP socket to it, a
/// cheap way to validate a `-i/--local_ip` entry at startup without
/// performing a real TCP connect.
pub fn probe_bindable(addr: SocketAddr) -> bool {
    UdpSocket::bind(addr).is_ok()
}

/// Performs a best-effort startup connectivity check against `addr`,
/// matching the original's "abort on DNS/startup-connect test failure"
/// error class (spec §7). Blocking is acceptable here since this runs
/// before any thread's reactor starts.
pub fn startup_connect_check(addr: SocketAddr, timeout: std::time::Duration) -> io::Result<()> {
    TcpStream::connect_timeout(&addr, timeout)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ready_threads_reaches_total_exactly_once() {
        let rt = Runtime::new();
        assert_eq!(rt.mark_thread_ready(), 1);
        assert_eq!(rt.mark_thread_ready(), 2);
        assert!(!rt.is_ready());
        rt.set_ready();
        assert!(rt.is_ready());
    }

    #[test]
    fn stop_flag_round_trips() {
        let rt = Runtime::new();
        assert!(!rt.should_stop());
        rt.request_stop();
        assert!(rt.should_stop());
    }

    #[test]
    fn resolve_local_bind_addr_parses_plain_ipv4() {
        let addr = resolve_local_bind_addr("127.0.0.1").unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
    }

    #[test]
    fn resolve_local_bind_addr_rejects_garbage() {
        assert!(resolve_local_bind_addr("not-an-ip").is_err());
    }
}

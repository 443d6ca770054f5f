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

//! Inter-process rendezvous (spec §4.6, §6): a primary accepts one TCP
//! connection per secondary at startup and holds it until every thread in
//! every cooperating process has warmed up, at which point a single
//! fan-in/fan-out barrier releases them all to begin NORMAL phase together.
//!
//! Setup is blocking by design (spec §5: "blocking system calls permitted
//! only during startup ... and the inter-process barrier setup/send/recv");
//! it runs once, on the main thread, before any reactor starts.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use tracing::warn;

use crate::error::SyncError;

/// The fixed 4-byte barrier payload. Sent and compared as-is (native byte
/// order) since both ends of the rendezvous run the same binary (spec §6).
const BARRIER_CODE: i32 = 1;

/// Held sockets for one process's side of the rendezvous, established at
/// startup and consumed exactly once by [`InterProcessSync::barrier`].
#[derive(Debug)]
pub enum InterProcessSync {
    /// This process has no cooperating peers; the barrier is a no-op.
    Standalone,
    /// This process is the primary, holding one accepted connection per
    /// secondary, in the order they connected.
    Primary { secondaries: Vec<TcpStream> },
    /// This process is a secondary, holding its one connection to the
    /// primary.
    Secondary { primary: TcpStream },
}

impl InterProcessSync {
    /// Performs the blocking rendezvous setup: the primary binds, listens,
    /// and accepts exactly `secondaries` connections; a secondary connects
    /// once to `addr`. Returns [`InterProcessSync::Standalone`] if `addr`
    /// is `None`.
    ///
    /// Any failure here is fatal to startup (spec §7: exit code 3) and the
    /// caller is expected to release any partially-opened sockets, which
    /// happens automatically via `Drop` on the `TcpStream`/`TcpListener`
    /// values that go out of scope.
    pub fn setup(addr: Option<SocketAddr>, secondaries: u16) -> Result<Self, SyncError> {
        let Some(addr) = addr else {
            return Ok(InterProcessSync::Standalone);
        };

        if secondaries > 0 {
            let listener = TcpListener::bind(addr).map_err(|source| SyncError::Bind { addr, source })?;
            println!("Sync Address: {addr}");
            println!("Waiting for secondaries to connect ...");

            let mut accepted = Vec::with_capacity(secondaries as usize);
            for _ in 0..secondaries {
                let (stream, _) = listener.accept().map_err(|source| SyncError::Bind { addr, source })?;
                accepted.push(stream);
            }
            if accepted.len() != secondaries as usize {
                return Err(SyncError::IncompleteRendezvous {
                    expected: secondaries,
                    accepted: accepted.len() as u16,
                });
            }
            println!("All secondaries connected.");
            Ok(InterProcessSync::Primary { secondaries: accepted })
        } else {
            let stream = TcpStream::connect(addr).map_err(|source| SyncError::Connect { addr, source })?;
            println!("Connected to Primary.");
            Ok(InterProcessSync::Secondary { primary: stream })
        }
    }

    /// Performs the one-shot fan-in/fan-out barrier: a secondary sends the
    /// barrier code then blocks for the primary's reply; the primary waits
    /// for every secondary's code before replying to all of them in order.
    ///
    /// A short read or mismatched code is logged and the barrier proceeds
    /// regardless (permissive mode, spec §9 Open Question), unless
    /// `strict` is set, in which case it is surfaced as
    /// [`SyncError::BarrierViolation`].
    pub fn barrier(&mut self, strict: bool) -> Result<(), SyncError> {
        match self {
            InterProcessSync::Standalone => Ok(()),
            InterProcessSync::Primary { secondaries } => {
                for (idx, sock) in secondaries.iter_mut().enumerate() {
                    check_code(recv_code(sock), idx, strict)?;
                }
                for sock in secondaries.iter_mut() {
                    let _ = send_code(sock);
                }
                println!("Synced with Secondaries");
                Ok(())
            }
            InterProcessSync::Secondary { primary } => {
                let _ = send_code(primary);
                check_code(recv_code(primary), 0, strict)?;
                println!("Synced with Primary");
                Ok(())
            }
        }
    }
}

fn send_code(sock: &mut TcpStream) -> std::io::Result<()> {
    sock.write_all(&BARRIER_CODE.to_ne_bytes())
}

fn recv_code(sock: &mut TcpStream) -> std::io::Result<i32> {
    sock.set_read_timeout(Some(Duration::from_secs(30)))?;
    let mut buf = [0u8; 4];
    sock.read_exact(&mut buf)?;
    Ok(i32::from_ne_bytes(buf))
}

fn check_code(result: std::io::Result<i32>, idx: usize, strict: bool) -> Result<(), SyncError> {
    match result {
        Ok(code) if code == BARRIER_CODE => Ok(()),
        Ok(code) => {
            let msg = format!("peer {idx} sent mismatched barrier code {code}");
            warn!("{msg}");
            if strict {
                Err(SyncError::BarrierViolation(msg))
            } else {
                Ok(())
            }
        }
        Err(e) => {
            let msg = format!("short read from peer {idx}: {e}");
            warn!("{msg}");
            if strict {
                Err(SyncError::BarrierViolation(msg))
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn standalone_barrier_is_noop() {
        let mut sync = InterProcessSync::Standalone;
        assert!(sync.barrier(false).is_ok());
    }

    #[test]
    fn primary_and_secondary_complete_barrier_together() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let primary_thread = thread::spawn(move || {
            let mut primary = InterProcessSync::setup(Some(addr), 1).unwrap();
            primary.barrier(false).unwrap();
        });

        // Give the primary a moment to bind before the secondary connects.
        std::thread::sleep(Duration::from_millis(50));
        let mut secondary = InterProcessSync::setup(Some(addr), 0).unwrap();
        secondary.barrier(false).unwrap();

        primary_thread.join().unwrap();
    }

    #[test]
    fn strict_mode_rejects_mismatched_code() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let bad_peer = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(&42i32.to_ne_bytes()).unwrap();
            let mut buf = [0u8; 4];
            let _ = sock.read_exact(&mut buf);
        });

        std::thread::sleep(Duration::from_millis(20));
        let mut secondary = InterProcessSync::Secondary {
            primary: TcpStream::connect(addr).unwrap(),
        };
        let result = secondary.barrier(true);
        assert!(matches!(result, Err(SyncError::BarrierViolation(_))));
        bad_peer.join().unwrap();
    }
}

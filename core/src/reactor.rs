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

//! A single-threaded readiness-and-timer event loop atop [`mio::Poll`].
//!
//! This is the in-workspace wrapper around the reactor *primitive*: `mio`
//! supplies the OS-level readiness multiplexing, this module supplies
//! callback registration, re-entrant dispatch, and monotonic time events,
//! none of which `mio` itself provides.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::time::{Duration, Instant};

use mio::{event::Source, Events, Interest, Poll};
use slab::Slab;

pub use mio::Token;

/// Which directions of a registered file descriptor became ready.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    /// The descriptor can be read without blocking.
    pub readable: bool,
    /// The descriptor can be written without blocking.
    pub writable: bool,
}

/// Handle to a registered time event, used to cancel it before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(usize);

type IoCallback = Box<dyn FnMut(&mut Reactor, Readiness)>;
type TimerCallback = Box<dyn FnMut(&mut Reactor) -> Option<Duration>>;

struct ScheduledTimer {
    fire_at: Instant,
    id: TimerId,
    generation: u64,
}

impl PartialEq for ScheduledTimer {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at
    }
}
impl Eq for ScheduledTimer {}
impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledTimer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at.cmp(&other.fire_at)
    }
}

struct TimerSlot {
    callback: Option<TimerCallback>,
    generation: u64,
}

/// A single-threaded reactor: one `mio::Poll`, a table of readiness
/// callbacks keyed by [`Token`], and a min-heap of time events.
///
/// Callbacks are never invoked concurrently with one another, and may freely
/// register or cancel other callbacks (including their own registration)
/// from within the callback body; see the module docs for the re-entrancy
/// mechanism.
pub struct Reactor {
    poll: Poll,
    io_callbacks: Slab<Option<IoCallback>>,
    timers: Slab<TimerSlot>,
    schedule: BinaryHeap<Reverse<ScheduledTimer>>,
    stopped: bool,
}

impl Reactor {
    /// Constructs a reactor, failing if the OS refuses the underlying
    /// `epoll`/`kqueue`/IOCP handle (typically file-descriptor exhaustion).
    /// Per spec, this failure is fatal to the owning thread's startup.
    pub fn new() -> io::Result<Self> {
        Ok(Reactor {
            poll: Poll::new()?,
            io_callbacks: Slab::new(),
            timers: Slab::new(),
            schedule: BinaryHeap::new(),
            stopped: false,
        })
    }

    /// Registers `source` for the given `interest`, invoking `callback`
    /// whenever it becomes ready. Returns the `Token` to pass to
    /// [`Reactor::reregister_io`]/[`Reactor::deregister_io`].
    pub fn register_io<S>(
        &mut self,
        source: &mut S,
        interest: Interest,
        callback: IoCallback,
    ) -> io::Result<Token>
    where
        S: Source + ?Sized,
    {
        let entry = self.io_callbacks.vacant_entry();
        let token = Token(entry.key());
        self.poll.registry().register(source, token, interest)?;
        entry.insert(Some(callback));
        Ok(token)
    }

    /// Changes the readiness mask for an already-registered source. Used
    /// during TLS handshakes to reconcile the mask to exactly what the
    /// library wants next (spec §4.2, §9: naively arming both edges spins
    /// the CPU).
    pub fn reregister_io<S>(&mut self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Deregisters `source` and drops its callback.
    pub fn deregister_io<S>(&mut self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().deregister(source)?;
        self.io_callbacks.try_remove(token.0);
        Ok(())
    }

    /// Registers a one-shot or periodic time callback, firing first after
    /// `delay`. The callback's return value governs rescheduling: `Some(d)`
    /// fires again after `d`; `None` is the "do not reschedule" sentinel.
    pub fn register_timer(&mut self, delay: Duration, callback: TimerCallback) -> TimerId {
        let entry = self.timers.vacant_entry();
        let id = TimerId(entry.key());
        let generation = 0;
        entry.insert(TimerSlot {
            callback: Some(callback),
            generation,
        });
        self.schedule.push(Reverse(ScheduledTimer {
            fire_at: Instant::now() + delay,
            id,
            generation,
        }));
        id
    }

    /// Cancels a previously-registered timer. A no-op if it already fired
    /// and was not rescheduled, or was already cancelled.
    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.try_remove(id.0);
    }

    /// Requests that [`Reactor::run`] return once the current dispatch pass
    /// completes. Safe to call from within a callback.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Runs the event loop until [`Reactor::stop`] is called.
    ///
    /// Time-event dispatch uses a monotonic clock; a timer that becomes due
    /// while another callback is running fires on the next loop iteration
    /// (late dispatch is acceptable, per spec §4.1, but never skipped).
    pub fn run(&mut self) -> io::Result<()> {
        self.stopped = false;
        let mut events = Events::with_capacity(1024);

        while !self.stopped {
            let timeout = self.next_timeout();
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            self.dispatch_timers();
            if self.stopped {
                break;
            }

            let tokens: Vec<(Token, Readiness)> = events
                .iter()
                .map(|event| {
                    (
                        event.token(),
                        Readiness {
                            readable: event.is_readable(),
                            writable: event.is_writable(),
                        },
                    )
                })
                .collect();

            for (token, readiness) in tokens {
                self.dispatch_io(token, readiness);
                if self.stopped {
                    break;
                }
            }
        }

        Ok(())
    }

    fn next_timeout(&mut self) -> Option<Duration> {
        loop {
            match self.schedule.peek() {
                None => return None,
                Some(Reverse(top)) => {
                    match self.timers.get(top.id.0) {
                        Some(slot) if slot.generation == top.generation => {
                            let now = Instant::now();
                            return Some(top.fire_at.saturating_duration_since(now));
                        }
                        _ => {
                            // Stale entry from a cancelled/rescheduled timer.
                            self.schedule.pop();
                            continue;
                        }
                    }
                }
            }
        }
    }

    fn dispatch_timers(&mut self) {
        let now = Instant::now();
        loop {
            let due = match self.schedule.peek() {
                Some(Reverse(top)) => top.fire_at <= now,
                None => false,
            };
            if !due {
                break;
            }
            let Reverse(top) = self.schedule.pop().unwrap();

            let slot = match self.timers.get_mut(top.id.0) {
                Some(slot) if slot.generation == top.generation => slot,
                _ => continue,
            };
            let mut callback = match slot.callback.take() {
                Some(cb) => cb,
                None => continue,
            };

            let next_delay = callback(self);

            if let Some(slot) = self.timers.get_mut(top.id.0) {
                if slot.generation == top.generation {
                    match next_delay {
                        Some(delay) => {
                            slot.callback = Some(callback);
                            slot.generation += 1;
                            self.schedule.push(Reverse(ScheduledTimer {
                                fire_at: Instant::now() + delay,
                                id: top.id,
                                generation: slot.generation,
                            }));
                        }
                        None => {
                            self.timers.try_remove(top.id.0);
                        }
                    }
                }
            }
        }
    }

    fn dispatch_io(&mut self, token: Token, readiness: Readiness) {
        let callback = match self.io_callbacks.get_mut(token.0) {
            Some(slot) => slot.take(),
            None => None,
        };
        let Some(mut callback) = callback else {
            return;
        };

        callback(self, readiness);

        if let Some(slot) = self.io_callbacks.get_mut(token.0) {
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("io_registrations", &self.io_callbacks.len())
            .field("timers", &self.timers.len())
            .field("stopped", &self.stopped)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    #[test]
    fn one_shot_timer_fires_once() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Arc::new(Mutex::new(0u32));
        let fired_cb = fired.clone();

        reactor.register_timer(
            Duration::from_millis(5),
            Box::new(move |r| {
                *fired_cb.lock().unwrap() += 1;
                r.stop();
                None
            }),
        );

        reactor.run().unwrap();
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[test]
    fn periodic_timer_reschedules_until_cancelled() {
        let mut reactor = Reactor::new().unwrap();
        let count = Arc::new(Mutex::new(0u32));
        let count_cb = count.clone();

        reactor.register_timer(
            Duration::from_millis(2),
            Box::new(move |r| {
                let mut c = count_cb.lock().unwrap();
                *c += 1;
                if *c >= 3 {
                    r.stop();
                    None
                } else {
                    Some(Duration::from_millis(2))
                }
            }),
        );

        reactor.run().unwrap();
        assert_eq!(*count.lock().unwrap(), 3);
    }

    #[test]
    fn io_readiness_dispatches_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();

        let mut reactor = Reactor::new().unwrap();
        let mut mio_listener = mio::net::TcpListener::from_std(listener);
        let accepted = Arc::new(Mutex::new(false));
        let accepted_cb = accepted.clone();

        reactor
            .register_io(
                &mut mio_listener,
                Interest::READABLE,
                Box::new(move |r, readiness| {
                    if readiness.readable {
                        *accepted_cb.lock().unwrap() = true;
                    }
                    r.stop();
                }),
            )
            .unwrap();

        reactor.run().unwrap();
        assert!(*accepted.lock().unwrap());
    }
}

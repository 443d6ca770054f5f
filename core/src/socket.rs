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

//! Pluggable non-blocking socket strategies: plain TCP, and TLS over TCP.
//!
//! Both strategies present the same connect/read/write/readable/close
//! surface so [`crate::connection::Connection`] can drive either without
//! knowing which transport it holds.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use mio::event::Source;
use mio::{Interest, Registry, Token};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};
use socket2::{Domain, Protocol, Socket as Socket2, Type};

use crate::error::TlsError;

/// Creates a non-blocking TCP socket, optionally bound to `local_addr`
/// before `connect` is issued (spec §4.7). Binding before connecting is
/// the reason this goes through `socket2` rather than
/// `mio::net::TcpStream::connect`, which offers no bind hook.
fn new_nonblocking_socket(addr: SocketAddr, local_addr: Option<SocketAddr>) -> io::Result<Socket2> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket2::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if let Some(local) = local_addr {
        socket.bind(&local.into())?;
    }
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) if e.raw_os_error() == Some(libc_einprogress()) => {}
        Err(e) => return Err(e),
    }
    Ok(socket)
}

#[cfg(unix)]
fn libc_einprogress() -> i32 {
    libc::EINPROGRESS
}

#[cfg(not(unix))]
fn libc_einprogress() -> i32 {
    i32::MIN
}

/// Outcome of driving a connect/handshake step.
#[derive(Debug, Clone, Copy)]
pub enum ConnectProgress {
    /// The transport (and handshake, if any) is fully established.
    Complete,
    /// Not yet complete; the caller must reconcile the registered readiness
    /// mask to exactly this set before the next poll (spec §4.2, §9: a
    /// naive both-edges registration spins the CPU during a TLS handshake).
    Retry(Interest),
}

/// Outcome of a single non-blocking read or write attempt.
#[derive(Debug, Clone, Copy)]
pub enum IoProgress {
    /// `n` bytes were read or written.
    Complete(usize),
    /// The operation would have blocked; no bytes moved. Not a peer close.
    Retry,
    /// The peer closed the connection (read returned 0 at the transport
    /// level).
    Closed,
}

/// Builds the shared client TLS configuration from the platform's web PKI
/// trust roots. ALPN is left at `http/1.1` only; HTTP/2 and HTTP/3 are
/// non-goals.
pub fn client_tls_config() -> Arc<ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Arc::new(config)
}

/// A plain, unencrypted TCP socket.
#[derive(Debug)]
pub struct PlainSocket {
    stream: mio::net::TcpStream,
}

impl PlainSocket {
    /// Initiates a non-blocking connection to `addr`, optionally bound to
    /// `local_addr` first (spec §4.7).
    pub fn connect(addr: SocketAddr, local_addr: Option<SocketAddr>) -> io::Result<Self> {
        let socket = new_nonblocking_socket(addr, local_addr)?;
        let stream = mio::net::TcpStream::from_std(socket.into());
        Ok(PlainSocket { stream })
    }

    /// Checks whether the initiated connect completed successfully. Must
    /// only be called once the socket has reported WRITABLE.
    pub fn connect_progress(&mut self) -> io::Result<ConnectProgress> {
        match self.stream.take_error()? {
            Some(e) => Err(e),
            None => Ok(ConnectProgress::Complete),
        }
    }

    /// Attempts to fill `buf`, per [`IoProgress`] semantics.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<IoProgress> {
        match self.stream.read(buf) {
            Ok(0) => Ok(IoProgress::Closed),
            Ok(n) => Ok(IoProgress::Complete(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoProgress::Retry),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(IoProgress::Retry),
            Err(e) => Err(e),
        }
    }

    /// Attempts to write `buf`, per [`IoProgress`] semantics.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<IoProgress> {
        match self.stream.write(buf) {
            Ok(n) => Ok(IoProgress::Complete(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoProgress::Retry),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(IoProgress::Retry),
            Err(e) => Err(e),
        }
    }

    /// Plain sockets never buffer decrypted bytes beyond what the kernel
    /// holds, so there is never more to drain without a fresh readable
    /// event.
    pub fn readable(&self) -> bool {
        false
    }

    /// Best-effort shutdown; errors are not actionable at this point.
    pub fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl Source for PlainSocket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}

/// A TLS session layered over a non-blocking TCP socket, acting as the
/// client side of the handshake.
pub struct TlsSocket {
    stream: mio::net::TcpStream,
    conn: Box<ClientConnection>,
    plain_connected: bool,
    pending_plaintext: usize,
}

impl std::fmt::Debug for TlsSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSocket")
            .field("plain_connected", &self.plain_connected)
            .field("pending_plaintext", &self.pending_plaintext)
            .finish()
    }
}

impl TlsSocket {
    /// Initiates a non-blocking connection to `addr`, optionally bound to
    /// `local_addr` first (spec §4.7), and prepares a client TLS session
    /// for `server_name` (used for SNI and certificate verification).
    pub fn connect(
        addr: SocketAddr,
        local_addr: Option<SocketAddr>,
        server_name: &str,
        config: Arc<ClientConfig>,
    ) -> Result<Self, TlsError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;
        let conn = ClientConnection::new(config, name).map_err(TlsError::Config)?;
        let socket = new_nonblocking_socket(addr, local_addr)
            .map_err(|e| TlsError::Config(rustls::Error::General(e.to_string())))?;
        let stream = mio::net::TcpStream::from_std(socket.into());

        Ok(TlsSocket {
            stream,
            conn: Box::new(conn),
            plain_connected: false,
            pending_plaintext: 0,
        })
    }

    /// Drives the TCP connect and, once established, the TLS handshake.
    pub fn connect_progress(&mut self) -> io::Result<ConnectProgress> {
        if !self.plain_connected {
            if let Some(e) = self.stream.take_error()? {
                return Err(e);
            }
            self.plain_connected = true;
        }

        match self.conn.complete_io(&mut self.stream) {
            Ok(_) => {
                if self.conn.is_handshaking() {
                    Ok(self.wanted_progress())
                } else {
                    Ok(ConnectProgress::Complete)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(self.wanted_progress()),
            Err(e) => Err(e),
        }
    }

    fn wanted_progress(&self) -> ConnectProgress {
        let interest = match (self.conn.wants_read(), self.conn.wants_write()) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            _ => Interest::READABLE,
        };
        ConnectProgress::Retry(interest)
    }

    /// Reads and decrypts TLS records, filling `buf` with plaintext.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<IoProgress> {
        let peer_closed = match self.conn.read_tls(&mut self.stream) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => false,
            Err(e) => return Err(e),
        };

        let state = match self.conn.process_new_packets() {
            Ok(state) => state,
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        };
        self.pending_plaintext = state.plaintext_bytes_to_read();

        match self.conn.reader().read(buf) {
            Ok(0) if peer_closed => Ok(IoProgress::Closed),
            Ok(0) => Ok(IoProgress::Retry),
            Ok(n) => {
                self.pending_plaintext = self.pending_plaintext.saturating_sub(n);
                Ok(IoProgress::Complete(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if peer_closed {
                    Ok(IoProgress::Closed)
                } else {
                    Ok(IoProgress::Retry)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Encrypts and writes `buf`, flushing whatever ciphertext results.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<IoProgress> {
        let n = match self.conn.writer().write(buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(e),
        };

        match self.conn.write_tls(&mut self.stream) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        if n == 0 {
            Ok(IoProgress::Retry)
        } else {
            Ok(IoProgress::Complete(n))
        }
    }

    /// Whether decrypted bytes are already buffered from a prior coalesced
    /// TLS record, so another drain can proceed without waiting on a fresh
    /// readable event.
    pub fn readable(&self) -> bool {
        self.pending_plaintext > 0
    }

    /// Sends `close_notify` best-effort and shuts down the TCP socket.
    pub fn close(&mut self) {
        self.conn.send_close_notify();
        let _ = self.conn.write_tls(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl Source for TlsSocket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}

/// Either transport a [`crate::connection::Connection`] may be driving.
#[derive(Debug)]
pub enum Socket {
    /// Unencrypted TCP.
    Plain(PlainSocket),
    /// TLS over TCP.
    Tls(TlsSocket),
}

impl Socket {
    /// Initiates a connection using the given `transport`, the strategy
    /// selected once at startup (spec §4.2). `tls_config`/`server_name`
    /// are ignored for `Transport::Plain`.
    pub fn connect(
        transport: crate::config::Transport,
        addr: SocketAddr,
        local_addr: Option<SocketAddr>,
        server_name: &str,
        tls_config: Option<Arc<ClientConfig>>,
    ) -> Result<Self, TlsError> {
        match transport {
            crate::config::Transport::Plain => Ok(Socket::Plain(
                PlainSocket::connect(addr, local_addr).map_err(|e| TlsError::Config(rustls::Error::General(e.to_string())))?,
            )),
            crate::config::Transport::Tls => {
                let config = tls_config.expect("tls transport requires a ClientConfig");
                Ok(Socket::Tls(TlsSocket::connect(addr, local_addr, server_name, config)?))
            }
        }
    }

    /// See [`PlainSocket::connect_progress`]/[`TlsSocket::connect_progress`].
    pub fn connect_progress(&mut self) -> io::Result<ConnectProgress> {
        match self {
            Socket::Plain(s) => s.connect_progress(),
            Socket::Tls(s) => s.connect_progress(),
        }
    }

    /// See [`PlainSocket::read`]/[`TlsSocket::read`].
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<IoProgress> {
        match self {
            Socket::Plain(s) => s.read(buf),
            Socket::Tls(s) => s.read(buf),
        }
    }

    /// See [`PlainSocket::write`]/[`TlsSocket::write`].
    pub fn write(&mut self, buf: &[u8]) -> io::Result<IoProgress> {
        match self {
            Socket::Plain(s) => s.write(buf),
            Socket::Tls(s) => s.write(buf),
        }
    }

    /// See [`PlainSocket::readable`]/[`TlsSocket::readable`].
    pub fn readable(&self) -> bool {
        match self {
            Socket::Plain(s) => s.readable(),
            Socket::Tls(s) => s.readable(),
        }
    }

    /// See [`PlainSocket::close`]/[`TlsSocket::close`].
    pub fn close(&mut self) {
        match self {
            Socket::Plain(s) => s.close(),
            Socket::Tls(s) => s.close(),
        }
    }
}

impl Source for Socket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Socket::Plain(s) => s.register(registry, token, interests),
            Socket::Tls(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Socket::Plain(s) => s.reregister(registry, token, interests),
            Socket::Tls(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Socket::Plain(s) => s.deregister(registry),
            Socket::Tls(s) => s.deregister(registry),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener;

    #[test]
    fn plain_socket_connects_and_round_trips() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_thread = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            peer.read_exact(&mut buf).unwrap();
            peer.write_all(b"world").unwrap();
        });

        let mut sock = PlainSocket::connect(addr, None).unwrap();
        // Give the OS a moment; a real caller would wait for WRITABLE.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(matches!(
            sock.connect_progress().unwrap(),
            ConnectProgress::Complete
        ));

        loop {
            match sock.write(b"hello").unwrap() {
                IoProgress::Complete(5) => break,
                IoProgress::Retry => std::thread::sleep(std::time::Duration::from_millis(5)),
                other => panic!("unexpected: {other:?}"),
            }
        }

        let mut buf = [0u8; 5];
        loop {
            match sock.read(&mut buf).unwrap() {
                IoProgress::Complete(5) => break,
                IoProgress::Retry => std::thread::sleep(std::time::Duration::from_millis(5)),
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(&buf, b"world");
        accept_thread.join().unwrap();
    }
}

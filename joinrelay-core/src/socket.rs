//! Managed Socket (C1)
//!
//! A raw socket adopted into the graph: non-blocking mode, a pending
//! write buffer, and the bookkeeping the reactor needs to decide
//! whether to read from it, write to it, or reap it.
//!
//! This module uses unsafe code to borrow a raw descriptor as a
//! `socket2::Socket` just long enough to flip `TCP_NODELAY`. The
//! borrow never takes ownership of the descriptor (see
//! `enable_tcp_nodelay`).
#![allow(unsafe_code)]

use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read, Write};
use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
#[cfg(unix)]
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};
#[cfg(windows)]
use std::os::windows::io::AsRawSocket;

use mio::event::Source;
use mio::{Interest, Registry, Token};
#[cfg(unix)]
use mio::net::{UnixListener, UnixStream};
use mio::net::{TcpListener, TcpStream};

use crate::error::{io_error_is_transient, RelayError, Result};

/// Disable Nagle's algorithm on anything that can hand us a raw
/// fd/handle, without taking ownership of it — borrow it through
/// `socket2` just long enough to flip the option.
fn enable_tcp_nodelay<S>(stream: &S) -> io::Result<()>
where
    S: RawTcpHandle,
{
    #[cfg(unix)]
    {
        use std::os::unix::io::FromRawFd;
        let sock = unsafe { socket2::Socket::from_raw_fd(stream.raw_fd()) };
        sock.set_nodelay(true)?;
        std::mem::forget(sock); // don't close the fd
        Ok(())
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::FromRawSocket;
        let sock = unsafe { socket2::Socket::from_raw_socket(stream.raw_fd()) };
        sock.set_nodelay(true)?;
        std::mem::forget(sock); // don't close the socket
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    {
        Ok(())
    }
}

/// Narrow trait so `enable_tcp_nodelay` works on both the
/// standard-library `TcpStream` and `mio::net::TcpStream` without
/// pulling `AsRawFd`/`AsRawSocket` into every call site.
trait RawTcpHandle {
    #[cfg(unix)]
    fn raw_fd(&self) -> RawFd;
    #[cfg(windows)]
    fn raw_fd(&self) -> std::os::windows::io::RawSocket;
}

impl RawTcpHandle for StdTcpStream {
    #[cfg(unix)]
    fn raw_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.as_raw_fd()
    }
    #[cfg(windows)]
    fn raw_fd(&self) -> std::os::windows::io::RawSocket {
        use std::os::windows::io::AsRawSocket;
        self.as_raw_socket()
    }
}

impl RawTcpHandle for TcpStream {
    #[cfg(unix)]
    fn raw_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.as_raw_fd()
    }
    #[cfg(windows)]
    fn raw_fd(&self) -> std::os::windows::io::RawSocket {
        use std::os::windows::io::AsRawSocket;
        self.as_raw_socket()
    }
}

/// A socket the engine owns outright, in one of the shapes the engine
/// understands: a connected byte stream, or a listener that produces
/// new connected streams on accept.
pub enum RawSocket {
    TcpStream(TcpStream),
    TcpListener(TcpListener),
    #[cfg(unix)]
    UnixStream(UnixStream),
    #[cfg(unix)]
    UnixListener(UnixListener),
}

impl RawSocket {
    /// Adopt a standard-library TCP stream, putting it in non-blocking
    /// mode and disabling Nagle's algorithm (a relay forwards whatever
    /// it has immediately; batching small writes only adds latency).
    pub fn from_std_tcp_stream(stream: StdTcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        enable_tcp_nodelay(&stream)?;
        Ok(Self::TcpStream(TcpStream::from_std(stream)))
    }

    /// Adopt a standard-library TCP listener, putting it in
    /// non-blocking mode as part of the conversion.
    pub fn from_std_tcp_listener(listener: StdTcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self::TcpListener(TcpListener::from_std(listener)))
    }

    /// Adopt a standard-library Unix stream.
    #[cfg(unix)]
    pub fn from_std_unix_stream(stream: StdUnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::UnixStream(UnixStream::from_std(stream)))
    }

    /// Adopt a standard-library Unix listener.
    #[cfg(unix)]
    pub fn from_std_unix_listener(listener: StdUnixListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self::UnixListener(UnixListener::from_std(listener)))
    }

    /// True for the listener variants. A listener has no write buffer
    /// and is never read from as data; the reactor treats its
    /// readiness as "accept one connection" instead of "pump bytes".
    #[must_use]
    pub const fn is_listening(&self) -> bool {
        matches!(self, Self::TcpListener(_) | Self::UnixListener(_))
    }

    fn read_stream(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::TcpStream(s) => s.read(buf),
            #[cfg(unix)]
            Self::UnixStream(s) => s.read(buf),
            Self::TcpListener(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot read from a listening socket",
            )),
            #[cfg(unix)]
            Self::UnixListener(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot read from a listening socket",
            )),
        }
    }

    fn write_stream(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::TcpStream(s) => s.write(buf),
            #[cfg(unix)]
            Self::UnixStream(s) => s.write(buf),
            Self::TcpListener(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot write to a listening socket",
            )),
            #[cfg(unix)]
            Self::UnixListener(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot write to a listening socket",
            )),
        }
    }

    /// Accept one pending connection. Exactly one accept per ready
    /// event: a backlog beyond one connection is picked up on the next
    /// readiness notification rather than drained in a loop.
    fn accept_one(&mut self) -> io::Result<RawSocket> {
        match self {
            Self::TcpListener(l) => {
                let (stream, _addr) = l.accept()?;
                enable_tcp_nodelay(&stream)?;
                Ok(RawSocket::TcpStream(stream))
            }
            #[cfg(unix)]
            Self::UnixListener(l) => {
                let (stream, _addr) = l.accept()?;
                stream.set_nonblocking(true)?;
                Ok(RawSocket::UnixStream(stream))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "accept() on a non-listening socket",
            )),
        }
    }
}

impl Source for RawSocket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Self::TcpStream(s) => s.register(registry, token, interests),
            Self::TcpListener(s) => s.register(registry, token, interests),
            #[cfg(unix)]
            Self::UnixStream(s) => s.register(registry, token, interests),
            #[cfg(unix)]
            Self::UnixListener(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Self::TcpStream(s) => s.reregister(registry, token, interests),
            Self::TcpListener(s) => s.reregister(registry, token, interests),
            #[cfg(unix)]
            Self::UnixStream(s) => s.reregister(registry, token, interests),
            #[cfg(unix)]
            Self::UnixListener(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::TcpStream(s) => s.deregister(registry),
            Self::TcpListener(s) => s.deregister(registry),
            #[cfg(unix)]
            Self::UnixStream(s) => s.deregister(registry),
            #[cfg(unix)]
            Self::UnixListener(s) => s.deregister(registry),
        }
    }
}

#[cfg(unix)]
impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::TcpStream(s) => s.as_raw_fd(),
            Self::TcpListener(s) => s.as_raw_fd(),
            Self::UnixStream(s) => s.as_raw_fd(),
            Self::UnixListener(s) => s.as_raw_fd(),
        }
    }
}

#[cfg(unix)]
impl AsRawFd for ManagedSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.raw.as_raw_fd()
    }
}

#[cfg(windows)]
impl AsRawSocket for RawSocket {
    fn as_raw_socket(&self) -> std::os::windows::io::RawSocket {
        match self {
            Self::TcpStream(s) => s.as_raw_socket(),
            Self::TcpListener(s) => s.as_raw_socket(),
        }
    }
}

#[cfg(windows)]
impl AsRawSocket for ManagedSocket {
    fn as_raw_socket(&self) -> std::os::windows::io::RawSocket {
        self.raw.as_raw_socket()
    }
}

/// The outcome of one `pump` attempt, classified the way the reactor
/// needs to branch on it.
pub enum PumpOutcome {
    /// Bytes were read; forward them to every outgoing stream.
    Data(Bytes),
    /// Orderly end of stream.
    Eof,
    /// Nothing to read right now; no state change.
    WouldBlock,
    /// A fatal error occurred; `close_ready` is already set.
    Fatal(io::Error),
}

/// A socket adopted into the graph, with the metadata the reactor
/// needs: edge lists (owned by the graph as `StreamId`s, see
/// `graph.rs`), a pending write buffer, and the close-ready flag.
pub struct ManagedSocket {
    raw: RawSocket,
    is_listening: bool,
    write_buffer: BytesMut,
    close_ready: bool,
}

impl ManagedSocket {
    pub(crate) fn new(raw: RawSocket) -> Self {
        let is_listening = raw.is_listening();
        Self {
            raw,
            is_listening,
            write_buffer: BytesMut::new(),
            close_ready: false,
        }
    }

    #[must_use]
    pub const fn is_listening(&self) -> bool {
        self.is_listening
    }

    #[must_use]
    pub const fn close_ready(&self) -> bool {
        self.close_ready
    }

    #[must_use]
    pub fn write_buffer_is_empty(&self) -> bool {
        self.write_buffer.is_empty()
    }

    #[must_use]
    pub fn write_buffer_len(&self) -> usize {
        self.write_buffer.len()
    }

    /// Ready to be reaped: EOF/fatal observed and nothing left to drain.
    #[must_use]
    pub fn reap_ready(&self) -> bool {
        self.close_ready && self.write_buffer.is_empty()
    }

    pub(crate) fn mark_close_ready(&mut self) {
        self.close_ready = true;
    }

    pub(crate) fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.raw.register(registry, token, interests)
    }

    pub(crate) fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.raw.reregister(registry, token, interests)
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.raw.deregister(registry)
    }

    /// Accept one pending connection on a listening socket.
    pub(crate) fn accept_one(&mut self) -> io::Result<RawSocket> {
        self.raw.accept_one()
    }

    /// Read up to `chunk_size` bytes. Never called on a listener — the
    /// reactor dispatches listeners to `accept_one` instead.
    pub(crate) fn try_read(&mut self, chunk_size: usize) -> PumpOutcome {
        let mut buf = vec![0u8; chunk_size];
        match self.raw.read_stream(&mut buf) {
            Ok(0) => {
                self.close_ready = true;
                PumpOutcome::Eof
            }
            Ok(n) => {
                buf.truncate(n);
                PumpOutcome::Data(Bytes::from(buf))
            }
            Err(e) if io_error_is_transient(&e) => PumpOutcome::WouldBlock,
            Err(e) => {
                self.close_ready = true;
                self.write_buffer.clear();
                PumpOutcome::Fatal(e)
            }
        }
    }

    /// Append bytes to the write buffer, enforcing the optional cap
    /// from `RelayConfig`. Exceeding the cap is treated as a fatal
    /// socket error (see DESIGN.md Open Question 5).
    pub(crate) fn buffer_bytes(&mut self, bytes: Bytes, cap: Option<usize>) -> Result<()> {
        if let Some(cap) = cap {
            if self.write_buffer.len() + bytes.len() > cap {
                self.close_ready = true;
                self.write_buffer.clear();
                return Err(RelayError::Io(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "write buffer exceeded configured cap",
                )));
            }
        }
        self.write_buffer.extend_from_slice(&bytes);
        Ok(())
    }

    /// Try a direct send; anything unsent is appended to the buffer.
    /// Called only when the buffer was empty on entry, so ordering is
    /// preserved either way.
    pub(crate) fn direct_send_or_buffer(&mut self, bytes: Bytes, cap: Option<usize>) -> Result<()> {
        debug_assert!(self.write_buffer.is_empty());
        match self.raw.write_stream(&bytes) {
            Ok(n) if n >= bytes.len() => Ok(()),
            Ok(n) => self.buffer_bytes(bytes.slice(n..), cap),
            Err(e) if io_error_is_transient(&e) => self.buffer_bytes(bytes, cap),
            Err(e) => {
                self.close_ready = true;
                self.write_buffer.clear();
                Err(e.into())
            }
        }
    }

    /// Drain the write buffer until empty or until the socket would
    /// block. Partial sends retain the unsent tail; fatal errors set
    /// `close_ready` and discard the buffer.
    pub(crate) fn flush_write_buffer(&mut self) -> Result<()> {
        while !self.write_buffer.is_empty() {
            match self.raw.write_stream(&self.write_buffer) {
                Ok(0) => break,
                Ok(n) => self.write_buffer.advance(n),
                Err(e) if io_error_is_transient(&e) => break,
                Err(e) => {
                    self.close_ready = true;
                    self.write_buffer.clear();
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Close the underlying socket. Callers must have already removed
    /// every `JoinStream` referencing this socket (see
    /// `graph::JoinGraph::reap`); this still checks the precondition
    /// itself (`close_ready` set and `write_buffer` empty) and refuses
    /// to close otherwise.
    pub(crate) fn close(self) -> Result<()> {
        if !self.reap_ready() {
            return Err(RelayError::graph_misuse(
                "close() called before close_ready with empty write_buffer",
            ));
        }
        // Dropping `self.raw` closes the underlying fd.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdTcpListener;

    fn loopback_pair() -> (StdTcpStream, StdTcpStream) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn fresh_socket_has_empty_buffer_and_is_not_close_ready() {
        let (_client, server) = loopback_pair();
        let raw = RawSocket::from_std_tcp_stream(server).unwrap();
        let managed = ManagedSocket::new(raw);
        assert!(managed.write_buffer_is_empty());
        assert!(!managed.close_ready());
        assert!(!managed.reap_ready());
    }

    #[test]
    fn eof_sets_close_ready() {
        let (client, server) = loopback_pair();
        drop(client);
        let raw = RawSocket::from_std_tcp_stream(server).unwrap();
        let mut managed = ManagedSocket::new(raw);
        // Give the kernel a moment to observe the peer shutdown.
        std::thread::sleep(std::time::Duration::from_millis(50));
        match managed.try_read(4096) {
            PumpOutcome::Eof => {}
            PumpOutcome::WouldBlock => {
                // Rare scheduling race; retry once.
                std::thread::sleep(std::time::Duration::from_millis(100));
                assert!(matches!(managed.try_read(4096), PumpOutcome::Eof));
            }
            PumpOutcome::Data(_) => panic!("expected Eof, got data"),
            PumpOutcome::Fatal(e) => panic!("expected Eof, got a fatal error: {e}"),
        }
        assert!(managed.close_ready());
    }

    #[test]
    fn buffer_cap_exceeded_is_fatal() {
        let (_client, server) = loopback_pair();
        let raw = RawSocket::from_std_tcp_stream(server).unwrap();
        let mut managed = ManagedSocket::new(raw);
        managed.write_buffer.extend_from_slice(&[0u8; 8]);
        let err = managed.buffer_bytes(Bytes::from_static(&[0u8; 8]), Some(10));
        assert!(err.is_err());
        assert!(managed.close_ready());
        assert!(managed.write_buffer_is_empty());
    }
}

//! Context Lifecycle (C5)
//!
//! The application-facing handle: spawn the reactor thread, adopt
//! sockets into it, join/unjoin them, and shut the whole thing down.
//! `Context` is a cheap `Clone` (`Arc`-backed) so multiple application
//! threads can each hold one and call these methods concurrently; see
//! the module-level note on `terminate` for the shutdown contract.

use std::io;
use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};
#[cfg(unix)]
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};
use std::sync::Arc;
use std::thread::JoinHandle;

use flume::Sender;
use mio::{Poll, Waker};
use parking_lot::Mutex;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::graph::SocketId;
use crate::reactor::{self, Mutation, WAKE_TOKEN};
use crate::socket::RawSocket;
use crate::transform::RelayTransform;

/// Bitmask flags accepted by [`Context::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinFlags(u8);

impl JoinFlags {
    /// Full duplex, link-close propagation on (the default).
    pub const NONE: Self = Self(0);
    /// One direction only: `source -> sink`, never `sink -> source`.
    pub const HALFDUPLEX: Self = Self(1);
    /// Do not propagate `close_ready` to the other endpoint when one
    /// side of the stream reaches EOF or a fatal error.
    pub const NOCLOSE: Self = Self(2);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for JoinFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

struct ContextState {
    handle: Option<JoinHandle<io::Result<()>>>,
    terminated: bool,
}

struct ContextInner {
    mutations: Sender<Mutation>,
    waker: Waker,
    state: Mutex<ContextState>,
}

/// A handle to a running relay engine. Cloning shares the same
/// underlying reactor thread and graph.
#[derive(Clone)]
pub struct Context(Arc<ContextInner>);

impl Context {
    /// Spawn the reactor thread and return a handle to it. The
    /// `Poll`/`Waker` are constructed here, before the thread starts,
    /// so any setup failure (e.g. file descriptor exhaustion) surfaces
    /// synchronously instead of after a thread is already running.
    pub fn init(config: RelayConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let (mutations, mutation_rx) = flume::unbounded();

        let handle = std::thread::Builder::new()
            .name("joinrelay-reactor".to_string())
            .spawn(move || reactor::run(config, mutation_rx, poll))?;

        Ok(Self(Arc::new(ContextInner {
            mutations,
            waker,
            state: Mutex::new(ContextState {
                handle: Some(handle),
                terminated: false,
            }),
        })))
    }

    fn send(&self, mutation: Mutation) -> Result<()> {
        self.0
            .mutations
            .send(mutation)
            .map_err(|_| RelayError::NotRunning)?;
        self.0.waker.wake().map_err(RelayError::Io)
    }

    /// Adopt an already-connected or already-listening raw socket into
    /// the graph, putting it in non-blocking mode.
    pub fn adopt(&self, raw: RawSocket) -> Result<SocketId> {
        let (reply, rx) = flume::unbounded();
        self.send(Mutation::Adopt { raw, reply })?;
        rx.recv().map_err(|_| RelayError::NotRunning)
    }

    /// Adopt a standard-library TCP stream.
    pub fn adopt_tcp_stream(&self, stream: StdTcpStream) -> Result<SocketId> {
        self.adopt(RawSocket::from_std_tcp_stream(stream)?)
    }

    /// Adopt a standard-library TCP listener.
    pub fn adopt_tcp_listener(&self, listener: StdTcpListener) -> Result<SocketId> {
        self.adopt(RawSocket::from_std_tcp_listener(listener)?)
    }

    /// Adopt a standard-library Unix domain stream.
    #[cfg(unix)]
    pub fn adopt_unix_stream(&self, stream: StdUnixStream) -> Result<SocketId> {
        self.adopt(RawSocket::from_std_unix_stream(stream)?)
    }

    /// Adopt a standard-library Unix domain listener.
    #[cfg(unix)]
    pub fn adopt_unix_listener(&self, listener: StdUnixListener) -> Result<SocketId> {
        self.adopt(RawSocket::from_std_unix_listener(listener)?)
    }

    /// Construct a join between two already-adopted sockets. Full
    /// duplex (both directions) unless `flags` includes
    /// [`JoinFlags::HALFDUPLEX`]; `close_ready` propagates to the
    /// other endpoint on EOF/fatal error unless `flags` includes
    /// [`JoinFlags::NOCLOSE`].
    pub fn join(
        &self,
        a: SocketId,
        b: SocketId,
        flags: JoinFlags,
        transform: Option<RelayTransform>,
    ) -> Result<()> {
        let link_close = !flags.contains(JoinFlags::NOCLOSE);
        let half_duplex = flags.contains(JoinFlags::HALFDUPLEX);

        self.join_one(a, b, transform.clone(), link_close)?;
        if !half_duplex {
            self.join_one(b, a, transform, link_close)?;
        }
        Ok(())
    }

    fn join_one(
        &self,
        source: SocketId,
        sink: SocketId,
        transform: Option<RelayTransform>,
        link_close: bool,
    ) -> Result<()> {
        let (reply, rx) = flume::unbounded();
        self.send(Mutation::Join {
            source,
            sink,
            transform,
            link_close,
            reply,
        })?;
        rx.recv().map_err(|_| RelayError::NotRunning)?
    }

    /// Tear down the join stream running from `a` to `b` (only that
    /// direction; call `unjoin(b, a)` too for the reverse side of a
    /// full-duplex pair).
    pub fn unjoin(&self, a: SocketId, b: SocketId) -> Result<()> {
        self.send(Mutation::Unjoin { a, b })
    }

    /// Idempotently shut the reactor thread down. The first call sends
    /// the shutdown signal, wakes the loop, and blocks until the
    /// thread exits; later calls (from any clone) return immediately.
    pub fn terminate(&self) {
        let handle = {
            let mut state = self.0.state.lock();
            if state.terminated {
                return;
            }
            state.terminated = true;
            state.handle.take()
        };
        let _ = self.0.mutations.send(Mutation::Terminate);
        let _ = self.0.waker.wake();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if Arc::strong_count(&self.0) != 1 {
            return;
        }
        let already_terminated = {
            let mut state = self.0.state.lock();
            let was = state.terminated;
            state.terminated = true;
            was
        };
        if already_terminated {
            return;
        }
        tracing::warn!("Context dropped without calling terminate(); signalling shutdown best-effort");
        let _ = self.0.mutations.send(Mutation::Terminate);
        let _ = self.0.waker.wake();
    }
}

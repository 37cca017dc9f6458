//! Join Graph (C3)
//!
//! The arena that owns every adopted socket and every join stream
//! between them, keyed by [`SocketId`]/[`StreamId`] so the graph can
//! hold what is naturally a cyclic structure (a socket's outgoing
//! streams point at other sockets, whose incoming-stream lists point
//! back) without any of the entries owning each other directly.
//!
//! `SocketId` doubles as the `mio::Token` used to register a socket
//! with a `Poll`, since both are just slab indices.

#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(windows)]
use std::os::windows::io::AsRawSocket;

use hashbrown::HashMap;
use mio::{Interest, Registry, Token};
use slab::Slab;
use smallvec::SmallVec;

use crate::error::{RelayError, Result};
use crate::socket::{ManagedSocket, PumpOutcome, RawSocket};
use crate::stream::JoinStream;
use crate::transform::RelayTransform;

/// The OS identity an adopted socket is keyed on, so re-adopting the
/// same underlying socket twice returns the existing [`SocketId`]
/// instead of inserting a duplicate entry. A raw file descriptor on
/// Unix, a raw `SOCKET` handle on Windows — platform-specific, but
/// every platform this crate compiles on has one.
#[cfg(unix)]
type IdentityKey = std::os::unix::io::RawFd;
#[cfg(windows)]
type IdentityKey = std::os::windows::io::RawSocket;

#[cfg(unix)]
fn raw_identity_key(raw: &RawSocket) -> IdentityKey {
    raw.as_raw_fd()
}
#[cfg(windows)]
fn raw_identity_key(raw: &RawSocket) -> IdentityKey {
    raw.as_raw_socket()
}

#[cfg(unix)]
fn managed_identity_key(socket: &ManagedSocket) -> IdentityKey {
    socket.as_raw_fd()
}
#[cfg(windows)]
fn managed_identity_key(socket: &ManagedSocket) -> IdentityKey {
    socket.as_raw_socket()
}

/// Arena key for an adopted socket. Numerically identical to the
/// `mio::Token` it is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(usize);

impl SocketId {
    #[must_use]
    pub(crate) const fn from_raw(n: usize) -> Self {
        Self(n)
    }

    #[must_use]
    pub(crate) const fn token(self) -> Token {
        Token(self.0)
    }

    #[must_use]
    pub(crate) const fn from_token(t: Token) -> Self {
        Self(t.0)
    }
}

/// Arena key for a join stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(usize);

impl StreamId {
    #[must_use]
    pub(crate) const fn from_raw(n: usize) -> Self {
        Self(n)
    }
}

struct SocketEntry {
    socket: ManagedSocket,
    streams_out: SmallVec<[StreamId; 4]>,
    streams_in: SmallVec<[StreamId; 4]>,
    /// The interest last registered with the `Poll`, so the reactor
    /// only calls register/reregister/deregister when it changes.
    current_interest: Option<Interest>,
}

/// The socket/stream arena, plus the identity index that makes
/// re-adopting an already-known file descriptor a no-op.
pub struct JoinGraph {
    sockets: Slab<SocketEntry>,
    streams: Slab<JoinStream>,
    identity: HashMap<IdentityKey, SocketId>,
}

impl Default for JoinGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl JoinGraph {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sockets: Slab::new(),
            streams: Slab::new(),
            identity: HashMap::new(),
        }
    }

    /// Adopt a raw socket, or return the existing [`SocketId`] if this
    /// socket is already known to the graph.
    pub fn adopt(&mut self, raw: RawSocket) -> SocketId {
        let key = raw_identity_key(&raw);
        if let Some(&id) = self.identity.get(&key) {
            return id;
        }
        let id = self.insert_socket(raw);
        self.identity.insert(key, id);
        id
    }

    fn insert_socket(&mut self, raw: RawSocket) -> SocketId {
        let entry = SocketEntry {
            socket: ManagedSocket::new(raw),
            streams_out: SmallVec::new(),
            streams_in: SmallVec::new(),
            current_interest: None,
        };
        SocketId(self.sockets.insert(entry))
    }

    #[must_use]
    pub fn socket(&self, id: SocketId) -> Option<&ManagedSocket> {
        self.sockets.get(id.0).map(|e| &e.socket)
    }

    #[must_use]
    pub fn contains_socket(&self, id: SocketId) -> bool {
        self.sockets.contains(id.0)
    }

    /// All sockets currently in the graph, for one-shot bookkeeping
    /// such as deregistering everything at shutdown.
    pub(crate) fn socket_ids(&self) -> impl Iterator<Item = SocketId> + '_ {
        self.sockets.iter().map(|(k, _)| SocketId(k))
    }

    /// Construct a directed join stream from `source` to `sink`.
    pub fn join(
        &mut self,
        source: SocketId,
        sink: SocketId,
        transform: Option<RelayTransform>,
        link_close: bool,
    ) -> Result<StreamId> {
        if !self.sockets.contains(source.0) || !self.sockets.contains(sink.0) {
            return Err(RelayError::graph_misuse(
                "join() referenced a socket not in the graph",
            ));
        }
        let stream = JoinStream::new(source, sink, transform, link_close);
        let id = StreamId(self.streams.insert(stream));
        self.sockets[source.0].streams_out.push(id);
        self.sockets[sink.0].streams_in.push(id);
        Ok(id)
    }

    /// Tear down the join stream(s) running from `a` to `b`.
    ///
    /// Only the `source == a, sink == b` direction is removed, found
    /// by scanning `a`'s outgoing streams — a full-duplex pair set up
    /// by [`crate::context::Context::join`] without `HALFDUPLEX` is
    /// two independent streams, and unjoining one direction leaves the
    /// other running, matching the asymmetric flags a caller can pass
    /// to `join`/`unjoin` individually per direction.
    pub fn unjoin(&mut self, a: SocketId, b: SocketId) {
        if !self.sockets.contains(a.0) || !self.sockets.contains(b.0) {
            return;
        }
        let doomed: SmallVec<[StreamId; 4]> = self.sockets[a.0]
            .streams_out
            .iter()
            .copied()
            .filter(|sid| self.streams.get(sid.0).is_some_and(|s| s.sink() == b))
            .collect();
        for sid in doomed {
            self.remove_stream(sid);
        }
    }

    fn remove_stream(&mut self, id: StreamId) {
        if !self.streams.contains(id.0) {
            return;
        }
        let stream = self.streams.remove(id.0);
        if let Some(entry) = self.sockets.get_mut(stream.source().0) {
            entry.streams_out.retain(|s| *s != id);
        }
        if let Some(entry) = self.sockets.get_mut(stream.sink().0) {
            entry.streams_in.retain(|s| *s != id);
        }
    }

    /// Accept one pending connection on `listener` and wire it up with
    /// the same streams `listener` itself is configured with: a stream
    /// templated `listener -> x` becomes `new_conn -> x`, and one
    /// templated `x -> listener` becomes `x -> new_conn`.
    ///
    /// Returns `Ok(None)` on `WouldBlock` (another thread or a spurious
    /// wakeup beat us to the single pending connection).
    pub fn accept_inherit(&mut self, listener: SocketId) -> std::io::Result<Option<SocketId>> {
        let raw = match self.sockets.get_mut(listener.0) {
            Some(entry) => match entry.socket.accept_one() {
                Ok(raw) => raw,
                Err(e) if crate::error::io_error_is_transient(&e) => return Ok(None),
                Err(e) => return Err(e),
            },
            None => return Ok(None),
        };
        let new_id = self.adopt(raw);

        let out_templates: SmallVec<[(SocketId, Option<RelayTransform>, bool); 4]> = self
            .sockets[listener.0]
            .streams_out
            .iter()
            .filter_map(|sid| self.streams.get(sid.0))
            .map(|s| (s.sink(), s.transform().cloned(), s.link_close()))
            .collect();
        for (sink, transform, link_close) in out_templates {
            let _ = self.join(new_id, sink, transform, link_close);
        }

        let in_templates: SmallVec<[(SocketId, Option<RelayTransform>, bool); 4]> = self
            .sockets[listener.0]
            .streams_in
            .iter()
            .filter_map(|sid| self.streams.get(sid.0))
            .map(|s| (s.source(), s.transform().cloned(), s.link_close()))
            .collect();
        for (source, transform, link_close) in in_templates {
            let _ = self.join(source, new_id, transform, link_close);
        }

        Ok(Some(new_id))
    }

    /// Read one chunk from `id` and forward it to every outgoing
    /// stream, transforming per-stream where configured. A transform
    /// panic only tears down the offending stream, not either of its
    /// endpoints or any other stream.
    ///
    /// Returns the set of sinks whose write buffer became non-empty as
    /// a result, so the reactor can sync their registered interest.
    pub(crate) fn pump_socket(
        &mut self,
        id: SocketId,
        chunk_size: usize,
        write_cap: Option<usize>,
    ) -> PumpSocketResult {
        let outcome = match self.sockets.get_mut(id.0) {
            Some(entry) => entry.socket.try_read(chunk_size),
            None => return PumpSocketResult::default(),
        };

        match outcome {
            PumpOutcome::Data(data) => {
                let mut dirtied = SmallVec::new();
                let out_ids: SmallVec<[StreamId; 4]> = self.sockets[id.0].streams_out.clone();
                for sid in out_ids {
                    let Some(stream) = self.streams.get(sid.0) else {
                        continue;
                    };
                    let sink = stream.sink();
                    let chunk = match stream.transform() {
                        Some(t) => match t.apply(data.clone()) {
                            Ok(out) => out,
                            Err(e) => {
                                tracing::warn!(error = %e, "transform panicked, tearing down stream");
                                self.remove_stream(sid);
                                continue;
                            }
                        },
                        None => data.clone(),
                    };
                    if chunk.is_empty() {
                        continue;
                    }
                    if let Some(entry) = self.sockets.get_mut(sink.0) {
                        let result = if entry.socket.write_buffer_is_empty() {
                            entry.socket.direct_send_or_buffer(chunk, write_cap)
                        } else {
                            entry.socket.buffer_bytes(chunk, write_cap)
                        };
                        if let Err(e) = result {
                            tracing::debug!(error = %e, "sink send failed, will be reaped");
                        }
                        if !entry.socket.write_buffer_is_empty() {
                            dirtied.push(sink);
                        }
                    }
                }
                PumpSocketResult {
                    closed: false,
                    dirtied_sinks: dirtied,
                }
            }
            PumpOutcome::Eof => PumpSocketResult {
                closed: true,
                dirtied_sinks: SmallVec::new(),
            },
            PumpOutcome::Fatal(e) => {
                tracing::debug!(socket = id.0, error = %e, "socket errored, will be reaped");
                PumpSocketResult {
                    closed: true,
                    dirtied_sinks: SmallVec::new(),
                }
            }
            PumpOutcome::WouldBlock => PumpSocketResult::default(),
        }
    }

    /// Drain as much of `id`'s write buffer as the socket will accept
    /// right now.
    pub(crate) fn flush_socket(&mut self, id: SocketId) -> Result<()> {
        match self.sockets.get_mut(id.0) {
            Some(entry) => entry.socket.flush_write_buffer(),
            None => Ok(()),
        }
    }

    /// Close every socket whose `close_ready` flag is set and whose
    /// write buffer has fully drained, propagating `close_ready` to
    /// linked peers per each torn-down stream's `link_close` flag.
    ///
    /// Runs to a fixpoint within this one call: closing a socket can
    /// mark a peer `close_ready` via `link_close`, and if that peer's
    /// write buffer is already empty it is reap-ready immediately, with
    /// no further I/O needed to observe it. Deferring that cascade to
    /// "the next iteration" would mean waiting on a `Poll::poll` wakeup
    /// that may never come (nothing external is going to make that
    /// peer readable or writable), so the loop below keeps re-scanning
    /// until a pass finds nothing new to close. A peer whose buffer is
    /// still non-empty only becomes reap-ready once its own I/O drains
    /// it, which a later call picks up as before.
    pub(crate) fn reap(&mut self, registry: &Registry) -> SmallVec<[SocketId; 8]> {
        let mut closed: SmallVec<[SocketId; 8]> = SmallVec::new();
        loop {
            let ready: SmallVec<[SocketId; 8]> = self
                .sockets
                .iter()
                .filter(|(_, e)| e.socket.reap_ready())
                .map(|(k, _)| SocketId(k))
                .collect();
            if ready.is_empty() {
                break;
            }
            for id in &ready {
                self.close_socket(*id, registry);
            }
            closed.extend(ready);
        }
        closed
    }

    fn close_socket(&mut self, id: SocketId, registry: &Registry) {
        let Some(entry) = self.sockets.get(id.0) else {
            return;
        };
        let streams_out = entry.streams_out.clone();
        let streams_in = entry.streams_in.clone();
        let mut touched_peers: SmallVec<[SocketId; 8]> = SmallVec::new();

        for sid in streams_out {
            let Some(stream) = self.streams.get(sid.0) else {
                continue;
            };
            let (sink, link_close) = (stream.sink(), stream.link_close());
            self.remove_stream(sid);
            if link_close {
                if let Some(sink_entry) = self.sockets.get_mut(sink.0) {
                    sink_entry.socket.mark_close_ready();
                }
            }
            touched_peers.push(sink);
        }
        for sid in streams_in {
            let Some(stream) = self.streams.get(sid.0) else {
                continue;
            };
            let (source, link_close) = (stream.source(), stream.link_close());
            self.remove_stream(sid);
            if link_close {
                if let Some(source_entry) = self.sockets.get_mut(source.0) {
                    source_entry.socket.mark_close_ready();
                }
            }
            touched_peers.push(source);
        }

        // Every peer above just lost an edge (and possibly gained
        // close_ready); its desired interest may have changed, so its
        // mio registration must be resynced here rather than left for
        // whatever `Join`/`Unjoin`/`flush_writable`/`process_readable`
        // call happens to run next — there is no guarantee one ever
        // touches this particular peer again.
        for peer in touched_peers {
            if peer != id {
                let _ = self.sync_interest(registry, peer);
            }
        }

        if let Some(entry) = self.sockets.get_mut(id.0) {
            let _ = entry.socket.deregister(registry);
        }
        let entry = self.sockets.remove(id.0);
        self.identity.remove(&managed_identity_key(&entry.socket));
        if let Err(e) = entry.socket.close() {
            tracing::warn!(error = %e, "error while closing a reaped socket");
        }
    }

    /// The interest a socket should be registered for right now:
    /// readable if it has any outgoing stream (including a listener
    /// waiting to accept), writable if it has buffered bytes pending.
    fn desired_interest(&self, id: SocketId) -> Option<Interest> {
        let entry = self.sockets.get(id.0)?;
        let want_read = !entry.streams_out.is_empty();
        let want_write = !entry.socket.is_listening() && !entry.socket.write_buffer_is_empty();
        match (want_read, want_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Register, reregister, or deregister `id` with `registry` so its
    /// actual registration matches [`Self::desired_interest`].
    pub(crate) fn sync_interest(&mut self, registry: &Registry, id: SocketId) -> std::io::Result<()> {
        let desired = self.desired_interest(id);
        let Some(entry) = self.sockets.get_mut(id.0) else {
            return Ok(());
        };
        match (entry.current_interest, desired) {
            (None, Some(interest)) => {
                entry.socket.register(registry, id.token(), interest)?;
                entry.current_interest = Some(interest);
            }
            (Some(old), Some(new)) if old != new => {
                entry.socket.reregister(registry, id.token(), new)?;
                entry.current_interest = Some(new);
            }
            (Some(_), None) => {
                entry.socket.deregister(registry)?;
                entry.current_interest = None;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Outcome of [`JoinGraph::pump_socket`].
#[derive(Default)]
pub(crate) struct PumpSocketResult {
    pub(crate) closed: bool,
    pub(crate) dirtied_sinks: SmallVec<[SocketId; 4]>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};

    fn loopback_pair() -> (StdTcpStream, StdTcpStream) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    #[cfg(unix)]
    fn adopt_registers_the_fd_in_the_identity_index() {
        use std::os::unix::io::AsRawFd;
        let (_client, server) = loopback_pair();
        let raw = RawSocket::from_std_tcp_stream(server).unwrap();
        let fd = raw.as_raw_fd();
        let mut graph = JoinGraph::new();
        let a = graph.adopt(raw);
        assert_eq!(graph.identity.get(&fd).copied(), Some(a));
    }

    #[test]
    fn join_then_unjoin_removes_only_the_matching_direction() {
        let (client, server) = loopback_pair();
        let mut graph = JoinGraph::new();
        let a = graph.adopt(RawSocket::from_std_tcp_stream(client).unwrap());
        let b = graph.adopt(RawSocket::from_std_tcp_stream(server).unwrap());

        graph.join(a, b, None, true).unwrap();
        graph.join(b, a, None, true).unwrap();
        assert_eq!(graph.sockets[a.0].streams_out.len(), 1);
        assert_eq!(graph.sockets[b.0].streams_out.len(), 1);

        graph.unjoin(a, b);
        assert_eq!(graph.sockets[a.0].streams_out.len(), 0);
        assert_eq!(graph.sockets[b.0].streams_out.len(), 1);
    }

    #[test]
    fn join_rejects_unknown_socket_ids() {
        let mut graph = JoinGraph::new();
        let (_client, server) = loopback_pair();
        let a = graph.adopt(RawSocket::from_std_tcp_stream(server).unwrap());
        let bogus = SocketId(9999);
        assert!(graph.join(a, bogus, None, true).is_err());
    }

    #[test]
    fn desired_interest_tracks_streams_and_buffer() {
        let (client, server) = loopback_pair();
        let mut graph = JoinGraph::new();
        let a = graph.adopt(RawSocket::from_std_tcp_stream(client).unwrap());
        let b = graph.adopt(RawSocket::from_std_tcp_stream(server).unwrap());
        assert_eq!(graph.desired_interest(a), None);

        graph.join(a, b, None, true).unwrap();
        assert_eq!(graph.desired_interest(a), Some(Interest::READABLE));
    }

    #[test]
    fn reap_cascades_link_close_within_one_call() {
        let (_a1, a2_raw) = loopback_pair();
        let (_b2, b1_raw) = loopback_pair();
        let mut graph = JoinGraph::new();
        let a2 = graph.adopt(RawSocket::from_std_tcp_stream(a2_raw).unwrap());
        let b1 = graph.adopt(RawSocket::from_std_tcp_stream(b1_raw).unwrap());
        graph.join(a2, b1, None, true).unwrap();

        // Simulate the reactor having already observed EOF on `a2`
        // (e.g. via `pump_socket`), without running any more I/O.
        graph.sockets[a2.0].socket.mark_close_ready();

        let poll = mio::Poll::new().unwrap();
        let closed = graph.reap(poll.registry());

        // `b1` must be reaped in this same call: link_close propagated
        // `close_ready` to it when `a2` closed, and its write buffer
        // was already empty, so nothing external is ever going to make
        // it readable/writable again to trigger a later pass.
        assert!(closed.contains(&a2));
        assert!(closed.contains(&b1));
        assert!(!graph.contains_socket(a2));
        assert!(!graph.contains_socket(b1));
    }

    #[test]
    fn close_socket_resyncs_peer_interest_after_losing_its_only_stream() {
        let (_a1, a2_raw) = loopback_pair();
        let (_b2, b1_raw) = loopback_pair();
        let mut graph = JoinGraph::new();
        let a2 = graph.adopt(RawSocket::from_std_tcp_stream(a2_raw).unwrap());
        let b1 = graph.adopt(RawSocket::from_std_tcp_stream(b1_raw).unwrap());
        // NOCLOSE both ways: closing `a2` must not mark `b1`
        // close_ready, so `b1` survives and its stale registration is
        // what this test is checking.
        graph.join(a2, b1, None, false).unwrap();
        graph.join(b1, a2, None, false).unwrap();

        let poll = mio::Poll::new().unwrap();
        graph.sync_interest(poll.registry(), a2).unwrap();
        graph.sync_interest(poll.registry(), b1).unwrap();
        // `b1` has an outgoing stream of its own (`b1 -> a2`), so it is
        // registered for READABLE before `a2` goes away.
        assert_eq!(graph.sockets[b1.0].current_interest, Some(Interest::READABLE));

        graph.sockets[a2.0].socket.mark_close_ready();
        graph.reap(poll.registry());

        assert!(!graph.contains_socket(a2));
        assert!(graph.contains_socket(b1), "NOCLOSE must keep b1 alive");
        // `b1 -> a2` was torn down along with `a2`, so `b1` has no
        // stream left and must be deregistered, not left stuck at
        // READABLE for an edge that no longer exists.
        assert_eq!(graph.sockets[b1.0].current_interest, None);
    }
}

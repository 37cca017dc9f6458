//! Event Loop (C4)
//!
//! The readiness-poll loop that owns the [`JoinGraph`] exclusively:
//! no other thread ever touches a [`ManagedSocket`](crate::socket::ManagedSocket)
//! or a join stream directly. Application threads reach the graph only
//! by sending a [`Mutation`] down a channel and waking the loop with a
//! [`mio::Waker`]; the loop applies every pending mutation at the top
//! of each iteration before touching I/O, so no edge list is ever read
//! while it is concurrently being mutated.
//!
//! One iteration:
//! 1. Drain pending mutations (adopt/join/unjoin/terminate).
//! 2. Flush any socket whose write buffer has pending bytes and is
//!    writable.
//! 3. For each readable socket: accept (if listening) or pump.
//! 4. Sync registered interest for every socket touched this
//!    iteration.
//! 5. Reap sockets that are `close_ready` with an empty write buffer.
//! 6. Block in `Poll::poll` until the next wakeup.

use std::io;

use flume::{Receiver, Sender};
use mio::{Events, Poll, Token};
use smallvec::SmallVec;

use crate::config::RelayConfig;
use crate::error::Result;
use crate::graph::{JoinGraph, SocketId};
use crate::socket::RawSocket;
use crate::transform::RelayTransform;

/// Token reserved for the `mio::Waker`. Socket tokens are slab indices
/// from 0, so `usize::MAX` never collides with a real `SocketId`.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// A mutation requested by an application thread. Every variant that
/// reports a result carries a one-shot reply channel; the caller blocks
/// on `recv()` so `Context::join`/`adopt`/etc. read as synchronous
/// calls even though the graph is mutated on another thread.
pub(crate) enum Mutation {
    Adopt {
        raw: RawSocket,
        reply: Sender<SocketId>,
    },
    Join {
        source: SocketId,
        sink: SocketId,
        transform: Option<RelayTransform>,
        link_close: bool,
        reply: Sender<Result<()>>,
    },
    Unjoin {
        a: SocketId,
        b: SocketId,
    },
    Terminate,
}

/// Runs on the reactor thread until a [`Mutation::Terminate`] is
/// received. `poll` and its waker are constructed by the caller (see
/// [`crate::context::Context::init`]) so the application thread can
/// hold the `Arc<Waker>` needed to interrupt the blocking `poll()`
/// call below; this function only ever reads from the registry.
pub(crate) fn run(
    config: RelayConfig,
    mutations: Receiver<Mutation>,
    mut poll: Poll,
) -> io::Result<()> {
    let mut events = Events::with_capacity(config.poll_capacity);
    let mut graph = JoinGraph::new();

    loop {
        if !drain_mutations(&mut graph, &poll, &mutations) {
            return Ok(());
        }

        flush_writable(&mut graph, &poll, &events);
        let _ = process_readable(&mut graph, &config, &poll, &events);
        graph.reap(poll.registry());

        match poll.poll(&mut events, None) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Apply every mutation queued so far. Returns `false` if a
/// `Terminate` was among them, signalling the loop to exit.
fn drain_mutations(graph: &mut JoinGraph, poll: &Poll, mutations: &Receiver<Mutation>) -> bool {
    while let Ok(mutation) = mutations.try_recv() {
        match mutation {
            Mutation::Adopt { raw, reply } => {
                let id = graph.adopt(raw);
                let _ = graph.sync_interest(poll.registry(), id);
                let _ = reply.send(id);
            }
            Mutation::Join {
                source,
                sink,
                transform,
                link_close,
                reply,
            } => {
                let result = graph.join(source, sink, transform, link_close).map(|_| ());
                let _ = graph.sync_interest(poll.registry(), source);
                let _ = graph.sync_interest(poll.registry(), sink);
                let _ = reply.send(result);
            }
            Mutation::Unjoin { a, b } => {
                graph.unjoin(a, b);
                let _ = graph.sync_interest(poll.registry(), a);
                let _ = graph.sync_interest(poll.registry(), b);
            }
            Mutation::Terminate => return false,
        }
    }
    true
}

fn flush_writable(graph: &mut JoinGraph, poll: &Poll, events: &Events) {
    for event in events.iter() {
        if event.token() == WAKE_TOKEN || !event.is_writable() {
            continue;
        }
        let id = SocketId::from_token(event.token());
        if graph.flush_socket(id).is_ok() {
            let _ = graph.sync_interest(poll.registry(), id);
        }
    }
}

/// Returns the set of sockets that hit EOF/a fatal error this pass,
/// purely for symmetry with `flush_writable`/`reap`; the graph already
/// marked them `close_ready` and `reap` will collect them next.
fn process_readable(
    graph: &mut JoinGraph,
    config: &RelayConfig,
    poll: &Poll,
    events: &Events,
) -> SmallVec<[SocketId; 8]> {
    let mut closed = SmallVec::new();
    for event in events.iter() {
        if event.token() == WAKE_TOKEN || !event.is_readable() {
            continue;
        }
        let id = SocketId::from_token(event.token());
        let Some(socket) = graph.socket(id) else {
            continue;
        };

        if socket.is_listening() {
            match graph.accept_inherit(id) {
                Ok(Some(new_id)) => {
                    let _ = graph.sync_interest(poll.registry(), new_id);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "accept failed");
                }
            }
            continue;
        }

        let result = graph.pump_socket(id, config.read_chunk_size, config.max_write_buffer_bytes);
        if result.closed {
            closed.push(id);
        }
        for sink in result.dirtied_sinks {
            let _ = graph.sync_interest(poll.registry(), sink);
        }
        let _ = graph.sync_interest(poll.registry(), id);
    }
    closed
}


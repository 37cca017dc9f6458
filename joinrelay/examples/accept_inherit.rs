//! Example: listener fan-out via accept-inherit
//!
//! Binds one listening socket and joins it to a single fixed peer
//! connection. Every client that connects to the listener inherits
//! that join automatically — each accepted connection is wired up to
//! the same peer the listener itself was joined to, with no further
//! application code required per connection.
//!
//! Run this example:
//! ```bash
//! RUST_LOG=info cargo run --example accept_inherit
//! ```
//!
//! Then connect a peer on 127.0.0.1:7001 first (e.g. `nc -l 7001`),
//! and any number of clients on 127.0.0.1:7000 (`nc 127.0.0.1 7000`)
//! — each one forwards to and from the 7001 peer.

use std::net::{TcpListener, TcpStream};

use joinrelay::prelude::*;

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let ctx = Context::init(RelayConfig::default())?;

    println!("waiting for the fan-out peer on 127.0.0.1:7001 ...");
    let peer = TcpStream::connect_timeout(
        &"127.0.0.1:7001".parse().unwrap(),
        std::time::Duration::from_secs(30),
    )
    .or_else(|_| {
        let listener = TcpListener::bind("127.0.0.1:7001")?;
        Ok::<_, std::io::Error>(listener.accept()?.0)
    })?;
    let peer_id = ctx.adopt_tcp_stream(peer)?;

    let listener = TcpListener::bind("127.0.0.1:7000")?;
    let listener_id = ctx.adopt_tcp_listener(listener)?;

    // Every client accepted on the listener inherits this join.
    ctx.join(listener_id, peer_id, JoinFlags::NONE, None)?;

    println!("listening on 127.0.0.1:7000; each client fans out to the 7001 peer");
    loop {
        std::thread::park();
    }
}

//! Example: plain TCP relay
//!
//! Joins two listening ports together: anything written to a client
//! connected on the first port is forwarded verbatim to whichever
//! client connected on the second port, and vice versa.
//!
//! Run this example:
//! ```bash
//! RUST_LOG=info cargo run --example echo
//! ```
//!
//! Then in two terminals:
//! ```bash
//! nc 127.0.0.1 7000
//! nc 127.0.0.1 7001
//! ```
//! Anything typed into one `nc` appears in the other.

use std::net::TcpListener;

use joinrelay::prelude::*;

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let ctx = Context::init(RelayConfig::default())?;

    let left = TcpListener::bind("127.0.0.1:7000")?;
    println!("waiting for a client on 127.0.0.1:7000 ...");
    let (left_stream, _) = left.accept()?;

    let right = TcpListener::bind("127.0.0.1:7001")?;
    println!("waiting for a client on 127.0.0.1:7001 ...");
    let (right_stream, _) = right.accept()?;

    let a = ctx.adopt_tcp_stream(left_stream)?;
    let b = ctx.adopt_tcp_stream(right_stream)?;
    ctx.join(a, b, JoinFlags::NONE, None)?;

    println!("relaying; press Ctrl+C to stop");
    loop {
        std::thread::park();
    }
}

//! Example: relay with a byte transform
//!
//! Same shape as `echo`, but every chunk read from the first client is
//! uppercased before it reaches the second. The reverse direction is
//! left untouched, so the transform is visibly one-way.
//!
//! Run this example:
//! ```bash
//! RUST_LOG=info cargo run --example transform
//! ```

use std::net::TcpListener;

use bytes::Bytes;
use joinrelay::prelude::*;

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let ctx = Context::init(RelayConfig::default())?;

    let left = TcpListener::bind("127.0.0.1:7000")?;
    println!("waiting for a client on 127.0.0.1:7000 (this side gets uppercased) ...");
    let (left_stream, _) = left.accept()?;

    let right = TcpListener::bind("127.0.0.1:7001")?;
    println!("waiting for a client on 127.0.0.1:7001 ...");
    let (right_stream, _) = right.accept()?;

    let a = ctx.adopt_tcp_stream(left_stream)?;
    let b = ctx.adopt_tcp_stream(right_stream)?;

    let upper = RelayTransform::new(|chunk: Bytes| Bytes::from(chunk.to_ascii_uppercase()));
    ctx.join(a, b, JoinFlags::HALFDUPLEX, Some(upper))?;
    // Replies flow back untransformed.
    ctx.join(b, a, JoinFlags::HALFDUPLEX, None)?;

    println!("relaying; press Ctrl+C to stop");
    loop {
        std::thread::park();
    }
}

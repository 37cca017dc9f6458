//! # joinrelay
//!
//! A socket-joining relay engine.
//!
//! ## Architecture
//!
//! joinrelay is structured the way a small messaging kernel is:
//!
//! - **`joinrelay-core`**: the join graph and its readiness-poll
//!   reactor — managed sockets, join streams, the event loop, the
//!   context lifecycle.
//! - **`joinrelay`**: this crate, a thin re-export surface plus
//!   runnable examples.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use joinrelay::prelude::*;
//! use std::net::{TcpListener, TcpStream};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = Context::init(RelayConfig::default())?;
//!
//! let listener = TcpListener::bind("127.0.0.1:0")?;
//! let addr = listener.local_addr()?;
//! let a = ctx.adopt_tcp_stream(TcpStream::connect(addr)?)?;
//! let (server, _) = listener.accept()?;
//! let b = ctx.adopt_tcp_stream(server)?;
//!
//! // Full-duplex join: bytes flow a -> b and b -> a.
//! ctx.join(a, b, JoinFlags::NONE, None)?;
//!
//! ctx.terminate();
//! # Ok(())
//! # }
//! ```
//!
//! ## Performance
//!
//! - Non-blocking sockets throughout; the reactor never calls a
//!   blocking syscall on a managed socket.
//! - A direct send is attempted first; buffering only engages once a
//!   sink is actually backpressured, and persists until drained so
//!   bytes already queued cannot be overtaken.
//! - The reactor blocks in `mio::Poll::poll` between iterations rather
//!   than busy-spinning; application-thread mutations wake it through
//!   a `mio::Waker`.
//!
//! ## Safety
//!
//! `unsafe` code is isolated to `joinrelay-core::socket`, where a raw
//! descriptor is briefly borrowed through `socket2` to toggle
//! `TCP_NODELAY` without taking ownership of it. Everything else in
//! both crates is safe Rust.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub use joinrelay_core::config::RelayConfig;
pub use joinrelay_core::context::{Context, JoinFlags};
pub use joinrelay_core::error::{RelayError, Result};
pub use joinrelay_core::graph::SocketId;
pub use joinrelay_core::socket::RawSocket;
pub use joinrelay_core::transform::RelayTransform;

/// Re-exports the names most call sites need.
pub mod prelude {
    pub use crate::{Context, JoinFlags, RawSocket, RelayConfig, RelayError, RelayTransform, Result, SocketId};
}

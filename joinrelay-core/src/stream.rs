//! Join Stream (C2)
//!
//! A directed byte pipe between two adopted sockets: bytes read from
//! `source` are optionally transformed and forwarded to `sink`. Join
//! streams do not own their endpoints; they reference them by
//! [`SocketId`](crate::graph::SocketId), the join graph's arena key,
//! so the same socket can be the endpoint of many streams without any
//! cyclic ownership.

use crate::graph::SocketId;
use crate::transform::RelayTransform;

/// A directed join from `source` to `sink`.
pub struct JoinStream {
    pub(crate) source: SocketId,
    pub(crate) sink: SocketId,
    pub(crate) transform: Option<RelayTransform>,
    /// When the source side reaches EOF or a fatal error, also mark
    /// the sink's write side closed once its buffer drains (unless
    /// `NOCLOSE` was requested for this stream).
    pub(crate) link_close: bool,
}

impl JoinStream {
    pub(crate) fn new(
        source: SocketId,
        sink: SocketId,
        transform: Option<RelayTransform>,
        link_close: bool,
    ) -> Self {
        Self {
            source,
            sink,
            transform,
            link_close,
        }
    }

    #[must_use]
    pub const fn source(&self) -> SocketId {
        self.source
    }

    #[must_use]
    pub const fn sink(&self) -> SocketId {
        self.sink
    }

    #[must_use]
    pub const fn link_close(&self) -> bool {
        self.link_close
    }

    #[must_use]
    pub fn transform(&self) -> Option<&RelayTransform> {
        self.transform.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SocketId;

    #[test]
    fn loopback_stream_is_constructible() {
        let id = SocketId::from_raw(0);
        let stream = JoinStream::new(id, id, None, true);
        assert_eq!(stream.source(), stream.sink());
    }

    #[test]
    fn carries_an_optional_transform() {
        let a = SocketId::from_raw(0);
        let b = SocketId::from_raw(1);
        let stream = JoinStream::new(a, b, Some(RelayTransform::new(|bytes| bytes)), false);
        assert!(stream.transform().is_some());
        assert!(!stream.link_close());
    }
}

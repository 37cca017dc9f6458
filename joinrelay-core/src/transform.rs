//! Byte transforms applied per chunk on a `JoinStream`.
//!
//! A transform is a pure `bytes -> bytes` function invoked on the
//! reactor thread once per chunk read from a stream's source. The
//! engine never composes or inspects transforms; it only calls them
//! and catches panics so a misbehaving transform cannot take down
//! unrelated streams.

use bytes::Bytes;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::RelayError;

/// A boxed, cloneable transform function.
#[derive(Clone)]
pub struct RelayTransform {
    f: Arc<dyn Fn(Bytes) -> Bytes + Send + Sync>,
}

impl RelayTransform {
    /// Wrap a plain function or closure as a transform.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Bytes) -> Bytes + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// Apply the transform to one chunk, catching any panic and
    /// turning it into a `RelayError::TransformPanicked` instead of
    /// unwinding across the reactor loop.
    pub fn apply(&self, chunk: Bytes) -> Result<Bytes, RelayError> {
        let f = &self.f;
        panic::catch_unwind(AssertUnwindSafe(|| f(chunk))).map_err(|payload| {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "transform panicked with a non-string payload".to_string());
            RelayError::TransformPanicked(msg)
        })
    }
}

impl fmt::Debug for RelayTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayTransform")
            .field("f", &"<fn>")
            .finish()
    }
}

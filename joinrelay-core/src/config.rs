//! Relay engine configuration.
//!
//! Tunables for parts of the reactor with no single correct value:
//! read chunk size, an optional per-sink write-buffer cap, and the
//! poll loop's event batch size.

/// Relay engine configuration.
///
/// # Examples
///
/// ```
/// use joinrelay_core::config::RelayConfig;
///
/// let cfg = RelayConfig::default()
///     .with_read_chunk_size(8 * 1024)
///     .with_max_write_buffer_bytes(Some(4 * 1024 * 1024));
/// ```
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bytes read per `pump` call before yielding back to the poll loop.
    ///
    /// - Default: 4 KiB.
    pub read_chunk_size: usize,

    /// Hard cap on a single sink's `write_buffer`, in bytes.
    ///
    /// - `None` (default): unbounded.
    /// - `Some(n)`: once a sink's buffer would grow past `n` bytes, the
    ///   sink is treated as fatally errored (`close_ready` is set and
    ///   the buffer discarded) rather than growing without limit.
    pub max_write_buffer_bytes: Option<usize>,

    /// Capacity of the `mio::Events` buffer the reactor polls into.
    ///
    /// - Default: 1024.
    pub poll_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 4 * 1024,
            max_write_buffer_bytes: None,
            poll_capacity: 1024,
        }
    }
}

impl RelayConfig {
    /// Set the per-`pump` read chunk size.
    #[must_use]
    pub const fn with_read_chunk_size(mut self, bytes: usize) -> Self {
        self.read_chunk_size = bytes;
        self
    }

    /// Set a hard cap on a sink's pending write buffer.
    #[must_use]
    pub const fn with_max_write_buffer_bytes(mut self, bytes: Option<usize>) -> Self {
        self.max_write_buffer_bytes = bytes;
        self
    }

    /// Set the `mio::Events` batch capacity.
    #[must_use]
    pub const fn with_poll_capacity(mut self, capacity: usize) -> Self {
        self.poll_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_4kib_chunk_unbounded_buffer() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.read_chunk_size, 4096);
        assert_eq!(cfg.max_write_buffer_bytes, None);
    }

    #[test]
    fn builder_is_chainable() {
        let cfg = RelayConfig::default()
            .with_read_chunk_size(16 * 1024)
            .with_max_write_buffer_bytes(Some(1024))
            .with_poll_capacity(64);
        assert_eq!(cfg.read_chunk_size, 16 * 1024);
        assert_eq!(cfg.max_write_buffer_bytes, Some(1024));
        assert_eq!(cfg.poll_capacity, 64);
    }
}

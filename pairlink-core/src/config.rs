//! Session tuning.

/// Receive buffer size used when none is configured.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Upper bound on the size of one delivered chunk.
    pub read_buffer_size: usize,
}

impl SessionConfig {
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub(crate) fn buffer_len(&self) -> usize {
        self.read_buffer_size.max(1)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

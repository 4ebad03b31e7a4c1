//! Cross-thread plumbing: task runners and the bounded data pipe.

pub mod pipe;
pub mod task;

use pd_core::BrowserError;
use pd_core::BrowserResult;

pub use pipe::PipeConsumer;
pub use pipe::PipeError;
pub use pipe::PipeProducer;
pub use pipe::WriteBuffer;
pub use pipe::data_pipe;
pub use task::ManualTaskRunner;
pub use task::Task;
pub use task::TaskRunner;
pub use task::ThreadTaskRunner;
pub use task::drain_until_idle;

const DEFAULT_PIPE_CAPACITY_BYTES: usize = 64 * 1024;
const DEFAULT_MAX_CHUNK_BYTES: usize = 16 * 1024;
const MAX_PIPE_CAPACITY_BYTES: usize = 16 * 1024 * 1024;

/// Sizing for the bounded byte pipe between a loader and its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeConfig {
    pub capacity_bytes: usize,
    pub max_chunk_bytes: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_PIPE_CAPACITY_BYTES,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
        }
    }
}

impl PipeConfig {
    pub fn hardened() -> BrowserResult<Self> {
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    pub fn with_capacity(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES.min(capacity_bytes),
        }
    }

    pub fn validate(&self) -> BrowserResult<()> {
        if self.capacity_bytes == 0 {
            return Err(BrowserError::new(
                "ipc.pipe_capacity_invalid",
                "pipe capacity_bytes must be greater than zero",
            ));
        }

        if self.capacity_bytes > MAX_PIPE_CAPACITY_BYTES {
            return Err(BrowserError::new(
                "ipc.pipe_capacity_too_large",
                "pipe capacity_bytes exceeds hard limit (16 MiB)",
            ));
        }

        if self.max_chunk_bytes == 0 || self.max_chunk_bytes > self.capacity_bytes {
            return Err(BrowserError::new(
                "ipc.pipe_chunk_invalid",
                format!(
                    "pipe max_chunk_bytes must be within 1..={} (got {})",
                    self.capacity_bytes, self.max_chunk_bytes
                ),
            ));
        }

        Ok(())
    }
}

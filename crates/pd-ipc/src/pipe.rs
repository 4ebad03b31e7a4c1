//! Bounded byte pipe with producer/consumer halves.
//!
//! The producer learns about free space through a one-shot writable watcher
//! that fires when the consumer drains bytes or goes away. Nothing blocks:
//! a full pipe reports `PipeError::ShouldWait` and the producer re-arms.

use crate::PipeConfig;
use crate::Task;
use bytes::Bytes;
use bytes::BytesMut;
use parking_lot::Mutex;
use pd_core::BrowserResult;
use std::sync::Arc;

/// Non-fatal pipe conditions reported to either half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    #[error("pipe is not ready; wait for a notification")]
    ShouldWait,
    #[error("the other end of the pipe is closed")]
    PeerClosed,
}

struct PipeState {
    buffer: BytesMut,
    capacity: usize,
    max_chunk: usize,
    producer_open: bool,
    consumer_open: bool,
    writable_watcher: Option<Task>,
}

impl PipeState {
    fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }
}

type SharedPipe = Arc<Mutex<PipeState>>;

/// Allocates a pipe; fails when the config is out of bounds.
pub fn data_pipe(config: &PipeConfig) -> BrowserResult<(PipeProducer, PipeConsumer)> {
    config.validate()?;

    let shared = Arc::new(Mutex::new(PipeState {
        buffer: BytesMut::with_capacity(config.capacity_bytes),
        capacity: config.capacity_bytes,
        max_chunk: config.max_chunk_bytes,
        producer_open: true,
        consumer_open: true,
        writable_watcher: None,
    }));

    Ok((
        PipeProducer {
            shared: Arc::clone(&shared),
        },
        PipeConsumer { shared },
    ))
}

/// Scratch space handed out by `PipeProducer::begin_write`.
#[derive(Debug)]
pub struct WriteBuffer {
    bytes: BytesMut,
}

impl WriteBuffer {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..]
    }
}

/// Write half, owned by the loader on the I/O thread.
pub struct PipeProducer {
    shared: SharedPipe,
}

impl PipeProducer {
    pub fn begin_write(&self) -> Result<WriteBuffer, PipeError> {
        let state = self.shared.lock();
        if !state.consumer_open {
            return Err(PipeError::PeerClosed);
        }

        let available = state.free_space().min(state.max_chunk);
        if available == 0 {
            return Err(PipeError::ShouldWait);
        }

        Ok(WriteBuffer {
            bytes: BytesMut::zeroed(available),
        })
    }

    /// Commits the first `written` bytes of `buffer`.
    pub fn end_write(&self, buffer: WriteBuffer, written: usize) -> Result<(), PipeError> {
        let mut state = self.shared.lock();
        if !state.consumer_open {
            return Err(PipeError::PeerClosed);
        }

        let written = written.min(buffer.len()).min(state.free_space());
        state.buffer.extend_from_slice(&buffer.bytes[..written]);
        Ok(())
    }

    /// Registers a one-shot callback for when space frees up.
    ///
    /// Fires immediately when the pipe already has room or the consumer is
    /// gone. A newer registration replaces an older unfired one.
    pub fn arm_writable(&self, callback: Task) {
        let mut state = self.shared.lock();
        if state.consumer_open && state.free_space() == 0 {
            state.writable_watcher = Some(callback);
            return;
        }

        drop(state);
        callback();
    }

    pub fn is_consumer_open(&self) -> bool {
        self.shared.lock().consumer_open
    }
}

impl Drop for PipeProducer {
    fn drop(&mut self) {
        self.shared.lock().producer_open = false;
    }
}

/// Read half, handed to the network-visible loader client.
pub struct PipeConsumer {
    shared: SharedPipe,
}

impl PipeConsumer {
    /// Copies buffered bytes into `out`; `Ok(0)` means end of stream.
    pub fn read(&self, out: &mut [u8]) -> Result<usize, PipeError> {
        let (count, watcher) = {
            let mut state = self.shared.lock();
            if state.buffer.is_empty() {
                if state.producer_open {
                    return Err(PipeError::ShouldWait);
                }
                return Ok(0);
            }

            let count = out.len().min(state.buffer.len());
            let chunk = state.buffer.split_to(count);
            out[..count].copy_from_slice(&chunk);
            let watcher = if count > 0 {
                state.writable_watcher.take()
            } else {
                None
            };
            (count, watcher)
        };

        if let Some(watcher) = watcher {
            watcher();
        }
        Ok(count)
    }

    /// Takes every buffered byte; empty once the producer has finished.
    pub fn read_available(&self) -> Result<Bytes, PipeError> {
        let (bytes, watcher) = {
            let mut state = self.shared.lock();
            if state.buffer.is_empty() {
                if state.producer_open {
                    return Err(PipeError::ShouldWait);
                }
                return Ok(Bytes::new());
            }

            let bytes = state.buffer.split().freeze();
            (bytes, state.writable_watcher.take())
        };

        if let Some(watcher) = watcher {
            watcher();
        }
        Ok(bytes)
    }

    pub fn buffered_len(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    /// True once the producer is gone and every byte has been read.
    pub fn is_complete(&self) -> bool {
        let state = self.shared.lock();
        !state.producer_open && state.buffer.is_empty()
    }
}

impl Drop for PipeConsumer {
    fn drop(&mut self) {
        let watcher = {
            let mut state = self.shared.lock();
            state.consumer_open = false;
            state.buffer.clear();
            state.writable_watcher.take()
        };

        if let Some(watcher) = watcher {
            watcher();
        }
    }
}

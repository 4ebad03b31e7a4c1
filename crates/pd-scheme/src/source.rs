//! Byte sources supplied by scheme handlers.
//!
//! A request only ever holds a `Weak` reference to its source; keeping the
//! source alive for the duration of the load is the handler's job. When the
//! weak reference stops upgrading mid-stream the load fails.

use bytes::Buf;
use bytes::Bytes;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;

/// Callback a sequential source fires when new bytes or end-of-input arrive.
pub type ReadyNotifier = Arc<dyn Fn() + Send + Sync>;

pub trait DataSource: Send + Sync {
    fn open(&self) -> io::Result<()>;

    fn is_open(&self) -> bool;

    fn is_readable(&self) -> bool;

    /// Sequential sources cannot seek and may return zero bytes while more
    /// data is still on its way.
    fn is_sequential(&self) -> bool;

    /// Total size in bytes, when known up front.
    fn size(&self) -> Option<u64>;

    fn seek(&self, position: u64) -> io::Result<()>;

    fn read(&self, out: &mut [u8]) -> io::Result<usize>;

    fn at_end(&self) -> bool;

    fn close(&self);

    /// Installs the readiness hook. Only sequential sources need to call it.
    fn set_ready_notifier(&self, _notifier: Option<ReadyNotifier>) {}
}

struct BufferState {
    data: Bytes,
    position: usize,
    open: bool,
}

/// Seekable in-memory source of known size.
pub struct BufferSource {
    state: Mutex<BufferState>,
}

impl BufferSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            state: Mutex::new(BufferState {
                data: data.into(),
                position: 0,
                open: false,
            }),
        }
    }

    pub fn shared(data: impl Into<Bytes>) -> Arc<dyn DataSource> {
        Arc::new(Self::new(data))
    }

    pub fn position(&self) -> u64 {
        self.state.lock().position as u64
    }
}

impl DataSource for BufferSource {
    fn open(&self) -> io::Result<()> {
        self.state.lock().open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn is_readable(&self) -> bool {
        self.state.lock().open
    }

    fn is_sequential(&self) -> bool {
        false
    }

    fn size(&self) -> Option<u64> {
        Some(self.state.lock().data.len() as u64)
    }

    fn seek(&self, position: u64) -> io::Result<()> {
        let mut state = self.state.lock();
        let position = usize::try_from(position)
            .ok()
            .filter(|position| *position <= state.data.len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("seek to {position} past end of {}-byte buffer", state.data.len()),
                )
            })?;
        state.position = position;
        Ok(())
    }

    fn read(&self, out: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "buffer source is closed",
            ));
        }

        let start = state.position;
        let count = out.len().min(state.data.len() - start);
        out[..count].copy_from_slice(&state.data[start..start + count]);
        state.position += count;
        Ok(count)
    }

    fn at_end(&self) -> bool {
        let state = self.state.lock();
        state.position >= state.data.len()
    }

    fn close(&self) {
        self.state.lock().open = false;
    }
}

#[derive(Default)]
struct StreamState {
    pending: BytesMut,
    open: bool,
    finished: bool,
    failed: Option<String>,
    notifier: Option<ReadyNotifier>,
}

/// Sequential source fed incrementally by the handler.
#[derive(Default)]
pub struct StreamSource {
    state: Mutex<StreamState>,
}

impl StreamSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes; ignored after `finish` or `fail`.
    pub fn push(&self, chunk: &[u8]) {
        let notifier = {
            let mut state = self.state.lock();
            if state.finished || state.failed.is_some() {
                return;
            }
            state.pending.extend_from_slice(chunk);
            state.notifier.clone()
        };
        notify(notifier);
    }

    pub fn finish(&self) {
        let notifier = {
            let mut state = self.state.lock();
            state.finished = true;
            state.notifier.clone()
        };
        notify(notifier);
    }

    /// Makes the next read report an I/O error.
    pub fn fail(&self, reason: &str) {
        let notifier = {
            let mut state = self.state.lock();
            state.failed = Some(reason.to_owned());
            state.notifier.clone()
        };
        notify(notifier);
    }

    pub fn buffered_len(&self) -> usize {
        self.state.lock().pending.len()
    }
}

fn notify(notifier: Option<ReadyNotifier>) {
    if let Some(notifier) = notifier {
        notifier();
    }
}

impl DataSource for StreamSource {
    fn open(&self) -> io::Result<()> {
        self.state.lock().open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn is_readable(&self) -> bool {
        self.state.lock().open
    }

    fn is_sequential(&self) -> bool {
        true
    }

    fn size(&self) -> Option<u64> {
        None
    }

    fn seek(&self, _position: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stream sources cannot seek",
        ))
    }

    fn read(&self, out: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.failed {
            return Err(io::Error::other(reason.clone()));
        }
        if !state.open {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream source is closed",
            ));
        }

        let count = out.len().min(state.pending.len());
        out[..count].copy_from_slice(&state.pending[..count]);
        state.pending.advance(count);
        Ok(count)
    }

    fn at_end(&self) -> bool {
        let state = self.state.lock();
        state.finished && state.pending.is_empty()
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.open = false;
        state.notifier = None;
    }

    fn set_ready_notifier(&self, notifier: Option<ReadyNotifier>) {
        self.state.lock().notifier = notifier;
    }
}

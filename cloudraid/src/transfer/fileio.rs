//! Positional file access with optional asynchronous contexts.
//!
//! The slot writes each finished piece either synchronously (briefly
//! blocking its tick) or through an [`AsyncIoContext`] it polls on later
//! ticks. Implementations without real asynchronous I/O get the default
//! methods, which perform the operation immediately and hand back an
//! already-completed context.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// Local file operation failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("file {op} of {len} bytes at {pos} failed: {message}")]
pub struct FileIoError {
    pub op: &'static str,
    pub pos: u64,
    pub len: usize,
    pub message: String,
    /// The condition is transient; the operation may be retried.
    pub retry: bool,
}

impl FileIoError {
    pub fn from_io(op: &'static str, pos: u64, len: usize, error: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let retry = matches!(
            error.kind(),
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
        );
        Self {
            op,
            pos,
            len,
            message: error.to_string(),
            retry,
        }
    }
}

type IoOutcome = Result<Option<Bytes>, FileIoError>;

/// An outstanding asynchronous read or write.
#[derive(Debug)]
pub struct AsyncIoContext {
    pos: u64,
    len: usize,
    rx: Option<oneshot::Receiver<IoOutcome>>,
    outcome: Option<IoOutcome>,
}

/// Completion side of an [`AsyncIoContext`].
#[derive(Debug)]
pub struct AsyncIoCompleter {
    tx: oneshot::Sender<IoOutcome>,
}

impl AsyncIoCompleter {
    /// Report the result. Read data is `Some`, writes report `None`.
    pub fn complete(self, outcome: Result<Option<Bytes>, FileIoError>) {
        let _ = self.tx.send(outcome);
    }
}

impl AsyncIoContext {
    /// A pending context and the handle that completes it.
    pub fn channel(pos: u64, len: usize) -> (AsyncIoCompleter, Self) {
        let (tx, rx) = oneshot::channel();
        let ctx = Self {
            pos,
            len,
            rx: Some(rx),
            outcome: None,
        };
        (AsyncIoCompleter { tx }, ctx)
    }

    /// An already-finished context.
    pub fn ready(pos: u64, len: usize, outcome: Result<Option<Bytes>, FileIoError>) -> Self {
        Self {
            pos,
            len,
            rx: None,
            outcome: Some(outcome),
        }
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Non-blocking check; `true` once the outcome is available.
    pub fn poll(&mut self) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        let Some(rx) = self.rx.as_mut() else {
            return false;
        };
        match rx.try_recv() {
            Ok(outcome) => {
                self.outcome = Some(outcome);
                self.rx = None;
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.outcome = Some(Err(self.abandoned()));
                self.rx = None;
                true
            }
        }
    }

    /// Take the outcome of a finished context. `None` while still pending.
    pub fn take_outcome(&mut self) -> Option<Result<Option<Bytes>, FileIoError>> {
        if self.poll() {
            self.outcome.take()
        } else {
            None
        }
    }

    /// Wait for the outcome. Must not be called from inside an async runtime.
    pub fn finish(mut self) -> Result<Option<Bytes>, FileIoError> {
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        match self.rx.take() {
            Some(rx) => rx.blocking_recv().unwrap_or_else(|_| Err(self.abandoned())),
            None => Err(self.abandoned()),
        }
    }

    fn abandoned(&self) -> FileIoError {
        FileIoError {
            op: "async",
            pos: self.pos,
            len: self.len,
            message: "operation abandoned".to_string(),
            retry: true,
        }
    }
}

/// File access used by a transfer slot.
pub trait FileAccess: Send {
    /// Whether `async_write`/`async_read` return genuinely pending contexts.
    fn async_available(&self) -> bool {
        false
    }

    fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<(), FileIoError>;

    fn read_at(&mut self, pos: u64, len: usize) -> Result<Vec<u8>, FileIoError>;

    fn async_write(&mut self, pos: u64, data: Bytes) -> AsyncIoContext {
        let len = data.len();
        AsyncIoContext::ready(pos, len, self.write_at(pos, &data).map(|_| None))
    }

    fn async_read(&mut self, pos: u64, len: usize) -> AsyncIoContext {
        AsyncIoContext::ready(pos, len, self.read_at(pos, len).map(|d| Some(Bytes::from(d))))
    }
}

// =============================================================================
// Local files
// =============================================================================

/// A local file, optionally with asynchronous I/O on a tokio blocking pool.
#[derive(Debug, Clone)]
pub struct LocalFile {
    file: Arc<Mutex<File>>,
    runtime: Option<Handle>,
}

impl LocalFile {
    /// Open (creating if needed) a download destination.
    pub fn create(path: &Path) -> Result<Self, FileIoError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| FileIoError::from_io("open", 0, 0, &e))?;
        Ok(Self::from_file(file))
    }

    /// Open an upload source.
    pub fn open(path: &Path) -> Result<Self, FileIoError> {
        let file = File::open(path).map_err(|e| FileIoError::from_io("open", 0, 0, &e))?;
        Ok(Self::from_file(file))
    }

    pub fn from_file(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
            runtime: None,
        }
    }

    /// Run asynchronous operations on this runtime's blocking pool.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn len(&self) -> Result<u64, FileIoError> {
        self.file
            .lock()
            .metadata()
            .map(|m| m.len())
            .map_err(|e| FileIoError::from_io("stat", 0, 0, &e))
    }

    pub fn is_empty(&self) -> Result<bool, FileIoError> {
        self.len().map(|len| len == 0)
    }
}

fn write_locked(file: &Mutex<File>, pos: u64, data: &[u8]) -> Result<(), FileIoError> {
    let mut file = file.lock();
    file.seek(SeekFrom::Start(pos))
        .and_then(|_| file.write_all(data))
        .map_err(|e| FileIoError::from_io("write", pos, data.len(), &e))
}

fn read_locked(file: &Mutex<File>, pos: u64, len: usize) -> Result<Vec<u8>, FileIoError> {
    let mut file = file.lock();
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(pos))
        .and_then(|_| file.read_exact(&mut buf))
        .map_err(|e| FileIoError::from_io("read", pos, len, &e))?;
    Ok(buf)
}

impl FileAccess for LocalFile {
    fn async_available(&self) -> bool {
        self.runtime.is_some()
    }

    fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<(), FileIoError> {
        write_locked(&self.file, pos, data)
    }

    fn read_at(&mut self, pos: u64, len: usize) -> Result<Vec<u8>, FileIoError> {
        read_locked(&self.file, pos, len)
    }

    fn async_write(&mut self, pos: u64, data: Bytes) -> AsyncIoContext {
        let Some(runtime) = self.runtime.as_ref() else {
            let len = data.len();
            return AsyncIoContext::ready(pos, len, self.write_at(pos, &data).map(|_| None));
        };
        let (done, ctx) = AsyncIoContext::channel(pos, data.len());
        let file = Arc::clone(&self.file);
        runtime.spawn_blocking(move || done.complete(write_locked(&file, pos, &data).map(|_| None)));
        ctx
    }

    fn async_read(&mut self, pos: u64, len: usize) -> AsyncIoContext {
        let Some(runtime) = self.runtime.as_ref() else {
            return AsyncIoContext::ready(pos, len, self.read_at(pos, len).map(|d| Some(Bytes::from(d))));
        };
        let (done, ctx) = AsyncIoContext::channel(pos, len);
        let file = Arc::clone(&self.file);
        runtime.spawn_blocking(move || {
            done.complete(read_locked(&file, pos, len).map(|d| Some(Bytes::from(d))))
        });
        ctx
    }
}

// =============================================================================
// In-memory files
// =============================================================================

/// How a [`MemoryFile`] handles asynchronous operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryAsyncMode {
    /// No asynchronous support; the slot writes synchronously.
    #[default]
    Unavailable,
    /// Asynchronous operations complete immediately.
    Immediate,
    /// Asynchronous writes never complete.
    StallWrites,
}

/// Shared in-memory file; clones see the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryFile {
    data: Arc<Mutex<Vec<u8>>>,
    mode: MemoryAsyncMode,
    stalled: Arc<Mutex<Vec<AsyncIoCompleter>>>,
    writes: Arc<Mutex<Vec<(u64, usize)>>>,
}

impl MemoryFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
            ..Self::default()
        }
    }

    pub fn with_async_mode(mut self, mode: MemoryAsyncMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Positions and lengths of completed writes, in completion order.
    pub fn writes(&self) -> Vec<(u64, usize)> {
        self.writes.lock().clone()
    }
}

impl FileAccess for MemoryFile {
    fn async_available(&self) -> bool {
        self.mode != MemoryAsyncMode::Unavailable
    }

    fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<(), FileIoError> {
        let start = pos as usize;
        let end = start + data.len();
        let mut contents = self.data.lock();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[start..end].copy_from_slice(data);
        self.writes.lock().push((pos, data.len()));
        Ok(())
    }

    fn read_at(&mut self, pos: u64, len: usize) -> Result<Vec<u8>, FileIoError> {
        let contents = self.data.lock();
        let start = pos as usize;
        contents
            .get(start..start + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| FileIoError {
                op: "read",
                pos,
                len,
                message: "read beyond end of file".to_string(),
                retry: false,
            })
    }

    fn async_write(&mut self, pos: u64, data: Bytes) -> AsyncIoContext {
        if self.mode == MemoryAsyncMode::StallWrites {
            let (done, ctx) = AsyncIoContext::channel(pos, data.len());
            self.stalled.lock().push(done);
            return ctx;
        }
        let len = data.len();
        AsyncIoContext::ready(pos, len, self.write_at(pos, &data).map(|_| None))
    }
}

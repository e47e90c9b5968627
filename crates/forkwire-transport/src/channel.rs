use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::stream::ForkStream;

/// Default buffer capacity for [`BufferedChannel`].
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// A writable channel with a fixed-capacity write buffer.
///
/// [`write`](Self::write) sends immediately (pushing out anything buffered
/// first). [`write_buffered`](Self::write_buffered) accumulates bytes and only
/// touches the sink when the buffer would overflow; each such overflow bumps
/// a monotonic counter the periodic flusher watches.
///
/// The channel is `Sync`: every write takes the same lock, so bytes from
/// concurrent writers never interleave within one call.
pub struct BufferedChannel<W> {
    state: Mutex<WriteState<W>>,
    overflows: AtomicU64,
    open: AtomicBool,
    writable: bool,
    capacity: usize,
}

struct WriteState<W> {
    sink: Option<W>,
    buf: BytesMut,
}

impl<W: Write> BufferedChannel<W> {
    pub fn new(sink: W) -> Self {
        Self::with_capacity(sink, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(sink: W, capacity: usize) -> Self {
        Self::build(sink, capacity, true)
    }

    fn build(sink: W, capacity: usize, writable: bool) -> Self {
        Self {
            state: Mutex::new(WriteState {
                sink: Some(sink),
                buf: BytesMut::with_capacity(capacity),
            }),
            overflows: AtomicU64::new(0),
            open: AtomicBool::new(true),
            writable,
            capacity,
        }
    }

    /// Write `data` after any buffered bytes, then flush.
    ///
    /// An empty `data` just flushes what is buffered.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut state = self.lock_open()?;
        let WriteState { sink, buf } = &mut *state;
        let sink = sink.as_mut().ok_or(TransportError::ChannelClosed)?;

        if !buf.is_empty() {
            write_fully(sink, buf)?;
            buf.clear();
        }
        write_fully(sink, data)?;
        flush_fully(sink)
    }

    /// Append `data` to the buffer, writing through only on overflow.
    pub fn write_buffered(&self, data: &[u8]) -> Result<()> {
        let mut state = self.lock_open()?;
        let WriteState { sink, buf } = &mut *state;
        // Closed between the open check and taking the lock.
        let sink = sink.as_mut().ok_or(TransportError::ChannelClosed)?;

        if buf.len() + data.len() <= self.capacity {
            buf.extend_from_slice(data);
            return Ok(());
        }

        let pending = std::mem::take(buf);
        self.overflows.fetch_add(1, Ordering::AcqRel);
        write_fully(sink, &pending)?;
        write_fully(sink, data)?;
        flush_fully(sink)?;

        // Reuse the allocation.
        *buf = pending;
        buf.clear();
        Ok(())
    }

    /// Number of buffered writes that did not fit and forced an early flush.
    pub fn count_buffer_overflows(&self) -> u64 {
        self.overflows.load(Ordering::Acquire)
    }

    /// Bytes currently held in the buffer.
    pub fn buffered_len(&self) -> usize {
        self.lock_state().buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Close the channel, pushing out buffered bytes best-effort.
    ///
    /// Closing twice is a no-op. The sink is dropped.
    pub fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let mut state = self.lock_state();
        let WriteState { sink, buf } = &mut *state;
        let Some(mut sink) = sink.take() else {
            return Ok(());
        };
        if !self.writable {
            return Ok(());
        }

        let result = if buf.is_empty() {
            flush_fully(&mut sink)
        } else {
            write_fully(&mut sink, buf).and_then(|()| flush_fully(&mut sink))
        };
        buf.clear();
        if let Err(e) = &result {
            debug!(error = %e, "flush on close failed");
        }
        result
    }

    fn lock_state(&self) -> MutexGuard<'_, WriteState<W>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, WriteState<W>>> {
        if !self.writable {
            return Err(TransportError::NotWritable);
        }
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        Ok(self.lock_state())
    }
}

impl BufferedChannel<ForkStream> {
    /// Wrap a fork stream. A read-only stream yields a channel whose writes
    /// fail with [`TransportError::NotWritable`].
    pub fn from_stream(stream: ForkStream, capacity: usize) -> Self {
        let writable = stream.is_writable();
        Self::build(stream, capacity, writable)
    }
}

impl<W> std::fmt::Debug for BufferedChannel<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedChannel")
            .field("capacity", &self.capacity)
            .field("overflows", &self.overflows.load(Ordering::Relaxed))
            .field("open", &self.open.load(Ordering::Relaxed))
            .field("writable", &self.writable)
            .finish()
    }
}

/// A readable channel with an open flag.
///
/// Implements [`Read`]; channel errors surface as `io::Error`s wrapping a
/// [`TransportError`] (see [`TransportError::from_io`]).
pub struct ReadChannel<R> {
    inner: R,
    open: bool,
    readable: bool,
}

impl<R: Read> ReadChannel<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            open: true,
            readable: true,
        }
    }

    /// Read whatever is available into `buf`. `Ok(0)` means end of stream.
    pub fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.readable {
            return Err(TransportError::NotReadable);
        }
        if !self.open {
            return Err(TransportError::ChannelClosed);
        }
        Ok(self.inner.read(buf)?)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Closing twice is a no-op.
    pub fn close(&mut self) {
        self.open = false;
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }
}

impl ReadChannel<ForkStream> {
    /// Wrap a fork stream. A write-only stream yields a channel whose reads
    /// fail with [`TransportError::NotReadable`].
    pub fn from_stream(stream: ForkStream) -> Self {
        let readable = stream.is_readable();
        Self {
            inner: stream,
            open: true,
            readable,
        }
    }
}

impl<R: Read> Read for ReadChannel<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_some(buf).map_err(|err| match err {
            TransportError::Io(io) => io,
            other => other.into(),
        })
    }
}

impl<R> std::fmt::Debug for ReadChannel<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadChannel")
            .field("open", &self.open)
            .field("readable", &self.readable)
            .finish()
    }
}

fn write_fully<W: Write>(sink: &mut W, data: &[u8]) -> Result<()> {
    let mut offset = 0usize;
    while offset < data.len() {
        match sink.write(&data[offset..]) {
            Ok(0) => return Err(TransportError::Io(ErrorKind::WriteZero.into())),
            Ok(n) => offset += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            // An expired socket write timeout surfaces as WouldBlock.
            Err(err) => return Err(TransportError::Io(err)),
        }
    }
    Ok(())
}

fn flush_fully<W: Write>(sink: &mut W) -> Result<()> {
    loop {
        match sink.flush() {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransportError::Io(err)),
        }
    }
}

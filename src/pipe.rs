// src/pipe.rs
//
// Byte streaming primitives.
//
// `ByteSource` is the pull side (`next_chunk` until `None`), `ByteSink` the
// push side. `DuplexPipe` bridges the two through a bounded channel so that a
// producer thread can `write` while a consumer `read`s at its own pace; built
// with `DuplexPipe::from_source` it is a plain pass-through over another
// source. Once a pipe is closed or exhausted it stays that way.

use bytes::{Bytes, BytesMut};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crate::constants::{DEFAULT_PIPE_CAPACITY, DEFAULT_STREAM_CHUNK_SIZE, PIPE_POLL_INTERVAL};
use crate::error::{Result, StorageError};

/// Pull-style byte producer.
pub trait ByteSource: Send {
    /// Next chunk, or `None` once the source is exhausted.
    fn next_chunk(&mut self) -> Result<Option<Bytes>>;

    /// Go back to where the source started. Sources that cannot seek refuse.
    fn rewind(&mut self) -> Result<()> {
        Err(StorageError::Unsupported("stream cannot be rewound".into()))
    }

    /// Bytes left before exhaustion, when cheaply known.
    fn remaining_len(&mut self) -> Option<u64> {
        None
    }
}

/// Push-style byte consumer.
pub trait ByteSink: Send {
    fn write_chunk(&mut self, chunk: Bytes) -> Result<()>;

    /// No more chunks will follow.
    fn close(&mut self) -> Result<()>;
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        (**self).next_chunk()
    }

    fn rewind(&mut self) -> Result<()> {
        (**self).rewind()
    }

    fn remaining_len(&mut self) -> Option<u64> {
        (**self).remaining_len()
    }
}

/// Drain a source into one buffer.
pub fn read_to_end(source: &mut dyn ByteSource) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = source.next_chunk()? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Copy a source into a sink chunk by chunk, closing the sink at the end.
/// Returns the number of bytes copied.
pub fn copy(source: &mut dyn ByteSource, sink: &mut dyn ByteSink) -> Result<u64> {
    let mut total = 0u64;
    while let Some(chunk) = source.next_chunk()? {
        total += chunk.len() as u64;
        sink.write_chunk(chunk)?;
    }
    sink.close()?;
    Ok(total)
}

// -----------------------------------------------------------------------------
// DuplexPipe
// -----------------------------------------------------------------------------

struct ReadState {
    rx: Receiver<Bytes>,
    leftover: Option<Bytes>,
    source: Option<Box<dyn ByteSource>>,
}

struct Inner {
    tx: SyncSender<Bytes>,
    state: Mutex<ReadState>,
    closed: AtomicBool,
    passthrough: AtomicBool,
    failure: Mutex<Option<StorageError>>,
}

/// Bounded in-memory byte channel. Clones share the same buffer, so one clone
/// can be handed to a producer thread and another kept for reading.
#[derive(Clone)]
pub struct DuplexPipe {
    inner: Arc<Inner>,
}

impl Default for DuplexPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl DuplexPipe {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PIPE_CAPACITY)
    }

    /// Pipe that buffers at most `capacity` chunks before `write` blocks.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                tx,
                state: Mutex::new(ReadState { rx, leftover: None, source: None }),
                closed: AtomicBool::new(false),
                passthrough: AtomicBool::new(false),
                failure: Mutex::new(None),
            }),
        }
    }

    /// Pass-through adapter over a pull source, with the pipe's read contract.
    pub fn from_source(source: Box<dyn ByteSource>) -> Self {
        let pipe = Self::with_capacity(1);
        pipe.lock_state().source = Some(source);
        pipe.inner.passthrough.store(true, Ordering::Release);
        pipe
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ReadState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Mark the end of the data. Blocked writers fail, readers drain what is
    /// buffered and then see end-of-stream.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Close the pipe because the producer failed. Readers drain what is
    /// buffered and then get `err` itself instead of end-of-stream, so a
    /// connectivity failure keeps its class across the pipe.
    pub fn fail(&self, err: StorageError) {
        *self.inner.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
        self.close();
    }

    fn end_of_stream(&self) -> Result<Option<Bytes>> {
        match self.inner.failure.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }

    /// Queue one chunk, blocking while the buffer is full.
    pub fn write(&self, chunk: Bytes) -> Result<()> {
        if self.inner.passthrough.load(Ordering::Acquire) {
            return Err(StorageError::Usage("cannot write into a pass-through pipe".into()));
        }
        let mut pending = chunk;
        loop {
            if self.is_closed() {
                return Err(StorageError::transfer("write to a closed pipe"));
            }
            match self.inner.tx.try_send(pending) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    pending = back;
                    thread::sleep(PIPE_POLL_INTERVAL);
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(StorageError::transfer("pipe reader is gone"));
                }
            }
        }
    }

    fn next_locked(&self, state: &mut ReadState) -> Result<Option<Bytes>> {
        if let Some(leftover) = state.leftover.take() {
            return Ok(Some(leftover));
        }
        if let Some(source) = state.source.as_mut() {
            let next = source.next_chunk()?;
            if next.is_none() {
                self.close();
            }
            return Ok(next);
        }
        loop {
            match state.rx.recv_timeout(PIPE_POLL_INTERVAL) {
                Ok(chunk) => return Ok(Some(chunk)),
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_closed() {
                        // writes racing with close may still be queued
                        return match state.rx.try_recv() {
                            Ok(chunk) => Ok(Some(chunk)),
                            Err(_) => self.end_of_stream(),
                        };
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return self.end_of_stream(),
            }
        }
    }

    /// Read up to `size` bytes (everything when `None`), blocking until that
    /// much is buffered or the pipe ends. An empty result means end of stream.
    pub fn read(&self, size: Option<usize>) -> Result<Bytes> {
        let mut state = self.lock_state();
        let mut buf = BytesMut::new();
        while size.is_none_or(|n| buf.len() < n) {
            match self.next_locked(&mut state)? {
                Some(chunk) => buf.extend_from_slice(&chunk),
                None => break,
            }
        }
        if let Some(n) = size {
            if buf.len() > n {
                state.leftover = Some(buf.split_off(n).freeze());
            }
        }
        Ok(buf.freeze())
    }

    /// Reading handle that closes the pipe when dropped, so an abandoned
    /// consumer unblocks the producer.
    pub fn reader(&self) -> PipeReader {
        PipeReader { pipe: self.clone() }
    }
}

impl ByteSource for DuplexPipe {
    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let mut state = self.lock_state();
        self.next_locked(&mut state)
    }
}

impl ByteSink for DuplexPipe {
    fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.write(chunk)
    }

    fn close(&mut self) -> Result<()> {
        DuplexPipe::close(self);
        Ok(())
    }
}

/// Consumer end of a `DuplexPipe`.
pub struct PipeReader {
    pipe: DuplexPipe,
}

impl PipeReader {
    pub fn read(&self, size: Option<usize>) -> Result<Bytes> {
        self.pipe.read(size)
    }
}

impl ByteSource for PipeReader {
    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.pipe.next_chunk()
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self
            .pipe
            .read(Some(buf.len()))
            .map_err(|e| io::Error::other(e.to_string()))?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.pipe.close();
    }
}

// -----------------------------------------------------------------------------
// Adapters
// -----------------------------------------------------------------------------

/// Seekable reader as a rewindable source. `rewind` returns to the position
/// the reader had when it was wrapped, not to offset zero.
pub struct ReaderSource<R> {
    reader: R,
    start: u64,
    chunk_size: usize,
}

impl<R: Read + Seek + Send> ReaderSource<R> {
    pub fn new(reader: R) -> Result<Self> {
        Self::with_chunk_size(reader, DEFAULT_STREAM_CHUNK_SIZE)
    }

    pub fn with_chunk_size(mut reader: R, chunk_size: usize) -> Result<Self> {
        let start = reader.stream_position()?;
        Ok(Self { reader, start, chunk_size: chunk_size.max(1) })
    }

    /// Offset `rewind` goes back to.
    pub fn start_offset(&self) -> u64 {
        self.start
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.reader.stream_position()?)
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl ReaderSource<io::Cursor<Bytes>> {
    /// In-memory source over `data`.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self {
            reader: io::Cursor::new(data.into()),
            start: 0,
            chunk_size: DEFAULT_STREAM_CHUNK_SIZE,
        }
    }
}

impl<R: Read + Seek + Send> ByteSource for ReaderSource<R> {
    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(Bytes::from(buf)))
    }

    fn rewind(&mut self) -> Result<()> {
        self.reader.seek(SeekFrom::Start(self.start))?;
        Ok(())
    }

    fn remaining_len(&mut self) -> Option<u64> {
        let pos = self.reader.stream_position().ok()?;
        let end = self.reader.seek(SeekFrom::End(0)).ok()?;
        self.reader.seek(SeekFrom::Start(pos)).ok()?;
        Some(end.saturating_sub(pos))
    }
}

/// Iterator of chunks as a (non-rewindable) source.
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Result<Bytes>> + Send,
{
    pub fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl<I> ByteSource for IterSource<I>
where
    I: Iterator<Item = Result<Bytes>> + Send,
{
    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.iter.next().transpose()
    }
}

/// Lazy, forward-only chunk sequence over a source.
pub struct Chunks {
    source: Box<dyn ByteSource>,
    done: bool,
}

impl Chunks {
    pub fn new(source: Box<dyn ByteSource>) -> Self {
        Self { source, done: false }
    }

    pub fn into_inner(self) -> Box<dyn ByteSource> {
        self.source
    }
}

impl Iterator for Chunks {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.source.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Any `Write` as a sink; `close` flushes.
pub struct WriterSink<W> {
    writer: W,
    written: u64,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> ByteSink for WriterSink<W> {
    fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.writer.write_all(&chunk)?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_read_coalesces_and_keeps_leftover() {
        let pipe = DuplexPipe::new();
        pipe.write(Bytes::from_static(b"abc")).unwrap();
        pipe.write(Bytes::from_static(b"defg")).unwrap();
        pipe.close();

        assert_eq!(&pipe.read(Some(5)).unwrap()[..], b"abcde");
        assert_eq!(&pipe.read(Some(5)).unwrap()[..], b"fg");
        assert!(pipe.read(Some(5)).unwrap().is_empty());
    }

    #[test]
    fn test_read_all() {
        let pipe = DuplexPipe::new();
        pipe.write(Bytes::from_static(b"hello ")).unwrap();
        pipe.write(Bytes::from_static(b"world")).unwrap();
        pipe.close();
        assert_eq!(&pipe.read(None).unwrap()[..], b"hello world");
    }

    #[test]
    fn test_write_blocks_until_capacity() {
        let pipe = DuplexPipe::with_capacity(1);
        let writer = pipe.clone();
        let producer = thread::spawn(move || {
            for i in 0..4u8 {
                writer.write(Bytes::from(vec![i; 2])).unwrap();
            }
            writer.close();
        });

        thread::sleep(Duration::from_millis(50));
        let data = pipe.read(None).unwrap();
        producer.join().unwrap();
        assert_eq!(&data[..], &[0, 0, 1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn test_close_wakes_blocked_reader() {
        let pipe = DuplexPipe::new();
        let closer = pipe.clone();
        let start = Instant::now();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            closer.close();
        });
        assert!(pipe.read(Some(10)).unwrap().is_empty());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_write_after_close_fails() {
        let pipe = DuplexPipe::new();
        pipe.close();
        assert!(pipe.write(Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_dropped_reader_unblocks_writer() {
        let pipe = DuplexPipe::with_capacity(1);
        let reader = pipe.reader();
        pipe.write(Bytes::from_static(b"1")).unwrap();
        drop(reader);
        // buffer is full and the reader is gone: the write must fail, not hang
        assert!(pipe.write(Bytes::from_static(b"2")).is_err());
    }

    #[test]
    fn test_passthrough_mode() {
        let chunks = vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))];
        let pipe = DuplexPipe::from_source(Box::new(IterSource::new(chunks.into_iter())));
        assert_eq!(&pipe.read(Some(3)).unwrap()[..], b"abc");
        assert_eq!(&pipe.read(Some(3)).unwrap()[..], b"d");
        assert!(pipe.read(None).unwrap().is_empty());
        assert!(pipe.is_closed());
        assert!(pipe.write(Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_reader_source_rewinds_to_start_offset() {
        let mut cursor = io::Cursor::new(b"0123456789".to_vec());
        cursor.seek(SeekFrom::Start(3)).unwrap();
        let mut source = ReaderSource::with_chunk_size(cursor, 4).unwrap();
        assert_eq!(source.start_offset(), 3);
        assert_eq!(source.remaining_len(), Some(7));
        assert_eq!(&source.next_chunk().unwrap().unwrap()[..], b"3456");
        source.rewind().unwrap();
        assert_eq!(source.position().unwrap(), 3);
        assert_eq!(&read_to_end(&mut source).unwrap()[..], b"3456789");
    }

    #[test]
    fn test_chunks_iterator() {
        let source = ReaderSource::with_chunk_size(io::Cursor::new(vec![7u8; 10]), 4).unwrap();
        let sizes: Vec<usize> = Chunks::new(Box::new(source)).map(|c| c.unwrap().len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_copy_into_writer_sink() {
        let mut source = ReaderSource::from_bytes(&b"payload"[..]);
        let mut sink = WriterSink::new(Vec::new());
        assert_eq!(copy(&mut source, &mut sink).unwrap(), 7);
        assert_eq!(sink.into_inner(), b"payload");
    }

    #[test]
    fn test_io_read_impl() {
        let pipe = DuplexPipe::new();
        pipe.write(Bytes::from_static(b"stream")).unwrap();
        pipe.close();
        let mut out = String::new();
        pipe.reader().read_to_string(&mut out).unwrap();
        assert_eq!(out, "stream");
    }

    #[test]
    fn test_failed_producer_surfaces_error_after_drain() {
        let pipe = DuplexPipe::new();
        pipe.write(Bytes::from_static(b"part")).unwrap();
        pipe.fail(StorageError::transfer("connection reset"));
        let mut reader = pipe.reader();
        assert_eq!(&reader.next_chunk().unwrap().unwrap()[..], b"part");
        let err = reader.next_chunk().unwrap_err();
        assert!(matches!(err, StorageError::Transfer(_)));
    }

    #[test]
    fn test_failed_producer_keeps_connectivity_class() {
        let pipe = DuplexPipe::new();
        pipe.fail(StorageError::Download("connection timed out".into()));
        let mut reader = pipe.reader();
        let err = reader.next_chunk().unwrap_err();
        assert!(err.is_download_error(), "{err:?}");
        assert!(err.to_string().contains("connection timed out"));
    }
}

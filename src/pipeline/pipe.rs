//! Synchronous single-producer/single-consumer byte pipe
//!
//! A write hands at most `capacity` bytes to the reader and completes only
//! once the reader has consumed all of them, so a slow reader throttles its
//! writer and memory per pipe stays bounded regardless of the payload size.
//! A pending write must be polled again with the same buffer.
//!
//! Closing the write end (shutdown or drop) delivers end-of-stream. Dropping
//! the read end makes pending and future writes fail with `BrokenPipe`.
//! [`PipeHandle::abort`] fails both ends with `ConnectionAborted`.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Default number of bytes a pipe holds in flight
pub const DEFAULT_PIPE_CAPACITY: usize = 32 * 1024;

/// Create a pipe with the default capacity
pub fn pipe() -> (PipeReader, PipeWriter) {
    pipe_with_capacity(DEFAULT_PIPE_CAPACITY)
}

/// Create a pipe holding at most `capacity` bytes in flight
///
/// A zero capacity is treated as one byte.
pub fn pipe_with_capacity(capacity: usize) -> (PipeReader, PipeWriter) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            chunk: Vec::with_capacity(capacity.max(1)),
            pos: 0,
            in_flight: None,
            capacity: capacity.max(1),
            writer_closed: false,
            reader_closed: false,
            discarding: false,
            aborted: false,
            read_waker: None,
            write_waker: None,
        }),
    });
    (
        PipeReader {
            shared: shared.clone(),
        },
        PipeWriter { shared },
    )
}

struct Shared {
    state: Mutex<State>,
}

struct State {
    chunk: Vec<u8>,
    pos: usize,
    // Length the parked writer reports once the reader drains the chunk
    in_flight: Option<usize>,
    capacity: usize,
    writer_closed: bool,
    reader_closed: bool,
    discarding: bool,
    aborted: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl State {
    fn pending(&self) -> usize {
        self.chunk.len() - self.pos
    }

    fn clear_chunk(&mut self) {
        self.chunk.clear();
        self.pos = 0;
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

impl Shared {
    // Critical sections never panic, so a poisoned lock still holds a
    // consistent state
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn aborted_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "pipe aborted")
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe read end closed")
}

/// Read end of a pipe
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Handle for closing or aborting this pipe from outside the reader
    pub fn handle(&self) -> PipeHandle {
        PipeHandle {
            shared: self.shared.clone(),
        }
    }

    /// Close the read end; pending and future writes fail
    pub fn close(&mut self) {
        let mut state = self.shared.lock();
        state.reader_closed = true;
        state.clear_chunk();
        state.wake_writer();
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.shared.lock();
        if state.aborted {
            return Poll::Ready(Err(aborted_error()));
        }
        if state.reader_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "pipe read end closed",
            )));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if state.pending() > 0 {
            let n = state.pending().min(buf.remaining());
            let start = state.pos;
            buf.put_slice(&state.chunk[start..start + n]);
            state.pos += n;
            if state.pending() == 0 {
                state.clear_chunk();
                state.wake_writer();
            }
            return Poll::Ready(Ok(()));
        }
        if state.writer_closed {
            // End of stream
            return Poll::Ready(Ok(()));
        }
        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Write end of a pipe
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Handle for closing or aborting this pipe from outside the writer
    pub fn handle(&self) -> PipeHandle {
        PipeHandle {
            shared: self.shared.clone(),
        }
    }

    /// Close the write end; the reader sees end-of-stream after the pending
    /// chunk. Closing twice is a no-op.
    pub fn close(&mut self) {
        let mut state = self.shared.lock();
        state.writer_closed = true;
        state.wake_reader();
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.shared.lock();
        if state.aborted {
            state.in_flight = None;
            return Poll::Ready(Err(aborted_error()));
        }
        if state.discarding {
            let n = state.in_flight.take().unwrap_or(buf.len());
            return Poll::Ready(Ok(n));
        }
        if state.reader_closed {
            state.in_flight = None;
            return Poll::Ready(Err(broken_pipe()));
        }
        if let Some(n) = state.in_flight {
            if state.pending() == 0 {
                state.in_flight = None;
                return Poll::Ready(Ok(n));
            }
            state.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        if state.writer_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe write end closed",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(state.capacity);
        state.clear_chunk();
        state.chunk.extend_from_slice(&buf[..n]);
        state.in_flight = Some(n);
        state.wake_reader();
        state.write_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Completed writes have already been consumed
        let state = self.shared.lock();
        if state.aborted {
            return Poll::Ready(Err(aborted_error()));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Out-of-band control over a pipe, usable while both ends are owned
/// elsewhere
#[derive(Clone)]
pub struct PipeHandle {
    shared: Arc<Shared>,
}

impl PipeHandle {
    /// Fail every pending and future read and write on the pipe
    pub fn abort(&self) {
        let mut state = self.shared.lock();
        state.aborted = true;
        state.clear_chunk();
        state.wake_reader();
        state.wake_writer();
    }

    /// Drop unread bytes and accept all future writes without delivering them
    ///
    /// Used when the reader has stopped consuming but the writer should still
    /// run to completion.
    pub fn discard(&self) {
        let mut state = self.shared.lock();
        state.discarding = true;
        state.clear_chunk();
        state.wake_writer();
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.lock().aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bytes_arrive_in_order_then_eof() {
        let (mut reader, mut writer) = pipe_with_capacity(4);

        let producer = tokio::spawn(async move {
            writer.write_all(b"hello pipe").await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        producer.await.unwrap();

        assert_eq!(out, b"hello pipe");
    }

    #[tokio::test]
    async fn test_write_waits_for_reader() {
        let (mut reader, mut writer) = pipe_with_capacity(8);

        let producer = tokio::spawn(async move {
            writer.write_all(b"hello").await.unwrap();
            writer
        });

        // Nobody has read yet, so the write is still parked
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let mut writer = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("write did not complete after the read")
            .unwrap();
        writer.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_read_keeps_writer_parked() {
        let (mut reader, mut writer) = pipe_with_capacity(4);

        let producer = tokio::spawn(async move { writer.write(b"abcd").await });

        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"cd");
        assert_eq!(producer.await.unwrap().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_reads_never_exceed_capacity() {
        let (mut reader, mut writer) = pipe_with_capacity(16);

        tokio::spawn(async move {
            writer.write_all(&vec![7u8; 1000]).await.unwrap();
        });

        let mut buf = vec![0u8; 4096];
        let mut total = 0;
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            assert!(n <= 16);
            total += n;
        }
        assert_eq!(total, 1000);
    }

    #[tokio::test]
    async fn test_dropped_reader_fails_writes() {
        let (reader, mut writer) = pipe_with_capacity(4);

        let pending = tokio::spawn(async move { writer.write_all(b"efgh").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(reader);

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_abort_unblocks_both_ends() {
        let (mut reader, mut writer) = pipe_with_capacity(4);
        let handle = reader.handle();

        let read_task = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            reader.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();

        let err = read_task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(writer.write_all(b"x").await.is_err());
        assert!(handle.is_aborted());
    }

    #[tokio::test]
    async fn test_abort_fails_parked_writer() {
        let (reader, mut writer) = pipe_with_capacity(4);
        let handle = reader.handle();

        let pending = tokio::spawn(async move { writer.write_all(b"abcd").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        drop(reader);
    }

    #[tokio::test]
    async fn test_discard_lets_writer_finish() {
        let (mut reader, mut writer) = pipe_with_capacity(4);
        let handle = reader.handle();

        let mut buf = [0u8; 2];
        let producer = tokio::spawn(async move {
            writer.write_all(&[1u8; 64]).await.unwrap();
        });
        reader.read_exact(&mut buf).await.unwrap();

        handle.discard();
        drop(reader);
        producer.await.unwrap();
    }
}

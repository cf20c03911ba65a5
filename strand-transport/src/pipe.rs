//! In-memory duplex byte pipes with watermark backpressure.
//!
//! Each accepted connection gets one pipe pair: bytes received from the
//! socket flow through the input pipe toward the application, bytes the
//! application writes flow through the output pipe toward the socket. A
//! writer suspends in `flush` once the buffered bytes reach the high
//! watermark and resumes when the reader has advanced below the low
//! watermark. Completion carries an optional [`ConnectionError`] which every
//! read after the buffer drains surfaces.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::sync::Arc;
use std::task::{Poll, Waker};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::ConnectionError;

/// Buffer thresholds for one pipe direction.
#[derive(Debug, Clone, Copy)]
pub struct PipeOptions {
    /// `flush` suspends once this many bytes are buffered.
    pub high_watermark: usize,
    /// A suspended `flush` resumes once the reader drains below this.
    pub low_watermark: usize,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            high_watermark: 64 * 1024,
            low_watermark: 32 * 1024,
        }
    }
}

struct PipeState {
    segments: VecDeque<Bytes>,
    buffered: usize,
    options: PipeOptions,
    /// Writer completion; `Some(None)` is a clean completion.
    write_done: Option<Option<ConnectionError>>,
    /// Reader completion; flushes return completed once the reader is gone.
    read_done: bool,
    read_canceled: bool,
    flush_canceled: bool,
    read_waker: Option<Waker>,
    flush_waker: Option<Waker>,
}

impl PipeState {
    fn snapshot(&self) -> Vec<Bytes> {
        self.segments.iter().cloned().collect()
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_flusher(&mut self) {
        if let Some(waker) = self.flush_waker.take() {
            waker.wake();
        }
    }
}

type Shared = Arc<Mutex<PipeState>>;

/// One read's view of the pipe.
#[derive(Debug)]
pub struct ReadResult {
    segments: Vec<Bytes>,
    is_completed: bool,
    is_canceled: bool,
}

impl ReadResult {
    /// Buffered segments in arrival order. Nothing is consumed until
    /// [`PipeReader::advance`] is called.
    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    /// Total byte count across all segments.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Bytes::is_empty)
    }

    /// True once the writer has completed; the segments, if any, are final.
    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    /// True when a pending read was woken by `cancel_pending_read`.
    pub fn is_canceled(&self) -> bool {
        self.is_canceled
    }

    /// Copies all segments into one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len());
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        out.freeze()
    }
}

/// Result of a writer flush.
#[derive(Debug, Clone, Copy)]
pub struct FlushResult {
    is_completed: bool,
    is_canceled: bool,
}

impl FlushResult {
    /// True once the reader has completed; further writes are pointless.
    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    /// True when the flush was woken by `cancel_pending_flush`.
    pub fn is_canceled(&self) -> bool {
        self.is_canceled
    }
}

/// Reading end of a pipe.
#[derive(Clone)]
pub struct PipeReader {
    shared: Shared,
}

impl PipeReader {
    /// Waits for buffered data, cancellation, or writer completion.
    ///
    /// Buffered segments are always delivered before a completion error is
    /// surfaced; once the buffer has drained, an error completion is returned
    /// by this and every subsequent call.
    pub async fn read(&self) -> Result<ReadResult, ConnectionError> {
        poll_fn(|cx| {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            if state.read_canceled {
                state.read_canceled = false;
                return Poll::Ready(Ok(ReadResult {
                    segments: state.snapshot(),
                    is_completed: state.write_done.is_some(),
                    is_canceled: true,
                }));
            }
            if !state.segments.is_empty() {
                return Poll::Ready(Ok(ReadResult {
                    segments: state.snapshot(),
                    is_completed: state.write_done.is_some(),
                    is_canceled: false,
                }));
            }
            match &state.write_done {
                Some(Some(error)) => Poll::Ready(Err(error.clone())),
                Some(None) => Poll::Ready(Ok(ReadResult {
                    segments: Vec::new(),
                    is_completed: true,
                    is_canceled: false,
                })),
                None => {
                    state.read_waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await
    }

    /// Consumes `count` bytes from the front of the pipe, crediting a
    /// suspended writer once the buffer drains below the low watermark.
    pub fn advance(&self, mut count: usize) {
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        while count > 0 {
            let Some(front) = state.segments.front_mut() else {
                break;
            };
            let front_len = front.len();
            if front_len <= count {
                state.segments.pop_front();
                state.buffered -= front_len;
                count -= front_len;
            } else {
                front.advance(count);
                state.buffered -= count;
                count = 0;
            }
        }
        if state.buffered <= state.options.low_watermark {
            state.wake_flusher();
        }
    }

    /// Wakes a pending read with a canceled result. Affects the current or
    /// next read, once.
    pub fn cancel_pending_read(&self) {
        let mut state = self.shared.lock();
        state.read_canceled = true;
        state.wake_reader();
    }

    /// Marks the reading side done; suspended and future flushes observe a
    /// completed result.
    pub fn complete(&self) {
        let mut state = self.shared.lock();
        state.read_done = true;
        state.wake_flusher();
    }
}

/// Writing end of a pipe.
#[derive(Clone)]
pub struct PipeWriter {
    shared: Shared,
}

impl PipeWriter {
    /// Appends a segment. Backpressure is applied at [`flush`](Self::flush),
    /// not here; writes after either side completed are dropped.
    pub fn write(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let mut state = self.shared.lock();
        if state.read_done || state.write_done.is_some() {
            return;
        }
        state.buffered += data.len();
        state.segments.push_back(data);
        state.wake_reader();
    }

    /// True when the buffered bytes have reached the high watermark and the
    /// next flush would suspend.
    pub fn is_backpressured(&self) -> bool {
        let state = self.shared.lock();
        state.buffered >= state.options.high_watermark
    }

    /// Waits until the reader has drained below the low watermark, the
    /// reader completed, or the flush was canceled.
    pub async fn flush(&self) -> FlushResult {
        poll_fn(|cx| {
            let mut state = self.shared.lock();
            // Cancellation is checked before the watermark credit so a flush
            // racing a cancel never reports the write as acknowledged.
            if state.flush_canceled {
                state.flush_canceled = false;
                return Poll::Ready(FlushResult {
                    is_completed: state.read_done,
                    is_canceled: true,
                });
            }
            if state.read_done {
                return Poll::Ready(FlushResult {
                    is_completed: true,
                    is_canceled: false,
                });
            }
            if state.buffered >= state.options.high_watermark {
                state.flush_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            Poll::Ready(FlushResult {
                is_completed: false,
                is_canceled: false,
            })
        })
        .await
    }

    /// Wakes a suspended flush with a canceled result. Affects the current
    /// or next flush, once.
    pub fn cancel_pending_flush(&self) {
        let mut state = self.shared.lock();
        state.flush_canceled = true;
        state.wake_flusher();
    }

    /// Completes the writing side. All reads after the buffer drains surface
    /// `error`; only the first completion is recorded.
    pub fn complete(&self, error: Option<ConnectionError>) {
        let mut state = self.shared.lock();
        if state.write_done.is_some() {
            return;
        }
        state.write_done = Some(error);
        state.wake_reader();
    }
}

/// Creates a single pipe.
pub fn pipe(options: PipeOptions) -> (PipeReader, PipeWriter) {
    let shared = Arc::new(Mutex::new(PipeState {
        segments: VecDeque::new(),
        buffered: 0,
        options,
        write_done: None,
        read_done: false,
        read_canceled: false,
        flush_canceled: false,
        read_waker: None,
        flush_waker: None,
    }));
    (
        PipeReader {
            shared: shared.clone(),
        },
        PipeWriter { shared },
    )
}

/// One side of a connection pipe pair.
#[derive(Clone)]
pub struct DuplexPipe {
    /// Bytes flowing toward this side.
    pub input: PipeReader,
    /// Bytes flowing away from this side.
    pub output: PipeWriter,
}

/// Creates the transport/application pipe pair for one connection.
///
/// The first element is the application-facing side handed to middleware;
/// the second is the socket-facing side driven by the receive and send
/// loops. `input` sizes the receive path, `output` the send path.
pub fn pair(input: PipeOptions, output: PipeOptions) -> (DuplexPipe, DuplexPipe) {
    let (to_app_reader, to_app_writer) = pipe(input);
    let (to_peer_reader, to_peer_writer) = pipe(output);
    let transport = DuplexPipe {
        input: to_app_reader,
        output: to_peer_writer,
    };
    let application = DuplexPipe {
        input: to_peer_reader,
        output: to_app_writer,
    };
    (transport, application)
}

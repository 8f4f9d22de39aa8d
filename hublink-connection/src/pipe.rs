//! Duplex byte pipes with backpressure and cursor-based consumption.
//!
//! A pipe carries bytes from one [`PipeWriter`] to one [`PipeReader`]. The
//! reader sees everything not yet consumed, then reports how far it got with
//! [`PipeReader::advance_to`]:
//!
//! - `consumed` bytes are released and never returned again;
//! - bytes up to `examined` were inspected, so the next `read` waits until
//!   something beyond them arrives.
//!
//! Writers suspend once the unexamined backlog reaches the pause threshold
//! and resume when the reader examines or consumes it below the resume
//! threshold. Bytes the reader examined but kept (a partial frame) do not
//! hold writers back; bounding those is up to the reader.

use crate::error::PipeError;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Default backlog at which writers suspend (64 KiB).
pub const DEFAULT_PAUSE_WRITER_THRESHOLD: usize = 64 * 1024;

/// Default backlog below which suspended writers resume (32 KiB).
pub const DEFAULT_RESUME_WRITER_THRESHOLD: usize = 32 * 1024;

/// Backpressure thresholds of one pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeOptions {
    /// Unexamined backlog at which writers suspend. Zero disables backpressure.
    pub pause_writer_threshold: usize,
    /// Unexamined backlog below which writers resume. Never above the pause
    /// threshold.
    pub resume_writer_threshold: usize,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            pause_writer_threshold: DEFAULT_PAUSE_WRITER_THRESHOLD,
            resume_writer_threshold: DEFAULT_RESUME_WRITER_THRESHOLD,
        }
    }
}

impl PipeOptions {
    pub fn new(pause_writer_threshold: usize, resume_writer_threshold: usize) -> Self {
        Self {
            pause_writer_threshold,
            resume_writer_threshold: resume_writer_threshold.min(pause_writer_threshold),
        }
    }

    /// Options without backpressure.
    pub fn unbounded() -> Self {
        Self::new(0, 0)
    }

    fn should_pause(&self, buffered: usize) -> bool {
        self.pause_writer_threshold > 0 && buffered >= self.pause_writer_threshold
    }

    fn can_resume(&self, buffered: usize) -> bool {
        self.pause_writer_threshold == 0 || buffered < self.resume_writer_threshold.max(1)
    }
}

/// Outcome of a [`PipeReader::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    /// Every unconsumed byte, oldest first.
    pub buffer: Bytes,
    /// The writer completed; no bytes will follow this buffer.
    pub is_completed: bool,
}

#[derive(Debug, Default)]
struct PipeState {
    /// Unconsumed bytes, frozen once handed to a reader.
    head: Bytes,
    /// Bytes written since `head` was last frozen.
    tail: BytesMut,
    /// Unconsumed bytes the reader already examined.
    examined: usize,
    /// Length handed out by the read awaiting `advance_to`.
    pending_read: Option<usize>,
    writer_completed: bool,
    reader_completed: bool,
}

impl PipeState {
    fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    fn unexamined(&self) -> usize {
        self.len() - self.examined
    }

    /// Returns every unconsumed byte as one buffer.
    ///
    /// New bytes are appended in place when the previous read's buffer was
    /// already dropped, so a frame arriving in many chunks is not recopied
    /// on every read.
    fn snapshot(&mut self) -> Bytes {
        if !self.tail.is_empty() {
            if self.head.is_empty() {
                self.head = std::mem::take(&mut self.tail).freeze();
            } else {
                let mut joined = match std::mem::take(&mut self.head).try_into_mut() {
                    Ok(head) => head,
                    Err(head) => BytesMut::from(&head[..]),
                };
                joined.extend_from_slice(&self.tail);
                self.tail.clear();
                self.head = joined.freeze();
            }
        }
        self.head.clone()
    }

    fn consume(&mut self, count: usize) {
        let from_head = count.min(self.head.len());
        self.head.advance(from_head);
        self.tail.advance(count - from_head);
    }

    fn clear(&mut self) {
        self.head = Bytes::new();
        self.tail.clear();
        self.examined = 0;
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<PipeState>,
    read_ready: Notify,
    write_ready: Notify,
    options: PipeOptions,
    token: CancellationToken,
}

/// Creates a pipe and returns its two ends.
pub fn pipe(options: PipeOptions, token: CancellationToken) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(PipeState::default()),
        read_ready: Notify::new(),
        write_ready: Notify::new(),
        options,
        token,
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

/// Reading end of a pipe.
#[derive(Debug, Clone)]
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Waits for unexamined bytes, writer completion, or cancellation.
    ///
    /// Every successful read must be followed by [`advance_to`](Self::advance_to)
    /// before the next one.
    pub async fn read(&self) -> Result<ReadResult, PipeError> {
        loop {
            let notified = self.shared.read_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if state.pending_read.is_some() {
                    return Err(PipeError::ReadInProgress);
                }
                if state.reader_completed {
                    return Err(PipeError::Closed);
                }
                if self.shared.token.is_cancelled() {
                    return Err(PipeError::Canceled);
                }
                if state.unexamined() > 0 || state.writer_completed {
                    let buffer = state.snapshot();
                    state.pending_read = Some(buffer.len());
                    return Ok(ReadResult {
                        buffer,
                        is_completed: state.writer_completed,
                    });
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.shared.token.cancelled() => return Err(PipeError::Canceled),
            }
        }
    }

    /// Releases `consumed` bytes and records how far the buffer was examined.
    ///
    /// Requires `consumed <= examined <= len` where `len` is the length of the
    /// buffer returned by the pending read. On error nothing changes.
    pub fn advance_to(&self, consumed: usize, examined: usize) -> Result<(), PipeError> {
        let mut state = self.shared.state.lock();
        let len = state.pending_read.ok_or(PipeError::NoReadInProgress)?;
        if consumed > examined || examined > len {
            return Err(PipeError::InvalidCursor {
                consumed,
                examined,
                len,
            });
        }

        state.consume(consumed);
        state.examined = examined - consumed;
        state.pending_read = None;

        if self.shared.options.can_resume(state.unexamined()) {
            self.shared.write_ready.notify_waiters();
        }
        Ok(())
    }

    /// Stops reading. Buffered bytes are dropped and writers fail with `Closed`.
    pub fn complete(&self) {
        let mut state = self.shared.state.lock();
        if state.reader_completed {
            return;
        }
        state.reader_completed = true;
        state.clear();
        state.pending_read = None;
        drop(state);
        self.shared.write_ready.notify_waiters();
    }

    /// Returns the number of unconsumed bytes.
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().len()
    }
}

/// Writing end of a pipe.
#[derive(Debug, Clone)]
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Appends `data`, then waits while the unexamined backlog is above the
    /// thresholds.
    pub async fn write(&self, data: &[u8]) -> Result<(), PipeError> {
        {
            let mut state = self.shared.state.lock();
            if state.writer_completed {
                return Err(PipeError::WriterCompleted);
            }
            if state.reader_completed {
                return Err(PipeError::Closed);
            }
            if self.shared.token.is_cancelled() {
                return Err(PipeError::Canceled);
            }

            state.tail.extend_from_slice(data);
            self.shared.read_ready.notify_waiters();

            if !self.shared.options.should_pause(state.unexamined()) {
                return Ok(());
            }
            tracing::debug!(
                "Pipe writer paused with {} bytes unexamined",
                state.unexamined()
            );
        }

        loop {
            let notified = self.shared.write_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.shared.state.lock();
                if state.reader_completed {
                    return Err(PipeError::Closed);
                }
                if self.shared.options.can_resume(state.unexamined()) {
                    return Ok(());
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.shared.token.cancelled() => return Err(PipeError::Canceled),
            }
        }
    }

    /// Marks the end of the byte stream. The reader sees `is_completed`.
    pub fn complete(&self) {
        let mut state = self.shared.state.lock();
        if state.writer_completed {
            return;
        }
        state.writer_completed = true;
        drop(state);
        self.shared.read_ready.notify_waiters();
    }

    /// Resolves once the reader completed or the pipe was canceled.
    pub async fn closed(&self) {
        loop {
            let notified = self.shared.write_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.state.lock().reader_completed {
                return;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.shared.token.cancelled() => return,
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        self.shared.state.lock().writer_completed
    }
}

/// One direction in, one direction out.
#[derive(Debug, Clone)]
pub struct DuplexPipe {
    pub input: PipeReader,
    pub output: PipeWriter,
}

impl DuplexPipe {
    /// Creates two cross-wired endpoints sharing one cancellation token.
    ///
    /// `transport_options` governs the pipe the application side writes
    /// into (read by the transport side); `application_options` governs the
    /// pipe the transport side writes into.
    pub fn connection_pair(
        transport_options: PipeOptions,
        application_options: PipeOptions,
        token: CancellationToken,
    ) -> DuplexPipePair {
        let (to_transport, transport_input) = pipe(transport_options, token.clone());
        let (to_application, application_input) = pipe(application_options, token);

        DuplexPipePair {
            transport: DuplexPipe {
                input: transport_input,
                output: to_application,
            },
            application: DuplexPipe {
                input: application_input,
                output: to_transport,
            },
        }
    }

    /// Completes both ends held by this side.
    pub fn complete(&self) {
        self.input.complete();
        self.output.complete();
    }
}

/// Both sides of an in-process connection.
#[derive(Debug, Clone)]
pub struct DuplexPipePair {
    pub transport: DuplexPipe,
    pub application: DuplexPipe,
}

//! Single-producer/single-consumer byte conduit (C2)
//!
//! A [`Pipe`] is the shared engine behind a [`PipeWriter`]/[`PipeReader`]
//! pair returned by [`pipe`]. The writer appends through a
//! [`SegmentBuffer`]; the reader observes committed bytes as
//! [`BufferSequence`]s and releases them by advancing past a
//! [`Position`]. Suspension on both sides is driven by
//! [`AwaitableCompletion`], spec §4.2.

use parking_lot::Mutex;

use crate::completion::AwaitableCompletion;
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use crate::segment::{BlockPool, BufferSequence, Position, SegmentBuffer};
use std::sync::Arc;

/// Configuration for a [`Pipe`], modeled on the teacher's `SocketOptions`
/// builder (`options.rs`): documented defaults, `with_*` setters.
#[derive(Clone)]
pub struct PipeOptions {
    /// Size of each rented memory block. Default 4 KiB.
    pub block_size: usize,
    /// Bytes buffered above which the writer suspends. `0` disables
    /// backpressure. Default `0`.
    pub high_watermark: usize,
    /// Bytes buffered at/below which a suspended writer resumes. Default
    /// `0`.
    pub low_watermark: usize,
    /// Scheduler continuations resume on for the writer side.
    pub writer_scheduler: Scheduler,
    /// Scheduler continuations resume on for the reader side.
    pub reader_scheduler: Scheduler,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            high_watermark: 0,
            low_watermark: 0,
            writer_scheduler: Scheduler::default(),
            reader_scheduler: Scheduler::default(),
        }
    }
}

impl PipeOptions {
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    #[must_use]
    pub fn with_watermarks(mut self, low: usize, high: usize) -> Self {
        self.low_watermark = low;
        self.high_watermark = high;
        self
    }

    #[must_use]
    pub fn with_writer_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.writer_scheduler = scheduler;
        self
    }

    #[must_use]
    pub fn with_reader_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.reader_scheduler = scheduler;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.low_watermark > self.high_watermark && self.high_watermark != 0 {
            return Err(Error::argument_out_of_range(
                "low_watermark must be <= high_watermark",
            ));
        }
        Ok(())
    }
}

/// Outcome of [`PipeWriter::flush_async`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushResult {
    /// The reader has permanently stopped consuming.
    pub is_completed: bool,
    /// The flush was woken by [`PipeWriter::cancel_pending_flush`].
    pub is_canceled: bool,
}

/// Outcome of [`PipeReader::read_async`]/[`PipeReader::try_read`].
#[derive(Clone)]
pub struct ReadResult {
    pub sequence: BufferSequence,
    pub is_canceled: bool,
    pub is_completed: bool,
}

struct PipeCore {
    buffer: SegmentBuffer,
    last_flush_end: Option<Position>,
    consumed: Option<Position>,
    examined: Option<Position>,
    writer_completed: bool,
    writer_error: Option<Error>,
    reader_closed: bool,
    flush_pending: bool,
    span_in_flight: bool,
}

impl PipeCore {
    fn ensure_anchor(&mut self) {
        if self.last_flush_end.is_none() {
            let seq = self.buffer.flush();
            self.last_flush_end = Some(seq.end());
        }
    }

    fn buffered_bytes(&self) -> u64 {
        let end = self.last_flush_end.as_ref().map_or(0, Position::absolute);
        let start = self.consumed.as_ref().map_or(0, Position::absolute);
        end.saturating_sub(start)
    }

    fn has_unexamined_data(&self) -> bool {
        let end = self.last_flush_end.as_ref().map_or(0, Position::absolute);
        let examined = self.examined.as_ref().map_or(0, Position::absolute);
        end > examined
    }

    fn current_sequence(&mut self) -> BufferSequence {
        self.ensure_anchor();
        let end = self.last_flush_end.clone().unwrap();
        let start = self
            .consumed
            .clone()
            .or_else(|| self.buffer.origin())
            .unwrap_or_else(|| end.clone());
        BufferSequence::spanning(start, end)
    }
}

/// Shared engine behind a [`PipeWriter`]/[`PipeReader`] pair.
pub struct Pipe {
    core: Mutex<PipeCore>,
    high_watermark: u64,
    low_watermark: u64,
    flush_waiter: AwaitableCompletion<FlushResult>,
    read_waiter: AwaitableCompletion<ReadResult>,
}

/// Construct a new pipe, returning its writer and reader halves.
pub fn pipe(options: PipeOptions) -> Result<(PipeWriter, PipeReader)> {
    options.validate()?;
    let pool = BlockPool::new(options.block_size);
    let core = PipeCore {
        buffer: SegmentBuffer::new(pool),
        last_flush_end: None,
        consumed: None,
        examined: None,
        writer_completed: false,
        writer_error: None,
        reader_closed: false,
        flush_pending: false,
        span_in_flight: false,
    };
    let shared = Arc::new(Pipe {
        core: Mutex::new(core),
        high_watermark: options.high_watermark as u64,
        low_watermark: options.low_watermark as u64,
        flush_waiter: AwaitableCompletion::new(options.writer_scheduler),
        read_waiter: AwaitableCompletion::new(options.reader_scheduler),
    });
    Ok((
        PipeWriter {
            shared: Arc::clone(&shared),
        },
        PipeReader { shared },
    ))
}

impl Pipe {
    fn wake_read_waiter_if_pending(&self, outcome: ReadResult) {
        let _ = self.read_waiter.complete_if_pending(outcome);
    }

    fn maybe_wake_flush_waiter(&self, core: &mut PipeCore) {
        if !core.flush_pending {
            return;
        }
        if core.buffered_bytes() <= self.low_watermark {
            core.flush_pending = false;
            let _ = self.flush_waiter.complete_if_pending(FlushResult::default());
        }
    }
}

/// The writer half of a [`Pipe`].
pub struct PipeWriter {
    shared: Arc<Pipe>,
}

impl PipeWriter {
    /// Request a buffer of at least `hint` bytes (0 means "one full
    /// block"). Returned as an owned `Vec` rather than a borrowed slice
    /// because `compio`'s completion-based reads need an owned, pinned
    /// `IoBufMut` target; see `socketpipe::connection` for how the
    /// receive-loop bridges the two. The bytes actually written into it
    /// are committed into the pipe's segment chain by [`Self::advance`].
    pub fn get_memory(&self, hint: usize) -> Result<Vec<u8>> {
        let mut core = self.shared.core.lock();
        if core.writer_completed {
            return Err(Error::invalid_operation("writer already completed"));
        }
        if core.span_in_flight {
            return Err(Error::invalid_operation(
                "get_memory called again before a matching advance",
            ));
        }
        if hint > core.buffer.block_size() {
            return Err(Error::argument_out_of_range(format!(
                "hint {hint} exceeds block_size {}",
                core.buffer.block_size()
            )));
        }
        core.span_in_flight = true;
        let len = if hint == 0 { core.buffer.block_size() } else { hint };
        Ok(vec![0u8; len])
    }

    /// Commit `written[..n]` into the pipe (does not flush).
    pub fn advance(&self, written: &[u8], n: usize) -> Result<()> {
        let mut core = self.shared.core.lock();
        if !core.span_in_flight {
            return Err(Error::invalid_operation(
                "advance without a pending get_memory",
            ));
        }
        if n > written.len() {
            return Err(Error::argument_out_of_range(format!(
                "advance({n}) exceeds the {}-byte buffer returned by get_memory",
                written.len()
            )));
        }
        // Reserve exactly `n` bytes rather than whatever the tail
        // happens to have spare: if a prior write left the tail
        // partially filled, `get_span(0)` would silently hand back less
        // than `n` and the excess would be dropped. `get_span(n)` rolls
        // a fresh block when the tail can't hold `n`.
        let span = core.buffer.get_span(n)?;
        span[..n].copy_from_slice(&written[..n]);
        core.buffer.advance(n)?;
        core.span_in_flight = false;
        Ok(())
    }

    /// Make committed bytes visible to the reader. Suspends if
    /// `buffered_bytes > high_watermark` (when backpressure is enabled).
    pub async fn flush_async(&self) -> Result<FlushResult> {
        let should_wait = {
            let mut core = self.shared.core.lock();
            if core.writer_completed {
                return Err(Error::invalid_operation("flush after writer completed"));
            }
            let seq = core.buffer.flush();
            core.last_flush_end = Some(seq.end());
            let outcome = ReadResult {
                sequence: core.current_sequence(),
                is_canceled: false,
                is_completed: core.writer_completed,
            };
            self.shared.wake_read_waiter_if_pending(outcome);

            let over_high = self.shared.high_watermark != 0
                && core.buffered_bytes() > self.shared.high_watermark;
            if over_high {
                core.flush_pending = true;
            }
            over_high
        };
        if should_wait {
            Ok(self.shared.flush_waiter.wait().await)
        } else {
            Ok(FlushResult::default())
        }
    }

    /// Seal the writer side. Further flush/advance calls fail.
    pub fn complete(&self, error: Option<Error>) {
        let mut core = self.shared.core.lock();
        core.writer_completed = true;
        core.writer_error = error;
        let outcome = ReadResult {
            sequence: core.current_sequence(),
            is_canceled: false,
            is_completed: true,
        };
        drop(core);
        self.shared.wake_read_waiter_if_pending(outcome);
    }

    /// Wake any blocked flusher with `is_canceled = true`.
    pub fn cancel_pending_flush(&self) {
        let mut core = self.shared.core.lock();
        if core.flush_pending {
            core.flush_pending = false;
        }
        drop(core);
        let _ = self.shared.flush_waiter.complete_if_pending(FlushResult {
            is_completed: false,
            is_canceled: true,
        });
    }
}

/// The reader half of a [`Pipe`].
pub struct PipeReader {
    shared: Arc<Pipe>,
}

impl PipeReader {
    /// Non-blocking: returns `Some` if bytes are available or the writer
    /// has completed.
    pub fn try_read(&self) -> Option<ReadResult> {
        let mut core = self.shared.core.lock();
        core.ensure_anchor();
        if core.has_unexamined_data() || core.writer_completed {
            Some(ReadResult {
                sequence: core.current_sequence(),
                is_canceled: false,
                is_completed: core.writer_completed,
            })
        } else {
            None
        }
    }

    /// Resolve immediately if data is available, else suspend until the
    /// writer flushes, completes, or a pending read is canceled.
    pub async fn read_async(&self) -> Result<ReadResult> {
        if let Some(result) = self.try_read() {
            return Ok(result);
        }
        Ok(self.shared.read_waiter.wait().await)
    }

    /// Release bytes up to `consumed`; `examined` (defaulting to
    /// `consumed`) marks how far the reader has looked without yet
    /// finding more to act on.
    pub fn advance_to(&self, consumed: Position, examined: Option<Position>) -> Result<()> {
        let examined = examined.unwrap_or_else(|| consumed.clone());
        if consumed.absolute() > examined.absolute() {
            return Err(Error::argument_out_of_range(
                "consumed position must be <= examined position",
            ));
        }
        let mut core = self.shared.core.lock();
        core.consumed = Some(consumed);
        core.examined = Some(examined);
        self.shared.maybe_wake_flush_waiter(&mut core);
        Ok(())
    }

    /// Seal the reader side (the writer will observe `is_completed` on
    /// its next flush).
    pub fn complete(&self, _error: Option<Error>) {
        let mut core = self.shared.core.lock();
        core.reader_closed = true;
        core.flush_pending = false;
        drop(core);
        let _ = self.shared.flush_waiter.complete_if_pending(FlushResult {
            is_completed: true,
            is_canceled: false,
        });
    }

    /// Wake a pending `read_async` with `is_canceled = true`.
    pub fn cancel_pending_read(&self) {
        let mut core = self.shared.core.lock();
        let sequence = core.current_sequence();
        drop(core);
        let _ = self.shared.read_waiter.complete_if_pending(ReadResult {
            sequence,
            is_canceled: true,
            is_completed: false,
        });
    }

    /// The error the writer passed to [`PipeWriter::complete`], if any.
    #[must_use]
    pub fn writer_completion_error(&self) -> Option<Error> {
        self.shared.core.lock().writer_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt() -> compio::runtime::Runtime {
        compio::runtime::Runtime::new().unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        rt().block_on(async {
            let (writer, reader) = pipe(PipeOptions::default().with_block_size(64)).unwrap();
            let mut buf = writer.get_memory(5).unwrap();
            buf[..5].copy_from_slice(b"hello");
            writer.advance(&buf, 5).unwrap();
            writer.flush_async().await.unwrap();

            let result = reader.read_async().await.unwrap();
            assert_eq!(result.sequence.to_vec(), b"hello");
            assert!(!result.is_completed);
            reader.advance_to(result.sequence.end(), None).unwrap();
        });
    }

    #[test]
    fn read_async_suspends_until_flush() {
        rt().block_on(async {
            let (writer, reader) = pipe(PipeOptions::default()).unwrap();
            assert!(reader.try_read().is_none());

            let mut buf = writer.get_memory(3).unwrap();
            buf[..3].copy_from_slice(b"abc");
            writer.advance(&buf, 3).unwrap();
            writer.flush_async().await.unwrap();

            let result = reader.read_async().await.unwrap();
            assert_eq!(result.sequence.to_vec(), b"abc");
        });
    }

    #[test]
    fn completion_is_visible_even_with_no_data() {
        rt().block_on(async {
            let (writer, reader) = pipe(PipeOptions::default()).unwrap();
            writer.complete(None);
            let result = reader.read_async().await.unwrap();
            assert!(result.is_completed);
            assert!(result.sequence.is_empty());
        });
    }

    #[test]
    fn flusher_suspends_above_high_watermark_and_resumes_below_low() {
        rt().block_on(async {
            let (writer, reader) =
                pipe(PipeOptions::default().with_block_size(64).with_watermarks(2, 4)).unwrap();

            let mut buf = writer.get_memory(8).unwrap();
            buf[..8].copy_from_slice(b"12345678");
            writer.advance(&buf, 8).unwrap();

            let flush = writer.flush_async();
            futures::pin_mut!(flush);
            assert!(futures::poll!(&mut flush).is_pending());

            let result = reader.read_async().await.unwrap();
            assert_eq!(result.sequence.len(), 8);
            // Advancing to the end drops buffered bytes to 0, which is
            // below the low watermark, so the flusher resumes.
            reader.advance_to(result.sequence.end(), None).unwrap();

            let outcome = flush.await.unwrap();
            assert!(!outcome.is_canceled);
        });
    }

    #[test]
    fn cancel_pending_flush_wakes_with_is_canceled() {
        rt().block_on(async {
            let (writer, _reader) =
                pipe(PipeOptions::default().with_block_size(64).with_watermarks(0, 1)).unwrap();
            let mut buf = writer.get_memory(4).unwrap();
            buf[..4].copy_from_slice(b"data");
            writer.advance(&buf, 4).unwrap();

            let flush = writer.flush_async();
            futures::pin_mut!(flush);
            assert!(futures::poll!(&mut flush).is_pending());

            writer.cancel_pending_flush();
            let outcome = flush.await.unwrap();
            assert!(outcome.is_canceled);
        });
    }

    #[test]
    fn get_memory_rejects_reentrant_call() {
        let (writer, _reader) = pipe(PipeOptions::default()).unwrap();
        let _first = writer.get_memory(4).unwrap();
        assert!(writer.get_memory(4).is_err());
    }
}

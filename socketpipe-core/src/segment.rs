//! Segment-based, refcounted, pool-backed buffer (C1 SegmentBuffer)
//!
//! This is the only module outside [`crate::worker_pool`] allowed to use
//! `unsafe`: every invariant the rest of the crate relies on (page
//! lifetime, initialized-length tracking, pool return-on-drop) is proven
//! here once.
//!
//! A `Page` is a fixed-size (`block_size`) heap allocation rented from a
//! [`BlockPool`] free-list and returned to it when the last `Arc<Page>`
//! drops. A `Segment` is an immutable, refcounted *view* over a page: its
//! `committed` length only ever grows (single-writer, append-only), so
//! multiple `Position`s can safely hold snapshots of different lengths
//! into the same page without any copying or locking on the read side.

#![allow(unsafe_code)]

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

const PAGE_ALIGN: usize = 64;

struct RawPage {
    ptr: NonNull<u8>,
    layout: Layout,
    pool: std::sync::Weak<PoolInner>,
}

// SAFETY: the page is exclusively owned while mutable (writer side) and
// read-only thereafter (multiple `Segment`s share it via `Arc`); no
// interior mutability is exposed except the append-only `committed`
// counter on `Segment`, which is itself atomic.
unsafe impl Send for RawPage {}
unsafe impl Sync for RawPage {}

impl Drop for RawPage {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.free.lock().push(self.ptr);
        } else {
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }
}

struct PoolInner {
    block_size: usize,
    layout: Layout,
    free: Mutex<Vec<NonNull<u8>>>,
}

// SAFETY: `free` only ever holds pointers to allocations made with
// `layout`; raw pointers are `Send` here because ownership transfers
// atomically through the mutex.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for ptr in self.free.lock().drain(..) {
            unsafe { dealloc(ptr.as_ptr(), self.layout) };
        }
    }
}

/// Free-list of fixed-size pages shared by every [`SegmentBuffer`] that
/// opts into pooling (the default).
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

impl BlockPool {
    #[must_use]
    pub fn new(block_size: usize) -> Arc<Self> {
        let layout = Layout::from_size_align(block_size, PAGE_ALIGN)
            .expect("block_size must yield a valid layout");
        Arc::new(Self {
            inner: Arc::new(PoolInner {
                block_size,
                layout,
                free: Mutex::new(Vec::new()),
            }),
        })
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    fn rent(self: &Arc<Self>) -> Arc<RawPage> {
        let ptr = self.inner.free.lock().pop().unwrap_or_else(|| {
            let raw = unsafe { alloc(self.inner.layout) };
            if raw.is_null() {
                std::alloc::handle_alloc_error(self.inner.layout);
            }
            NonNull::new(raw).expect("alloc returned null after null-check")
        });
        Arc::new(RawPage {
            ptr,
            layout: self.inner.layout,
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Number of pages currently idle in the free-list.
    #[must_use]
    pub fn idle_pages(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// One node of the forward-linked segment chain: a refcounted page plus
/// the committed-length high-water mark and the absolute `running_index`
/// of its first byte.
pub struct Segment {
    page: Arc<RawPage>,
    capacity: usize,
    committed: AtomicUsize,
    running_index: u64,
    next: Mutex<Option<Arc<Segment>>>,
}

impl Segment {
    fn new(page: Arc<RawPage>, capacity: usize, running_index: u64) -> Arc<Self> {
        Arc::new(Self {
            page,
            capacity,
            committed: AtomicUsize::new(0),
            running_index,
            next: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn running_index(&self) -> u64 {
        self.running_index
    }

    /// Bytes committed into this segment so far. Only ever grows.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn next(&self) -> Option<Arc<Segment>> {
        self.next.lock().clone()
    }

    fn link_next(&self, next: &Arc<Segment>) {
        *self.next.lock() = Some(Arc::clone(next));
    }

    /// Borrow `[start, end)` of this segment's committed bytes.
    fn slice(&self, start: usize, end: usize) -> &[u8] {
        debug_assert!(end <= self.committed());
        debug_assert!(start <= end);
        unsafe { std::slice::from_raw_parts(self.page.ptr.as_ptr().add(start), end - start) }
    }

    fn writable_mut(&self, start: usize, end: usize) -> &mut [u8] {
        debug_assert!(end <= self.capacity);
        debug_assert!(start <= end);
        unsafe { std::slice::from_raw_parts_mut(self.page.ptr.as_ptr().add(start), end - start) }
    }
}

/// A `(segment, offset_within_segment)` cursor into a segment chain.
#[derive(Clone)]
pub struct Position {
    pub(crate) segment: Arc<Segment>,
    pub(crate) offset: usize,
}

impl Position {
    #[must_use]
    pub fn absolute(&self) -> u64 {
        self.segment.running_index() + self.offset as u64
    }
}

impl PartialEq for Position {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.segment, &other.segment) && self.offset == other.offset
    }
}

/// A read-only, refcounted view over a run of committed bytes spanning
/// one or more segments. Dropping it releases the chain's refcounts.
#[derive(Clone)]
pub struct BufferSequence {
    start: Position,
    end: Position,
}

impl BufferSequence {
    fn empty_at(pos: Position) -> Self {
        Self {
            start: pos.clone(),
            end: pos,
        }
    }

    #[must_use]
    pub fn start(&self) -> Position {
        self.start.clone()
    }

    #[must_use]
    pub fn end(&self) -> Position {
        self.end.clone()
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end.absolute().saturating_sub(self.start.absolute())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build a sequence spanning `[start, end)`, collapsing to an empty
    /// sequence anchored at `start` if the two positions coincide.
    pub(crate) fn spanning(start: Position, end: Position) -> Self {
        if start == end {
            Self::empty_at(start)
        } else {
            Self { start, end }
        }
    }

    /// Visit each contiguous chunk of bytes in order.
    pub fn for_each_chunk(&self, mut f: impl FnMut(&[u8])) {
        if self.is_empty() {
            return;
        }
        let mut seg = Arc::clone(&self.start.segment);
        let mut start_off = self.start.offset;
        loop {
            let is_last = Arc::ptr_eq(&seg, &self.end.segment);
            let end_off = if is_last {
                self.end.offset
            } else {
                seg.committed()
            };
            if end_off > start_off {
                f(seg.slice(start_off, end_off));
            }
            if is_last {
                break;
            }
            let next = seg.next().expect("segment chain ends before reaching `end`");
            seg = next;
            start_off = 0;
        }
    }

    /// Copy the whole sequence into a freshly allocated `Vec<u8>`.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() as usize);
        self.for_each_chunk(|chunk| out.extend_from_slice(chunk));
        out
    }

    /// As a list of segment slices, suitable for scatter-gather sends
    /// (spec §4.5 send-loop, S6).
    #[must_use]
    pub fn chunks(&self) -> Vec<bytes::Bytes> {
        let mut out = Vec::new();
        self.for_each_chunk(|chunk| out.push(bytes::Bytes::copy_from_slice(chunk)));
        out
    }
}

/// A writer-facing append-only buffer producing refcounted read-only
/// sequences (spec §4.1).
pub struct SegmentBuffer {
    pool: Arc<BlockPool>,
    block_size: usize,
    head: Option<Arc<Segment>>,
    tail: Option<Arc<Segment>>,
    flush_start: Option<Position>,
    next_running_index: u64,
    span_in_flight: bool,
}

impl SegmentBuffer {
    #[must_use]
    pub fn new(pool: Arc<BlockPool>) -> Self {
        let block_size = pool.block_size();
        Self {
            pool,
            block_size,
            head: None,
            tail: None,
            flush_start: None,
            next_running_index: 0,
            span_in_flight: false,
        }
    }

    fn tail_spare(&self) -> usize {
        self.tail
            .as_ref()
            .map_or(0, |t| t.capacity() - t.committed())
    }

    /// Size of each rented block.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Position of the first byte ever written to this buffer, if any.
    #[must_use]
    pub fn origin(&self) -> Option<Position> {
        self.head.as_ref().map(|head| Position {
            segment: Arc::clone(head),
            offset: 0,
        })
    }

    /// Return the current tail's unused capacity if it satisfies
    /// `size_hint`, else rent a new block. `size_hint > block_size` fails.
    pub fn get_span(&mut self, size_hint: usize) -> Result<&mut [u8]> {
        if self.span_in_flight {
            return Err(Error::invalid_operation(
                "get_span called again before a matching advance",
            ));
        }
        if size_hint > self.block_size {
            return Err(Error::argument_out_of_range(format!(
                "size_hint {size_hint} exceeds block_size {}",
                self.block_size
            )));
        }
        if self.tail_spare() < size_hint.max(1) {
            self.roll_tail();
        }
        self.span_in_flight = true;
        let tail = self.tail.as_ref().expect("roll_tail always sets a tail");
        let committed = tail.committed();
        Ok(tail.writable_mut(committed, tail.capacity()))
    }

    fn roll_tail(&mut self) {
        let page = self.pool.rent();
        let running_index = self.next_running_index;
        let new_tail = Segment::new(page, self.block_size, running_index);
        if let Some(prev) = &self.tail {
            prev.link_next(&new_tail);
        }
        if self.head.is_none() {
            self.head = Some(Arc::clone(&new_tail));
        }
        self.tail = Some(new_tail);
    }

    /// Commit `n` written bytes (does not make them visible to a reader;
    /// see [`Self::flush`]).
    pub fn advance(&mut self, n: usize) -> Result<()> {
        if !self.span_in_flight {
            return Err(Error::invalid_operation("advance called without a pending get_span"));
        }
        let tail = self
            .tail
            .as_ref()
            .expect("span_in_flight implies a tail exists");
        let spare = tail.capacity() - tail.committed();
        if n > spare {
            return Err(Error::argument_out_of_range(format!(
                "advance({n}) exceeds the {spare} bytes returned by get_span"
            )));
        }
        tail.committed.fetch_add(n, Ordering::Release);
        self.next_running_index += n as u64;
        self.span_in_flight = false;
        Ok(())
    }

    /// Return a refcounted sequence of all bytes committed since the last
    /// flush, retaining any residual tail capacity for future writes.
    pub fn flush(&mut self) -> BufferSequence {
        let end = match &self.tail {
            Some(tail) => Position {
                segment: Arc::clone(tail),
                offset: tail.committed(),
            },
            None => {
                // Nothing has ever been written: synthesize an empty
                // sequence anchored at a fresh, empty tail so callers have
                // a stable position to advance_to from.
                self.roll_tail();
                let tail = self.tail.as_ref().unwrap();
                Position {
                    segment: Arc::clone(tail),
                    offset: 0,
                }
            }
        };
        let start = self.flush_start.clone().unwrap_or_else(|| Position {
            segment: self.head.clone().unwrap_or_else(|| Arc::clone(&self.tail.as_ref().unwrap())),
            offset: 0,
        });
        self.flush_start = Some(end.clone());
        if start == end {
            BufferSequence::empty_at(start)
        } else {
            BufferSequence { start, end }
        }
    }

    /// Release every segment this buffer holds.
    pub fn dispose(&mut self) {
        self.head = None;
        self.tail = None;
        self.flush_start = None;
        self.span_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_block_roundtrip() {
        let pool = BlockPool::new(64);
        let mut buf = SegmentBuffer::new(pool);
        let span = buf.get_span(5).unwrap();
        span[..5].copy_from_slice(b"hello");
        buf.advance(5).unwrap();
        let seq = buf.flush();
        assert_eq!(seq.to_vec(), b"hello");
    }

    #[test]
    fn spans_multiple_blocks() {
        let pool = BlockPool::new(4);
        let mut buf = SegmentBuffer::new(pool);
        for chunk in [b"ab".as_slice(), b"cd", b"ef"] {
            let span = buf.get_span(chunk.len()).unwrap();
            span[..chunk.len()].copy_from_slice(chunk);
            buf.advance(chunk.len()).unwrap();
        }
        let seq = buf.flush();
        assert_eq!(seq.to_vec(), b"abcdef");
        assert!(seq.chunks().len() >= 2);
    }

    #[test]
    fn oversized_hint_rejected() {
        let pool = BlockPool::new(8);
        let mut buf = SegmentBuffer::new(pool);
        assert!(buf.get_span(9).is_err());
    }

    #[test]
    fn double_span_without_advance_rejected() {
        let pool = BlockPool::new(8);
        let mut buf = SegmentBuffer::new(pool);
        let _ = buf.get_span(4).unwrap();
        assert!(buf.get_span(4).is_err());
    }

    #[test]
    fn pages_return_to_pool_on_drop() {
        let pool = BlockPool::new(8);
        {
            let mut buf = SegmentBuffer::new(Arc::clone(&pool));
            let _ = buf.get_span(8).unwrap();
            buf.advance(8).unwrap();
        }
        assert_eq!(pool.idle_pages(), 1);
    }
}

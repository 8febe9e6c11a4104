//! Refcounted stream blocks and the per-source queue.
//!
//! A producer's stream is held as a singly-linked chain of [`RefBlock`]s.
//! Payload bytes are immutable once a block is linked; the only mutable
//! header fields are the flag word (to stamp a release marker), the `next`
//! link (written once, on append) and the logical reference count.
//!
//! The logical refcount drives retention policy, not memory safety - memory
//! is owned by `Arc`, which every logical reference also holds. A linked
//! block carries one baseline reference for the chain link itself, one more
//! while it is the tail, one more while it sits inside the burst window
//! behind the tail, and one per listener cursor parked on it. The head can
//! be trimmed exactly when its count falls back to the baseline.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::{CastError, CastResult};

bitflags! {
    /// Header flags on a stream block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u8 {
        /// Codec boundary a listener may start streaming from.
        const SYNC = 0x01;
        /// Block has been linked into a source queue.
        const QUEUE_BLOCK = 0x02;
        /// Block was trimmed off the queue; cursors still on it must drop.
        const RELEASE_MARKER = 0x04;
    }
}

/// Immutable refcounted byte block.
pub struct RefBlock {
    data: Bytes,
    flags: AtomicU8,
    refcount: AtomicUsize,
    next: RwLock<Option<Arc<RefBlock>>>,
}

impl RefBlock {
    /// Creates an unlinked block holding `data`, with one logical reference
    /// (the caller's).
    pub fn new(data: Bytes) -> Arc<Self> {
        Arc::new(Self {
            data,
            flags: AtomicU8::new(0),
            refcount: AtomicUsize::new(1),
            next: RwLock::new(None),
        })
    }

    /// Creates an unlinked block with flags preset (used by format adapters
    /// to stamp sync points).
    pub fn with_flags(data: Bytes, flags: BlockFlags) -> Arc<Self> {
        let block = Self::new(data);
        block.flags.store(flags.bits(), Ordering::Relaxed);
        block
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn flags(&self) -> BlockFlags {
        BlockFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn has_flag(&self, flag: BlockFlags) -> bool {
        self.flags().contains(flag)
    }

    /// ORs `flag` into the header. Structural callers hold the source lock.
    pub fn set_flag(&self, flag: BlockFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    /// Current logical reference count.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Takes a logical reference, returning an owning handle for it.
    pub fn addref(self: &Arc<Self>) -> Arc<RefBlock> {
        self.refcount.fetch_add(1, Ordering::AcqRel);
        Arc::clone(self)
    }

    /// Releases one logical reference and drops the owning handle.
    pub fn release(this: Arc<RefBlock>) {
        this.refcount.fetch_sub(1, Ordering::AcqRel);
    }

    /// The successor block, if one has been appended.
    pub fn next(&self) -> Option<Arc<RefBlock>> {
        self.next.read().clone()
    }

    /// Links the successor. Written once, under the source lock.
    pub fn set_next(&self, next: Arc<RefBlock>) {
        *self.next.write() = Some(next);
    }

    /// Unlinks and returns the successor, so dropping this block never
    /// cascades down the chain.
    fn take_next(&self) -> Option<Arc<RefBlock>> {
        self.next.write().take()
    }
}

impl std::fmt::Debug for RefBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefBlock")
            .field("len", &self.data.len())
            .field("flags", &self.flags())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// Per-source queue of stream blocks with a burst window behind the tail.
///
/// `min_cursor` marks the oldest block of the burst window; `min_offset` is
/// the byte distance from the cursor block (inclusive) through the tail
/// (inclusive). Appends advance the window so `min_offset` never exceeds
/// `min_size` by more than one block.
pub struct SourceQueue {
    head: Option<Arc<RefBlock>>,
    tail: Option<Arc<RefBlock>>,
    min_cursor: Option<Arc<RefBlock>>,
    min_offset: usize,
    min_size: usize,
    burst_size: usize,
    queue_size: usize,
    queue_size_limit: usize,
}

impl SourceQueue {
    pub fn new(min_size: usize, burst_size: usize, queue_size_limit: usize) -> Self {
        Self {
            head: None,
            tail: None,
            min_cursor: None,
            min_offset: 0,
            min_size,
            burst_size,
            queue_size: 0,
            queue_size_limit,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Total bytes linked from head through tail.
    pub fn size(&self) -> usize {
        self.queue_size
    }

    pub fn head(&self) -> Option<Arc<RefBlock>> {
        self.head.clone()
    }

    pub fn tail(&self) -> Option<Arc<RefBlock>> {
        self.tail.clone()
    }

    pub fn min_cursor(&self) -> Option<Arc<RefBlock>> {
        self.min_cursor.clone()
    }

    pub fn min_offset(&self) -> usize {
        self.min_offset
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    /// Default burst handed to listeners that request none.
    pub fn burst_size(&self) -> usize {
        self.burst_size
    }

    pub fn limit(&self) -> usize {
        self.queue_size_limit
    }

    /// Applies new mount settings without touching the linked chain.
    pub fn apply_limits(&mut self, min_size: usize, burst_size: usize, limit: usize) {
        self.min_size = min_size;
        self.burst_size = burst_size;
        self.queue_size_limit = limit;
    }

    /// Appends a freshly-pulled block to the tail.
    ///
    /// Consumes the caller's reference as the chain-link reference, takes
    /// the tail retention (releasing the previous tail's), takes the burst
    /// window retention, and advances the window cursor.
    pub fn append(&mut self, block: Arc<RefBlock>) -> CastResult<()> {
        block.set_flag(BlockFlags::QUEUE_BLOCK);
        let len = block.len();

        match self.tail.take() {
            Some(old_tail) => {
                old_tail.set_next(Arc::clone(&block));
                self.tail = Some(block.addref());
                RefBlock::release(old_tail);
            }
            None => {
                // Empty queue: block becomes head, tail and window cursor.
                self.head = Some(Arc::clone(&block));
                self.tail = Some(block.addref());
                self.min_cursor = Some(Arc::clone(&block));
                self.min_offset = 0;
            }
        }

        // Burst window retention; tracked by count only, the chain link
        // keeps the block alive.
        block.refcount.fetch_add(1, Ordering::AcqRel);

        self.queue_size += len;
        self.min_offset += len;
        self.advance_min_window()
    }

    /// Moves the window cursor forward until `min_offset` fits `min_size`.
    fn advance_min_window(&mut self) -> CastResult<()> {
        while self.min_offset > self.min_size {
            let cursor = match &self.min_cursor {
                Some(c) => Arc::clone(c),
                None => return Err(CastError::QueueCorrupt("min cursor lost".into())),
            };
            let next = match cursor.next() {
                Some(n) => n,
                // Window bigger than min_size with nothing to advance past:
                // a single oversized block is fine, a dangling offset is not.
                None => {
                    if self.min_offset > self.min_size + cursor.len() {
                        return Err(CastError::QueueCorrupt("min window overran tail".into()));
                    }
                    return Ok(());
                }
            };
            self.min_offset -= cursor.len();
            self.min_cursor = Some(next);
            cursor.refcount.fetch_sub(1, Ordering::AcqRel);
            drop(cursor);
        }
        Ok(())
    }

    /// Trims old head blocks.
    ///
    /// A block leaves the queue when total size is over the limit, or when
    /// nothing but the chain link references it. Trimmed blocks are stamped
    /// with [`BlockFlags::RELEASE_MARKER`] so cursors still parked on them
    /// drop out on their next tick. Returns bytes trimmed.
    pub fn trim(&mut self) -> usize {
        let mut trimmed = 0usize;
        loop {
            let head = match &self.head {
                Some(h) => Arc::clone(h),
                None => break,
            };
            // Never trim the tail; it carries the retention reference.
            if head.next().is_none() {
                break;
            }
            let over_limit = self.queue_size > self.queue_size_limit;
            if !over_limit && head.refcount() != 1 {
                break;
            }
            if self.min_cursor.as_ref().is_some_and(|c| Arc::ptr_eq(c, &head)) {
                if !over_limit {
                    break;
                }
                // Forced past the window: move the cursor off the head first.
                if let Some(next) = head.next() {
                    self.min_offset = self.min_offset.saturating_sub(head.len());
                    self.min_cursor = Some(next);
                    head.refcount.fetch_sub(1, Ordering::AcqRel);
                }
            }
            head.set_flag(BlockFlags::RELEASE_MARKER);
            let next = head.take_next();
            self.queue_size -= head.len();
            trimmed += head.len();
            self.head = next;
            RefBlock::release(head);
        }
        trimmed
    }

    /// Releases the whole chain and both retention references.
    ///
    /// Iterative so tearing down a deep queue never recurses.
    pub fn clear(&mut self) {
        if let Some(tail) = self.tail.take() {
            RefBlock::release(tail);
        }
        // Walk the window releasing its per-block retention.
        let mut cursor = self.min_cursor.take();
        while let Some(block) = cursor {
            cursor = block.next();
            block.refcount.fetch_sub(1, Ordering::AcqRel);
        }
        self.min_offset = 0;
        let mut head = self.head.take();
        while let Some(block) = head {
            block.set_flag(BlockFlags::RELEASE_MARKER);
            head = block.take_next();
            RefBlock::release(block);
        }
        self.queue_size = 0;
    }
}

impl Drop for SourceQueue {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(len: usize, sync: bool) -> Arc<RefBlock> {
        let flags = if sync { BlockFlags::SYNC } else { BlockFlags::empty() };
        RefBlock::with_flags(Bytes::from(vec![0u8; len]), flags)
    }

    fn chain_len(q: &SourceQueue) -> usize {
        let mut total = 0;
        let mut cur = q.head();
        while let Some(b) = cur {
            total += b.len();
            cur = b.next();
        }
        total
    }

    mod refblock {
        use super::*;

        #[test]
        fn addref_release_balance() {
            let b = block(10, true);
            assert_eq!(b.refcount(), 1);
            let extra = b.addref();
            assert_eq!(b.refcount(), 2);
            RefBlock::release(extra);
            assert_eq!(b.refcount(), 1);
        }

        #[test]
        fn flags_accumulate() {
            let b = block(10, true);
            b.set_flag(BlockFlags::RELEASE_MARKER);
            assert!(b.has_flag(BlockFlags::SYNC));
            assert!(b.has_flag(BlockFlags::RELEASE_MARKER));
        }
    }

    mod queue {
        use super::*;

        #[test]
        fn queue_size_matches_linked_bytes() {
            let mut q = SourceQueue::new(8192, 4096, 100_000);
            for _ in 0..10 {
                q.append(block(4096, true)).unwrap();
            }
            assert_eq!(q.size(), chain_len(&q));
        }

        #[test]
        fn first_block_becomes_head_and_cursor() {
            let mut q = SourceQueue::new(8192, 4096, 100_000);
            let b = block(1000, true);
            q.append(Arc::clone(&b)).unwrap();
            assert!(Arc::ptr_eq(&q.head().unwrap(), &b));
            assert!(Arc::ptr_eq(&q.min_cursor().unwrap(), &b));
            assert_eq!(q.min_offset(), 1000);
            assert!(b.has_flag(BlockFlags::QUEUE_BLOCK));
        }

        #[test]
        fn min_offset_tracks_window_bytes() {
            let mut q = SourceQueue::new(10_000, 4096, 1_000_000);
            for _ in 0..20 {
                q.append(block(4000, true)).unwrap();
            }
            // The window may undershoot after an advance but never exceeds
            // min_size by more than one block.
            assert!(q.min_offset() <= q.min_size() + 4000);
            // min_offset equals bytes from cursor through tail.
            let mut bytes = 0;
            let mut cur = q.min_cursor();
            while let Some(b) = cur {
                bytes += b.len();
                cur = b.next();
            }
            assert_eq!(bytes, q.min_offset());
        }

        #[test]
        fn refcounts_are_link_plus_retentions() {
            let mut q = SourceQueue::new(4000, 2000, 1_000_000);
            let a = block(4000, true);
            let b = block(4000, true);
            let c = block(4000, true);
            q.append(Arc::clone(&a)).unwrap();
            q.append(Arc::clone(&b)).unwrap();
            q.append(Arc::clone(&c)).unwrap();
            // a, b: chain link only - the window advanced past both.
            assert_eq!(a.refcount(), 1);
            assert_eq!(b.refcount(), 1);
            // c: chain link + tail retention + window.
            assert_eq!(c.refcount(), 3);
            assert!(Arc::ptr_eq(&q.min_cursor().unwrap(), &c));
        }

        #[test]
        fn idle_heads_are_trimmed() {
            let mut q = SourceQueue::new(4000, 2000, 1_000_000);
            for _ in 0..4 {
                q.append(block(4000, true)).unwrap();
            }
            let head = q.head().unwrap();
            assert_eq!(head.refcount(), 1);
            let trimmed = q.trim();
            assert!(trimmed >= 4000);
            assert!(head.has_flag(BlockFlags::RELEASE_MARKER));
            assert!(!Arc::ptr_eq(&q.head().unwrap(), &head));
            assert_eq!(q.size(), chain_len(&q));
        }

        #[test]
        fn listener_reference_pins_head() {
            let mut q = SourceQueue::new(2000, 1000, 1_000_000);
            q.append(block(4000, true)).unwrap();
            q.append(block(4000, true)).unwrap();
            q.append(block(4000, true)).unwrap();
            let head = q.head().unwrap();
            let cursor = head.addref(); // simulated listener cursor
            assert_eq!(q.trim(), 0);
            assert!(Arc::ptr_eq(&q.head().unwrap(), &head));
            RefBlock::release(cursor);
            assert!(q.trim() > 0);
        }

        #[test]
        fn over_limit_trim_evicts_pinned_heads() {
            let mut q = SourceQueue::new(2000, 1000, 10_000);
            q.append(block(4000, true)).unwrap();
            let head = q.head().unwrap();
            let cursor = head.addref(); // slow listener parked on head
            for _ in 0..3 {
                q.append(block(4000, true)).unwrap();
            }
            assert!(q.size() > q.limit());
            q.trim();
            assert!(q.size() <= q.limit());
            assert!(head.has_flag(BlockFlags::RELEASE_MARKER));
            RefBlock::release(cursor);
        }

        #[test]
        fn tail_survives_trim() {
            let mut q = SourceQueue::new(100, 50, 200);
            q.append(block(4000, true)).unwrap();
            q.trim();
            assert!(q.head().is_some());
            assert_eq!(q.size(), 4000);
        }

        #[test]
        fn clear_releases_everything() {
            let mut q = SourceQueue::new(8000, 4000, 1_000_000);
            let blocks: Vec<_> = (0..5).map(|_| block(4000, true)).collect();
            for b in &blocks {
                q.append(Arc::clone(b)).unwrap();
            }
            q.clear();
            assert!(q.is_empty());
            assert_eq!(q.size(), 0);
            for b in &blocks {
                assert_eq!(b.refcount(), 0, "all retentions released");
            }
        }
    }
}

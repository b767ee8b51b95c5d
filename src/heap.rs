//! The allocator engine.
//!
//! [`Heap`] ties the backing segment, the segregated free lists, and the
//! quick lists together into the three classical operations plus the two
//! utilization metrics.  Allocation tries a quick-list exact match, then a
//! first-fit scan of the size-class buckets with splinter-avoiding splits,
//! growing the heap a page at a time until the reserve is spent.  Freeing
//! either parks small blocks in a quick list (deferring their coalescing
//! until a flush) or returns the block to its bucket and merges it with
//! whichever neighbors are free.
//!
//! The committed region always starts with an immovable allocated prologue
//! and ends with a zero-sized allocated epilogue, so traversal and
//! coalescing terminate without bounds checks against the region itself.

use core::fmt;
use core::ptr::NonNull;

use crate::block::{
    required_block_size, Header, LinkStore, ALIGNMENT, MIN_BLOCK_SIZE, NIL, PAYLOAD_OFFSET,
    WORD_SIZE,
};
use crate::freelist::{bucket_index, FreeLists, NUM_FREE_LISTS};
use crate::quicklist::{quick_index, QuickLists};
use crate::segment::{Segment, PAGE_SZ};

/// Reserve of the process-default heap: enough for twenty-four pages.
pub const DEFAULT_HEAP_SIZE: usize = 24 * PAGE_SZ;

/// Header obfuscation mask used unless [`Heap::set_magic`] overrides it.
const DEFAULT_MAGIC: u64 = 0xdead_beef_cafe_f00d;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Zero-byte request; nothing was changed.
    ZeroSize,
    /// The backing reserve is spent and the request still does not fit.
    HeapExhausted,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSize => write!(f, "zero-size request"),
            Self::HeapExhausted => write!(f, "out of heap memory"),
        }
    }
}

/// One block of the heap walk, as reported by [`Heap::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Byte offset of the block's base from the heap start.
    pub offset: usize,
    pub size: usize,
    pub payload_size: u32,
    pub allocated: bool,
    pub prev_allocated: bool,
    pub in_quick_list: bool,
}

pub struct Heap<const SIZE_BYTES: usize> {
    seg: Segment<SIZE_BYTES>,
    free_lists: FreeLists,
    quick_lists: QuickLists,
    magic: u64,
    peak: f64,
}

impl<const SIZE_BYTES: usize> Heap<SIZE_BYTES> {
    pub const fn new() -> Self {
        Self {
            seg: Segment::new(),
            free_lists: FreeLists::new(),
            quick_lists: QuickLists::new(),
            magic: DEFAULT_MAGIC,
            peak: 0.0,
        }
    }

    /// Replace the header obfuscation mask.  Must precede the first
    /// allocation; the mask is a runtime constant once blocks exist.
    pub fn set_magic(&mut self, magic: u64) {
        assert!(self.seg.is_empty(), "set_magic after heap initialization");
        self.magic = magic;
    }

    pub fn start(&self) -> *mut u8 {
        self.seg.start()
    }

    pub fn end(&self) -> *mut u8 {
        self.seg.end()
    }

    // ------------------------------------------------------------------
    // Block access
    // ------------------------------------------------------------------

    fn header(&self, blk: usize) -> Header {
        Header::decode(self.seg.word(blk + WORD_SIZE), self.magic)
    }

    fn set_header(&mut self, blk: usize, hdr: Header) {
        self.seg.set_word(blk + WORD_SIZE, hdr.encode(self.magic));
    }

    /// The predecessor's footer, stored in this block's first word.  Only
    /// meaningful while the predecessor is free.
    fn prev_footer(&self, blk: usize) -> Header {
        Header::decode(self.seg.word(blk), self.magic)
    }

    /// Mirror a free block's header into the successor's footer slot.
    fn install_footer(&mut self, blk: usize) {
        let hdr = self.header(blk);
        self.seg.set_word(blk + hdr.size(), hdr.encode(self.magic));
    }

    /// Base offset of the epilogue pseudo-block.  Its header is the last
    /// word of the committed region.
    fn epilogue(&self) -> usize {
        self.seg.committed() - PAYLOAD_OFFSET
    }

    fn payload_ptr(&self, blk: usize) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.seg.start().add(blk + PAYLOAD_OFFSET)) }
    }

    // ------------------------------------------------------------------
    // Initialization and growth
    // ------------------------------------------------------------------

    /// First-use setup: prologue, epilogue, and one free block spanning the
    /// interior of the first page.
    fn init_heap(&mut self) -> Result<(), AllocError> {
        self.seg.grow().ok_or(AllocError::HeapExhausted)?;

        self.set_header(0, Header::empty().with_size(MIN_BLOCK_SIZE).with_allocated(true));
        let epi = self.epilogue();
        self.set_header(epi, Header::empty().with_allocated(true));

        let rem = MIN_BLOCK_SIZE;
        let rem_size = PAGE_SZ - MIN_BLOCK_SIZE - PAYLOAD_OFFSET;
        self.set_header(rem, Header::empty().with_size(rem_size).with_prev_allocated(true));
        self.install_footer(rem);
        self.free_lists.insert(&mut self.seg, rem, rem_size);
        Ok(())
    }

    /// Extend the heap by one page.  The old epilogue's slot becomes the
    /// base of a fresh page-sized free block, which then absorbs a free
    /// predecessor if one was waiting at the old heap end.
    fn add_page(&mut self) -> Result<(), AllocError> {
        let page = self.seg.grow().ok_or(AllocError::HeapExhausted)?;

        let blk = page - PAYLOAD_OFFSET;
        let inherited = self.header(blk).prev_allocated();
        self.set_header(blk, Header::empty().with_size(PAGE_SZ).with_prev_allocated(inherited));

        let epi = self.epilogue();
        self.set_header(epi, Header::empty().with_allocated(true));
        self.install_footer(blk);

        self.free_lists.insert(&mut self.seg, blk, PAGE_SZ);
        self.coalesce_prev(blk);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------

    /// Exact-match allocation from a quick list.
    fn alloc_from_quick(&mut self, blk_size: usize, payload_size: u32) -> Option<NonNull<u8>> {
        let idx = quick_index(blk_size)?;
        let blk = self.quick_lists.pop(&mut self.seg, idx)?;
        let hdr = self.header(blk).with_in_quick_list(false).with_payload_size(payload_size);
        debug_assert_eq!(hdr.size(), blk_size);
        self.set_header(blk, hdr);
        Some(self.payload_ptr(blk))
    }

    /// First-fit scan of the segregated lists from the request's size class
    /// upward, extending the heap and rescanning until the reserve is spent.
    fn alloc_from_free_lists(
        &mut self,
        blk_size: usize,
        payload_size: u32,
    ) -> Result<NonNull<u8>, AllocError> {
        loop {
            for idx in bucket_index(blk_size)..NUM_FREE_LISTS {
                let mut cur = self.free_lists.first(idx);
                while cur != NIL {
                    let cur_size = self.header(cur).size();
                    if cur_size >= blk_size + MIN_BLOCK_SIZE {
                        self.split_free_block(cur, blk_size, payload_size);
                        return Ok(self.payload_ptr(cur));
                    } else if cur_size >= blk_size {
                        // Exact fit, or a split would leave a splinter:
                        // hand over the whole block.
                        self.free_lists.remove(&mut self.seg, cur, cur_size);
                        let hdr =
                            self.header(cur).with_allocated(true).with_payload_size(payload_size);
                        self.set_header(cur, hdr);
                        self.mark_successor_prev_allocated(cur);
                        return Ok(self.payload_ptr(cur));
                    }
                    cur = self.seg.next_link(cur);
                }
            }
            self.add_page()?;
        }
    }

    /// Set the successor's prev-allocated bit, mirroring the change into the
    /// successor's own footer when the successor is free.
    fn mark_successor_prev_allocated(&mut self, blk: usize) {
        let next = blk + self.header(blk).size();
        let next_hdr = self.header(next).with_prev_allocated(true);
        self.set_header(next, next_hdr);
        if !next_hdr.allocated() {
            self.install_footer(next);
        }
    }

    // ------------------------------------------------------------------
    // Split and coalesce
    // ------------------------------------------------------------------

    /// Split an over-large free block: the lower half becomes the allocated
    /// result, the upper half a new free block in its own bucket.  Callers
    /// guarantee the remainder is at least a minimum block.
    fn split_free_block(&mut self, blk: usize, blk_size: usize, payload_size: u32) {
        let orig_size = self.header(blk).size();
        debug_assert!(orig_size >= blk_size + MIN_BLOCK_SIZE);
        self.free_lists.remove(&mut self.seg, blk, orig_size);

        let hdr =
            self.header(blk).with_size(blk_size).with_payload_size(payload_size).with_allocated(true);
        self.set_header(blk, hdr);

        let upper = blk + blk_size;
        let upper_size = orig_size - blk_size;
        self.set_header(upper, Header::empty().with_size(upper_size).with_prev_allocated(true));
        self.install_footer(upper);
        self.free_lists.insert(&mut self.seg, upper, upper_size);
    }

    /// Shrink an allocated block in place.  A remainder below the minimum
    /// block size is a splinter: the block keeps its size and only the
    /// recorded payload changes.  Otherwise the tail becomes a free block
    /// (never quick-listed) and is merged forward if possible.
    fn split_alloc_block(&mut self, blk: usize, blk_size: usize, payload_size: u32) {
        let orig_size = self.header(blk).size();
        if orig_size - blk_size < MIN_BLOCK_SIZE {
            self.set_header(blk, self.header(blk).with_payload_size(payload_size));
            return;
        }

        self.set_header(
            blk,
            self.header(blk).with_size(blk_size).with_payload_size(payload_size),
        );

        let upper = blk + blk_size;
        let upper_size = orig_size - blk_size;
        self.set_header(upper, Header::empty().with_size(upper_size).with_prev_allocated(true));
        self.install_footer(upper);

        // The tail is free now; its successor's prev-allocated bit was set
        // while this block still covered the tail's range.
        let next = upper + upper_size;
        let next_hdr = self.header(next).with_prev_allocated(false);
        self.set_header(next, next_hdr);
        if !next_hdr.allocated() {
            self.install_footer(next);
        }

        self.free_lists.insert(&mut self.seg, upper, upper_size);
        self.coalesce_next(upper);
    }

    /// Merge a free block into a free predecessor.  Returns the merged
    /// block's base, or `None` when the predecessor is allocated.
    fn coalesce_prev(&mut self, blk: usize) -> Option<usize> {
        let hdr = self.header(blk);
        if hdr.prev_allocated() {
            return None;
        }
        let prev_size = self.prev_footer(blk).size();
        let cur_size = hdr.size();
        let merged = blk - prev_size;
        let merged_size = prev_size + cur_size;

        let merged_hdr = self.header(merged).with_size(merged_size).with_payload_size(0);
        self.set_header(merged, merged_hdr);
        self.install_footer(merged);

        self.free_lists.remove(&mut self.seg, blk, cur_size);
        self.free_lists.relocate(&mut self.seg, merged, prev_size, merged_size);
        Some(merged)
    }

    /// Merge a free successor into this free block.
    fn coalesce_next(&mut self, blk: usize) {
        let cur_size = self.header(blk).size();
        let next = blk + cur_size;
        let next_hdr = self.header(next);
        if next_hdr.allocated() {
            return;
        }
        let merged_size = cur_size + next_hdr.size();
        self.free_lists.remove(&mut self.seg, next, next_hdr.size());

        let hdr = self.header(blk).with_size(merged_size).with_payload_size(0);
        self.set_header(blk, hdr);
        self.install_footer(blk);
        self.free_lists.relocate(&mut self.seg, blk, cur_size, merged_size);
    }

    /// Free-side rule: previous neighbor first; forward from the merged
    /// block if that succeeded, else forward from the original.  Absorbs up
    /// to both neighbors in one pass.
    fn coalesce_both(&mut self, blk: usize) {
        match self.coalesce_prev(blk) {
            Some(merged) => self.coalesce_next(merged),
            None => self.coalesce_next(blk),
        }
    }

    /// Mark a block free, mirror the change into both boundary tags, insert
    /// it into its bucket, and coalesce.  Shared by the ordinary free path
    /// and the quick-list flush.
    fn release(&mut self, blk: usize) {
        let hdr = self.header(blk).with_allocated(false).with_in_quick_list(false);
        self.set_header(blk, hdr);
        self.install_footer(blk);

        let next = blk + hdr.size();
        let next_hdr = self.header(next).with_prev_allocated(false);
        self.set_header(next, next_hdr);
        if !next_hdr.allocated() {
            self.install_footer(next);
        }

        self.free_lists.insert(&mut self.seg, blk, hdr.size());
        self.coalesce_both(blk);
    }

    /// Return every resident of a quick list to the free lists, coalescing
    /// each in head-to-tail order.  The list ends empty.
    fn flush_quick_list(&mut self, idx: usize) {
        while let Some(blk) = self.quick_lists.pop(&mut self.seg, idx) {
            self.release(blk);
        }
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    pub fn allocate(&mut self, size: u32) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        if self.seg.is_empty() {
            self.init_heap()?;
        }
        let blk_size = required_block_size(size);
        let ptr = match self.alloc_from_quick(blk_size, size) {
            Some(ptr) => ptr,
            None => self.alloc_from_free_lists(blk_size, size)?,
        };
        self.update_peak();
        Ok(ptr)
    }

    /// Release a previously allocated block.
    ///
    /// # Panics
    /// Panics if `ptr` fails validation; a heap handed an invalid pointer is
    /// not recovered.
    pub fn free(&mut self, ptr: *mut u8) {
        let blk = self.validate(ptr);
        let size = self.header(blk).size();
        self.set_header(blk, self.header(blk).with_payload_size(0));

        match quick_index(size) {
            Some(idx) => {
                self.set_header(blk, self.header(blk).with_in_quick_list(true));
                if self.quick_lists.is_full(idx) {
                    self.flush_quick_list(idx);
                }
                self.quick_lists.push(&mut self.seg, idx, blk);
            }
            None => self.release(blk),
        }
        self.update_peak();
    }

    /// Resize a previously allocated block.  `Ok(None)` means `rsize` was
    /// zero and the block was freed.
    ///
    /// # Panics
    /// Panics if `ptr` fails validation.
    pub fn reallocate(
        &mut self,
        ptr: *mut u8,
        rsize: u32,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        if rsize == 0 {
            self.free(ptr);
            return Ok(None);
        }
        let blk = self.validate(ptr);
        let old_hdr = self.header(blk);
        let old_size = old_hdr.size();
        let new_size = required_block_size(rsize);

        let result = if new_size == old_size {
            // The padding already covers the request; record it.
            if old_hdr.payload_size() != rsize {
                self.set_header(blk, old_hdr.with_payload_size(rsize));
            }
            self.payload_ptr(blk)
        } else if new_size > old_size {
            let new_ptr = self.allocate(rsize)?;
            let dst = new_ptr.as_ptr() as usize - self.seg.start() as usize;
            self.seg.copy_payload(blk + PAYLOAD_OFFSET, dst, old_hdr.payload_size() as usize);
            self.free(ptr);
            new_ptr
        } else {
            self.split_alloc_block(blk, new_size, rsize);
            self.payload_ptr(blk)
        };
        self.update_peak();
        Ok(Some(result))
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Full payload-pointer validation.  Panics on any failure; the caller
    /// handed us something that was never a live allocation, and there is
    /// nothing to salvage.
    fn validate(&self, ptr: *mut u8) -> usize {
        match self.check_pointer(ptr) {
            Some(blk) => blk,
            None => panic!("invalid payload pointer: {:p}", ptr),
        }
    }

    fn check_pointer(&self, ptr: *mut u8) -> Option<usize> {
        if ptr.is_null() || (ptr as usize) % ALIGNMENT != 0 || self.seg.is_empty() {
            return None;
        }
        let blk = (ptr as usize)
            .checked_sub(self.seg.start() as usize)?
            .checked_sub(PAYLOAD_OFFSET)?;
        // The header must sit between the first legal header slot and the
        // epilogue header.
        if blk < WORD_SIZE || blk >= self.epilogue() {
            return None;
        }
        let hdr = self.header(blk);
        let size = hdr.size();
        if size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 {
            return None;
        }
        if blk + size > self.epilogue() {
            return None;
        }
        if !hdr.allocated() || hdr.in_quick_list() {
            return None;
        }
        if !hdr.prev_allocated() {
            // The predecessor claims to be free: its footer must agree with
            // its header.
            let footer = self.prev_footer(blk);
            let prev_size = footer.size();
            if prev_size < MIN_BLOCK_SIZE || prev_size % ALIGNMENT != 0 {
                return None;
            }
            let prev = blk.checked_sub(prev_size)?;
            if prev < MIN_BLOCK_SIZE || self.header(prev) != footer {
                return None;
            }
        }
        Some(blk)
    }

    // ------------------------------------------------------------------
    // Metrics and introspection
    // ------------------------------------------------------------------

    /// Ratio of requested payload bytes to the block bytes serving them,
    /// over allocated blocks with a non-zero payload.  Zero on an empty
    /// heap.
    pub fn internal_fragmentation(&self) -> f64 {
        let mut payload = 0u64;
        let mut size = 0u64;
        for b in self.blocks() {
            if b.allocated && b.payload_size != 0 {
                payload += b.payload_size as u64;
                size += b.size as u64;
            }
        }
        if size == 0 {
            return 0.0;
        }
        payload as f64 / size as f64
    }

    /// Ratio of allocated payload bytes to the committed heap size.
    pub fn utilization(&self) -> f64 {
        if self.seg.is_empty() {
            return 0.0;
        }
        let mut payload = 0u64;
        for b in self.blocks() {
            if b.allocated {
                payload += b.payload_size as u64;
            }
        }
        payload as f64 / self.seg.committed() as f64
    }

    /// Running maximum of [`Heap::utilization`] over the heap's lifetime.
    pub fn peak_utilization(&self) -> f64 {
        self.peak
    }

    fn update_peak(&mut self) {
        let current = self.utilization();
        if current > self.peak {
            self.peak = current;
        }
    }

    /// Walk the heap from the prologue up to (not including) the epilogue.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        let mut cur = if self.seg.is_empty() { None } else { Some(0) };
        core::iter::from_fn(move || {
            let blk = cur?;
            let hdr = self.header(blk);
            if hdr.size() == 0 {
                cur = None;
                return None;
            }
            cur = Some(blk + hdr.size());
            Some(BlockInfo {
                offset: blk,
                size: hdr.size(),
                payload_size: hdr.payload_size(),
                allocated: hdr.allocated(),
                prev_allocated: hdr.prev_allocated(),
                in_quick_list: hdr.in_quick_list(),
            })
        })
    }

    /// Residents of one free-list bucket in sentinel-forward order.
    pub fn free_list(&self, bucket: usize) -> impl Iterator<Item = usize> + '_ {
        self.free_lists.iter(&self.seg, bucket)
    }

    /// Residents of one quick list in head-to-tail order.
    pub fn quick_list(&self, idx: usize) -> impl Iterator<Item = usize> + '_ {
        self.quick_lists.iter(&self.seg, idx)
    }
}

impl<const SIZE_BYTES: usize> Default for Heap<SIZE_BYTES> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SIZE_BYTES: usize> fmt::Debug for Heap<SIZE_BYTES> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "heap {:p}..{:p} ({} bytes committed)",
            self.start(),
            self.end(),
            self.seg.committed()
        )?;
        for b in self.blocks() {
            writeln!(
                f,
                "  {:#07x} size={:<6} payload={:<10} {}{}{}",
                b.offset,
                b.size,
                b.payload_size,
                if b.allocated { "al " } else { "fr " },
                if b.prev_allocated { "pal " } else { "    " },
                if b.in_quick_list { "qk" } else { "" },
            )?;
        }
        if !self.seg.is_empty() {
            writeln!(f, "  {:#07x} epilogue", self.epilogue())?;
        }
        Ok(())
    }
}

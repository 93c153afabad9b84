//! A heap that deals only in spans.
//!
//! The heap does not record the size of the blocks allocated from it; it only
//! knows what space is allocated and what is not. The client must deallocate
//! exactly the ranges it allocated.

use fxhash::FxHasher64;
use hal::RepositionStep;
use std::hash::{Hash, Hasher};

/// Span-only free-list heap over `[0, size)`.
#[derive(Clone, Debug)]
pub struct SpanningHeap {
    // free spans as (start, end) pairs, ordered, non-adjacent, non-overlapping
    free_spans: Vec<(u32, u32)>,
    size: u32,
}

impl SpanningHeap {
    /// A heap covering `[0, size)`, initially entirely free.
    pub fn new(size: u32) -> Self {
        SpanningHeap {
            free_spans: if size != 0 { vec![(0, size)] } else { Vec::new() },
            size,
        }
    }

    /// Allocate `size` bytes anywhere in the heap, first fit. Returns the
    /// start of the allocated span.
    pub fn allocate(&mut self, size: u32) -> Option<u32> {
        if size == 0 {
            return None;
        }
        for i in 0..self.free_spans.len() {
            let (start, end) = self.free_spans[i];
            if end - start >= size {
                if end - start == size {
                    self.free_spans.remove(i);
                } else {
                    self.free_spans[i].0 = start + size;
                }
                return Some(start);
            }
        }
        None
    }

    /// Allocate the exact span `[ptr, ptr + size)`. Fails if any part of it
    /// is already allocated.
    pub fn allocate_at(&mut self, ptr: u32, size: u32) -> bool {
        if size == 0 || ptr + size > self.size {
            return false;
        }
        let end = ptr + size;
        for i in 0..self.free_spans.len() {
            let (s, e) = self.free_spans[i];
            if ptr >= s && end <= e {
                // carve [ptr, end) out of [s, e)
                self.free_spans.remove(i);
                if end < e {
                    self.free_spans.insert(i, (end, e));
                }
                if ptr > s {
                    self.free_spans.insert(i, (s, ptr));
                }
                return true;
            }
        }
        false
    }

    /// Return the span `[ptr, ptr + size)` to the heap, merging with
    /// neighbouring free spans.
    pub fn deallocate(&mut self, ptr: u32, size: u32) -> bool {
        if size == 0 || ptr + size > self.size {
            return false;
        }
        let end = ptr + size;
        let idx = self
            .free_spans
            .iter()
            .position(|&(s, _)| s >= ptr)
            .unwrap_or(self.free_spans.len());

        // double-free detection: the span must not intersect a free span
        if idx < self.free_spans.len() && self.free_spans[idx].0 < end {
            return false;
        }
        if idx > 0 && self.free_spans[idx - 1].1 > ptr {
            return false;
        }

        let merges_prev = idx > 0 && self.free_spans[idx - 1].1 == ptr;
        let merges_next = idx < self.free_spans.len() && self.free_spans[idx].0 == end;
        match (merges_prev, merges_next) {
            (true, true) => {
                self.free_spans[idx - 1].1 = self.free_spans[idx].1;
                self.free_spans.remove(idx);
            }
            (true, false) => self.free_spans[idx - 1].1 = end,
            (false, true) => self.free_spans[idx].0 = ptr,
            (false, false) => self.free_spans.insert(idx, (ptr, end)),
        }
        true
    }

    /// Total bytes currently free.
    pub fn available_space(&self) -> u32 {
        self.free_spans.iter().map(|&(s, e)| e - s).sum()
    }

    /// Size of the largest free span.
    pub fn largest_free_block(&self) -> u32 {
        self.free_spans.iter().map(|&(s, e)| e - s).max().unwrap_or(0)
    }

    /// Total bytes currently allocated.
    pub fn allocated_space(&self) -> u32 {
        self.size - self.available_space()
    }

    /// Size of the heap's address range.
    pub fn heap_size(&self) -> u32 {
        self.size
    }

    /// True when nothing is allocated.
    pub fn is_empty(&self) -> bool {
        self.free_spans.len() == 1 && self.free_spans[0] == (0, self.size)
            || (self.size == 0 && self.free_spans.is_empty())
    }

    /// Hash of the free-list layout; changes whenever the arrangement of
    /// allocated spans changes.
    pub fn layout_hash(&self) -> u64 {
        let mut hasher = FxHasher64::default();
        self.size.hash(&mut hasher);
        self.free_spans.hash(&mut hasher);
        hasher.finish()
    }

    /// Grow the heap by `size` bytes and allocate the new block in one step.
    /// Returns the start of the new block.
    pub fn append_new_block(&mut self, size: u32) -> u32 {
        let start = self.size;
        self.size += size;
        start
    }

    /// Flattened `(start, end)` pairs of the free spans, for metrics display.
    pub fn metrics_markers(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.free_spans.len() * 2);
        for &(s, e) in &self.free_spans {
            out.push(s);
            out.push(e);
        }
        out
    }

    /// Allocated spans in address order (the complement of the free list).
    pub fn allocated_spans(&self) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        let mut cursor = 0;
        for &(s, e) in &self.free_spans {
            if s > cursor {
                out.push((cursor, s));
            }
            cursor = e;
        }
        if cursor < self.size {
            out.push((cursor, self.size));
        }
        out
    }

    /// Plan a full compression: slide every allocated span toward the front,
    /// preserving order. The destinations are heap-relative; callers add the
    /// offset of wherever the compacted bytes will actually live.
    pub fn calculate_heap_compression(&self) -> Vec<RepositionStep> {
        let mut steps = Vec::new();
        let mut destination = 0u32;
        for (s, e) in self.allocated_spans() {
            steps.push(RepositionStep {
                source_start: s,
                source_end: e,
                destination,
            });
            destination += e - s;
        }
        steps
    }
}

/// External size quantum used when packing many small records into a
/// spanning heap (the transaction table reserves one block per slot).
pub const BLOCK_ALIGN: u32 = 16;

/// Round `size` up to the block quantum.
pub fn align_block_size(size: u32) -> u32 {
    (size + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1)
}

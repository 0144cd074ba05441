use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};

use super::{
    padding_with_header, AllocStats, Allocation, RawAllocator, DEFAULT_ALIGN,
    MIN_ALIGN,
};

/// Bookkeeping stored immediately before each returned pointer.
#[repr(C)]
struct AllocationHeader {
    /// Offset before this allocation was made.
    previous_offset: usize,
    /// Distance from the pre-allocation cursor to the returned pointer.
    padding: usize,
}

/// LIFO allocator with per-allocation rewind.
///
/// Each block stores an [`AllocationHeader`] in front of the returned
/// pointer; `deallocate` rewinds the cursor to the header's recorded
/// offset. Deallocating in any order other than reverse allocation order is
/// a contract violation. Allocation is thread-safe via CAS; deallocation
/// and rewinding are single-writer.
pub struct StackAllocator {
    base: NonNull<u8>,
    layout: Layout,
    capacity: usize,
    offset: AtomicUsize,
    peak: AtomicUsize,
    live: AtomicUsize,
    total_allocations: AtomicUsize,
    total_deallocations: AtomicUsize,
    waste: AtomicUsize,
}

// The buffer is owned and handed-out ranges are disjoint via the atomic
// cursor, exactly as in the bump allocators.
unsafe impl Send for StackAllocator {}
unsafe impl Sync for StackAllocator {}

impl StackAllocator {
    /// Allocates a backing buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 {
            contract_violation!("StackAllocator: capacity must be greater than 0");
        }
        let layout = Layout::from_size_align(capacity.max(1), DEFAULT_ALIGN)
            .expect("stack capacity overflows Layout");
        let base = unsafe { alloc(layout) };
        let Some(base) = NonNull::new(base) else {
            handle_alloc_error(layout)
        };
        Self {
            base,
            layout,
            capacity,
            offset: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            total_allocations: AtomicUsize::new(0),
            total_deallocations: AtomicUsize::new(0),
            waste: AtomicUsize::new(0),
        }
    }

    /// Current cursor, usable with [`rewind_to`](StackAllocator::rewind_to)
    /// for bulk deallocation.
    pub fn marker(&self) -> usize {
        self.offset.load(Ordering::Relaxed)
    }

    /// Frees every allocation made after `marker` was taken.
    ///
    /// The live-allocation counter becomes approximate after a rewind; bulk
    /// frees do not walk the headers they discard.
    pub fn rewind_to(&mut self, marker: usize) {
        let current = self.offset.load(Ordering::Acquire);
        if marker > current {
            contract_violation!("rewind_to: marker {marker} is ahead of the cursor {current}");
            return;
        }
        self.offset.store(marker, Ordering::Release);
    }

    /// Frees everything.
    pub fn reset(&mut self) {
        self.offset.store(0, Ordering::Release);
        self.live.store(0, Ordering::Release);
        self.waste.store(0, Ordering::Release);
    }

    /// Total buffer size in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for StackAllocator {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

unsafe impl RawAllocator for StackAllocator {
    fn allocate(&self, size: usize, align: usize) -> Option<Allocation> {
        if !align.is_power_of_two() || align < MIN_ALIGN {
            contract_violation!("allocate: alignment {align} must be a power of two >= {MIN_ALIGN}");
            return None;
        }
        if size == 0 {
            return None;
        }

        let header_size = core::mem::size_of::<AllocationHeader>();
        let mut current = self.offset.load(Ordering::Acquire);
        let (data_offset, padding) = loop {
            let addr = self.base.as_ptr() as usize + current;
            let padding = padding_with_header(addr, align, header_size);
            let data_offset = current + padding;
            if data_offset.checked_add(size)? > self.capacity {
                return None;
            }
            match self.offset.compare_exchange_weak(
                current,
                data_offset + size,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break (data_offset, padding),
                Err(observed) => current = observed,
            }
        };

        // The header slot belongs exclusively to this allocation once the
        // CAS has claimed the range.
        unsafe {
            let header = self
                .base
                .as_ptr()
                .add(data_offset - header_size)
                .cast::<AllocationHeader>();
            header.write(AllocationHeader {
                previous_offset: current,
                padding,
            });
        }

        self.live.fetch_add(1, Ordering::Relaxed);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        self.waste
            .fetch_add(padding - header_size, Ordering::Relaxed);

        let new_offset = data_offset + size;
        let mut peak = self.peak.load(Ordering::Acquire);
        while new_offset > peak {
            match self.peak.compare_exchange_weak(
                peak,
                new_offset,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }

        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(data_offset)) };
        Some(Allocation { ptr, size })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        if !self.owns(ptr.as_ptr()) {
            contract_violation!("deallocate: pointer does not belong to this stack");
            return;
        }

        #[cfg(debug_assertions)]
        {
            let end = self.base.as_ptr() as usize + self.offset.load(Ordering::Acquire);
            assert!(
                ptr.as_ptr() as usize + size <= end,
                "deallocate violates LIFO order"
            );
        }
        let _ = size;

        let header = ptr
            .as_ptr()
            .sub(core::mem::size_of::<AllocationHeader>())
            .cast::<AllocationHeader>()
            .read();
        // LIFO deallocation is single-writer per stack by contract.
        self.offset.store(header.previous_offset, Ordering::Release);
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.total_deallocations.fetch_add(1, Ordering::Relaxed);
    }

    fn owns(&self, ptr: *const u8) -> bool {
        let start = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.capacity
    }

    fn stats(&self) -> AllocStats {
        AllocStats {
            bytes_in_use: self.offset.load(Ordering::Relaxed),
            peak_bytes_in_use: self.peak.load(Ordering::Relaxed),
            allocation_count: self.live.load(Ordering::Relaxed),
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_deallocations: self.total_deallocations.load(Ordering::Relaxed),
            alignment_waste: self.waste.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifo_roundtrip() {
        let stack = StackAllocator::new(1024);
        let a = stack.allocate(64, MIN_ALIGN).unwrap();
        let b = stack.allocate(64, MIN_ALIGN).unwrap();

        let before_b = stack.marker();
        unsafe { stack.deallocate(b.ptr, b.size) };
        assert!(stack.marker() < before_b);
        unsafe { stack.deallocate(a.ptr, a.size) };
        assert_eq!(stack.marker(), 0);
        assert_eq!(stack.stats().total_deallocations, 2);
    }

    #[test]
    fn rewind_bulk_frees() {
        let mut stack = StackAllocator::new(1024);
        stack.allocate(32, MIN_ALIGN).unwrap();
        let marker = stack.marker();
        stack.allocate(64, MIN_ALIGN).unwrap();
        stack.allocate(64, MIN_ALIGN).unwrap();

        stack.rewind_to(marker);
        assert_eq!(stack.marker(), marker);
    }

    #[test]
    fn reuse_after_deallocate() {
        let stack = StackAllocator::new(256);
        let a = stack.allocate(128, MIN_ALIGN).unwrap();
        unsafe { stack.deallocate(a.ptr, a.size) };
        let b = stack.allocate(128, MIN_ALIGN).unwrap();
        assert_eq!(a.ptr, b.ptr);
    }
}

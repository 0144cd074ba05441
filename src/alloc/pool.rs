use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};

use super::{AllocStats, Allocation, RawAllocator, MIN_ALIGN};

/// Lock-free fixed-block allocator.
///
/// The block count is decided at construction. Free blocks form an
/// intrusive singly linked list threaded through the unused memory itself;
/// both `allocate` and `deallocate` are CAS loops on the list head.
/// Requests larger than the block size are a contract violation.
pub struct PoolAllocator {
    base: NonNull<u8>,
    layout: Layout,
    block_size: usize,
    block_count: usize,
    capacity: usize,
    head: AtomicPtr<u8>,
    free_blocks: AtomicUsize,
    peak_used_blocks: AtomicUsize,
    total_allocations: AtomicUsize,
    total_deallocations: AtomicUsize,
}

// The buffer is owned; blocks move between the free list and callers only
// through the atomic head.
unsafe impl Send for PoolAllocator {}
unsafe impl Sync for PoolAllocator {}

impl PoolAllocator {
    /// Creates a pool of `block_count` blocks of `block_size` bytes aligned
    /// to [`MIN_ALIGN`].
    pub fn new(block_size: usize, block_count: usize) -> Self {
        Self::with_align(block_size, block_count, MIN_ALIGN)
    }

    /// Creates a pool with an explicit block alignment.
    pub fn with_align(block_size: usize, block_count: usize, align: usize) -> Self {
        if block_count == 0 {
            contract_violation!("PoolAllocator: block_count must be greater than 0");
        }
        if !align.is_power_of_two() || align < MIN_ALIGN {
            contract_violation!("PoolAllocator: alignment {align} must be a power of two >= {MIN_ALIGN}");
        }

        // A free block must be able to hold the next-pointer of the list.
        let block_size = block_size
            .max(core::mem::size_of::<*mut u8>())
            .next_multiple_of(align);
        let capacity = block_size * block_count.max(1);

        let layout =
            Layout::from_size_align(capacity, align).expect("pool capacity overflows Layout");
        let base = unsafe { alloc(layout) };
        let Some(base) = NonNull::new(base) else {
            handle_alloc_error(layout)
        };

        // Thread the free list through the blocks, front to back.
        let mut head = core::ptr::null_mut();
        for index in (0..block_count).rev() {
            unsafe {
                let block = base.as_ptr().add(index * block_size);
                block.cast::<*mut u8>().write(head);
                head = block;
            }
        }

        Self {
            base,
            layout,
            block_size,
            block_count,
            capacity,
            head: AtomicPtr::new(head),
            free_blocks: AtomicUsize::new(block_count),
            peak_used_blocks: AtomicUsize::new(0),
            total_allocations: AtomicUsize::new(0),
            total_deallocations: AtomicUsize::new(0),
        }
    }

    /// Size of one block in bytes (after alignment rounding).
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of blocks.
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Blocks currently on the free list.
    pub fn free_block_count(&self) -> usize {
        self.free_blocks.load(Ordering::Relaxed)
    }

    /// Blocks currently handed out.
    pub fn used_block_count(&self) -> usize {
        self.block_count - self.free_blocks.load(Ordering::Relaxed)
    }

    /// Whether every block is handed out.
    pub fn is_full(&self) -> bool {
        self.free_blocks.load(Ordering::Relaxed) == 0
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

unsafe impl RawAllocator for PoolAllocator {
    fn allocate(&self, size: usize, align: usize) -> Option<Allocation> {
        if size == 0 {
            return None;
        }
        if size > self.block_size {
            contract_violation!(
                "PoolAllocator::allocate: size {size} exceeds block size {}",
                self.block_size
            );
            return None;
        }
        if align > self.layout.align() {
            contract_violation!(
                "PoolAllocator::allocate: alignment {align} exceeds block alignment {}",
                self.layout.align()
            );
            return None;
        }

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let block = NonNull::new(head)?;
            let next = unsafe { block.as_ptr().cast::<*mut u8>().read() };
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        self.free_blocks.fetch_sub(1, Ordering::Relaxed);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);

        let used = self.block_count - self.free_blocks.load(Ordering::Relaxed);
        let mut peak = self.peak_used_blocks.load(Ordering::Acquire);
        while used > peak {
            match self.peak_used_blocks.compare_exchange_weak(
                peak,
                used,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }

        Some(Allocation {
            ptr: NonNull::new(head).expect("free-list head was checked non-null"),
            size: self.block_size,
        })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _size: usize) {
        if !self.owns(ptr.as_ptr()) {
            contract_violation!("deallocate: pointer does not belong to this pool");
            return;
        }

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            ptr.as_ptr().cast::<*mut u8>().write(head);
            match self.head.compare_exchange_weak(
                head,
                ptr.as_ptr(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        self.free_blocks.fetch_add(1, Ordering::Relaxed);
        self.total_deallocations.fetch_add(1, Ordering::Relaxed);
    }

    fn owns(&self, ptr: *const u8) -> bool {
        let start = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.capacity
    }

    fn stats(&self) -> AllocStats {
        let used = self.used_block_count();
        AllocStats {
            bytes_in_use: used * self.block_size,
            peak_bytes_in_use: self.peak_used_blocks.load(Ordering::Relaxed) * self.block_size,
            allocation_count: used,
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_deallocations: self.total_deallocations.load(Ordering::Relaxed),
            alignment_waste: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_until_exhausted() {
        let pool = PoolAllocator::new(32, 4);
        let blocks: Vec<_> = (0..4).map(|_| pool.allocate(32, MIN_ALIGN).unwrap()).collect();
        assert!(pool.is_full());
        assert!(pool.allocate(32, MIN_ALIGN).is_none());

        for block in &blocks {
            unsafe { pool.deallocate(block.ptr, block.size) };
        }
        assert_eq!(pool.free_block_count(), 4);
    }

    #[test]
    fn roundtrip_restores_free_count_and_pointer() {
        let pool = PoolAllocator::new(64, 8);
        let before = pool.free_block_count();
        let a = pool.allocate(64, MIN_ALIGN).unwrap();
        unsafe { pool.deallocate(a.ptr, a.size) };
        assert_eq!(pool.free_block_count(), before);

        // LIFO free list hands the same block straight back.
        let b = pool.allocate(64, MIN_ALIGN).unwrap();
        assert_eq!(a.ptr, b.ptr);
    }

    #[test]
    fn owns_is_a_range_check() {
        let pool = PoolAllocator::new(16, 2);
        let a = pool.allocate(16, MIN_ALIGN).unwrap();
        assert!(pool.owns(a.ptr.as_ptr()));
        assert!(!pool.owns(core::ptr::null()));
        let unrelated = 0u64;
        assert!(!pool.owns(&unrelated as *const u64 as *const u8));
    }

    #[test]
    fn concurrent_allocate_and_free() {
        use std::sync::Arc;

        let pool = Arc::new(PoolAllocator::new(64, 128));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(block) = pool.allocate(64, MIN_ALIGN) {
                            unsafe { pool.deallocate(block.ptr, block.size) };
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.free_block_count(), 128);
    }
}

use core::alloc::Layout;
use core::ptr::NonNull;

use allocator_api2::alloc::{AllocError, Allocator};

use super::{RawAllocator, MIN_ALIGN};

/// Exposes any [`RawAllocator`] as a standard container allocator.
///
/// The adapter is a non-owning `Copy` handle, so a container and its
/// rebound siblings can share one backing allocator:
///
/// ```
/// # use keel::alloc::{AllocatorAdapter, FreeListAllocator};
/// use allocator_api2::vec::Vec;
///
/// let backing = FreeListAllocator::new(4096);
/// let mut numbers: Vec<u64, _> = Vec::new_in(AllocatorAdapter::new(&backing));
/// numbers.extend(0..100u64);
/// assert_eq!(numbers.iter().sum::<u64>(), 4950);
/// ```
///
/// When the backing discipline does not support individual deallocation
/// (arena, frame, stack), pair the adapter with containers that free in a
/// compatible order or with a reset-at-frame-end scheme. Node-based
/// containers need a free-list or pool backing, because their deallocation
/// order is arbitrary.
pub struct AllocatorAdapter<'a, A: RawAllocator> {
    backing: &'a A,
}

impl<'a, A: RawAllocator> AllocatorAdapter<'a, A> {
    /// Wraps a reference to the backing allocator.
    pub fn new(backing: &'a A) -> Self {
        Self { backing }
    }

    /// The shared backing allocator.
    pub fn backing(&self) -> &'a A {
        self.backing
    }
}

impl<A: RawAllocator> Clone for AllocatorAdapter<'_, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A: RawAllocator> Copy for AllocatorAdapter<'_, A> {}

unsafe impl<A: RawAllocator> Allocator for AllocatorAdapter<'_, A> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            // Zero-size requests are served with a dangling, well-aligned
            // pointer; the backing allocators treat them as null results.
            let dangling = layout.align() as *mut u8;
            let ptr = NonNull::new(dangling).ok_or(AllocError)?;
            return Ok(NonNull::slice_from_raw_parts(ptr, 0));
        }

        let align = layout.align().max(MIN_ALIGN);
        let allocation = self
            .backing
            .allocate(layout.size(), align)
            .ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(allocation.ptr, allocation.size))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            self.backing.deallocate(ptr, layout.size());
        }
    }
}

use core::ptr::NonNull;
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};

use parking_lot::Mutex;

use super::{
    padding_with_header, AllocStats, Allocation, RawAllocator, DEFAULT_ALIGN,
    MIN_ALIGN,
};

/// Free node threaded through unused memory. Blocks are kept sorted by
/// address so neighbours can be coalesced on deallocation.
#[repr(C)]
struct FreeBlock {
    size: usize,
    next: *mut FreeBlock,
}

/// Stored immediately before each returned pointer.
#[repr(C)]
struct AllocationHeader {
    /// Total bytes consumed from the buffer, padding and header included.
    block_size: usize,
    /// Distance from the block start to the returned pointer.
    padding: usize,
}

struct Inner {
    head: *mut FreeBlock,
    bytes_in_use: usize,
    peak_bytes_in_use: usize,
    live: usize,
    total_allocations: usize,
    total_deallocations: usize,
    waste: usize,
}

/// General-purpose variable-size allocator.
///
/// First-fit over an address-ordered free list with coalescing on free.
/// This is the backing of choice for containers whose deallocation order is
/// arbitrary (node-based maps and lists); the bump and stack disciplines
/// cannot serve those.
pub struct FreeListAllocator {
    base: NonNull<u8>,
    layout: Layout,
    capacity: usize,
    inner: Mutex<Inner>,
}

// The buffer is owned and the list is only touched under the mutex.
unsafe impl Send for FreeListAllocator {}
unsafe impl Sync for FreeListAllocator {}

impl FreeListAllocator {
    /// Allocates a backing buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        if capacity < core::mem::size_of::<FreeBlock>() {
            contract_violation!("FreeListAllocator: capacity must hold at least one free block");
        }
        let layout = Layout::from_size_align(
            capacity.max(core::mem::size_of::<FreeBlock>()),
            DEFAULT_ALIGN,
        )
        .expect("free-list capacity overflows Layout");
        let base = unsafe { alloc(layout) };
        let Some(base) = NonNull::new(base) else {
            handle_alloc_error(layout)
        };

        let head = base.as_ptr().cast::<FreeBlock>();
        unsafe {
            head.write(FreeBlock {
                size: capacity,
                next: core::ptr::null_mut(),
            });
        }

        Self {
            base,
            layout,
            capacity,
            inner: Mutex::new(Inner {
                head,
                bytes_in_use: 0,
                peak_bytes_in_use: 0,
                live: 0,
                total_allocations: 0,
                total_deallocations: 0,
                waste: 0,
            }),
        }
    }

    /// Total buffer size in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for FreeListAllocator {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

unsafe impl RawAllocator for FreeListAllocator {
    fn allocate(&self, size: usize, align: usize) -> Option<Allocation> {
        if !align.is_power_of_two() || align < MIN_ALIGN {
            contract_violation!("allocate: alignment {align} must be a power of two >= {MIN_ALIGN}");
            return None;
        }
        if size == 0 {
            return None;
        }

        let header_size = core::mem::size_of::<AllocationHeader>();
        let min_block = core::mem::size_of::<FreeBlock>();
        let mut inner = self.inner.lock();

        // First fit: walk the address-ordered list until a block is large
        // enough for padding + payload.
        let mut prev: *mut *mut FreeBlock = &mut inner.head;
        let mut current = inner.head;
        while !current.is_null() {
            let block_addr = current as usize;
            let block_size = unsafe { (*current).size };
            let padding = padding_with_header(block_addr, align, header_size);
            // Keep block boundaries aligned for the free-list nodes that
            // will later be written into freed memory.
            let mut needed = padding
                .checked_add(size)?
                .next_multiple_of(core::mem::align_of::<FreeBlock>());

            if needed <= block_size {
                let remainder = block_size - needed;
                unsafe {
                    if remainder >= min_block {
                        // Split: the tail of this block stays free.
                        let tail = (block_addr + needed) as *mut FreeBlock;
                        tail.write(FreeBlock {
                            size: remainder,
                            next: (*current).next,
                        });
                        *prev = tail;
                    } else {
                        // Too small to keep; hand the whole block out.
                        needed = block_size;
                        *prev = (*current).next;
                    }

                    let data = (block_addr + padding) as *mut u8;
                    data.sub(header_size)
                        .cast::<AllocationHeader>()
                        .write(AllocationHeader {
                            block_size: needed,
                            padding,
                        });

                    inner.bytes_in_use += needed;
                    inner.peak_bytes_in_use = inner.peak_bytes_in_use.max(inner.bytes_in_use);
                    inner.live += 1;
                    inner.total_allocations += 1;
                    inner.waste += padding - header_size;

                    return Some(Allocation {
                        ptr: NonNull::new_unchecked(data),
                        size,
                    });
                }
            }

            prev = unsafe { &mut (*current).next };
            current = unsafe { (*current).next };
        }

        None
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _size: usize) {
        if !self.owns(ptr.as_ptr()) {
            contract_violation!("deallocate: pointer does not belong to this allocator");
            return;
        }

        let header = ptr
            .as_ptr()
            .sub(core::mem::size_of::<AllocationHeader>())
            .cast::<AllocationHeader>()
            .read();
        let block_addr = ptr.as_ptr() as usize - header.padding;
        let block_size = header.block_size;

        let mut inner = self.inner.lock();
        inner.bytes_in_use -= block_size;
        inner.live -= 1;
        inner.total_deallocations += 1;

        // Insert address-ordered, then coalesce with either neighbour when
        // the ranges touch.
        let mut prev: *mut FreeBlock = core::ptr::null_mut();
        let mut current = inner.head;
        while !current.is_null() && (current as usize) < block_addr {
            prev = current;
            current = (*current).next;
        }

        let block = block_addr as *mut FreeBlock;
        block.write(FreeBlock {
            size: block_size,
            next: current,
        });

        if !current.is_null() && block_addr + block_size == current as usize {
            (*block).size += (*current).size;
            (*block).next = (*current).next;
        }

        if prev.is_null() {
            inner.head = block;
        } else {
            (*prev).next = block;
            if prev as usize + (*prev).size == block_addr {
                (*prev).size += (*block).size;
                (*prev).next = (*block).next;
            }
        }
    }

    fn owns(&self, ptr: *const u8) -> bool {
        let start = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.capacity
    }

    fn stats(&self) -> AllocStats {
        let inner = self.inner.lock();
        AllocStats {
            bytes_in_use: inner.bytes_in_use,
            peak_bytes_in_use: inner.peak_bytes_in_use,
            allocation_count: inner.live,
            total_allocations: inner.total_allocations,
            total_deallocations: inner.total_deallocations,
            alignment_waste: inner.waste,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_frees_coalesce() {
        let list = FreeListAllocator::new(1024);
        let a = list.allocate(100, MIN_ALIGN).unwrap();
        let b = list.allocate(100, MIN_ALIGN).unwrap();
        let c = list.allocate(100, MIN_ALIGN).unwrap();

        // Free the middle block first; arbitrary order must be legal here.
        unsafe {
            list.deallocate(b.ptr, b.size);
            list.deallocate(a.ptr, a.size);
            list.deallocate(c.ptr, c.size);
        }
        assert_eq!(list.stats().bytes_in_use, 0);

        // After full coalescing, a capacity-sized allocation fits again.
        let big = list.allocate(900, MIN_ALIGN);
        assert!(big.is_some());
    }

    #[test]
    fn exhaustion_returns_none() {
        let list = FreeListAllocator::new(256);
        assert!(list.allocate(4096, MIN_ALIGN).is_none());
    }

    #[test]
    fn split_leaves_usable_tail() {
        let list = FreeListAllocator::new(1024);
        let _a = list.allocate(64, MIN_ALIGN).unwrap();
        let b = list.allocate(512, MIN_ALIGN).unwrap();
        assert!(list.owns(b.ptr.as_ptr()));
        assert!(list.stats().allocation_count == 2);
    }
}

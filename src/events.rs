use core::any::TypeId;
use core::ptr::{self, NonNull};
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};

use hashbrown::HashMap;

/// Messages passed between systems through the world's event queues.
///
/// Events live in contiguous per-type byte logs and are copied in and out
/// wholesale, hence the `Copy` bound. Automatically implemented for all
/// eligible types.
pub trait Event: Copy + Send + Sync + 'static {}
impl<T: Copy + Send + Sync + 'static> Event for T {}

/// Append-only storage for one event type. Values are `Copy`, so clearing
/// is a length reset and merging is a straight byte copy.
struct EventBuffer {
    item: Layout,
    data: NonNull<u8>,
    /// Stored events.
    len: usize,
    /// Allocated capacity, in items.
    capacity: usize,
}

// The buffer owns its storage outright.
unsafe impl Send for EventBuffer {}
unsafe impl Sync for EventBuffer {}

impl EventBuffer {
    fn new(item: Layout) -> Self {
        Self {
            item,
            data: NonNull::dangling(),
            len: 0,
            capacity: 0,
        }
    }

    fn reserve(&mut self, additional: usize) {
        if self.item.size() == 0 || self.len + additional <= self.capacity {
            return;
        }
        let new_capacity = (self.len + additional).next_power_of_two().max(16);
        let new_layout = Layout::from_size_align(new_capacity * self.item.size(), self.item.align())
            .expect("event buffer layout overflow");
        unsafe {
            let new_data = alloc(new_layout);
            let Some(new_data) = NonNull::new(new_data) else {
                handle_alloc_error(new_layout)
            };
            if self.capacity != 0 {
                ptr::copy_nonoverlapping(
                    self.data.as_ptr(),
                    new_data.as_ptr(),
                    self.len * self.item.size(),
                );
                dealloc(self.data.as_ptr(), self.layout_for(self.capacity));
            }
            self.data = new_data;
        }
        self.capacity = new_capacity;
    }

    fn layout_for(&self, items: usize) -> Layout {
        Layout::from_size_align(items * self.item.size(), self.item.align())
            .expect("event buffer layout overflow")
    }

    /// Appends `count` items from `src`.
    ///
    /// # Safety
    ///
    /// `src` must point at `count` values whose layout matches this buffer.
    unsafe fn extend_raw(&mut self, src: *const u8, count: usize) {
        self.reserve(count);
        if self.item.size() != 0 {
            ptr::copy_nonoverlapping(
                src,
                self.data.as_ptr().add(self.len * self.item.size()),
                count * self.item.size(),
            );
        }
        self.len += count;
    }

    fn as_slice<E: Event>(&self) -> &[E] {
        debug_assert_eq!(Layout::new::<E>(), self.item);
        if self.capacity == 0 {
            // Zero-sized event types (and never-grown buffers) have no
            // storage; hand out a well-aligned dangling slice.
            let dangling = self.item.align() as *const E;
            return unsafe { core::slice::from_raw_parts(dangling, self.len) };
        }
        unsafe { core::slice::from_raw_parts(self.data.as_ptr().cast::<E>(), self.len) }
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    /// Moves every event of `other` onto the end of `self`.
    fn append(&mut self, other: &mut EventBuffer) {
        debug_assert_eq!(self.item, other.item);
        unsafe { self.extend_raw(other.data.as_ptr(), other.len) };
        other.len = 0;
    }
}

impl Drop for EventBuffer {
    fn drop(&mut self) {
        if self.capacity != 0 {
            unsafe { dealloc(self.data.as_ptr(), self.layout_for(self.capacity)) };
        }
    }
}

/// Type-segregated event log.
///
/// Each registered type owns a contiguous buffer; sends append, reads see
/// the buffer as a slice, and merging moves one queue's buffers onto
/// another per type while preserving order.
#[derive(Default)]
pub struct EventQueue {
    buffers: HashMap<TypeId, EventBuffer>,
}

impl EventQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn buffer_mut<E: Event>(&mut self) -> &mut EventBuffer {
        self.buffers
            .entry(TypeId::of::<E>())
            .or_insert_with(|| EventBuffer::new(Layout::new::<E>()))
    }

    /// Declares the event type up front. Sending also registers lazily;
    /// registration only matters for making early reads well-defined.
    pub fn register<E: Event>(&mut self) {
        self.buffer_mut::<E>();
    }

    /// Appends one event.
    pub fn send<E: Event>(&mut self, event: E) {
        unsafe {
            self.buffer_mut::<E>()
                .extend_raw((&event as *const E).cast(), 1)
        };
    }

    /// Appends a contiguous run of events; no-op for an empty slice.
    pub fn send_bulk<E: Event>(&mut self, events: &[E]) {
        if events.is_empty() {
            return;
        }
        unsafe {
            self.buffer_mut::<E>()
                .extend_raw(events.as_ptr().cast(), events.len())
        };
    }

    /// Every stored event of the type, oldest first. Unregistered types
    /// read as empty.
    pub fn read<E: Event>(&self) -> &[E] {
        self.buffers
            .get(&TypeId::of::<E>())
            .map(EventBuffer::as_slice)
            .unwrap_or(&[])
    }

    /// Copies every stored event of the type into `out`.
    pub fn read_into<E: Event>(&self, out: &mut impl Extend<E>) {
        out.extend(self.read::<E>().iter().copied());
    }

    /// Number of stored events of the type.
    pub fn len<E: Event>(&self) -> usize {
        self.buffers
            .get(&TypeId::of::<E>())
            .map_or(0, |buffer| buffer.len)
    }

    /// Whether no type holds any events.
    pub fn is_empty(&self) -> bool {
        self.buffers.values().all(|buffer| buffer.len == 0)
    }

    /// Truncates one event type.
    pub fn clear<E: Event>(&mut self) {
        if let Some(buffer) = self.buffers.get_mut(&TypeId::of::<E>()) {
            buffer.clear();
        }
    }

    /// Truncates every event type; registrations are kept.
    pub fn clear_all(&mut self) {
        for buffer in self.buffers.values_mut() {
            buffer.clear();
        }
    }

    /// Appends every buffer of `other` onto `self`, preserving per-type
    /// FIFO order, and leaves `other` empty.
    pub fn merge(&mut self, other: &mut EventQueue) {
        for (&id, source) in other.buffers.iter_mut() {
            if source.len == 0 {
                continue;
            }
            self.buffers
                .entry(id)
                .or_insert_with(|| EventBuffer::new(source.item))
                .append(source);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Damage(u32);

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Ping;

    #[test]
    fn send_and_read() {
        let mut queue = EventQueue::new();
        queue.register::<Damage>();
        queue.send(Damage(1));
        queue.send(Damage(2));
        assert_eq!(queue.read::<Damage>(), &[Damage(1), Damage(2)]);
    }

    #[test]
    fn bulk_write_then_read_is_prefix_equal() {
        let mut queue = EventQueue::new();
        let batch = [Damage(1), Damage(2), Damage(3)];
        queue.send_bulk(&batch);
        assert_eq!(queue.read::<Damage>(), &batch);

        queue.send_bulk::<Damage>(&[]);
        assert_eq!(queue.read::<Damage>().len(), 3);

        queue.clear::<Damage>();
        assert!(queue.read::<Damage>().is_empty());
    }

    #[test]
    fn unregistered_reads_are_empty() {
        let queue = EventQueue::new();
        assert_eq!(queue.read::<Damage>(), &[]);
        assert_eq!(queue.len::<Damage>(), 0);
    }

    #[test]
    fn merge_preserves_order_and_drains_source() {
        let mut destination = EventQueue::new();
        destination.send(Damage(1));

        let mut source = EventQueue::new();
        source.send(Damage(2));
        source.send(Damage(3));
        source.send(Ping);

        destination.merge(&mut source);
        assert_eq!(
            destination.read::<Damage>(),
            &[Damage(1), Damage(2), Damage(3)]
        );
        assert_eq!(destination.len::<Ping>(), 1);
        assert!(source.is_empty());

        // Merging an empty queue changes nothing.
        destination.merge(&mut source);
        assert_eq!(destination.len::<Damage>(), 3);
    }

    #[test]
    fn zero_sized_events() {
        let mut queue = EventQueue::new();
        queue.send(Ping);
        queue.send(Ping);
        assert_eq!(queue.read::<Ping>().len(), 2);
        let mut out = Vec::new();
        queue.read_into::<Ping>(&mut out);
        assert_eq!(out.len(), 2);
    }
}
